//! Parsing of GDB/MI output records.
//!
//! Only the parts of the grammar the GDB backend consumes are modelled: result records,
//! async records, stream records and the `(gdb)` prompt. Values are C strings, tuples and
//! lists.

use crate::session::StopEvent;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed MI output at byte {offset}: {reason}")]
pub struct MiParseError {
    pub offset: usize,
    pub reason: String,
}

/// A value in an MI record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiValue {
    Const(String),
    Tuple(Vec<(String, MiValue)>),
    /// `[...]` lists. Lists of results keep their keys as one-entry tuples.
    List(Vec<MiValue>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Const(text) => Some(text),
            _ => None,
        }
    }

    /// Looks up `key` in a tuple.
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        match self {
            MiValue::Tuple(results) => field(results, key),
            _ => None,
        }
    }
}

/// First value named `key` among `results`.
pub fn field<'a>(results: &'a [(String, MiValue)], key: &str) -> Option<&'a MiValue> {
    results
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value)
}

pub fn field_str<'a>(results: &'a [(String, MiValue)], key: &str) -> Option<&'a str> {
    field(results, key).and_then(MiValue::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*`: execution state changes (`running`, `stopped`).
    Exec,
    /// `+`: progress of slow operations.
    Status,
    /// `=`: supplementary notifications.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiRecord {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Vec<(String, MiValue)>,
    },
    Async {
        token: Option<u64>,
        kind: AsyncKind,
        class: String,
        results: Vec<(String, MiValue)>,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    Prompt,
}

/// What a `*stopped` record means for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    /// A stop the runner has to react to.
    Event(StopEvent),
    /// The debuggee halted because it was interrupted (`SIGINT`, `SIGTRAP` or an interrupt
    /// without a reason).
    Interrupted,
    /// Any other halt, e.g. the end of a step or a signal the debuggee survives.
    Other(String),
}

/// Signals a `signal-received` stop is reported as a crash for. GDB stops on others too
/// (`SIGUSR1`, `SIGPIPE`, `SIGCHLD`, ...) but the debuggee may handle them and go on.
pub const FATAL_SIGNALS: [&str; 9] = [
    "SIGSEGV", "SIGBUS", "SIGILL", "SIGFPE", "SIGABRT", "SIGSYS", "SIGKILL", "SIGTERM",
    "SIGQUIT",
];

/// Classifies the results of a `*stopped` record.
pub fn classify_stop(results: &[(String, MiValue)]) -> Stop {
    let signal = || field_str(results, "signal-name").unwrap_or("SIGUNKNOWN").to_string();
    match field_str(results, "reason") {
        Some("breakpoint-hit") => Stop::Event(StopEvent::BreakpointHit),
        Some("exited-normally") => Stop::Event(StopEvent::Exited(0)),
        Some("exited") => {
            // GDB reports the exit code in octal.
            let code = field_str(results, "exit-code")
                .and_then(|code| i32::from_str_radix(code, 8).ok())
                .unwrap_or(-1);
            Stop::Event(StopEvent::Exited(code))
        }
        Some("exited-signalled") => Stop::Event(StopEvent::Signaled(signal())),
        Some("signal-received") => match signal().as_str() {
            "SIGINT" | "SIGTRAP" => Stop::Interrupted,
            name if FATAL_SIGNALS.contains(&name) => Stop::Event(StopEvent::Signaled(signal())),
            name => Stop::Other(format!("signal-received {name}")),
        },
        Some(other) => Stop::Other(other.to_string()),
        None => Stop::Interrupted,
    }
}

/// Parses one line of MI output.
pub fn parse_line(line: &str) -> Result<MiRecord, MiParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_end() == "(gdb)" {
        return Ok(MiRecord::Prompt);
    }
    let mut parser = Parser {
        bytes: line.as_bytes(),
        pos: 0,
    };
    parser.record()
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> MiParseError {
        MiParseError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn expect(&mut self, expected: u8) -> Result<(), MiParseError> {
        match self.bump() {
            Some(byte) if byte == expected => Ok(()),
            Some(byte) => {
                self.pos -= 1;
                Err(self.error(format!(
                    "expected '{}', found '{}'",
                    expected as char, byte as char
                )))
            }
            None => Err(self.error(format!("expected '{}', found end of line", expected as char))),
        }
    }

    fn record(&mut self) -> Result<MiRecord, MiParseError> {
        let token = self.token()?;
        let marker = self.bump().ok_or_else(|| self.error("empty record"))?;
        let record = match marker {
            b'^' => {
                let class = match self.identifier().as_str() {
                    "done" => ResultClass::Done,
                    "running" => ResultClass::Running,
                    "connected" => ResultClass::Connected,
                    "error" => ResultClass::Error,
                    "exit" => ResultClass::Exit,
                    other => return Err(self.error(format!("unknown result class '{other}'"))),
                };
                MiRecord::Result {
                    token,
                    class,
                    results: self.trailing_results()?,
                }
            }
            b'*' | b'+' | b'=' => {
                let kind = match marker {
                    b'*' => AsyncKind::Exec,
                    b'+' => AsyncKind::Status,
                    _ => AsyncKind::Notify,
                };
                let class = self.identifier();
                MiRecord::Async {
                    token,
                    kind,
                    class,
                    results: self.trailing_results()?,
                }
            }
            b'~' | b'@' | b'&' if token.is_none() => {
                let kind = match marker {
                    b'~' => StreamKind::Console,
                    b'@' => StreamKind::Target,
                    _ => StreamKind::Log,
                };
                MiRecord::Stream {
                    kind,
                    text: self.c_string()?,
                }
            }
            other => {
                self.pos -= 1;
                return Err(self.error(format!("unknown record marker '{}'", other as char)));
            }
        };
        if self.pos != self.bytes.len() {
            return Err(self.error("trailing characters"));
        }
        Ok(record)
    }

    fn token(&mut self) -> Result<Option<u64>, MiParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Ok(None);
        }
        let digits = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.error("invalid token"))?;
        digits
            .parse()
            .map(Some)
            .map_err(|_| self.error(format!("token '{digits}' out of range")))
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    fn trailing_results(&mut self) -> Result<Vec<(String, MiValue)>, MiParseError> {
        let mut results = Vec::new();
        while self.peek() == Some(b',') {
            self.pos += 1;
            results.push(self.result()?);
        }
        Ok(results)
    }

    fn result(&mut self) -> Result<(String, MiValue), MiParseError> {
        let name = self.identifier();
        if name.is_empty() {
            return Err(self.error("expected a variable name"));
        }
        self.expect(b'=')?;
        Ok((name, self.value()?))
    }

    fn value(&mut self) -> Result<MiValue, MiParseError> {
        match self.peek() {
            Some(b'"') => self.c_string().map(MiValue::Const),
            Some(b'{') => {
                self.pos += 1;
                let mut results = Vec::new();
                if self.peek() == Some(b'}') {
                    self.pos += 1;
                    return Ok(MiValue::Tuple(results));
                }
                loop {
                    results.push(self.result()?);
                    match self.bump() {
                        Some(b',') => continue,
                        Some(b'}') => return Ok(MiValue::Tuple(results)),
                        _ => return Err(self.error("unterminated tuple")),
                    }
                }
            }
            Some(b'[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if self.peek() == Some(b']') {
                    self.pos += 1;
                    return Ok(MiValue::List(items));
                }
                loop {
                    let item = match self.peek() {
                        Some(b'"' | b'{' | b'[') => self.value()?,
                        _ => {
                            let (name, value) = self.result()?;
                            MiValue::Tuple(vec![(name, value)])
                        }
                    };
                    items.push(item);
                    match self.bump() {
                        Some(b',') => continue,
                        Some(b']') => return Ok(MiValue::List(items)),
                        _ => return Err(self.error("unterminated list")),
                    }
                }
            }
            _ => Err(self.error("expected a value")),
        }
    }

    fn c_string(&mut self) -> Result<String, MiParseError> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            let byte = self.bump().ok_or_else(|| self.error("unterminated string"))?;
            match byte {
                b'"' => break,
                b'\\' => {
                    let escaped = self.bump().ok_or_else(|| self.error("dangling escape"))?;
                    match escaped {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'e' => out.push(0x1b),
                        b'a' => out.push(0x07),
                        b'0'..=b'7' => {
                            let mut value = u32::from(escaped - b'0');
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(digit @ b'0'..=b'7') => {
                                        value = value * 8 + u32::from(digit - b'0');
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            out.push((value & 0xff) as u8);
                        }
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Quotes `text` as an MI C string argument.
pub fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

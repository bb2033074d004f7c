//! Debugger sessions driven through GDB's machine interface.

use crate::mi::{self, MiRecord, MiValue, ResultClass, Stop, field, field_str};
use crate::operation::encode_le;
use crate::session::{
    Access, BreakpointHandle, DebugSession, SessionDescriptor, SessionError, SessionFactory,
    StopEvent,
};
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Opens one GDB process per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct GdbSessionFactory;

impl SessionFactory for GdbSessionFactory {
    fn attach(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<Box<dyn DebugSession>, SessionError> {
        Ok(Box::new(GdbSession::start(descriptor)?))
    }
}

/// A running `gdb --interpreter=mi3` child and the program it controls.
pub struct GdbSession {
    /// `None` when the MI stream is not backed by a spawned process.
    child: Option<Child>,
    stdin: Box<dyn Write + Send>,
    lines: Receiver<String>,
    next_token: u64,
    command_timeout: Duration,
    /// `*stopped` records that arrived while waiting for a command reply.
    stops: VecDeque<Stop>,
    /// The program has been started (`-exec-run`) or was already halted on connect.
    launched: bool,
    running: bool,
    /// The program is gone; `kill` becomes a no-op.
    finished: bool,
    closed: bool,
    /// Result-condition symbols by breakpoint number.
    conditions: HashMap<u32, String>,
}

impl GdbSession {
    /// Spawns the debugger, loads the executable and connects to a remote target if one is
    /// configured. Every step is bounded by the descriptor's attach timeout.
    pub fn start(descriptor: &SessionDescriptor) -> Result<Self, SessionError> {
        let mut command = Command::new(&descriptor.debugger);
        command
            .args(["-q", "--nx", "--interpreter=mi3"])
            .arg(&descriptor.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        // Keep the terminal's Ctrl-C away from the debugger and the program under test.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            SessionError::AttachFailed(format!(
                "cannot start {}: {e}",
                descriptor.debugger.display()
            ))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::AttachFailed(
                "debugger pipes unavailable".to_string(),
            ));
        };

        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut session = Self::over(Box::new(stdin), lines, descriptor.attach_timeout);
        session.child = Some(child);
        session.connect(descriptor)
    }

    /// A session speaking MI over `stdin` and the lines received on `lines`.
    fn over(stdin: Box<dyn Write + Send>, lines: Receiver<String>, timeout: Duration) -> Self {
        Self {
            child: None,
            stdin,
            lines,
            next_token: 1,
            command_timeout: timeout,
            stops: VecDeque::new(),
            launched: false,
            running: false,
            finished: false,
            closed: false,
            conditions: HashMap::new(),
        }
    }

    fn connect(mut self, descriptor: &SessionDescriptor) -> Result<Self, SessionError> {
        self.handshake(descriptor)
            .map_err(|err| SessionError::AttachFailed(err.to_string()))?;
        Ok(self)
    }

    fn handshake(&mut self, descriptor: &SessionDescriptor) -> Result<(), SessionError> {
        self.await_prompt()?;
        self.command("-gdb-set mi-async on")?;
        self.command("-gdb-set confirm off")?;
        self.command("-gdb-set pagination off")?;

        let Some(remote) = &descriptor.remote else {
            return Ok(());
        };
        if descriptor.embedded {
            self.command(&format!("-target-select remote {remote}"))?;
            self.console("monitor reset halt")?;
            self.command("-target-download")?;
            self.launched = true;
        } else {
            self.command(&format!("-target-select extended-remote {remote}"))?;
            let executable = descriptor.executable.to_string_lossy();
            self.command(&format!(
                "-gdb-set remote exec-file {}",
                mi::quote(&executable)
            ))?;
        }
        Ok(())
    }

    fn await_prompt(&mut self) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.command_timeout;
        loop {
            match self.next_record(deadline)? {
                Some(MiRecord::Prompt) => return Ok(()),
                Some(_) => {}
                None => {
                    return Err(SessionError::Protocol(
                        "no prompt from debugger".to_string(),
                    ));
                }
            }
        }
    }

    /// Receives and parses the next record. `Ok(None)` once `deadline` has passed.
    fn next_record(&mut self, deadline: Instant) -> Result<Option<MiRecord>, SessionError> {
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let line = match self.lines.recv_timeout(wait) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                    return Err(SessionError::Io("debugger exited".to_string()));
                }
            };
            trace!("mi <- {line}");
            if line.trim().is_empty() {
                continue;
            }
            match mi::parse_line(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => debug!("ignoring unparsable MI line: {err}"),
            }
        }
    }

    /// Sends one MI command and waits for its result record.
    fn command(&mut self, command: &str) -> Result<Vec<(String, MiValue)>, SessionError> {
        let token = self.next_token;
        self.next_token += 1;
        debug!("mi -> {token}{command}");
        writeln!(self.stdin, "{token}{command}")?;
        self.stdin.flush()?;

        let deadline = Instant::now() + self.command_timeout;
        loop {
            let Some(record) = self.next_record(deadline)? else {
                return Err(SessionError::Protocol(format!(
                    "no reply to '{command}' within {:?}",
                    self.command_timeout
                )));
            };
            match record {
                MiRecord::Result {
                    token: Some(reply),
                    class,
                    results,
                } if reply == token => {
                    return match class {
                        ResultClass::Done | ResultClass::Running | ResultClass::Connected => {
                            Ok(results)
                        }
                        ResultClass::Error => Err(SessionError::Protocol(
                            field_str(&results, "msg")
                                .unwrap_or("unknown error")
                                .to_string(),
                        )),
                        ResultClass::Exit => {
                            self.closed = true;
                            Err(SessionError::Io("debugger exited".to_string()))
                        }
                    };
                }
                other => self.observe(other),
            }
        }
    }

    fn console(&mut self, command: &str) -> Result<(), SessionError> {
        self.command(&format!("-interpreter-exec console {}", mi::quote(command)))
            .map(|_| ())
    }

    /// Tracks out-of-band records: run state changes and stops.
    fn observe(&mut self, record: MiRecord) {
        match record {
            MiRecord::Async {
                kind: mi::AsyncKind::Exec,
                class,
                results,
                ..
            } => match class.as_str() {
                "running" => self.running = true,
                "stopped" => {
                    self.running = false;
                    let stop = match mi::classify_stop(&results) {
                        Stop::Event(StopEvent::BreakpointHit) => match self.condition(&results) {
                            Some(symbol) => Stop::Event(StopEvent::ConditionReached(symbol)),
                            None => Stop::Event(StopEvent::BreakpointHit),
                        },
                        stop => stop,
                    };
                    if matches!(&stop, Stop::Event(event) if event.is_terminal()) {
                        self.finished = true;
                    }
                    self.stops.push_back(stop);
                }
                _ => {}
            },
            MiRecord::Stream { text, .. } => debug!("gdb: {}", text.trim_end()),
            _ => {}
        }
    }

    /// The result condition a breakpoint stop belongs to, if any.
    fn condition(&self, results: &[(String, MiValue)]) -> Option<String> {
        field_str(results, "bkptno")
            .and_then(|number| number.parse::<u32>().ok())
            .and_then(|number| self.conditions.get(&number))
            .cloned()
    }

    /// Next stop, either queued or received before `deadline`.
    fn next_stop(&mut self, deadline: Instant) -> Result<Option<Stop>, SessionError> {
        loop {
            if let Some(stop) = self.stops.pop_front() {
                return Ok(Some(stop));
            }
            match self.next_record(deadline)? {
                Some(record) => self.observe(record),
                None => return Ok(None),
            }
        }
    }

    fn evaluate(&mut self, expression: &str) -> Result<String, SessionError> {
        let results = self.command(&format!(
            "-data-evaluate-expression {}",
            mi::quote(expression)
        ))?;
        field_str(&results, "value")
            .map(str::to_string)
            .ok_or_else(|| SessionError::Protocol(format!("no value for '{expression}'")))
    }

    fn size_of(&mut self, expression: &str) -> Result<usize, SessionError> {
        let size = self.evaluate(&format!("sizeof({expression})"))?;
        size.trim()
            .parse()
            .map_err(|_| SessionError::Protocol(format!("unexpected size '{size}'")))
    }

    /// Address and width of a variable.
    fn locate(&mut self, name: &str) -> Result<(u64, usize), SessionError> {
        let address = self.evaluate(&format!("&{name}"))?;
        let address = parse_address(&address)
            .ok_or_else(|| SessionError::Protocol(format!("unexpected address '{address}'")))?;
        Ok((address, self.size_of(name)?))
    }

    fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>, SessionError> {
        let results = self.command(&format!("-data-read-memory-bytes {address:#x} {len}"))?;
        let contents = match field(&results, "memory") {
            Some(MiValue::List(blocks)) => blocks
                .iter()
                .filter_map(|block| block.get("contents").and_then(MiValue::as_str))
                .collect::<String>(),
            _ => String::new(),
        };
        let bytes = hex::decode(&contents)
            .map_err(|err| SessionError::Protocol(format!("bad memory contents: {err}")))?;
        if bytes.len() != len {
            return Err(SessionError::Protocol(format!(
                "read {} of {len} bytes at {address:#x}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    fn write_memory(&mut self, address: u64, bytes: &[u8]) -> Result<(), SessionError> {
        let contents = hex::encode(bytes);
        self.command(&format!("-data-write-memory-bytes {address:#x} {contents}"))
            .map(|_| ())
    }

    fn read_register(&mut self, name: &str) -> Result<Vec<u8>, SessionError> {
        let width = self.size_of(&format!("${name}"))?;
        if width == 0 || width > 8 {
            return Err(SessionError::Protocol(format!(
                "register '{name}' is {width} bytes wide"
            )));
        }
        let value = self.evaluate(&format!("(unsigned long long)${name}"))?;
        let value: u64 = value
            .trim()
            .parse()
            .map_err(|_| SessionError::Protocol(format!("unexpected register value '{value}'")))?;
        Ok(encode_le(value, width))
    }

    fn write_register(&mut self, name: &str, bytes: &[u8]) -> Result<(), SessionError> {
        if bytes.len() > 8 {
            return Err(SessionError::Protocol(format!(
                "{} bytes do not fit register '{name}'",
                bytes.len()
            )));
        }
        let value = bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        self.evaluate(&format!("${name}={value:#x}")).map(|_| ())
    }

    fn halt_if_running(&mut self) -> Result<Option<StopEvent>, SessionError> {
        if !self.running {
            return Ok(None);
        }
        self.command("-exec-interrupt")?;
        let deadline = Instant::now() + self.command_timeout;
        loop {
            match self.next_stop(deadline)? {
                Some(Stop::Event(event)) if event.is_terminal() => return Ok(Some(event)),
                Some(_) if !self.running => return Ok(None),
                Some(_) => {}
                None => {
                    return Err(SessionError::Protocol(
                        "program did not stop after interrupt".to_string(),
                    ));
                }
            }
        }
    }
}

impl DebugSession for GdbSession {
    fn set_breakpoint(&mut self, symbol: &str) -> Result<BreakpointHandle, SessionError> {
        let results = self
            .command(&format!("-break-insert {symbol}"))
            .map_err(|err| match err {
                SessionError::Protocol(_) => SessionError::SymbolNotFound(symbol.to_string()),
                other => other,
            })?;
        let number = field(&results, "bkpt")
            .and_then(|bkpt| bkpt.get("number"))
            .and_then(MiValue::as_str)
            .and_then(|number| number.parse().ok())
            .ok_or_else(|| SessionError::Protocol("breakpoint without number".to_string()))?;
        Ok(BreakpointHandle {
            number,
            symbol: symbol.to_string(),
        })
    }

    fn set_result_condition(&mut self, symbol: &str) -> Result<BreakpointHandle, SessionError> {
        let handle = self.set_breakpoint(symbol)?;
        self.conditions.insert(handle.number, symbol.to_string());
        Ok(handle)
    }

    fn resume(&mut self) -> Result<(), SessionError> {
        if self.finished {
            // The queued exit is reported by the next `wait_for_stop`.
            return Ok(());
        }
        if self.launched {
            self.command("-exec-continue")?;
        } else {
            self.command("-exec-run")?;
            self.launched = true;
        }
        // Whatever is queued now was reported before `^running`, e.g. the halt seen when
        // connecting to a board. Only the end of the program stays relevant.
        self.stops.retain(|stop| matches!(stop, Stop::Event(event) if event.is_terminal()));
        self.running = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<Option<StopEvent>, SessionError> {
        // A stop that already arrived decides the outcome.
        let ended = self
            .stops
            .drain(..)
            .find_map(|stop| match stop {
                Stop::Event(event) if event.is_terminal() => Some(event),
                _ => None,
            });
        if let Some(event) = ended {
            return Ok(Some(event));
        }
        self.halt_if_running()
    }

    fn read_value(&mut self, access: &Access) -> Result<Vec<u8>, SessionError> {
        let result = match access {
            Access::Variable(name) => self
                .locate(name)
                .and_then(|(address, len)| self.read_memory(address, len)),
            Access::Register(name) => self.read_register(name),
            Access::Memory { address, len } => self.read_memory(*address, *len),
        };
        result.map_err(|err| SessionError::ReadFailed {
            access: access.to_string(),
            reason: err.to_string(),
        })
    }

    fn write_value(&mut self, access: &Access, bytes: &[u8]) -> Result<(), SessionError> {
        let result = match access {
            Access::Variable(name) => self
                .locate(name)
                .and_then(|(address, _)| self.write_memory(address, bytes)),
            Access::Register(name) => self.write_register(name, bytes),
            Access::Memory { address, .. } => self.write_memory(*address, bytes),
        };
        result.map_err(|err| SessionError::WriteFailed {
            access: access.to_string(),
            reason: err.to_string(),
        })
    }

    fn wait_for_stop(&mut self, deadline: Instant) -> Result<StopEvent, SessionError> {
        loop {
            match self.next_stop(deadline)? {
                None => return Ok(StopEvent::DeadlineExceeded),
                Some(Stop::Event(event)) => return Ok(event),
                // A later `*running` already superseded this stop.
                Some(stop) if self.running => debug!("ignoring stale stop {stop:?}"),
                Some(stop) => {
                    debug!("continuing after unrequested stop {stop:?}");
                    self.resume()?;
                }
            }
        }
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        if self.finished || !self.launched {
            return Ok(());
        }
        if let Some(event) = self.halt_if_running()? {
            debug!("program ended before kill: {event:?}");
            return Ok(());
        }
        self.console("kill")?;
        self.finished = true;
        Ok(())
    }

    fn detach(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        let result = self.command("-gdb-exit").map(|_| ());
        self.closed = true;
        match result {
            // The reply races with the pipe closing.
            Err(SessionError::Io(_)) | Ok(()) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Drop for GdbSession {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(err) = child.kill() {
                    warn!("failed to kill debugger process: {err}");
                }
                let _ = child.wait();
            }
        }
    }
}

/// Extracts the address from a pointer value such as `(int *) 0x7ffdf000 <i>`.
fn parse_address(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .find_map(|word| word.strip_prefix("0x"))
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::RunOutcome;
    use crate::runner::ExperimentRunner;
    use crate::testing::setup_with_windows;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::path::PathBuf;
    use std::sync::mpsc::Sender;
    use std::sync::{Arc, Mutex};

    type Sent = Arc<Mutex<Vec<String>>>;

    /// Answers MI commands like GDB does for a program that runs until its next scripted stop.
    struct FakeGdb {
        replies: Sender<String>,
        buffer: Vec<u8>,
        running: bool,
        breakpoints: u32,
        /// Records emitted after each resume, in order. Once exhausted the program keeps
        /// running until interrupted.
        stops: VecDeque<Vec<&'static str>>,
        sent: Sent,
    }

    impl FakeGdb {
        fn new(stops: Vec<Vec<&'static str>>) -> (Self, Receiver<String>, Sent) {
            let (replies, lines) = mpsc::channel();
            let sent = Sent::default();
            let _ = replies.send("(gdb)".to_string());
            let gdb = Self {
                replies,
                buffer: Vec::new(),
                running: false,
                breakpoints: 0,
                stops: stops.into(),
                sent: Arc::clone(&sent),
            };
            (gdb, lines, sent)
        }

        fn answer(&mut self, line: &str) -> Vec<String> {
            let split = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
            let (token, command) = line.split_at(split);
            self.sent.lock().unwrap().push(command.to_string());

            let mut out = Vec::new();
            let mut later = Vec::new();
            if command.starts_with("-exec-run") || command.starts_with("-exec-continue") {
                if self.running {
                    out.push(format!(
                        "{token}^error,msg=\"Cannot execute this command while the target is running.\""
                    ));
                } else {
                    self.running = true;
                    out.push(format!("{token}^running"));
                    out.push("*running,thread-id=\"all\"".to_string());
                    for record in self.stops.pop_front().unwrap_or_default() {
                        if record.starts_with("*stopped") {
                            self.running = false;
                        }
                        later.push(record.to_string());
                    }
                }
            } else if command.starts_with("-exec-interrupt") {
                out.push(format!("{token}^done"));
                if self.running {
                    self.running = false;
                    later.push("*stopped,reason=\"signal-received\",signal-name=\"SIGINT\"".into());
                }
            } else if command.starts_with("-target-select remote") {
                // A remote board is halted when GDB connects.
                out.push(format!("{token}^connected"));
                later.push("*stopped,frame={addr=\"0x08000000\",func=\"Reset_Handler\"}".into());
            } else if command.starts_with("-break-insert") {
                self.breakpoints += 1;
                out.push(format!("{token}^done,bkpt={{number=\"{}\"}}", self.breakpoints));
            } else if let Some(expression) = command.strip_prefix("-data-evaluate-expression ") {
                let value = if expression.starts_with("\"&") {
                    "(int *) 0x7ffdf000 <i>"
                } else if expression.starts_with("\"sizeof") {
                    "4"
                } else {
                    "42"
                };
                out.push(format!("{token}^done,value=\"{value}\""));
            } else if let Some(args) = command.strip_prefix("-data-read-memory-bytes ") {
                let len: usize = args
                    .split_whitespace()
                    .nth(1)
                    .and_then(|len| len.parse().ok())
                    .unwrap_or(0);
                let contents = format!("2a{}", "00".repeat(len.saturating_sub(1)));
                out.push(format!(
                    "{token}^done,memory=[{{begin=\"0x7ffdf000\",offset=\"0x0\",contents=\"{contents}\"}}]"
                ));
            } else if command.starts_with("-gdb-exit") {
                return vec![format!("{token}^exit")];
            } else {
                if command.contains("console \"kill\"") {
                    self.running = false;
                }
                out.push(format!("{token}^done"));
            }
            out.push("(gdb)".to_string());
            out.extend(later);
            out
        }
    }

    impl Write for FakeGdb {
        fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
            self.buffer.extend_from_slice(bytes);
            while let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line).trim_end().to_string();
                for reply in self.answer(&line) {
                    let _ = self.replies.send(reply);
                }
            }
            Ok(bytes.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FakeGdbFactory;

    impl SessionFactory for FakeGdbFactory {
        fn attach(
            &self,
            descriptor: &SessionDescriptor,
        ) -> Result<Box<dyn DebugSession>, SessionError> {
            let (gdb, lines, _) = FakeGdb::new(Vec::new());
            let session = GdbSession::over(Box::new(gdb), lines, descriptor.attach_timeout)
                .connect(descriptor)?;
            Ok(Box::new(session))
        }
    }

    fn local() -> SessionDescriptor {
        SessionDescriptor {
            executable: PathBuf::from("./foo"),
            debugger: PathBuf::from("gdb"),
            remote: None,
            embedded: false,
            attach_timeout: Duration::from_secs(2),
            word_size: 4,
        }
    }

    fn board() -> SessionDescriptor {
        SessionDescriptor {
            remote: Some("localhost:1234".to_string()),
            embedded: true,
            ..local()
        }
    }

    fn session(
        descriptor: &SessionDescriptor,
        stops: Vec<Vec<&'static str>>,
    ) -> (GdbSession, Sent) {
        let (gdb, lines, sent) = FakeGdb::new(stops);
        let session = GdbSession::over(Box::new(gdb), lines, descriptor.attach_timeout)
            .connect(descriptor)
            .expect("Handshake with the fake debugger");
        (session, sent)
    }

    fn sent(sent: &Sent) -> Vec<String> {
        sent.lock().unwrap().clone()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn halt_on_connect_is_not_continued_twice() {
        let (mut session, commands) = session(&board(), Vec::new());
        session.set_breakpoint("foo").expect("Breakpoint");
        session.resume().expect("Resume");

        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(session.wait_for_stop(deadline), Ok(StopEvent::DeadlineExceeded));
        assert_eq!(session.pause(), Ok(None));

        let commands = sent(&commands);
        assert!(commands.contains(&"-target-download".to_string()));
        assert!(!commands.contains(&"-exec-run".to_string()), "A board is never run");
        let continues = commands.iter().filter(|c| *c == "-exec-continue").count();
        assert_eq!(continues, 1, "{commands:?}");
    }

    #[test]
    fn embedded_run_injects_and_times_out() {
        let mut setup = setup_with_windows((400, 400), (50, 50));
        setup.session = board();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let record = ExperimentRunner::new(&FakeGdbFactory, &setup).run(0, &mut rng);

        assert_eq!(record.outcome, RunOutcome::TimedOut, "{:?}", record.diagnostic);
        assert!(record.injected());
        assert!(record.diagnostic.is_none(), "{:?}", record.diagnostic);
        assert_eq!(record.snapshot.len(), 3);
        assert!(record.snapshot.iter().all(|observed| observed.value.is_some()));
    }

    #[test]
    fn local_program_runs_to_breakpoint_then_exit() {
        let stops = vec![
            vec!["*stopped,reason=\"breakpoint-hit\",disp=\"keep\",bkptno=\"1\",frame={func=\"foo\"}"],
            vec!["*stopped,reason=\"exited\",exit-code=\"03\""],
        ];
        let (mut session, commands) = session(&local(), stops);
        let handle = session.set_breakpoint("foo").expect("Breakpoint");
        assert_eq!(handle.number, 1);

        session.resume().expect("Run");
        assert_eq!(session.wait_for_stop(soon()), Ok(StopEvent::BreakpointHit));
        assert_eq!(
            session.read_value(&Access::Variable("i".into())),
            Ok(vec![0x2a, 0, 0, 0])
        );
        let memory = Access::Memory {
            address: 0x7ffd_f000,
            len: 4,
        };
        session
            .write_value(&memory, &[0xef, 0xbe, 0xad, 0xde])
            .expect("Write");
        session.resume().expect("Continue");
        assert_eq!(session.wait_for_stop(soon()), Ok(StopEvent::Exited(3)));
        session.kill().expect("Kill after exit");
        session.detach().expect("Detach");

        let commands = sent(&commands);
        let run_control: Vec<_> = commands
            .iter()
            .filter(|c| c.starts_with("-exec") || c.contains("kill") || *c == "-gdb-exit")
            .map(String::as_str)
            .collect();
        assert_eq!(run_control, ["-exec-run", "-exec-continue", "-gdb-exit"]);
        assert!(commands.contains(&"-data-write-memory-bytes 0x7ffdf000 efbeadde".to_string()));
    }

    #[test]
    fn result_condition_hits_report_their_symbol() {
        let stops = vec![vec![
            "*stopped,reason=\"breakpoint-hit\",disp=\"keep\",bkptno=\"2\",frame={func=\"foo_done\"}",
        ]];
        let (mut session, _) = session(&local(), stops);
        session.set_breakpoint("foo").expect("Breakpoint");
        let condition = session.set_result_condition("foo_done").expect("Condition");
        assert_eq!(condition.number, 2);

        session.resume().expect("Run");
        assert_eq!(
            session.wait_for_stop(soon()),
            Ok(StopEvent::ConditionReached("foo_done".into()))
        );
    }

    #[test]
    fn non_fatal_signal_is_continued_past() {
        let stops = vec![
            vec!["*stopped,reason=\"signal-received\",signal-name=\"SIGUSR1\""],
            vec!["*stopped,reason=\"exited-normally\""],
        ];
        let (mut session, commands) = session(&local(), stops);
        session.resume().expect("Run");
        assert_eq!(session.wait_for_stop(soon()), Ok(StopEvent::Exited(0)));
        let commands = sent(&commands);
        assert_eq!(commands.iter().filter(|c| *c == "-exec-continue").count(), 1);
    }

    #[test]
    fn running_program_is_interrupted_before_kill() {
        let (mut session, commands) = session(&local(), Vec::new());
        session.resume().expect("Run");
        session.kill().expect("Kill");
        let commands = sent(&commands);
        let tail: Vec<_> = commands.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(tail, ["-exec-interrupt", "-interpreter-exec console \"kill\""]);
    }

    #[test]
    fn pointer_values_yield_addresses() {
        assert_eq!(parse_address("(int *) 0x7ffdf000 <i>"), Some(0x7ffd_f000));
        assert_eq!(parse_address("0x20000000"), Some(0x2000_0000));
        assert_eq!(parse_address("<optimized out>"), None);
    }

    #[test]
    fn missing_debugger_fails_to_attach() {
        let descriptor = SessionDescriptor {
            debugger: PathBuf::from("/nonexistent/faultline-gdb"),
            attach_timeout: Duration::from_millis(100),
            ..local()
        };
        match GdbSessionFactory.attach(&descriptor) {
            Err(SessionError::AttachFailed(reason)) => {
                assert!(reason.contains("faultline-gdb"), "{reason}")
            }
            Err(other) => panic!("Expected AttachFailed, got {other:?}"),
            Ok(_) => panic!("Attach should fail without a debugger"),
        }
    }
}

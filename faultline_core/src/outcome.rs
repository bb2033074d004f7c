use crate::operation::OperationKind;
use crate::session::StopEvent;
use crate::target::Category;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The terminal classification of one run. Every run ends in exactly one of these.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Completed,
    Crashed,
    TimedOut,
    InjectionFailed,
    AttachFailed,
}

impl RunOutcome {
    pub const ALL: [RunOutcome; 5] = [
        RunOutcome::Completed,
        RunOutcome::Crashed,
        RunOutcome::TimedOut,
        RunOutcome::InjectionFailed,
        RunOutcome::AttachFailed,
    ];

    /// Classifies a stop of the debuggee. Exits, result conditions and fatal signals end a
    /// run.
    pub fn from_stop(event: &StopEvent) -> Option<Self> {
        match event {
            StopEvent::Exited(_) | StopEvent::ConditionReached(_) => Some(RunOutcome::Completed),
            StopEvent::Signaled(_) => Some(RunOutcome::Crashed),
            StopEvent::BreakpointHit | StopEvent::DeadlineExceeded => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Crashed => "crashed",
            RunOutcome::TimedOut => "timed-out",
            RunOutcome::InjectionFailed => "injection-failed",
            RunOutcome::AttachFailed => "attach-failed",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names a declared target without borrowing the catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub category: Category,
    pub identifier: String,
}

/// A value read from a declared target, or the reason it could not be read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObservedValue {
    pub target: TargetRef,
    pub value: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// The value change that was actually written to the debuggee.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InjectedValue {
    /// Concrete address for memory targets.
    pub address: Option<u64>,
    pub original: Vec<u8>,
    pub injected: Vec<u8>,
    /// Bit index, drawn value or mask pattern, depending on the operation.
    pub parameter: Option<u64>,
    /// MD5 over target, operation and both values; equal faults share a fingerprint.
    pub fingerprint: String,
}

impl InjectedValue {
    pub fn new(
        target: &TargetRef,
        operation: OperationKind,
        address: Option<u64>,
        original: Vec<u8>,
        injected: Vec<u8>,
        parameter: Option<u64>,
    ) -> Self {
        let mut context = md5::Context::new();
        context.consume(target.category.as_str().as_bytes());
        context.consume(b"\0");
        context.consume(target.identifier.as_bytes());
        context.consume(b"\0");
        context.consume(operation.as_str().as_bytes());
        context.consume(address.unwrap_or_default().to_le_bytes());
        context.consume(&original);
        context.consume(&injected);
        let fingerprint = format!("{:x}", context.compute());
        Self {
            address,
            original,
            injected,
            parameter,
            fingerprint,
        }
    }
}

/// Everything observed about one run. Immutable once built by the runner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub run_index: usize,
    pub target: Option<TargetRef>,
    pub operation: Option<OperationKind>,
    pub injection: Option<InjectedValue>,
    #[serde(with = "duration_ms")]
    pub injection_delay: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub outcome: RunOutcome,
    #[serde(with = "duration_ms")]
    pub wall_clock: Duration,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub breakpoint_hits: u32,
    /// Symbol of the result condition that ended the run.
    pub result_condition: Option<String>,
    /// Every declared target, read once the run ended while the debuggee was still present.
    pub snapshot: Vec<ObservedValue>,
    pub diagnostic: Option<String>,
}

impl RunRecord {
    /// Whether a fault was actually written during this run.
    pub fn injected(&self) -> bool {
        self.injection.is_some()
    }
}

/// The mutable half of a run, owned by the runner until the run reaches its outcome.
#[derive(Debug, Clone)]
pub(crate) struct PendingRun {
    pub run_index: usize,
    pub target: Option<TargetRef>,
    pub operation: Option<OperationKind>,
    pub injection: Option<InjectedValue>,
    pub injection_delay: Duration,
    pub timeout: Duration,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub breakpoint_hits: u32,
    pub result_condition: Option<String>,
    pub snapshot: Vec<ObservedValue>,
    pub diagnostic: Option<String>,
}

impl PendingRun {
    pub fn new(run_index: usize, injection_delay: Duration, timeout: Duration) -> Self {
        Self {
            run_index,
            target: None,
            operation: None,
            injection: None,
            injection_delay,
            timeout,
            exit_code: None,
            signal: None,
            breakpoint_hits: 0,
            result_condition: None,
            snapshot: Vec::new(),
            diagnostic: None,
        }
    }

    /// Records the stop details an outcome was classified from.
    pub fn observe_stop(&mut self, event: &StopEvent) {
        match event {
            StopEvent::Exited(code) => self.exit_code = Some(*code),
            StopEvent::Signaled(signal) => self.signal = Some(signal.clone()),
            StopEvent::BreakpointHit => self.breakpoint_hits += 1,
            StopEvent::ConditionReached(symbol) => self.result_condition = Some(symbol.clone()),
            StopEvent::DeadlineExceeded => {}
        }
    }

    pub fn note(&mut self, diagnostic: impl Into<String>) {
        let diagnostic = diagnostic.into();
        self.diagnostic = Some(match self.diagnostic.take() {
            Some(previous) => format!("{previous}; {diagnostic}"),
            None => diagnostic,
        });
    }

    pub fn finish(self, outcome: RunOutcome, wall_clock: Duration) -> RunRecord {
        RunRecord {
            run_index: self.run_index,
            target: self.target,
            operation: self.operation,
            injection: self.injection,
            injection_delay: self.injection_delay,
            timeout: self.timeout,
            outcome,
            wall_clock,
            exit_code: self.exit_code,
            signal: self.signal,
            breakpoint_hits: self.breakpoint_hits,
            result_condition: self.result_condition,
            snapshot: self.snapshot,
            diagnostic: self.diagnostic,
        }
    }
}

/// Serializes durations as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> TargetRef {
        TargetRef {
            category: Category::Variable,
            identifier: "i".to_string(),
        }
    }

    #[test]
    fn stops_classify_into_outcomes() {
        assert_eq!(
            RunOutcome::from_stop(&StopEvent::Exited(3)),
            Some(RunOutcome::Completed)
        );
        assert_eq!(
            RunOutcome::from_stop(&StopEvent::Signaled("SIGSEGV".into())),
            Some(RunOutcome::Crashed)
        );
        assert_eq!(
            RunOutcome::from_stop(&StopEvent::ConditionReached("foo_done".into())),
            Some(RunOutcome::Completed)
        );
        assert_eq!(RunOutcome::from_stop(&StopEvent::BreakpointHit), None);
        assert_eq!(RunOutcome::from_stop(&StopEvent::DeadlineExceeded), None);
    }

    #[test]
    fn fingerprint_is_stable_and_value_sensitive() {
        let flip = |injected: u8, bit: u64| {
            InjectedValue::new(
                &target(),
                OperationKind::BitFlip,
                None,
                vec![1],
                vec![injected],
                Some(bit),
            )
        };
        let a = flip(0, 0);
        let b = flip(0, 0);
        let c = flip(3, 1);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
        assert_eq!(a.fingerprint.len(), 32, "MD5 hex digest should be 32 characters");
    }

    #[test]
    fn pending_run_collects_stop_details() {
        let mut pending = PendingRun::new(4, Duration::from_millis(5), Duration::from_millis(9));
        pending.observe_stop(&StopEvent::BreakpointHit);
        pending.observe_stop(&StopEvent::BreakpointHit);
        pending.observe_stop(&StopEvent::Signaled("SIGABRT".into()));
        pending.note("first");
        pending.note("second");
        let record = pending.finish(RunOutcome::Crashed, Duration::from_millis(7));
        assert_eq!(record.run_index, 4);
        assert_eq!(record.breakpoint_hits, 2);
        assert_eq!(record.signal.as_deref(), Some("SIGABRT"));
        assert_eq!(record.diagnostic.as_deref(), Some("first; second"));
        assert!(record.result_condition.is_none());
        assert!(!record.injected());
    }

    #[test]
    fn record_serializes_durations_as_milliseconds() {
        let record = PendingRun::new(0, Duration::from_millis(1500), Duration::from_secs(2))
            .finish(RunOutcome::TimedOut, Duration::from_millis(2001));
        let json = serde_json::to_value(&record).expect("Serialize");
        assert_eq!(json["injection_delay"], 1500);
        assert_eq!(json["timeout"], 2000);
        assert_eq!(json["outcome"], "timed-out");
    }

    #[test]
    fn reached_condition_is_recorded_by_name() {
        let mut pending = PendingRun::new(1, Duration::ZERO, Duration::from_secs(1));
        pending.observe_stop(&StopEvent::ConditionReached("foo_done".into()));
        let record = pending.finish(RunOutcome::Completed, Duration::from_millis(3));
        assert_eq!(record.result_condition.as_deref(), Some("foo_done"));
        assert_eq!(record.breakpoint_hits, 0, "Conditions are not injection breakpoint hits");
    }
}

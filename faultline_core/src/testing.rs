//! Scripted debugger sessions for runner and campaign tests.

use crate::config::CampaignConfig;
use crate::operation::OperationCatalog;
use crate::plan::InjectionPlan;
use crate::runner::ExperimentSetup;
use crate::session::{
    Access, BreakpointHandle, DebugSession, SessionDescriptor, SessionError, SessionFactory,
    StopEvent,
};
use crate::target::{Category, Target, TargetCatalog};
use crate::timing::{RunTiming, TimingWindow};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One recorded interaction with the factory or a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Attach,
    SetBreakpoint(String),
    SetResultCondition(String),
    Resume,
    Pause,
    Read(Access),
    Write(Access, Vec<u8>),
    Wait,
    Kill,
    Detach,
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<Call>,
    events: VecDeque<StopEvent>,
    values: HashMap<Access, Vec<u8>>,
    attach_attempts: usize,
}

/// A factory whose sessions replay a fixed queue of stop events. An exhausted queue reports
/// `DeadlineExceeded`, so tests never sleep.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
    failing_attach: Option<fn(usize) -> bool>,
    missing_symbol: bool,
    failing_reads: bool,
    failing_writes: bool,
    pause_event: Option<StopEvent>,
}

impl ScriptedFactory {
    pub fn new(events: Vec<StopEvent>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                events: events.into(),
                ..Script::default()
            })),
            failing_attach: None,
            missing_symbol: false,
            failing_reads: false,
            failing_writes: false,
            pause_event: None,
        }
    }

    pub fn failing_attach(self) -> Self {
        self.failing_attach_when(|_| true)
    }

    /// Fails the attach attempts (0-based, in call order) selected by `predicate`.
    pub fn failing_attach_when(mut self, predicate: fn(usize) -> bool) -> Self {
        self.failing_attach = Some(predicate);
        self
    }

    pub fn missing_symbol(mut self) -> Self {
        self.missing_symbol = true;
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.failing_reads = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.failing_writes = true;
        self
    }

    /// Every `pause` reports `event` instead of halting the program.
    pub fn pause_reports(mut self, event: StopEvent) -> Self {
        self.pause_event = Some(event);
        self
    }

    pub fn with_value(self, access: Access, value: Vec<u8>) -> Self {
        self.lock().values.insert(access, value);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionFactory for ScriptedFactory {
    fn attach(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<Box<dyn DebugSession>, SessionError> {
        let attempt = {
            let mut script = self.lock();
            script.calls.push(Call::Attach);
            script.attach_attempts += 1;
            script.attach_attempts - 1
        };
        if self.failing_attach.is_some_and(|fails| fails(attempt)) {
            return Err(SessionError::AttachFailed(format!(
                "cannot reach {}",
                descriptor.remote.as_deref().unwrap_or("local debugger")
            )));
        }
        Ok(Box::new(ScriptedSession {
            factory: self.clone(),
            word_size: descriptor.word_size as usize,
        }))
    }
}

struct ScriptedSession {
    factory: ScriptedFactory,
    word_size: usize,
}

impl ScriptedSession {
    fn record(&self, call: Call) {
        self.factory.lock().calls.push(call);
    }
}

impl DebugSession for ScriptedSession {
    fn set_breakpoint(&mut self, symbol: &str) -> Result<BreakpointHandle, SessionError> {
        self.record(Call::SetBreakpoint(symbol.to_string()));
        if self.factory.missing_symbol {
            return Err(SessionError::SymbolNotFound(symbol.to_string()));
        }
        Ok(BreakpointHandle {
            number: 1,
            symbol: symbol.to_string(),
        })
    }

    fn set_result_condition(&mut self, symbol: &str) -> Result<BreakpointHandle, SessionError> {
        self.record(Call::SetResultCondition(symbol.to_string()));
        Ok(BreakpointHandle {
            number: 2,
            symbol: symbol.to_string(),
        })
    }

    fn resume(&mut self) -> Result<(), SessionError> {
        self.record(Call::Resume);
        Ok(())
    }

    fn pause(&mut self) -> Result<Option<StopEvent>, SessionError> {
        self.record(Call::Pause);
        Ok(self.factory.pause_event.clone())
    }

    fn read_value(&mut self, access: &Access) -> Result<Vec<u8>, SessionError> {
        self.record(Call::Read(access.clone()));
        if self.factory.failing_reads {
            return Err(SessionError::ReadFailed {
                access: access.to_string(),
                reason: "no symbol in current context".to_string(),
            });
        }
        let width = match access {
            Access::Memory { len, .. } => *len,
            _ => self.word_size,
        };
        Ok(self
            .factory
            .lock()
            .values
            .get(access)
            .cloned()
            .unwrap_or_else(|| vec![0x5a; width]))
    }

    fn write_value(&mut self, access: &Access, bytes: &[u8]) -> Result<(), SessionError> {
        self.record(Call::Write(access.clone(), bytes.to_vec()));
        if self.factory.failing_writes {
            return Err(SessionError::WriteFailed {
                access: access.to_string(),
                reason: "cannot access memory".to_string(),
            });
        }
        Ok(())
    }

    fn wait_for_stop(&mut self, _deadline: Instant) -> Result<StopEvent, SessionError> {
        let mut script = self.factory.lock();
        script.calls.push(Call::Wait);
        Ok(script
            .events
            .pop_front()
            .unwrap_or(StopEvent::DeadlineExceeded))
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        self.record(Call::Kill);
        Ok(())
    }

    fn detach(&mut self) -> Result<(), SessionError> {
        self.record(Call::Detach);
        Ok(())
    }
}

pub fn descriptor() -> SessionDescriptor {
    SessionDescriptor {
        executable: PathBuf::from("./foo"),
        debugger: PathBuf::from("gdb"),
        remote: None,
        embedded: false,
        attach_timeout: Duration::from_secs(5),
        word_size: 4,
    }
}

/// Setup with one target per category (`i`, `eax`, `0x7ffdf000`), the standard operations,
/// injection function `foo` and the given `(min, max)` millisecond windows.
pub fn setup_with_windows(timeout_ms: (u64, u64), delay_ms: (u64, u64)) -> ExperimentSetup {
    let mut targets = TargetCatalog::new();
    targets
        .insert(
            Category::Variable,
            0.3,
            vec![Target::variable("i", Some("int"), 1.0)],
        )
        .expect("Variable targets");
    targets
        .insert(Category::Register, 0.2, vec![Target::register("eax", 1.0)])
        .expect("Register targets");
    targets
        .insert(
            Category::Memory,
            0.5,
            vec![Target::memory("0x7ffdf000", 1.0).expect("Memory address")],
        )
        .expect("Memory targets");

    ExperimentSetup {
        session: descriptor(),
        injection_function: "foo".to_string(),
        result_conditions: Vec::new(),
        timing: RunTiming {
            timeout: TimingWindow::from_millis("timeout", timeout_ms.0, timeout_ms.1)
                .expect("Timeout window"),
            injection_delay: TimingWindow::from_millis("injection delay", delay_ms.0, delay_ms.1)
                .expect("Delay window"),
        },
        plan: InjectionPlan::new(targets, OperationCatalog::standard()).expect("Valid plan"),
    }
}

pub fn campaign(runs: usize, threads: usize, golden_run: bool) -> CampaignConfig {
    CampaignConfig {
        name: "foo".to_string(),
        runs,
        seed: Some(42),
        threads,
        golden_run,
        setup: setup_with_windows((15_000, 20_000), (5_000, 10_000)),
    }
}

use crate::outcome::{
    InjectedValue, ObservedValue, PendingRun, RunOutcome, RunRecord, TargetRef,
};
use crate::plan::InjectionPlan;
use crate::session::{DebugSession, SessionDescriptor, SessionFactory, StopEvent};
use crate::timing::RunTiming;
use log::{debug, warn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Everything a single run needs besides its random source. Read-only and shared by every
/// run of a campaign.
#[derive(Debug, Clone)]
pub struct ExperimentSetup {
    pub session: SessionDescriptor,
    /// Function the breakpoint is set on.
    pub injection_function: String,
    /// Symbols whose breakpoints end a run as `Completed`, labelled with the symbol.
    pub result_conditions: Vec<String>,
    pub timing: RunTiming,
    pub plan: InjectionPlan,
}

/// States of one run. `Finished` carries the terminal outcome until the session is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Attaching,
    Armed,
    AwaitingInjectionWindow,
    Injecting,
    Monitoring,
    Finished(RunOutcome),
    Detached,
}

/// The fault-free baseline run, used to tell injected behaviour from normal behaviour.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GoldenRun {
    pub record: RunRecord,
    /// Every declared target, read the first time the injection function was reached.
    pub values: Vec<ObservedValue>,
}

/// Drives single experiment runs from attach to verdict.
pub struct ExperimentRunner<'a> {
    factory: &'a dyn SessionFactory,
    setup: &'a ExperimentSetup,
}

impl<'a> ExperimentRunner<'a> {
    pub fn new(factory: &'a dyn SessionFactory, setup: &'a ExperimentSetup) -> Self {
        Self { factory, setup }
    }

    /// Executes one run and returns its record. Never fails: every error is folded into the
    /// record's outcome and diagnostic.
    ///
    /// The injection delay and the timeout are drawn independently. If the delay is not
    /// shorter than the timeout the run times out before anything is injected.
    ///
    /// # Arguments
    /// * `run_index`: Index of the run within its campaign, copied into the record.
    /// * `rng`: The run's own random source. Timing, target, operation and every operation
    ///   parameter are drawn from it, in that order.
    ///
    /// # Returns
    /// The immutable record of the run, including the post-run snapshot of every declared
    /// target when the program was still present at the end.
    pub fn run<R: Rng + ?Sized>(&self, run_index: usize, rng: &mut R) -> RunRecord {
        let injection_delay = self.setup.timing.injection_delay.draw(rng);
        let timeout = self.setup.timing.timeout.draw(rng);
        let run = ActiveRun::new(
            self.setup,
            PendingRun::new(run_index, injection_delay, timeout),
            Some(injection_delay),
        );
        run.drive(self.factory, rng).0
    }

    /// Runs the program without injecting anything, using the longest allowed timeout, and
    /// reads every declared target the first time the injection function is reached.
    pub fn golden_run(&self) -> GoldenRun {
        let timeout = self.setup.timing.timeout.max();
        let pending = PendingRun::new(0, Duration::ZERO, timeout);
        let mut run = ActiveRun::new(self.setup, pending, None);
        run.golden_values = Some(Vec::new());
        // Nothing is drawn when no injection is scheduled.
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let (record, values) = run.drive(self.factory, &mut rng);
        GoldenRun {
            record,
            values: values.unwrap_or_default(),
        }
    }
}

/// Per-run mutable state. Exclusively owns the debugger session for the run.
struct ActiveRun<'s> {
    setup: &'s ExperimentSetup,
    pending: PendingRun,
    session: Option<Box<dyn DebugSession>>,
    /// `None` disables injection (baseline run).
    injection_delay: Option<Duration>,
    started: Instant,
    inject_at: Option<Instant>,
    timeout_at: Instant,
    process_live: bool,
    paused: bool,
    /// `Some` only for the baseline run; filled at the first breakpoint hit.
    golden_values: Option<Vec<ObservedValue>>,
}

impl<'s> ActiveRun<'s> {
    fn new(
        setup: &'s ExperimentSetup,
        pending: PendingRun,
        injection_delay: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            setup,
            timeout_at: now + pending.timeout,
            pending,
            session: None,
            injection_delay,
            started: now,
            inject_at: None,
            process_live: false,
            paused: false,
            golden_values: None,
        }
    }

    fn drive<R: Rng + ?Sized>(
        mut self,
        factory: &dyn SessionFactory,
        rng: &mut R,
    ) -> (RunRecord, Option<Vec<ObservedValue>>) {
        let run_index = self.pending.run_index;
        let mut outcome = RunOutcome::InjectionFailed;
        let mut state = RunState::Idle;
        loop {
            let next = match state {
                RunState::Idle => RunState::Attaching,
                RunState::Attaching => self.attach(factory),
                RunState::Armed => self.arm(),
                RunState::AwaitingInjectionWindow => self.await_injection_window(),
                RunState::Injecting => self.inject(rng),
                RunState::Monitoring => self.monitor(),
                RunState::Finished(finished) => {
                    outcome = finished;
                    self.snapshot(finished);
                    self.release();
                    RunState::Detached
                }
                RunState::Detached => break,
            };
            debug!("run {run_index}: {state:?} -> {next:?}");
            state = next;
        }

        let record = self.pending.finish(outcome, self.started.elapsed());
        (record, self.golden_values)
    }

    fn attach(&mut self, factory: &dyn SessionFactory) -> RunState {
        let session = match factory.attach(&self.setup.session) {
            Ok(session) => self.session.insert(session),
            Err(err) => {
                self.pending.note(err.to_string());
                return RunState::Finished(RunOutcome::AttachFailed);
            }
        };
        match session.set_breakpoint(&self.setup.injection_function) {
            Ok(handle) => debug!(
                "run {}: breakpoint {} set on '{}'",
                self.pending.run_index, handle.number, handle.symbol
            ),
            Err(err) => {
                self.pending.note(err.to_string());
                return RunState::Finished(RunOutcome::InjectionFailed);
            }
        }
        for condition in &self.setup.result_conditions {
            if let Err(err) = session.set_result_condition(condition) {
                self.pending.note(format!("cannot set result condition: {err}"));
                return RunState::Finished(RunOutcome::InjectionFailed);
            }
        }
        RunState::Armed
    }

    fn arm(&mut self) -> RunState {
        let Some(session) = self.session.as_deref_mut() else {
            return RunState::Finished(RunOutcome::AttachFailed);
        };
        // Both timers start together, when the debuggee starts running.
        let now = Instant::now();
        self.timeout_at = now + self.pending.timeout;
        self.inject_at = self.injection_delay.map(|delay| now + delay);
        match session.resume() {
            Ok(()) => {
                self.process_live = true;
                RunState::AwaitingInjectionWindow
            }
            Err(err) => {
                self.pending.note(format!("failed to start the program: {err}"));
                RunState::Finished(RunOutcome::InjectionFailed)
            }
        }
    }

    /// Single wait on the earlier of the injection deadline and the timeout.
    fn await_injection_window(&mut self) -> RunState {
        let deadline = match self.inject_at {
            Some(inject_at) => inject_at.min(self.timeout_at),
            None => self.timeout_at,
        };
        let Some(session) = self.session.as_deref_mut() else {
            return RunState::Finished(RunOutcome::AttachFailed);
        };

        match session.wait_for_stop(deadline) {
            Err(err) => {
                self.pending.note(format!("waiting for the injection window failed: {err}"));
                RunState::Finished(RunOutcome::InjectionFailed)
            }
            Ok(StopEvent::DeadlineExceeded) => match self.inject_at {
                Some(inject_at) if inject_at < self.timeout_at => RunState::Injecting,
                Some(_) => {
                    self.pending.note("timed out before the injection delay elapsed");
                    RunState::Finished(RunOutcome::TimedOut)
                }
                None => RunState::Finished(RunOutcome::TimedOut),
            },
            Ok(StopEvent::BreakpointHit) => {
                self.pending.observe_stop(&StopEvent::BreakpointHit);
                if let Some(values) = self.golden_values.as_mut().filter(|v| v.is_empty()) {
                    *values = observe_targets(session, self.setup);
                }

                let now = Instant::now();
                if now >= self.timeout_at {
                    self.paused = true;
                    return RunState::Finished(RunOutcome::TimedOut);
                }
                if self.inject_at.is_some_and(|inject_at| now >= inject_at) {
                    // Already halted at the injection function: inject right here.
                    self.paused = true;
                    return RunState::Injecting;
                }
                match session.resume() {
                    Ok(()) => RunState::AwaitingInjectionWindow,
                    Err(err) => {
                        self.pending.note(format!("failed to resume after breakpoint: {err}"));
                        RunState::Finished(RunOutcome::InjectionFailed)
                    }
                }
            }
            Ok(event) => {
                if self.injection_delay.is_some() {
                    self.pending.note("program stopped before injection");
                }
                self.terminated(event)
            }
        }
    }

    fn inject<R: Rng + ?Sized>(&mut self, rng: &mut R) -> RunState {
        let setup = self.setup;
        let Some(session) = self.session.as_deref_mut() else {
            return RunState::Finished(RunOutcome::AttachFailed);
        };

        if !self.paused {
            match session.pause() {
                Ok(None) => self.paused = true,
                Ok(Some(event)) => {
                    self.pending.note("program stopped before it could be paused for injection");
                    return self.terminated(event);
                }
                Err(err) => {
                    self.pending.note(format!("failed to pause the program: {err}"));
                    return RunState::Finished(RunOutcome::InjectionFailed);
                }
            }
        }

        let decision = setup.plan.decide(rng);
        let target = TargetRef {
            category: decision.target.category,
            identifier: decision.target.identifier.clone(),
        };
        let kind = decision.operation.kind();
        self.pending.target = Some(target.clone());
        self.pending.operation = Some(kind);

        let (access, address) = decision.target.access(setup.session.word_size, rng);
        let original = match session.read_value(&access) {
            Ok(original) => original,
            Err(err) => {
                self.pending.note(err.to_string());
                return RunState::Finished(RunOutcome::InjectionFailed);
            }
        };
        let applied = match decision
            .operation
            .corruption
            .apply(&original, decision.target.value_domain(), rng)
        {
            Ok(applied) => applied,
            Err(err) => {
                self.pending.note(format!("cannot corrupt {access}: {err}"));
                return RunState::Finished(RunOutcome::InjectionFailed);
            }
        };
        if let Err(err) = session.write_value(&access, &applied.value) {
            self.pending.note(err.to_string());
            return RunState::Finished(RunOutcome::InjectionFailed);
        }
        self.pending.injection = Some(InjectedValue::new(
            &target,
            kind,
            address,
            original,
            applied.value,
            applied.parameter,
        ));
        // Nothing touches the debuggee between the write above and this resume.
        if let Err(err) = session.resume() {
            self.pending.note(format!("failed to resume after injection: {err}"));
            return RunState::Finished(RunOutcome::InjectionFailed);
        }
        self.paused = false;
        debug!(
            "run {}: {kind} injected into {} '{}' ({access})",
            self.pending.run_index, target.category, target.identifier
        );
        RunState::Monitoring
    }

    fn monitor(&mut self) -> RunState {
        let Some(session) = self.session.as_deref_mut() else {
            return RunState::Finished(RunOutcome::AttachFailed);
        };
        match session.wait_for_stop(self.timeout_at) {
            Err(err) => {
                self.pending.note(format!("monitoring failed: {err}"));
                RunState::Finished(RunOutcome::InjectionFailed)
            }
            Ok(StopEvent::DeadlineExceeded) => RunState::Finished(RunOutcome::TimedOut),
            Ok(StopEvent::BreakpointHit) => {
                self.pending.observe_stop(&StopEvent::BreakpointHit);
                match session.resume() {
                    Ok(()) => RunState::Monitoring,
                    Err(err) => {
                        self.pending.note(format!("failed to resume after breakpoint: {err}"));
                        RunState::Finished(RunOutcome::InjectionFailed)
                    }
                }
            }
            Ok(event) => self.terminated(event),
        }
    }

    /// Classifies an exit, a reached result condition or a fatal signal.
    fn terminated(&mut self, event: StopEvent) -> RunState {
        self.pending.observe_stop(&event);
        match RunOutcome::from_stop(&event) {
            Some(outcome) => {
                if event.is_terminal() {
                    self.process_live = false;
                } else {
                    // Halted at the condition's breakpoint.
                    self.paused = true;
                }
                RunState::Finished(outcome)
            }
            None => {
                self.pending.note(format!("unexpected stop event {event:?}"));
                RunState::Finished(RunOutcome::InjectionFailed)
            }
        }
    }

    /// Reads every declared target into the record once the run has ended. Skipped when the
    /// program exited or never got to run an injection (attach or injection failures).
    fn snapshot(&mut self, outcome: RunOutcome) {
        if self.pending.exit_code.is_some()
            || matches!(outcome, RunOutcome::AttachFailed | RunOutcome::InjectionFailed)
        {
            return;
        }
        let Some(session) = self.session.as_deref_mut() else {
            return;
        };
        if self.process_live && !self.paused {
            match session.pause() {
                Ok(None) => self.paused = true,
                Ok(Some(event)) => {
                    debug!(
                        "run {}: program ended before the snapshot: {event:?}",
                        self.pending.run_index
                    );
                    if event.is_terminal() {
                        self.process_live = false;
                        return;
                    }
                }
                Err(err) => {
                    self.pending.note(format!("no snapshot, pause failed: {err}"));
                    return;
                }
            }
        }
        self.pending.snapshot = observe_targets(session, self.setup);
    }

    /// Kills a still-running debuggee and releases the session. Runs once per run, on every
    /// path; failures here are logged and never change the outcome.
    fn release(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let run_index = self.pending.run_index;
        if self.process_live {
            match session.kill() {
                Ok(()) => self.process_live = false,
                Err(err) => warn!("run {run_index}: failed to kill the program: {err}"),
            }
        }
        if let Err(err) = session.detach() {
            warn!("run {run_index}: failed to detach: {err}");
        }
    }
}

fn observe_targets(
    session: &mut dyn DebugSession,
    setup: &ExperimentSetup,
) -> Vec<ObservedValue> {
    setup
        .plan
        .targets()
        .targets()
        .map(|target| {
            let access = target.base_access(setup.session.word_size);
            let (value, error) = match session.read_value(&access) {
                Ok(value) => (Some(value), None),
                Err(err) => (None, Some(err.to_string())),
            };
            ObservedValue {
                target: TargetRef {
                    category: target.category,
                    identifier: target.identifier.clone(),
                },
                value,
                error,
            }
        })
        .collect()
}

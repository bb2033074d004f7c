use crate::config::CampaignConfig;
use crate::outcome::{PendingRun, RunOutcome, RunRecord};
use crate::runner::{ExperimentRunner, GoldenRun};
use crate::session::SessionFactory;
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

const INTERRUPTED: &str = "campaign interrupted";

/// The result of a campaign: exactly one record per configured run, in run index order.
#[derive(Serialize, Debug, Clone)]
pub struct CampaignReport {
    pub experiment: String,
    pub seed: u64,
    pub golden: Option<GoldenRun>,
    pub runs: Vec<RunRecord>,
    /// Set when the campaign was stopped before every run started.
    pub interrupted: bool,
}

impl CampaignReport {
    /// Number of runs per outcome. Every outcome is present, possibly with a zero count.
    pub fn summary(&self) -> BTreeMap<RunOutcome, usize> {
        let mut counts: BTreeMap<RunOutcome, usize> =
            RunOutcome::ALL.iter().map(|outcome| (*outcome, 0)).collect();
        for record in &self.runs {
            *counts.entry(record.outcome).or_default() += 1;
        }
        counts
    }

    /// Whether at least one run got a debugger session.
    pub fn any_run_started(&self) -> bool {
        self.runs
            .iter()
            .any(|record| record.outcome != RunOutcome::AttachFailed)
    }
}

/// Executes the runs of a campaign with bounded concurrency and collects their records.
pub struct CampaignController<'a> {
    factory: &'a dyn SessionFactory,
    config: &'a CampaignConfig,
    seed: u64,
    stop: Arc<AtomicBool>,
}

impl<'a> CampaignController<'a> {
    pub fn new(factory: &'a dyn SessionFactory, config: &'a CampaignConfig, seed: u64) -> Self {
        Self {
            factory,
            config,
            seed,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares the flag that stops scheduling new runs, e.g. with a Ctrl-C handler.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Runs the optional golden run, then every configured run.
    ///
    /// Workers pull run indices from a shared counter, so at most `threads` runs are in flight.
    /// Each run draws from its own ChaCha8 stream keyed by the campaign seed and the run index,
    /// which makes the injected faults independent of how runs are spread over threads.
    /// Runs that never started because the stop flag was raised are recorded as
    /// `AttachFailed` with a "campaign interrupted" diagnostic.
    ///
    /// # Returns
    /// A report with exactly one record per configured run, ordered by run index, plus the
    /// golden run when one was requested and started.
    pub fn run(&mut self) -> CampaignReport {
        let config = self.config;
        let runner = ExperimentRunner::new(self.factory, &config.setup);
        info!(
            "Starting campaign '{}': {} runs, {} threads, seed {}",
            config.name, config.runs, config.threads, self.seed
        );

        let golden = if config.golden_run && !self.stop.load(Ordering::SeqCst) {
            info!("Golden run: executing without injection");
            let golden = runner.golden_run();
            info!("Golden run finished: {}", golden.record.outcome);
            Some(golden)
        } else {
            None
        };

        let total = config.runs;
        let mut slots: Vec<Option<RunRecord>> = vec![None; total];
        let worker_count = config.threads.max(1).min(total.max(1));
        let next_index = AtomicUsize::new(0);
        let seed = self.seed;
        let stop = self.stop.as_ref();
        let (result_tx, result_rx) = mpsc::channel::<RunRecord>();

        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let result_tx = result_tx.clone();
                let runner = &runner;
                let next_index = &next_index;
                scope.spawn(move || {
                    loop {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let index = next_index.fetch_add(1, Ordering::SeqCst);
                        if index >= total {
                            break;
                        }
                        let mut rng = run_rng(seed, index);
                        let record = runner.run(index, &mut rng);
                        if result_tx.send(record).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for (completed, record) in result_rx.iter().enumerate() {
                log_record(&record, completed + 1, total);
                let index = record.run_index;
                slots[index] = Some(record);
            }
        });

        let mut interrupted = false;
        let runs = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    interrupted = true;
                    let mut pending = PendingRun::new(index, Duration::ZERO, Duration::ZERO);
                    pending.note(INTERRUPTED);
                    pending.finish(RunOutcome::AttachFailed, Duration::ZERO)
                })
            })
            .collect();
        if interrupted {
            warn!("Campaign '{}' interrupted before all runs started", config.name);
        }

        CampaignReport {
            experiment: config.name.clone(),
            seed,
            golden,
            runs,
            interrupted,
        }
    }
}

/// Random stream for one run, independent of every other run of the same campaign.
pub fn run_rng(seed: u64, run_index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(run_index as u64);
    rng
}

fn log_record(record: &RunRecord, completed: usize, total: usize) {
    let target = record
        .target
        .as_ref()
        .map_or_else(|| "-".to_string(), |t| format!("{} '{}'", t.category, t.identifier));
    let operation = record
        .operation
        .map_or_else(|| "-".to_string(), |kind| kind.to_string());
    match record.outcome {
        RunOutcome::InjectionFailed | RunOutcome::AttachFailed => warn!(
            "[{completed}/{total}] run {}: {} ({})",
            record.run_index,
            record.outcome,
            record.diagnostic.as_deref().unwrap_or("no diagnostic")
        ),
        outcome => info!(
            "[{completed}/{total}] run {}: {outcome} ({} on {target}, {:?})",
            record.run_index, operation, record.wall_clock
        ),
    }
}

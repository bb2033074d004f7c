pub mod campaign;
pub mod config;
pub mod gdb;
pub mod mi;
pub mod operation;
pub mod outcome;
pub mod plan;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod session;
pub mod target;
pub mod timing;

#[cfg(test)]
pub(crate) mod testing;

pub use campaign::{CampaignController, CampaignReport};
pub use config::{CampaignConfig, ConfigError, ConfigOverrides, FaultlineConfig};
pub use gdb::{GdbSession, GdbSessionFactory};
pub use operation::{Corruption, Operation, OperationCatalog, OperationKind};
pub use outcome::{InjectedValue, ObservedValue, RunOutcome, RunRecord, TargetRef};
pub use plan::{Decision, InjectionPlan};
pub use report::{ReportError, ReportFormat};
pub use runner::{ExperimentRunner, ExperimentSetup, GoldenRun, RunState};
pub use sampler::{SamplerError, WeightedSampler};
pub use session::{
    Access, DebugSession, SessionDescriptor, SessionError, SessionFactory, StopEvent,
};
pub use target::{Category, Target, TargetCatalog};
pub use timing::{RunTiming, TimingWindow};

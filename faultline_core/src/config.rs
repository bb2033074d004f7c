use crate::operation::{Corruption, MaskOp, Operation, OperationCatalog, OperationKind};
use crate::plan::InjectionPlan;
use crate::runner::ExperimentSetup;
use crate::sampler::WeightedSampler;
use crate::session::SessionDescriptor;
use crate::target::{Category, Target, TargetCatalog};
use crate::timing::{RunTiming, TimingWindow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors found while validating a campaign configuration. All of them are reported before
/// any run starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A timing window whose lower bound exceeds its upper bound.
    #[error("Invalid {name} window: min {min_ms} ms is greater than max {max_ms} ms")]
    InvalidWindow {
        name: String,
        min_ms: u64,
        max_ms: u64,
    },
    /// A memory target that is neither a hex address nor a `start:end` hex range.
    #[error("Invalid memory target '{0}': expected a hex address or a 'start:end' range")]
    InvalidMemoryTarget(String),
    #[error("A {0} target has an empty identifier")]
    EmptyIdentifier(Category),
    /// The same identifier declared twice within one category.
    #[error("Duplicate {category} target '{identifier}'")]
    DuplicateTarget {
        category: Category,
        identifier: String,
    },
    /// A target listed under a category it does not belong to.
    #[error("Target '{identifier}' is not a {expected} target")]
    MisplacedTarget {
        expected: Category,
        identifier: String,
    },
    /// A negative, NaN or infinite weight or probability.
    #[error("Invalid weight {weight} for {context}: weights must be finite and non-negative")]
    InvalidWeight { context: String, weight: f64 },
    /// Nothing left to draw from: no entries, or every weight is zero.
    #[error("No {0} to choose from (empty or all weights zero)")]
    EmptyDomain(String),
    #[error("The number of runs must be at least 1")]
    InvalidRunCount,
    #[error("The number of threads must be at least 1")]
    InvalidThreadCount,
    /// A remote endpoint that is not `host:port`.
    #[error("Invalid remote '{0}': expected host:port")]
    InvalidRemote(String),
    #[error("Invalid {kind} operation: {reason}")]
    InvalidOperation { kind: OperationKind, reason: String },
    /// Memory word size outside 1..=8 bytes.
    #[error("Invalid word size {0}: expected 1 to 8 bytes")]
    InvalidWordSize(u64),
    #[error("The injection function must not be empty")]
    EmptyInjectionFunction,
    /// Empty, repeated, or the injection function itself.
    #[error("Invalid result condition '{0}'")]
    InvalidResultCondition(String),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExperimentSettings {
    pub name: String,
    pub runs: u64,
    pub seed: Option<u64>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub golden_run: bool,
}

pub fn default_threads() -> usize {
    1
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    pub executable: PathBuf,
    pub debugger: Option<PathBuf>,
    pub remote: Option<String>,
    #[serde(default)]
    pub embedded: bool,
    pub injection_function: String,
    /// Symbols that end a run when reached, e.g. the end of the computation or an error
    /// handler. The run is labelled with the symbol that was hit.
    #[serde(default)]
    pub result_conditions: Vec<String>,
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    #[serde(default = "default_word_size")]
    pub word_size: u64,
}

fn default_attach_timeout_ms() -> u64 {
    5000
}

fn default_word_size() -> u64 {
    4
}

impl SessionSettings {
    /// `gdb-multiarch` for remote boards, plain `gdb` otherwise.
    pub fn debugger_path(&self) -> PathBuf {
        match &self.debugger {
            Some(path) => path.clone(),
            None if self.embedded => PathBuf::from("gdb-multiarch"),
            None => PathBuf::from("gdb"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct WindowSettings {
    pub min: u64,
    pub max: u64,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TimingSettings {
    pub timeout_ms: WindowSettings,
    pub injection_delay_ms: WindowSettings,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TargetEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub declared_type: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CategorySettings {
    pub probability: f64,
    #[serde(default)]
    pub entries: Vec<TargetEntry>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub variable: Option<CategorySettings>,
    pub register: Option<CategorySettings>,
    pub memory: Option<CategorySettings>,
}

impl TargetSettings {
    fn categories(&self) -> [(Category, Option<&CategorySettings>); 3] {
        [
            (Category::Variable, self.variable.as_ref()),
            (Category::Register, self.register.as_ref()),
            (Category::Memory, self.memory.as_ref()),
        ]
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct PatternEntry {
    pub value: u64,
    #[serde(default = "default_weight")]
    pub probability: f64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OperationSettings {
    pub kind: OperationKind,
    #[serde(default = "all_categories")]
    pub categories: Vec<Category>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub bit: Option<u32>,
    pub min: Option<u64>,
    pub max: Option<u64>,
    #[serde(default)]
    pub values: Vec<PatternEntry>,
}

fn all_categories() -> Vec<Category> {
    Category::ALL.to_vec()
}

/// The configuration document as written on disk.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FaultlineConfig {
    pub experiment: ExperimentSettings,
    pub session: SessionSettings,
    pub timing: TimingSettings,
    #[serde(default)]
    pub targets: TargetSettings,
    /// Empty means the standard catalog: bit flip, random value and zeroing everywhere.
    #[serde(default)]
    pub operations: Vec<OperationSettings>,
}

/// Command line values that take precedence over the document.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub remote: Option<String>,
    pub runs: Option<u64>,
    pub seed: Option<u64>,
    pub threads: Option<usize>,
}

/// A validated campaign, ready to hand to the campaign controller.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    pub name: String,
    pub runs: usize,
    /// `None` until the caller picks one from entropy.
    pub seed: Option<u64>,
    pub threads: usize,
    pub golden_run: bool,
    pub setup: ExperimentSetup,
}

impl FaultlineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FaultlineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(remote) = &overrides.remote {
            self.session.remote = Some(remote.clone());
        }
        if let Some(runs) = overrides.runs {
            self.experiment.runs = runs;
        }
        if let Some(seed) = overrides.seed {
            self.experiment.seed = Some(seed);
        }
        if let Some(threads) = overrides.threads {
            self.experiment.threads = threads;
        }
    }

    /// Converts the document into closed, checked types and builds the injection plan, so
    /// that every configuration mistake surfaces here rather than during a run.
    pub fn validate(&self) -> Result<CampaignConfig, ConfigError> {
        let experiment = &self.experiment;
        if experiment.runs == 0 {
            return Err(ConfigError::InvalidRunCount);
        }
        let runs = usize::try_from(experiment.runs).map_err(|_| ConfigError::InvalidRunCount)?;
        if experiment.threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }

        let session = self.session_descriptor()?;
        let injection_function = self.session.injection_function.trim();
        if injection_function.is_empty() {
            return Err(ConfigError::EmptyInjectionFunction);
        }
        let result_conditions = self.result_conditions(injection_function)?;

        let timing = RunTiming {
            timeout: TimingWindow::from_millis(
                "timeout",
                self.timing.timeout_ms.min,
                self.timing.timeout_ms.max,
            )?,
            injection_delay: TimingWindow::from_millis(
                "injection delay",
                self.timing.injection_delay_ms.min,
                self.timing.injection_delay_ms.max,
            )?,
        };

        let plan = InjectionPlan::new(self.target_catalog()?, self.operation_catalog()?)?;

        Ok(CampaignConfig {
            name: experiment.name.clone(),
            runs,
            seed: experiment.seed,
            threads: experiment.threads,
            golden_run: experiment.golden_run,
            setup: ExperimentSetup {
                session,
                injection_function: injection_function.to_string(),
                result_conditions,
                timing,
                plan,
            },
        })
    }

    fn session_descriptor(&self) -> Result<SessionDescriptor, ConfigError> {
        let settings = &self.session;
        if let Some(remote) = &settings.remote {
            validate_remote(remote)?;
        }
        if !(1..=8).contains(&settings.word_size) {
            return Err(ConfigError::InvalidWordSize(settings.word_size));
        }
        Ok(SessionDescriptor {
            executable: settings.executable.clone(),
            debugger: settings.debugger_path(),
            remote: settings.remote.clone(),
            embedded: settings.embedded,
            attach_timeout: Duration::from_millis(settings.attach_timeout_ms),
            word_size: settings.word_size,
        })
    }

    fn result_conditions(&self, injection_function: &str) -> Result<Vec<String>, ConfigError> {
        let mut conditions: Vec<String> = Vec::new();
        for condition in &self.session.result_conditions {
            let symbol = condition.trim();
            if symbol.is_empty()
                || symbol == injection_function
                || conditions.iter().any(|seen| seen == symbol)
            {
                return Err(ConfigError::InvalidResultCondition(condition.clone()));
            }
            conditions.push(symbol.to_string());
        }
        Ok(conditions)
    }

    fn target_catalog(&self) -> Result<TargetCatalog, ConfigError> {
        let mut catalog = TargetCatalog::new();
        for (category, settings) in self.targets.categories() {
            let Some(settings) = settings else {
                continue;
            };
            let targets = settings
                .entries
                .iter()
                .map(|entry| {
                    let name = entry.name.trim();
                    match category {
                        Category::Variable => Ok(Target::variable(
                            name,
                            entry.declared_type.as_deref(),
                            entry.weight,
                        )),
                        Category::Register => Ok(Target::register(name, entry.weight)),
                        Category::Memory => Target::memory(name, entry.weight),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            catalog.insert(category, settings.probability, targets)?;
        }
        Ok(catalog)
    }

    fn operation_catalog(&self) -> Result<OperationCatalog, ConfigError> {
        if self.operations.is_empty() {
            return Ok(OperationCatalog::standard());
        }
        self.operations
            .iter()
            .map(OperationSettings::to_operation)
            .collect::<Result<Vec<_>, _>>()
            .map(OperationCatalog::new)
    }
}

impl OperationSettings {
    fn to_operation(&self) -> Result<Operation, ConfigError> {
        let kind = self.kind;
        let invalid = |reason: &str| ConfigError::InvalidOperation {
            kind,
            reason: reason.to_string(),
        };

        if self.categories.is_empty() {
            return Err(invalid("it applies to no category"));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(ConfigError::InvalidWeight {
                context: format!("{kind} operation"),
                weight: self.weight,
            });
        }
        if self.bit.is_some() && kind != OperationKind::BitFlip {
            return Err(invalid("'bit' only applies to bit-flip"));
        }
        if (self.min.is_some() || self.max.is_some()) && kind != OperationKind::RandomValue {
            return Err(invalid("'min' and 'max' only apply to random-value"));
        }
        let is_mask = matches!(
            kind,
            OperationKind::Xor | OperationKind::And | OperationKind::Or
        );
        if !self.values.is_empty() && !is_mask {
            return Err(invalid("'values' only apply to xor, and, or"));
        }

        let corruption = match kind {
            OperationKind::BitFlip => {
                if let Some(bit) = self.bit.filter(|bit| *bit >= 64) {
                    return Err(invalid(&format!("bit {bit} is not below 64")));
                }
                Corruption::BitFlip { bit: self.bit }
            }
            OperationKind::RandomValue => {
                let range = match (self.min, self.max) {
                    (None, None) => None,
                    (min, max) => {
                        let min = min.unwrap_or(0);
                        let max = max.unwrap_or(u64::MAX);
                        if min > max {
                            return Err(invalid(&format!("min {min} is greater than max {max}")));
                        }
                        Some(min..=max)
                    }
                };
                Corruption::RandomValue { range }
            }
            OperationKind::Zeroing => Corruption::Zeroing,
            OperationKind::Xor => self.mask(MaskOp::Xor)?,
            OperationKind::And => self.mask(MaskOp::And)?,
            OperationKind::Or => self.mask(MaskOp::Or)?,
        };

        Ok(Operation::new(corruption, self.categories.iter().copied()).with_weight(self.weight))
    }

    fn mask(&self, op: MaskOp) -> Result<Corruption, ConfigError> {
        let patterns = WeightedSampler::new(
            self.values
                .iter()
                .map(|pattern| (pattern.value, pattern.probability)),
        )
        .map_err(|err| ConfigError::InvalidOperation {
            kind: self.kind,
            reason: format!("patterns: {err}"),
        })?;
        Ok(Corruption::Mask { op, patterns })
    }
}

fn validate_remote(remote: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidRemote(remote.to_string());
    let (host, port) = remote.rsplit_once(':').ok_or_else(invalid)?;
    if host.trim().is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(())
}

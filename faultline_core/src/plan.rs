use crate::config::ConfigError;
use crate::operation::{Operation, OperationCatalog};
use crate::sampler::{SamplerError, WeightedSampler};
use crate::target::{Target, TargetCatalog};
use rand::Rng;

/// One injection decision: what to corrupt and how.
#[derive(Debug, Clone, Copy)]
pub struct Decision<'a> {
    pub target: &'a Target,
    pub operation: &'a Operation,
}

/// Targets and applicable operations of one sampled category.
#[derive(Debug, Clone)]
struct CategoryPlan {
    targets: WeightedSampler<Target>,
    operations: WeightedSampler<Operation>,
}

/// The validated, read-only sampling structure behind every injection decision.
///
/// Built once per campaign; all samplers are checked up front so that a category with no
/// targets, zero total weight or no applicable operation fails the campaign before any run.
#[derive(Debug, Clone)]
pub struct InjectionPlan {
    targets: TargetCatalog,
    categories: WeightedSampler<CategoryPlan>,
}

impl InjectionPlan {
    /// Validates the catalogs into a plan. Categories declared with probability zero are
    /// excluded from sampling and are not required to be populated.
    pub fn new(targets: TargetCatalog, operations: OperationCatalog) -> Result<Self, ConfigError> {
        let mut weighted_categories = Vec::new();

        for (category, entry) in targets.iter() {
            if entry.probability == 0.0 {
                continue;
            }
            let target_sampler = WeightedSampler::new(
                entry
                    .targets
                    .iter()
                    .map(|target| (target.clone(), target.weight)),
            )
            .map_err(|err| sampler_error(err, &format!("{category} targets")))?;
            let operation_sampler = WeightedSampler::new(operations.weighted_for(category))
                .map_err(|err| sampler_error(err, &format!("{category} operations")))?;

            weighted_categories.push((
                CategoryPlan {
                    targets: target_sampler,
                    operations: operation_sampler,
                },
                entry.probability,
            ));
        }

        let categories = WeightedSampler::new(weighted_categories)
            .map_err(|err| sampler_error(err, "target categories"))?;

        Ok(Self {
            targets,
            categories,
        })
    }

    /// Two-level draw: a category by its probability, then a target of that category by its
    /// weight, then one of the category's applicable operations.
    pub fn decide<R: Rng + ?Sized>(&self, rng: &mut R) -> Decision<'_> {
        let category = self.categories.sample(rng);
        Decision {
            target: category.targets.sample(rng),
            operation: category.operations.sample(rng),
        }
    }

    pub fn targets(&self) -> &TargetCatalog {
        &self.targets
    }
}

fn sampler_error(err: SamplerError, domain: &str) -> ConfigError {
    match err {
        SamplerError::EmptyDomain => ConfigError::EmptyDomain(domain.to_string()),
        SamplerError::InvalidWeight { weight, .. } => ConfigError::InvalidWeight {
            context: domain.to_string(),
            weight,
        },
    }
}

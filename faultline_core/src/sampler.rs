use rand::Rng;
use thiserror::Error;

/// Errors that can occur while building a `WeightedSampler`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    /// The mapping has no entries, or every weight in it is zero.
    #[error("Sampling domain is empty or all of its weights are zero")]
    EmptyDomain,
    /// A weight was negative, NaN or infinite.
    #[error("Invalid weight {weight} at position {index}: weights must be finite and non-negative")]
    InvalidWeight { index: usize, weight: f64 },
}

/// Draws items from a fixed `item -> weight` mapping so that
/// `P(item) = weight(item) / sum(weights)`.
///
/// Weights do not need to sum to 1. The sampler is immutable once built and holds no
/// randomness of its own: every draw takes the caller's random source, which keeps a
/// seeded campaign reproducible.
#[derive(Debug, Clone)]
pub struct WeightedSampler<T> {
    items: Vec<T>,
    cumulative: Vec<f64>,
    total: f64,
    /// Index of the last item with a positive weight, used when floating point rounding
    /// pushes a draw onto the upper boundary.
    last_positive: usize,
}

impl<T> WeightedSampler<T> {
    /// Builds a sampler from `(item, weight)` pairs.
    ///
    /// Returns `Err(SamplerError::EmptyDomain)` if there are no pairs or all weights are
    /// zero, and `Err(SamplerError::InvalidWeight)` for a negative or non-finite weight.
    pub fn new<W>(weighted: W) -> Result<Self, SamplerError>
    where
        W: IntoIterator<Item = (T, f64)>,
    {
        let mut items = Vec::new();
        let mut cumulative = Vec::new();
        let mut total = 0.0;
        let mut last_positive = None;

        for (index, (item, weight)) in weighted.into_iter().enumerate() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(SamplerError::InvalidWeight { index, weight });
            }
            if weight > 0.0 {
                last_positive = Some(index);
            }
            total += weight;
            items.push(item);
            cumulative.push(total);
        }

        match last_positive {
            Some(last_positive) if total > 0.0 => Ok(Self {
                items,
                cumulative,
                total,
                last_positive,
            }),
            _ => Err(SamplerError::EmptyDomain),
        }
    }

    /// Builds a sampler where every item has the same weight.
    pub fn uniform<I>(items: I) -> Result<Self, SamplerError>
    where
        I: IntoIterator<Item = T>,
    {
        Self::new(items.into_iter().map(|item| (item, 1.0)))
    }

    /// Draws one item.
    ///
    /// A uniform value in `[0, total)` is compared against the running cumulative sums and
    /// the first item whose cumulative sum exceeds it wins, so each item owns the interval
    /// `[previous_sum, its_sum)`. Zero-weight items own an empty interval and are never drawn.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        let draw = rng.random::<f64>() * self.total;
        let index = self
            .cumulative
            .iter()
            .position(|&boundary| boundary > draw)
            .unwrap_or(self.last_positive);
        &self.items[index]
    }

    /// Normalized probability of the item at `index`.
    pub fn probability(&self, index: usize) -> Option<f64> {
        let upper = *self.cumulative.get(index)?;
        let lower = if index == 0 {
            0.0
        } else {
            self.cumulative[index - 1]
        };
        Some((upper - lower) / self.total)
    }

}

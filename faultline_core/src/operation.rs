use crate::sampler::WeightedSampler;
use crate::target::{Category, ValueDomain};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Errors raised while applying a corruption to a concrete value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The debugger returned zero bytes for the target.
    #[error("Cannot corrupt an empty value")]
    EmptyValue,
    /// An explicit bit index does not exist in a value of this width.
    #[error("Bit {bit} is out of range for a {width_bits}-bit value")]
    BitOutOfRange { bit: u32, width_bits: u32 },
}

/// The tag of a corruption, as written in configuration and reports.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    BitFlip,
    RandomValue,
    Zeroing,
    Xor,
    And,
    Or,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::BitFlip => "bit-flip",
            OperationKind::RandomValue => "random-value",
            OperationKind::Zeroing => "zeroing",
            OperationKind::Xor => "xor",
            OperationKind::And => "and",
            OperationKind::Or => "or",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Xor,
    And,
    Or,
}

/// A stateless transform from the current value of a target to the injected value.
#[derive(Debug, Clone)]
pub enum Corruption {
    /// Flip one bit; `None` picks a bit uniformly within the value's bit width.
    BitFlip { bit: Option<u32> },
    /// Replace with a random value; `None` draws from the target's value domain.
    RandomValue { range: Option<RangeInclusive<u64>> },
    Zeroing,
    /// Combine the current value with a pattern drawn from a weighted list.
    Mask {
        op: MaskOp,
        patterns: WeightedSampler<u64>,
    },
}

/// Result of applying a `Corruption`: the new bytes and the parameter that was used
/// (bit index, drawn value or mask pattern), when there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub value: Vec<u8>,
    pub parameter: Option<u64>,
}

impl Corruption {
    pub fn kind(&self) -> OperationKind {
        match self {
            Corruption::BitFlip { .. } => OperationKind::BitFlip,
            Corruption::RandomValue { .. } => OperationKind::RandomValue,
            Corruption::Zeroing => OperationKind::Zeroing,
            Corruption::Mask { op: MaskOp::Xor, .. } => OperationKind::Xor,
            Corruption::Mask { op: MaskOp::And, .. } => OperationKind::And,
            Corruption::Mask { op: MaskOp::Or, .. } => OperationKind::Or,
        }
    }

    /// Computes the corrupted value. The output always has the same width as `current`.
    ///
    /// # Arguments
    /// * `current`: Little-endian bytes read from the target.
    /// * `domain`: The target's declared value domain, if known. It narrows the bits a
    ///   random bit flip or random value may touch.
    /// * `rng`: Random source for every parameter that is not fixed by configuration.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        current: &[u8],
        domain: Option<ValueDomain>,
        rng: &mut R,
    ) -> Result<Applied, OperationError> {
        if current.is_empty() {
            return Err(OperationError::EmptyValue);
        }
        let width_bits = (current.len() * 8) as u32;
        let domain_bits = domain.map_or(width_bits, |d| d.bits.min(width_bits));

        match self {
            Corruption::BitFlip { bit } => {
                let bit = match bit {
                    Some(bit) if *bit >= width_bits => {
                        return Err(OperationError::BitOutOfRange {
                            bit: *bit,
                            width_bits,
                        });
                    }
                    Some(bit) => *bit,
                    None => rng.random_range(0..domain_bits),
                };
                Ok(Applied {
                    value: flip_bit(current, bit),
                    parameter: Some(bit as u64),
                })
            }
            Corruption::RandomValue { range } => {
                if let Some(range) = range {
                    let drawn = truncate(rng.random_range(range.clone()), current.len());
                    return Ok(Applied {
                        value: encode_le(drawn, current.len()),
                        parameter: Some(drawn),
                    });
                }
                if domain_bits > 64 {
                    let mut value = vec![0u8; current.len()];
                    rng.fill(&mut value[..]);
                    return Ok(Applied {
                        value,
                        parameter: None,
                    });
                }
                let drawn = if domain_bits == 64 {
                    rng.random::<u64>()
                } else {
                    rng.random_range(0..(1u64 << domain_bits))
                };
                Ok(Applied {
                    value: encode_le(drawn, current.len()),
                    parameter: Some(drawn),
                })
            }
            Corruption::Zeroing => Ok(Applied {
                value: zero(current),
                parameter: None,
            }),
            Corruption::Mask { op, patterns } => {
                let pattern = truncate(*patterns.sample(rng), current.len());
                Ok(Applied {
                    value: mask(*op, current, pattern),
                    parameter: Some(pattern),
                })
            }
        }
    }
}

/// Flips `bit` (0 = least significant bit of the first byte) in a little-endian value.
pub fn flip_bit(value: &[u8], bit: u32) -> Vec<u8> {
    let mut out = value.to_vec();
    let byte = (bit / 8) as usize;
    if let Some(target) = out.get_mut(byte) {
        *target ^= 1 << (bit % 8);
    }
    out
}

pub fn zero(value: &[u8]) -> Vec<u8> {
    vec![0; value.len()]
}

/// Applies `op` with `pattern` encoded at the value's width. Patterns wider than the value
/// are truncated; narrower values are zero-extended.
pub fn mask(op: MaskOp, value: &[u8], pattern: u64) -> Vec<u8> {
    let pattern = encode_le(pattern, value.len());
    value
        .iter()
        .zip(pattern)
        .map(|(byte, pattern)| match op {
            MaskOp::Xor => byte ^ pattern,
            MaskOp::And => byte & pattern,
            MaskOp::Or => byte | pattern,
        })
        .collect()
}

/// Keeps the low `width` bytes of `value`, the part `encode_le` writes.
pub fn truncate(value: u64, width: usize) -> u64 {
    match width {
        0 => 0,
        1..8 => value & ((1u64 << (width * 8)) - 1),
        _ => value,
    }
}

/// Little-endian encoding of `value` truncated or zero-extended to `width` bytes.
pub fn encode_le(value: u64, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    for (dst, src) in out.iter_mut().zip(value.to_le_bytes()) {
        *dst = src;
    }
    out
}

/// An entry of the operation catalog.
#[derive(Debug, Clone)]
pub struct Operation {
    pub corruption: Corruption,
    pub categories: BTreeSet<Category>,
    /// Relative weight among the operations of a category.
    pub weight: f64,
}

impl Operation {
    pub fn new(corruption: Corruption, categories: impl IntoIterator<Item = Category>) -> Self {
        Self {
            corruption,
            categories: categories.into_iter().collect(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.corruption.kind()
    }

    pub fn applies_to(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }
}

/// Maps each target category to the corruptions applicable to it.
#[derive(Debug, Clone, Default)]
pub struct OperationCatalog {
    operations: Vec<Operation>,
}

impl OperationCatalog {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    /// Random bit flip, random value and zeroing, applicable to every category with equal
    /// weight.
    pub fn standard() -> Self {
        Self::new(vec![
            Operation::new(Corruption::BitFlip { bit: None }, Category::ALL),
            Operation::new(Corruption::RandomValue { range: None }, Category::ALL),
            Operation::new(Corruption::Zeroing, Category::ALL),
        ])
    }

    /// The operations applicable to `category`, with their weights.
    pub fn weighted_for(&self, category: Category) -> Vec<(Operation, f64)> {
        self.operations
            .iter()
            .filter(|operation| operation.applies_to(category))
            .map(|operation| (operation.clone(), operation.weight))
            .collect()
    }
}

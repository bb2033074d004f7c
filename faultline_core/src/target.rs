use crate::config::ConfigError;
use crate::session::Access;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// The closed set of places a fault can be injected into.
#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Variable,
    Register,
    Memory,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Variable, Category::Register, Category::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Variable => "variable",
            Category::Register => "register",
            Category::Memory => "memory",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A memory target, either a single word or a range in which a word is picked per injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryLocation {
    Address(u64),
    Range { start: u64, end: u64 },
}

impl MemoryLocation {
    /// Parses `0x7ffdf000` or `0x20000000:0x20000010` (end exclusive).
    pub fn parse(identifier: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidMemoryTarget(identifier.to_string());
        match identifier.split_once(':') {
            Some((start, end)) => {
                let start = parse_hex(start).ok_or_else(invalid)?;
                let end = parse_hex(end).ok_or_else(invalid)?;
                if start >= end {
                    return Err(invalid());
                }
                Ok(MemoryLocation::Range { start, end })
            }
            None => parse_hex(identifier)
                .map(MemoryLocation::Address)
                .ok_or_else(invalid),
        }
    }

    /// Picks the concrete address for one injection. Ranges yield a word-aligned offset
    /// drawn uniformly so that a whole word still fits below `end`.
    pub fn resolve<R: Rng + ?Sized>(&self, word_size: u64, rng: &mut R) -> u64 {
        match *self {
            MemoryLocation::Address(address) => address,
            MemoryLocation::Range { start, end } => {
                let words = ((end - start) / word_size.max(1)).max(1);
                start + rng.random_range(0..words) * word_size
            }
        }
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}

/// The set of values a target can hold, derived from its declared C type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueDomain {
    pub bits: u32,
}

impl ValueDomain {
    /// Maps common C type names to their domain. Pointers and unknown types yield `None`
    /// and fall back to the width of the bytes read from the debuggee.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
        let bits = match normalized.as_str() {
            "bool" | "_Bool" => 1,
            "char" | "signed char" | "unsigned char" | "int8_t" | "uint8_t" => 8,
            "short" | "short int" | "unsigned short" | "int16_t" | "uint16_t" => 16,
            "int" | "signed int" | "unsigned" | "unsigned int" | "int32_t" | "uint32_t"
            | "float" => 32,
            "long" | "long int" | "long long" | "unsigned long" | "unsigned long long"
            | "int64_t" | "uint64_t" | "ssize_t" | "size_t" | "double" => 64,
            _ => return None,
        };
        Some(Self { bits })
    }
}

/// How a target is reached in the debuggee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Variable(String),
    Register(String),
    Memory(MemoryLocation),
}

/// A declared injection target. Immutable once loaded from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub category: Category,
    pub identifier: String,
    pub declared_type: Option<String>,
    pub weight: f64,
    pub location: Location,
}

impl Target {
    pub fn variable(name: &str, declared_type: Option<&str>, weight: f64) -> Self {
        Self {
            category: Category::Variable,
            identifier: name.to_string(),
            declared_type: declared_type.map(str::to_string),
            weight,
            location: Location::Variable(name.to_string()),
        }
    }

    pub fn register(name: &str, weight: f64) -> Self {
        Self {
            category: Category::Register,
            identifier: name.to_string(),
            declared_type: None,
            weight,
            location: Location::Register(name.to_string()),
        }
    }

    pub fn memory(identifier: &str, weight: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            category: Category::Memory,
            identifier: identifier.to_string(),
            declared_type: None,
            weight,
            location: Location::Memory(MemoryLocation::parse(identifier)?),
        })
    }

    /// Domain implied by the declared type, if it names a known scalar.
    pub fn value_domain(&self) -> Option<ValueDomain> {
        self.declared_type
            .as_deref()
            .and_then(ValueDomain::from_type_name)
    }

    /// Resolves the debugger access for one injection, plus the concrete address when the
    /// target is a memory word.
    pub fn access<R: Rng + ?Sized>(&self, word_size: u64, rng: &mut R) -> (Access, Option<u64>) {
        match &self.location {
            Location::Memory(memory) => {
                let address = memory.resolve(word_size, rng);
                (memory_word(address, word_size), Some(address))
            }
            _ => (self.base_access(word_size), None),
        }
    }

    /// Access without any random choice: memory ranges resolve to their first word.
    pub fn base_access(&self, word_size: u64) -> Access {
        match &self.location {
            Location::Variable(name) => Access::Variable(name.clone()),
            Location::Register(name) => Access::Register(name.clone()),
            Location::Memory(MemoryLocation::Address(address))
            | Location::Memory(MemoryLocation::Range { start: address, .. }) => {
                memory_word(*address, word_size)
            }
        }
    }
}

fn memory_word(address: u64, word_size: u64) -> Access {
    Access::Memory {
        address,
        len: word_size as usize,
    }
}

/// Targets of one category together with the category-level sampling probability.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryTargets {
    pub probability: f64,
    pub targets: Vec<Target>,
}

/// All declared targets, grouped by category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetCatalog {
    categories: BTreeMap<Category, CategoryTargets>,
}

impl TargetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a category. Identifiers must be unique within it and every target must belong
    /// to `category`.
    pub fn insert(
        &mut self,
        category: Category,
        probability: f64,
        targets: Vec<Target>,
    ) -> Result<(), ConfigError> {
        if !probability.is_finite() || probability < 0.0 {
            return Err(ConfigError::InvalidWeight {
                context: format!("{category} probability"),
                weight: probability,
            });
        }
        let mut seen = HashSet::new();
        for target in &targets {
            if target.category != category {
                return Err(ConfigError::MisplacedTarget {
                    expected: category,
                    identifier: target.identifier.clone(),
                });
            }
            if target.identifier.trim().is_empty() {
                return Err(ConfigError::EmptyIdentifier(category));
            }
            if !seen.insert(target.identifier.as_str()) {
                return Err(ConfigError::DuplicateTarget {
                    category,
                    identifier: target.identifier.clone(),
                });
            }
        }
        self.categories.insert(
            category,
            CategoryTargets {
                probability,
                targets,
            },
        );
        Ok(())
    }

    pub fn get(&self, category: Category) -> Option<&CategoryTargets> {
        self.categories.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &CategoryTargets)> {
        self.categories.iter().map(|(category, entry)| (*category, entry))
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.categories.values().flat_map(|entry| entry.targets.iter())
    }
}

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;

use crate::error::{DemError, DemResult};
use crate::hyperparams::value::{HyperValue, ParamInput};

pub const LOG_GRID_POINTS: usize = 100;

/// How a searchable hyperparameter is drawn.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchSpec {
    LinearFloat { low: f64, high: f64 },
    LinearInt { low: i64, high: i64 },
    LinearTuple { low: Vec<i64>, high: Vec<i64> },
    Log { low: f64, high: f64 },
    Exp { base: ExpBase, low_exp: i64, high_exp: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpBase {
    Int(i64),
    Float(f64),
}

impl SearchSpec {
    /// Parse a `[low, high, kind]` (or `[base, [lo, hi], "exp"]`) literal.
    pub fn from_list(key: &str, items: &[ParamInput]) -> DemResult<Self> {
        let malformed = |why: &str| {
            DemError::config(format!(
                "malformed search spec for '{}': {} ({})",
                key,
                why,
                ParamInput::List(items.to_vec()).describe()
            ))
        };
        if items.len() < 3 {
            return Err(malformed("expected at least three elements"));
        }
        let kind = match &items[2] {
            ParamInput::Value(HyperValue::Text(kind)) => kind.as_str(),
            _ => return Err(malformed("third element must be the search kind")),
        };

        match kind {
            "linear" => match (&items[0], &items[1]) {
                (
                    ParamInput::Value(HyperValue::Int(low)),
                    ParamInput::Value(HyperValue::Int(high)),
                ) => {
                    if low > high {
                        return Err(malformed("low bound exceeds high bound"));
                    }
                    Ok(Self::LinearInt {
                        low: *low,
                        high: *high,
                    })
                }
                (ParamInput::Value(low), ParamInput::Value(high))
                    if matches!(low, HyperValue::Float(_))
                        || matches!(high, HyperValue::Float(_)) =>
                {
                    let (Some(low), Some(high)) = (low.as_f64(), high.as_f64()) else {
                        return Err(malformed("linear bounds must both be numeric"));
                    };
                    if low > high {
                        return Err(malformed("low bound exceeds high bound"));
                    }
                    Ok(Self::LinearFloat { low, high })
                }
                (low, high) => match (low.as_tuple(), high.as_tuple()) {
                    (Some(low), Some(high)) => {
                        if low.len() != high.len() || low.is_empty() {
                            return Err(malformed("tuple bounds must have equal, non-zero length"));
                        }
                        if low.iter().zip(&high).any(|(l, h)| l > h) {
                            return Err(malformed("low bound exceeds high bound"));
                        }
                        Ok(Self::LinearTuple { low, high })
                    }
                    _ => Err(malformed("linear bounds must be floats, integers or tuples")),
                },
            },
            "log" => {
                let (ParamInput::Value(low), ParamInput::Value(high)) = (&items[0], &items[1])
                else {
                    return Err(malformed("log bounds must be numeric"));
                };
                let (Some(low), Some(high)) = (low.as_f64(), high.as_f64()) else {
                    return Err(malformed("log bounds must be numeric"));
                };
                if low <= 0.0 || high <= 0.0 {
                    return Err(malformed("log bounds must be positive"));
                }
                Ok(Self::Log { low, high })
            }
            "exp" => {
                let base = match &items[0] {
                    ParamInput::Value(HyperValue::Int(b)) => ExpBase::Int(*b),
                    ParamInput::Value(HyperValue::Float(b)) => ExpBase::Float(*b),
                    _ => return Err(malformed("exp base must be numeric")),
                };
                let exps = items[1]
                    .as_tuple()
                    .ok_or_else(|| malformed("exp exponents must be a (low, high) pair"))?;
                let [low_exp, high_exp] = exps[..] else {
                    return Err(malformed("exp exponents must be a (low, high) pair"));
                };
                if low_exp > high_exp {
                    return Err(malformed("low exponent exceeds high exponent"));
                }
                Ok(Self::Exp {
                    base,
                    low_exp,
                    high_exp,
                })
            }
            other => Err(malformed(&format!("unknown search kind '{}'", other))),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> HyperValue {
        match self {
            Self::LinearFloat { low, high } => HyperValue::Float(rng.random_range(*low..=*high)),
            Self::LinearInt { low, high } => HyperValue::Int(rng.random_range(*low..=*high)),
            Self::LinearTuple { low, high } => HyperValue::Tuple(
                low.iter()
                    .zip(high)
                    .map(|(l, h)| rng.random_range(*l..=*h))
                    .collect(),
            ),
            Self::Log { low, high } => {
                let grid = log_grid(*low, *high, LOG_GRID_POINTS);
                HyperValue::Float(grid[rng.random_range(0..grid.len())])
            }
            Self::Exp {
                base,
                low_exp,
                high_exp,
            } => exp_value(*base, rng.random_range(*low_exp..=*high_exp)),
        }
    }

    /// Concrete value used until the first sample is drawn.
    pub fn starting_value(&self) -> HyperValue {
        match self {
            Self::LinearFloat { low, .. } | Self::Log { low, .. } => HyperValue::Float(*low),
            Self::LinearInt { low, .. } => HyperValue::Int(*low),
            Self::LinearTuple { low, .. } => HyperValue::Tuple(low.clone()),
            Self::Exp { base, low_exp, .. } => exp_value(*base, *low_exp),
        }
    }
}

impl fmt::Display for SearchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinearFloat { low, high } => write!(f, "linear[{}, {}]", low, high),
            Self::LinearInt { low, high } => write!(f, "linear[{}, {}]", low, high),
            Self::LinearTuple { low, high } => write!(f, "linear[{:?}, {:?}]", low, high),
            Self::Log { low, high } => write!(f, "log[{}, {}]", low, high),
            Self::Exp {
                base,
                low_exp,
                high_exp,
            } => {
                let b = match base {
                    ExpBase::Int(b) => *b as f64,
                    ExpBase::Float(b) => *b,
                };
                write!(f, "{}^[{}, {}]", b, low_exp, high_exp)
            }
        }
    }
}

/// `n` points evenly spaced in log10 between `low` and `high`, both included.
pub fn log_grid(low: f64, high: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![low];
    }
    let a = low.log10();
    let b = high.log10();
    let step = (b - a) / (n - 1) as f64;
    (0..n).map(|i| 10f64.powf(a + step * i as f64)).collect()
}

fn exp_value(base: ExpBase, k: i64) -> HyperValue {
    match base {
        ExpBase::Int(b) if k >= 0 => u32::try_from(k)
            .ok()
            .and_then(|k| b.checked_pow(k))
            .map(HyperValue::Int)
            .unwrap_or_else(|| HyperValue::Float((b as f64).powf(k as f64))),
        ExpBase::Int(b) => HyperValue::Float((b as f64).powf(k as f64)),
        ExpBase::Float(b) => HyperValue::Float(b.powf(k as f64)),
    }
}

/// Every hyperparameter resolved to a concrete value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedParams {
    values: BTreeMap<String, HyperValue>,
}

impl FixedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<HyperValue>) -> Self {
        self.insert(key, value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: HyperValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&HyperValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HyperValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn require(&self, key: &str) -> DemResult<&HyperValue> {
        self.values
            .get(key)
            .ok_or_else(|| DemError::config(format!("hyperparameter '{}' is not set", key)))
    }

    pub fn f64(&self, key: &str) -> DemResult<f64> {
        let v = self.require(key)?;
        v.as_f64().ok_or_else(|| {
            DemError::config(format!("hyperparameter '{}' must be numeric, got {}", key, v))
        })
    }

    pub fn usize(&self, key: &str) -> DemResult<usize> {
        let v = self.require(key)?;
        v.as_i64()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| {
                DemError::config(format!(
                    "hyperparameter '{}' must be a non-negative integer, got {}",
                    key, v
                ))
            })
    }

    pub fn text(&self, key: &str) -> DemResult<&str> {
        let v = self.require(key)?;
        v.as_str().ok_or_else(|| {
            DemError::config(format!("hyperparameter '{}' must be text, got {}", key, v))
        })
    }
}

impl fmt::Display for FixedParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Hyperparameters still pending a sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSpace {
    specs: BTreeMap<String, SearchSpec>,
}

impl SearchSpace {
    pub fn insert(&mut self, key: &str, spec: SearchSpec) {
        self.specs.insert(key.to_string(), spec);
    }

    pub fn remove(&mut self, key: &str) -> Option<SearchSpec> {
        self.specs.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&SearchSpec> {
        self.specs.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.specs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SearchSpec)> {
        self.specs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn sample_one<R: Rng + ?Sized>(&self, key: &str, rng: &mut R) -> DemResult<HyperValue> {
        self.specs
            .get(key)
            .map(|spec| spec.sample(rng))
            .ok_or_else(|| DemError::config(format!("'{}' is not a searchable hyperparameter", key)))
    }
}

/// Fixed values plus the subset of keys that are searched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HyperparameterSet {
    pub fixed: FixedParams,
    pub search: SearchSpace,
}

impl HyperparameterSet {
    pub fn new(defaults: FixedParams) -> Self {
        Self {
            fixed: defaults,
            search: SearchSpace::default(),
        }
    }

    /// Merge `values` on top of the current assignment.
    ///
    /// Plain values overwrite the fixed entry and drop any pending search for
    /// that key. Search specs register the key as searchable; the key keeps its
    /// current value (or the spec's lower bound) until the first sample.
    pub fn set_hyperparameters<I, K>(&mut self, values: I) -> DemResult<()>
    where
        I: IntoIterator<Item = (K, ParamInput)>,
        K: AsRef<str>,
    {
        for (key, input) in values {
            let key = key.as_ref();
            match input {
                ParamInput::Value(v) => {
                    self.fixed.insert(key, v);
                    self.search.remove(key);
                }
                ParamInput::List(ref items) if input.is_search_spec() => {
                    let spec = SearchSpec::from_list(key, items)?;
                    if !self.fixed.contains(key) {
                        self.fixed.insert(key, spec.starting_value());
                    }
                    self.search.insert(key, spec);
                }
                list @ ParamInput::List(_) => match list.as_tuple() {
                    Some(tuple) => {
                        self.fixed.insert(key, HyperValue::Tuple(tuple));
                        self.search.remove(key);
                    }
                    None => {
                        return Err(DemError::config(format!(
                            "malformed search spec for '{}': {}",
                            key,
                            list.describe()
                        )))
                    }
                },
            }
        }
        Ok(())
    }

    /// Parse a TOML table of hyperparameters and merge it.
    pub fn set_from_toml(&mut self, table: &toml::Table) -> DemResult<()> {
        let inputs = table
            .iter()
            .map(|(k, v)| ParamInput::try_from(v).map(|input| (k.clone(), input)))
            .collect::<DemResult<Vec<_>>>()?;
        self.set_hyperparameters(inputs)
    }
}

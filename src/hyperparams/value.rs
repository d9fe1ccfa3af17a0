use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DemError, DemResult};

/// A concrete hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperValue {
    Int(i64),
    Float(f64),
    Text(String),
    Tuple(Vec<i64>),
}

impl HyperValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view; floats are accepted only when they carry no fraction.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[i64]> {
        match self {
            Self::Tuple(v) => Some(v),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for HyperValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            // Keep a decimal point so the value parses back as a float.
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{:.1}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

impl FromStr for HyperValue {
    type Err = DemError;

    fn from_str(s: &str) -> DemResult<Self> {
        let s = s.trim();
        if let Ok(v) = s.parse::<i64>() {
            return Ok(Self::Int(v));
        }
        if let Ok(v) = s.parse::<f64>() {
            return Ok(Self::Float(v));
        }
        if let Some(inner) = s.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
            let items = inner
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse::<i64>().map_err(|_| {
                        DemError::config(format!("invalid tuple component '{}' in '{}'", part, s))
                    })
                })
                .collect::<DemResult<Vec<i64>>>()?;
            return Ok(Self::Tuple(items));
        }
        Ok(Self::Text(s.to_string()))
    }
}

impl From<i64> for HyperValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for HyperValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for HyperValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Raw hyperparameter input as handed over by a caller or a config file.
///
/// A `List` whose third element is a kind tag (`"linear"`, `"log"`, `"exp"`)
/// is a search specification; every other input is a fixed value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamInput {
    Value(HyperValue),
    List(Vec<ParamInput>),
}

impl ParamInput {
    pub fn linear(low: impl Into<HyperValue>, high: impl Into<HyperValue>) -> Self {
        Self::List(vec![
            Self::Value(low.into()),
            Self::Value(high.into()),
            Self::Value(HyperValue::from("linear")),
        ])
    }

    pub fn linear_tuple(low: Vec<i64>, high: Vec<i64>) -> Self {
        Self::List(vec![
            Self::Value(HyperValue::Tuple(low)),
            Self::Value(HyperValue::Tuple(high)),
            Self::Value(HyperValue::from("linear")),
        ])
    }

    pub fn log(low: f64, high: f64) -> Self {
        Self::List(vec![
            Self::Value(HyperValue::Float(low)),
            Self::Value(HyperValue::Float(high)),
            Self::Value(HyperValue::from("log")),
        ])
    }

    pub fn exp(base: impl Into<HyperValue>, low_exp: i64, high_exp: i64) -> Self {
        Self::List(vec![
            Self::Value(base.into()),
            Self::Value(HyperValue::Tuple(vec![low_exp, high_exp])),
            Self::Value(HyperValue::from("exp")),
        ])
    }

    /// True when this input is a search specification rather than a value.
    pub fn is_search_spec(&self) -> bool {
        match self {
            Self::List(items) => {
                items.len() >= 3 && matches!(&items[2], Self::Value(HyperValue::Text(_)))
            }
            Self::Value(_) => false,
        }
    }

    /// Collapse a plain integer list into a tuple value.
    pub(crate) fn as_tuple(&self) -> Option<Vec<i64>> {
        match self {
            Self::Value(HyperValue::Tuple(items)) => Some(items.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| match item {
                    Self::Value(v) => match v {
                        HyperValue::Int(i) => Some(*i),
                        _ => None,
                    },
                    Self::List(_) => None,
                })
                .collect(),
            Self::Value(_) => None,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Value(v) => format!("{} ({})", v, v.kind_name()),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.describe()).collect();
                format!("[{}]", parts.join(", "))
            }
        }
    }
}

impl From<HyperValue> for ParamInput {
    fn from(v: HyperValue) -> Self {
        Self::Value(v)
    }
}

impl From<i64> for ParamInput {
    fn from(v: i64) -> Self {
        Self::Value(HyperValue::Int(v))
    }
}

impl From<f64> for ParamInput {
    fn from(v: f64) -> Self {
        Self::Value(HyperValue::Float(v))
    }
}

impl From<&str> for ParamInput {
    fn from(v: &str) -> Self {
        Self::Value(HyperValue::from(v))
    }
}

impl TryFrom<&toml::Value> for ParamInput {
    type Error = DemError;

    fn try_from(value: &toml::Value) -> DemResult<Self> {
        match value {
            toml::Value::Integer(v) => Ok(Self::Value(HyperValue::Int(*v))),
            toml::Value::Float(v) => Ok(Self::Value(HyperValue::Float(*v))),
            toml::Value::String(s) => Ok(Self::Value(HyperValue::Text(s.clone()))),
            toml::Value::Array(items) => {
                let list = Self::List(
                    items
                        .iter()
                        .map(ParamInput::try_from)
                        .collect::<DemResult<Vec<_>>>()?,
                );
                if list.is_search_spec() {
                    return Ok(list);
                }
                match list.as_tuple() {
                    Some(tuple) => Ok(Self::Value(HyperValue::Tuple(tuple))),
                    None => Err(DemError::config(format!(
                        "array {} is neither an integer tuple nor a [low, high, kind] search spec",
                        list.describe()
                    ))),
                }
            }
            other => Err(DemError::config(format!(
                "unsupported hyperparameter value `{}`",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_from_str() {
        for v in [
            HyperValue::Int(32),
            HyperValue::Float(0.01),
            HyperValue::Float(2.0),
            HyperValue::Text("tanh".to_string()),
            HyperValue::Tuple(vec![8, 16]),
        ] {
            let parsed: HyperValue = v.to_string().parse().unwrap();
            assert_eq!(parsed, v);
        }
    }

    #[test]
    fn integral_float_is_usable_as_integer() {
        assert_eq!(HyperValue::Float(16.0).as_i64(), Some(16));
        assert_eq!(HyperValue::Float(16.5).as_i64(), None);
    }

    #[test]
    fn toml_arrays_map_to_tuple_or_search_spec() {
        let table: toml::Table = toml::from_str(
            r#"
widths = [8, 4]
neurons = [8, 32, "linear"]
batch = [2, [4, 7], "exp"]
bad = [1.5, "x"]
"#,
        )
        .unwrap();
        let widths = ParamInput::try_from(&table["widths"]).unwrap();
        assert_eq!(widths, ParamInput::Value(HyperValue::Tuple(vec![8, 4])));
        assert!(ParamInput::try_from(&table["neurons"]).unwrap().is_search_spec());
        assert!(ParamInput::try_from(&table["batch"]).unwrap().is_search_spec());
        assert!(ParamInput::try_from(&table["bad"]).is_err());
    }
}

//! Search space definitions: declaration, file loading and domain checks.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use mp_types::{validation_error, MpResult, SearchError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One concrete hyperparameter assignment.
pub type HyperparameterConfig = HashMap<String, ParameterValue>;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name as understood by the model (e.g. "max_depth").
    pub name: String,
    pub kind: ParameterKind,
}

/// Describes the domain of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Always the same value.
    Fixed { value: serde_json::Value },
    /// One of an enumerated set of values.
    Choice { values: Vec<serde_json::Value> },
    /// Integer range [low, high] inclusive.
    IntRange {
        low: i64,
        high: i64,
        #[serde(default)]
        log_scale: bool,
    },
    /// Continuous range [low, high]; sampled in log-space when `log_scale`.
    FloatRange {
        low: f64,
        high: f64,
        #[serde(default)]
        log_scale: bool,
    },
}

/// A concrete parameter value produced by a search strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Normalize a JSON literal: integers and floats get their own variants.
    pub fn from_json(value: &serde_json::Value) -> Self {
        if let Some(i) = value.as_i64() {
            Self::Int(i)
        } else if let (true, Some(f)) = (value.is_f64(), value.as_f64()) {
            Self::Float(f)
        } else {
            Self::Json(value.clone())
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Json(v) => v.clone(),
        }
    }

    /// Numeric view; integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
            Self::Json(v) => v.as_i64(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(v) => v.as_bool(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(v) => v.as_str(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Json(serde_json::Value::Null))
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl ParameterKind {
    /// Draw a value uniformly from the domain (log-uniformly for log ranges).
    pub fn sample<R: Rng>(&self, rng: &mut R) -> ParameterValue {
        match self {
            Self::Fixed { value } => ParameterValue::from_json(value),
            Self::Choice { values } => ParameterValue::from_json(&values[rng.gen_range(0..values.len())]),
            Self::IntRange {
                low,
                high,
                log_scale: false,
            } => ParameterValue::Int(rng.gen_range(*low..=*high)),
            Self::IntRange {
                low,
                high,
                log_scale: true,
            } => {
                let log_low = (*low as f64).ln();
                let log_high = (*high as f64 + 1.0).ln();
                let v = rng.gen_range(log_low..log_high).exp().floor() as i64;
                ParameterValue::Int(v.clamp(*low, *high))
            }
            Self::FloatRange {
                low,
                high,
                log_scale: false,
            } => ParameterValue::Float(rng.gen_range(*low..=*high)),
            Self::FloatRange {
                low,
                high,
                log_scale: true,
            } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
        }
    }

    /// Whether `value` lies inside the declared domain.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match self {
            Self::Fixed { value: fixed } => ParameterValue::from_json(fixed) == *value,
            Self::Choice { values } => values
                .iter()
                .any(|choice| ParameterValue::from_json(choice) == *value),
            Self::IntRange { low, high, .. } => {
                matches!(value, ParameterValue::Int(v) if v >= low && v <= high)
            }
            Self::FloatRange { low, high, .. } => match value {
                ParameterValue::Float(v) => v.is_finite() && v >= low && v <= high,
                ParameterValue::Int(v) => (*v as f64) >= *low && (*v as f64) <= *high,
                ParameterValue::Json(_) => false,
            },
        }
    }

    fn check(&self, name: &str) -> Result<(), String> {
        match self {
            Self::Fixed { .. } => Ok(()),
            Self::Choice { values } if values.is_empty() => {
                Err(format!("{name}: choice set is empty"))
            }
            Self::Choice { .. } => Ok(()),
            Self::IntRange { low, high, log_scale } => {
                if low > high {
                    Err(format!("{name}: low {low} is greater than high {high}"))
                } else if *log_scale && *low <= 0 {
                    Err(format!("{name}: log scale needs low > 0, got {low}"))
                } else {
                    Ok(())
                }
            }
            Self::FloatRange { low, high, log_scale } => {
                if !low.is_finite() || !high.is_finite() {
                    Err(format!("{name}: bounds must be finite"))
                } else if low > high {
                    Err(format!("{name}: low {low} is greater than high {high}"))
                } else if *log_scale && *low <= 0.0 {
                    Err(format!("{name}: log scale needs low > 0, got {low}"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Number of distinct values, `None` for continuous ranges.
    pub fn cardinality(&self) -> Option<usize> {
        match self {
            Self::Fixed { .. } => Some(1),
            Self::Choice { values } => Some(values.len()),
            Self::IntRange { low, high, .. } => usize::try_from(i128::from(*high) - i128::from(*low) + 1).ok(),
            Self::FloatRange { .. } => None,
        }
    }
}

/// The full search space: parameter definitions in a fixed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn add_fixed(self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.push(name, ParameterKind::Fixed { value })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.push(name, ParameterKind::Choice { values })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(
            name,
            ParameterKind::IntRange {
                low,
                high,
                log_scale: false,
            },
        )
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(
            name,
            ParameterKind::FloatRange {
                low,
                high,
                log_scale: false,
            },
        )
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(
            name,
            ParameterKind::FloatRange {
                low,
                high,
                log_scale: true,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Parse a declarative space document.
    ///
    /// Each key maps to a literal (fixed value), a list (choices) or a
    /// `{"low", "high", "log_scale"?}` object (range). Integer bounds give an
    /// integer range. Parameters come out sorted by name.
    pub fn from_json_value(document: &serde_json::Value) -> MpResult<Self> {
        let entries = document.as_object().ok_or_else(|| invalid("top level must be an object"))?;

        let mut space = Self::new();
        for (name, spec) in entries {
            let kind = match spec {
                serde_json::Value::Array(values) => ParameterKind::Choice {
                    values: values.clone(),
                },
                serde_json::Value::Object(fields) => parse_range(name, fields)?,
                literal => ParameterKind::Fixed {
                    value: literal.clone(),
                },
            };
            space = space.push(name.clone(), kind);
        }

        space.validate()?;
        Ok(space)
    }

    pub fn from_json_str(document: &str) -> MpResult<Self> {
        let value: serde_json::Value = serde_json::from_str(document)
            .map_err(|e| invalid(&format!("not valid JSON: {e}")))?;
        Self::from_json_value(&value)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MpResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(&format!("cannot read {}: {e}", path.display())))?;
        tracing::info!("Loaded search space definition from {}", path.display());
        Self::from_json_str(&text)
    }

    /// Reject malformed definitions.
    pub fn validate(&self) -> MpResult<()> {
        if self.parameters.is_empty() {
            return Err(invalid("no parameters declared"));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(invalid(&format!("duplicate parameter {}", param.name)));
            }
            param.kind.check(&param.name).map_err(|m| invalid(&m))?;
        }
        Ok(())
    }

    /// Check that `config` assigns every declared parameter, and nothing
    /// else, a value inside its domain.
    pub fn validate_config(&self, config: &HyperparameterConfig) -> MpResult<()> {
        for param in &self.parameters {
            match config.get(&param.name) {
                None => return Err(validation_error!("parameter {} is missing", param.name)),
                Some(value) if !param.kind.contains(value) => {
                    return Err(validation_error!(
                        "parameter {}={} lies outside its domain",
                        param.name,
                        value
                    ))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = config.keys().find(|k| self.get(k).is_none()) {
            return Err(validation_error!("parameter {} is not declared", extra));
        }
        Ok(())
    }

    /// Draw every parameter independently.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> HyperparameterConfig {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.kind.sample(rng)))
            .collect()
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        self.parameters
            .iter()
            .try_fold(1usize, |total, p| total.checked_mul(p.kind.cardinality()?))
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(message: &str) -> mp_types::MpError {
    SearchError::InvalidSearchSpace {
        message: message.to_string(),
    }
    .into()
}

fn parse_range(
    name: &str,
    fields: &serde_json::Map<String, serde_json::Value>,
) -> MpResult<ParameterKind> {
    if let Some(unknown) = fields
        .keys()
        .find(|k| !matches!(k.as_str(), "low" | "high" | "log_scale"))
    {
        return Err(invalid(&format!("{name}: unexpected key {unknown} in range object")));
    }
    let (low, high) = match (fields.get("low"), fields.get("high")) {
        (Some(low), Some(high)) => (low, high),
        _ => return Err(invalid(&format!("{name}: range object needs low and high"))),
    };
    let log_scale = match fields.get("log_scale") {
        None => false,
        Some(flag) => flag
            .as_bool()
            .ok_or_else(|| invalid(&format!("{name}: log_scale must be a boolean")))?,
    };

    if let (Some(low), Some(high)) = (low.as_i64(), high.as_i64()) {
        return Ok(ParameterKind::IntRange {
            low,
            high,
            log_scale,
        });
    }
    match (low.as_f64(), high.as_f64()) {
        (Some(low), Some(high)) => Ok(ParameterKind::FloatRange {
            low,
            high,
            log_scale,
        }),
        _ => Err(invalid(&format!("{name}: low and high must be numbers"))),
    }
}

// Matrix Expansion
// Expands a build-matrix definition into concrete, deterministically ordered environments

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Axes expanded when no other order is configured
pub const DEFAULT_AXES: &[&str] = &["runtime", "env"];

/// Errors that can occur while reading a matrix definition
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("failed to read matrix file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid matrix YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("matrix definition must be a mapping at the top level")]
    NotAMapping,

    #[error("axis '{axis}' has an unsupported value: {detail}")]
    InvalidAxisValue { axis: String, detail: String },
}

/// A single scalar value of one axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisValue::Bool(b) => write!(f, "{}", b),
            AxisValue::Integer(i) => write!(f, "{}", i),
            // `{:?}` keeps the fractional part, so 2.0 never collides with 2
            AxisValue::Float(x) => write!(f, "{:?}", x),
            AxisValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for AxisValue {
    fn from(s: &str) -> Self {
        AxisValue::String(s.to_string())
    }
}

impl From<String> for AxisValue {
    fn from(s: String) -> Self {
        AxisValue::String(s)
    }
}

impl From<i64> for AxisValue {
    fn from(i: i64) -> Self {
        AxisValue::Integer(i)
    }
}

impl From<bool> for AxisValue {
    fn from(b: bool) -> Self {
        AxisValue::Bool(b)
    }
}

/// Values given for one axis in a matrix definition
#[derive(Debug, Clone, PartialEq)]
pub enum AxisSpec {
    /// A scalar, treated as a one-element list
    Single(AxisValue),
    /// One branch per element
    List(Vec<AxisValue>),
}

impl AxisSpec {
    fn values(&self) -> Vec<AxisValue> {
        match self {
            AxisSpec::Single(value) => vec![value.clone()],
            AxisSpec::List(values) => values.clone(),
        }
    }
}

/// A build-matrix definition: axis name to one or many values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixDefinition {
    axes: HashMap<String, AxisSpec>,
}

impl MatrixDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an axis to a single value
    pub fn with_value(mut self, axis: impl Into<String>, value: impl Into<AxisValue>) -> Self {
        self.axes.insert(axis.into(), AxisSpec::Single(value.into()));
        self
    }

    /// Set an axis to a list of values
    pub fn with_values<V: Into<AxisValue>>(
        mut self,
        axis: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.axes.insert(axis.into(), AxisSpec::List(values));
        self
    }

    pub fn get(&self, axis: &str) -> Option<&AxisSpec> {
        self.axes.get(axis)
    }

    /// Parse a definition from YAML, keeping only the named axes.
    ///
    /// Other top-level keys (`language`, `script`, ...) are ignored and a
    /// `null` axis counts as absent.
    pub fn from_yaml_str(content: &str, axes: &[String]) -> Result<Self, MatrixError> {
        let document: serde_yaml::Value = serde_yaml::from_str(content)?;
        let mapping = match document {
            serde_yaml::Value::Mapping(mapping) => mapping,
            serde_yaml::Value::Null => return Ok(Self::default()),
            _ => return Err(MatrixError::NotAMapping),
        };

        let mut definition = Self::default();
        for axis in axes {
            let Some(raw) = mapping.get(axis.as_str()) else {
                continue;
            };
            let spec = match raw {
                serde_yaml::Value::Null => continue,
                serde_yaml::Value::Sequence(items) => AxisSpec::List(
                    items
                        .iter()
                        .map(|item| scalar_from_yaml(axis, item))
                        .collect::<Result<_, _>>()?,
                ),
                other => AxisSpec::Single(scalar_from_yaml(axis, other)?),
            };
            definition.axes.insert(axis.clone(), spec);
        }

        Ok(definition)
    }

    pub fn from_file(path: impl AsRef<Path>, axes: &[String]) -> Result<Self, MatrixError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| MatrixError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content, axes)
    }
}

fn scalar_from_yaml(axis: &str, value: &serde_yaml::Value) -> Result<AxisValue, MatrixError> {
    match value {
        serde_yaml::Value::Bool(b) => Ok(AxisValue::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(AxisValue::Integer(i))
            } else if let Some(x) = n.as_f64() {
                Ok(AxisValue::Float(x))
            } else {
                Err(MatrixError::InvalidAxisValue {
                    axis: axis.to_string(),
                    detail: format!("number {} out of range", n),
                })
            }
        }
        serde_yaml::Value::String(s) => Ok(AxisValue::String(s.clone())),
        serde_yaml::Value::Null => Err(MatrixError::InvalidAxisValue {
            axis: axis.to_string(),
            detail: "null list element".to_string(),
        }),
        serde_yaml::Value::Sequence(_) => Err(MatrixError::InvalidAxisValue {
            axis: axis.to_string(),
            detail: "nested list".to_string(),
        }),
        serde_yaml::Value::Mapping(_) => Err(MatrixError::InvalidAxisValue {
            axis: axis.to_string(),
            detail: "mapping".to_string(),
        }),
        serde_yaml::Value::Tagged(tagged) => Err(MatrixError::InvalidAxisValue {
            axis: axis.to_string(),
            detail: format!("tagged value {}", tagged.tag),
        }),
    }
}

/// One concrete combination of axis values, kept in axis order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    entries: Vec<(String, AxisValue)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `axis` set to `value`, appended in axis order
    fn with(&self, axis: &str, value: AxisValue) -> Self {
        let mut entries = self.entries.clone();
        entries.push((axis.to_string(), value));
        Self { entries }
    }

    pub fn get(&self, axis: &str) -> Option<&AxisValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AxisValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical rendering used for sorting and display: `runtime=A; env=X`
    pub fn describe(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Axis values as environment-variable style strings
    pub fn to_string_map(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl FromIterator<(String, AxisValue)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, AxisValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// Serialized as a mapping so manifests stay readable; entry order is preserved.
impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvironmentVisitor;

        impl<'de> Visitor<'de> for EnvironmentVisitor {
            type Value = Environment;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of axis names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, AxisValue>()? {
                    entries.push((name, value));
                }
                Ok(Environment { entries })
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Environment::default())
            }
        }

        deserializer.deserialize_map(EnvironmentVisitor)
    }
}

/// Expands matrix definitions over a fixed, ordered list of axes
#[derive(Debug, Clone)]
pub struct MatrixExpander {
    axes: Vec<String>,
    limit: Option<usize>,
}

impl MatrixExpander {
    /// Create an expander over the default axes
    pub fn new() -> Self {
        Self::with_axes(DEFAULT_AXES.iter().map(|axis| axis.to_string()))
    }

    pub fn with_axes(axes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            axes: axes.into_iter().map(Into::into).collect(),
            limit: None,
        }
    }

    /// Cap the number of environments returned; applied after sorting
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn axes(&self) -> &[String] {
        &self.axes
    }

    /// Expand a definition into sorted, optionally truncated environments
    pub fn expand(&self, definition: &MatrixDefinition) -> Vec<Environment> {
        let mut environments = Vec::new();
        self.traverse(0, definition, &Environment::new(), &self.axes, &mut environments);

        environments.sort_by_cached_key(Environment::describe);

        tracing::info!(count = environments.len(), "inferred test environments");
        for environment in &environments {
            tracing::debug!("  {}", environment);
        }

        if let Some(limit) = self.limit {
            if environments.len() > limit {
                tracing::info!(limit, "limiting environments");
                environments.truncate(limit);
            }
        }

        environments
    }

    fn traverse(
        &self,
        level: usize,
        definition: &MatrixDefinition,
        current: &Environment,
        remaining: &[String],
        out: &mut Vec<Environment>,
    ) {
        let Some((axis, rest)) = remaining.split_first() else {
            tracing::debug!(level, "inferred environment: {}", current);
            out.push(current.clone());
            return;
        };

        match definition.get(axis) {
            Some(spec) => {
                for value in spec.values() {
                    tracing::debug!(level, axis = %axis, value = %value, "branch");
                    let next = current.with(axis, value);
                    self.traverse(level + 1, definition, &next, rest, out);
                }
            }
            // An absent axis does not split
            None => self.traverse(level, definition, current, rest, out),
        }
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

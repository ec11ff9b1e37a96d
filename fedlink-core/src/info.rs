//! Task info attached to every contribution

use alloc::collections::BTreeMap;
use alloc::string::String;

use serde::{Deserialize, Serialize};

/// Number of local samples behind a contribution
pub const TRAIN_INSTANCES: &str = "train_instances";
/// Round version a contribution was computed against
pub const VERSION: &str = "version";

/// A single task info value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Str(String),
    Bool(bool),
    I64(i64),
    F64(f64),
}

impl InfoValue {
    /// Numeric view, if the value is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InfoValue::I64(v) => Some(*v as f64),
            InfoValue::F64(v) => Some(*v),
            InfoValue::Str(_) | InfoValue::Bool(_) => None,
        }
    }
}

impl From<f64> for InfoValue {
    fn from(v: f64) -> Self {
        InfoValue::F64(v)
    }
}

impl From<i64> for InfoValue {
    fn from(v: i64) -> Self {
        InfoValue::I64(v)
    }
}

impl From<bool> for InfoValue {
    fn from(v: bool) -> Self {
        InfoValue::Bool(v)
    }
}

impl From<&str> for InfoValue {
    fn from(v: &str) -> Self {
        InfoValue::Str(v.into())
    }
}

/// Ordered key/value metadata (deterministic ordering via BTreeMap).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo(BTreeMap<String, InfoValue>);

impl TaskInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<InfoValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<InfoValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&InfoValue> {
        self.0.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(InfoValue::as_f64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InfoValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Round version the contribution was computed against, if recorded
    pub fn version(&self) -> Option<i64> {
        match self.get(VERSION)? {
            InfoValue::I64(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_view_covers_ints_and_floats() {
        let info = TaskInfo::new()
            .with(TRAIN_INSTANCES, 12i64)
            .with("loss", 0.25)
            .with("mode", "train");
        assert_eq!(info.get_f64(TRAIN_INSTANCES), Some(12.0));
        assert_eq!(info.get_f64("loss"), Some(0.25));
        assert_eq!(info.get_f64("mode"), None);
        assert_eq!(info.get_f64("missing"), None);
    }

    #[test]
    fn task_info_survives_postcard() {
        let info = TaskInfo::new().with(VERSION, 3i64).with("ok", true);
        let bytes = postcard::to_allocvec(&info).unwrap();
        let back: TaskInfo = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.version(), Some(3));
    }
}

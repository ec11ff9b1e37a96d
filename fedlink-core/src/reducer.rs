//! Reduction of the task infos received in one round

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::info::{InfoValue, TaskInfo};
use crate::{Error, Result};

/// Folds a round's task infos into one summary.
pub trait Reducer: Send + Sync {
    fn reduce(&self, infos: &[TaskInfo]) -> Result<TaskInfo>;
}

/// Weighted mean of numeric keys.
///
/// With a `weight_key`, each info is weighted by its share of the summed
/// weight and the summary carries that sum under the same key. Without one,
/// infos are weighted uniformly. `reduce_keys` restricts which keys are
/// reduced; by default every numeric key is.
#[derive(Debug, Clone, Default)]
pub struct AutoReducer {
    reduce_keys: Option<Vec<String>>,
    weight_key: Option<&'static str>,
}

impl AutoReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weight_key(mut self, key: &'static str) -> Self {
        self.weight_key = Some(key);
        self
    }

    pub fn with_reduce_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reduce_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    fn selected(&self, key: &str) -> bool {
        match &self.reduce_keys {
            Some(keys) => keys.iter().any(|k| k == key),
            None => true,
        }
    }
}

impl Reducer for AutoReducer {
    fn reduce(&self, infos: &[TaskInfo]) -> Result<TaskInfo> {
        if infos.is_empty() {
            return Err(Error::EmptyRound);
        }

        let (weights, total): (Vec<f64>, Option<f64>) = match self.weight_key {
            Some(key) => {
                let raw = infos
                    .iter()
                    .map(|i| i.get_f64(key).ok_or(Error::MissingContributionKey(key)))
                    .collect::<Result<Vec<f64>>>()?;
                let total: f64 = raw.iter().sum();
                if total <= 0.0 {
                    return Err(Error::EmptyRound);
                }
                (raw.into_iter().map(|w| w / total).collect(), Some(total))
            }
            None => {
                let share = 1.0 / infos.len() as f64;
                (alloc::vec![share; infos.len()], None)
            }
        };

        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for (weight, info) in weights.iter().zip(infos) {
            for (key, value) in info.iter() {
                if Some(key.as_str()) == self.weight_key || !self.selected(key) {
                    continue;
                }
                if let Some(v) = value.as_f64() {
                    *sums.entry(key.clone()).or_insert(0.0) += v * weight;
                }
            }
        }

        let mut out = TaskInfo::new();
        for (key, value) in sums {
            out.set(key, InfoValue::F64(value));
        }
        if let (Some(key), Some(total)) = (self.weight_key, total) {
            out.set(key, InfoValue::F64(total));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::TRAIN_INSTANCES;

    #[test]
    fn weighted_mean_by_weight_key() {
        let infos = [
            TaskInfo::new().with(TRAIN_INSTANCES, 1i64).with("loss", 4.0),
            TaskInfo::new().with(TRAIN_INSTANCES, 3i64).with("loss", 0.0),
        ];
        let out = AutoReducer::new()
            .with_weight_key(TRAIN_INSTANCES)
            .reduce(&infos)
            .unwrap();
        assert_eq!(out.get_f64("loss"), Some(1.0));
        assert_eq!(out.get_f64(TRAIN_INSTANCES), Some(4.0));
    }

    #[test]
    fn uniform_mean_skips_non_numeric_values() {
        let infos = [
            TaskInfo::new().with("acc", 0.5).with("mode", "test"),
            TaskInfo::new().with("acc", 1.0).with("mode", "test"),
        ];
        let out = AutoReducer::new().reduce(&infos).unwrap();
        assert_eq!(out.get_f64("acc"), Some(0.75));
        assert!(!out.contains_key("mode"));
    }

    #[test]
    fn reduce_keys_restrict_output() {
        let infos = [TaskInfo::new().with("acc", 0.5).with("loss", 2.0)];
        let out = AutoReducer::new()
            .with_reduce_keys(["loss"])
            .reduce(&infos)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get_f64("loss"), Some(2.0));
    }

    #[test]
    fn missing_weight_key_is_an_error() {
        let infos = [TaskInfo::new().with("acc", 0.5)];
        let err = AutoReducer::new()
            .with_weight_key(TRAIN_INSTANCES)
            .reduce(&infos)
            .unwrap_err();
        assert_eq!(err, Error::MissingContributionKey(TRAIN_INSTANCES));
        assert_eq!(AutoReducer::new().reduce(&[]), Err(Error::EmptyRound));
    }
}

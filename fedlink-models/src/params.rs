//! Keyed parameter container
//!
//! Parameters travel as [`Contribution`]s: per parameter, a `param` entry
//! plus any auxiliary state (e.g. `importance`) the aggregation policy needs.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use fedlink_core::aggregation::{Contribution, ParamId, Parameter, Parameters, Payload, PARAM};
use fedlink_core::traits::FederatedModel;
use fedlink_core::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    params: Parameters,
    state: BTreeMap<ParamId, Payload>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parameters(params: Parameters) -> Self {
        Self {
            params,
            state: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: impl Into<ParamId>, param: Parameter) {
        self.params.insert(id.into(), param);
    }

    pub fn get(&self, id: &str) -> Option<&Parameter> {
        self.params.get(id)
    }

    /// Auxiliary state kept next to a parameter
    pub fn state(&self, id: &str, key: &str) -> Option<&Vec<f32>> {
        self.state.get(id).and_then(|s| s.get(key))
    }

    pub fn set_state(&mut self, id: impl Into<ParamId>, key: impl Into<String>, value: Vec<f32>) {
        self.state.entry(id.into()).or_default().insert(key.into(), value);
    }

    /// Build a contribution carrying `param` and every requested aux key
    /// that is present.
    pub fn pack(&self, aux_keys: &[&str]) -> Contribution {
        let mut out = Contribution::new();
        for (id, param) in &self.params {
            let mut payload = Payload::new();
            payload.insert(PARAM.into(), param.value.clone());
            for key in aux_keys {
                if let Some(value) = self.state(id, key) {
                    payload.insert((*key).into(), value.clone());
                }
            }
            out.insert(id.clone(), payload);
        }
        out
    }

    /// Load a contribution: `param` overwrites values, other keys land in
    /// the aux state. Unknown parameter ids are ignored.
    ///
    /// Shapes are checked before anything is written.
    pub fn unpack(&mut self, contribution: &Contribution) -> Result<()> {
        for (id, payload) in contribution {
            if let (Some(param), Some(value)) = (self.params.get(id), payload.get(PARAM)) {
                if param.value.len() != value.len() {
                    return Err(Error::ShapeMismatch);
                }
            }
        }
        for (id, payload) in contribution {
            let Some(param) = self.params.get_mut(id) else {
                continue;
            };
            for (key, value) in payload {
                if key == PARAM {
                    param.value.clone_from(value);
                } else {
                    self.state
                        .entry(id.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Drop all aux state
    pub fn clear_state(&mut self) {
        self.state.clear();
    }
}

impl FederatedModel for ParamStore {
    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use fedlink_core::aggregation::IMPORTANCE;

    fn store() -> ParamStore {
        let mut s = ParamStore::new();
        s.insert("w", Parameter::trainable(vec![1.0, 2.0]));
        s.insert("bn", Parameter::frozen(vec![0.0]));
        s
    }

    #[test]
    fn pack_includes_present_aux_keys_only() {
        let mut s = store();
        s.set_state("w", IMPORTANCE, vec![0.1, 0.2]);
        let packed = s.pack(&[IMPORTANCE]);
        assert_eq!(packed["w"][IMPORTANCE], vec![0.1, 0.2]);
        assert!(!packed["bn"].contains_key(IMPORTANCE));
        assert_eq!(packed["bn"][PARAM], vec![0.0]);
    }

    #[test]
    fn unpack_overwrites_and_stores_aux() {
        let mut s = store();
        let mut other = store();
        other.insert("w", Parameter::trainable(vec![5.0, 6.0]));
        other.set_state("w", "momentum", vec![1.0, 1.0]);
        let mut c = other.pack(&["momentum"]);
        c.insert("ghost".into(), Payload::new());

        s.unpack(&c).unwrap();
        assert_eq!(s.get("w").unwrap().value, vec![5.0, 6.0]);
        assert_eq!(s.state("w", "momentum"), Some(&vec![1.0, 1.0]));
        assert_eq!(s.num_parameters(), 3);
    }

    #[test]
    fn unpack_checks_shapes_first() {
        let mut s = store();
        let mut c = Contribution::new();
        let mut good = Payload::new();
        good.insert(PARAM.into(), vec![9.0]);
        let mut bad = Payload::new();
        bad.insert(PARAM.into(), vec![9.0]);
        c.insert("bn".into(), good);
        c.insert("w".into(), bad);

        assert_eq!(s.unpack(&c), Err(Error::ShapeMismatch));
        assert_eq!(s.get("bn").unwrap().value, vec![0.0]);
    }
}

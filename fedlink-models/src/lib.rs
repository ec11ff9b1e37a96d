//! # FedLink Models
//!
//! Model-side collaborators for FedLink.
//!
//! This crate provides:
//! - `ParamStore`, a keyed parameter container that packs/unpacks contributions
//! - `Sgd`, a reference optimizer consuming aggregation pseudo-gradients
//! - `LinearModel`, a small reference model for demos and tests
//! - `ModelState`, the postcard checkpoint format
//!
//! ## Feature Flags
//!
//! - `std` (default): checkpoint files on disk

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
pub mod optim;
#[cfg(feature = "alloc")]
pub mod params;
#[cfg(feature = "alloc")]
pub mod simple;

/// Prelude for convenient imports
#[cfg(feature = "alloc")]
pub mod prelude {
    pub use crate::optim::*;
    pub use crate::params::*;
    pub use crate::simple::*;
    pub use crate::ModelState;
}

#[cfg(feature = "alloc")]
use fedlink_core::aggregation::Parameters;

/// Model state for serialization
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelState {
    /// Model name/identifier
    pub name: alloc::string::String,
    /// Round version the parameters belong to
    pub version: i64,
    pub params: Parameters,
}

#[cfg(feature = "alloc")]
impl ModelState {
    /// Create a new model state
    pub fn new(name: impl Into<alloc::string::String>, version: i64, params: Parameters) -> Self {
        Self {
            name: name.into(),
            version,
            params,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<alloc::vec::Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// File name used for a checkpoint of this version
    pub fn file_name(&self) -> alloc::string::String {
        alloc::format!("{}.{}.ckpt", self.name, self.version)
    }

    /// Write to `dir/<name>.<version>.ckpt`, returning the path
    #[cfg(feature = "std")]
    pub fn save(&self, dir: &std::path::Path) -> std::io::Result<std::path::PathBuf> {
        let bytes = self
            .to_bytes()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    #[cfg(feature = "std")]
    pub fn load(path: &std::path::Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use fedlink_core::aggregation::Parameter;

    #[test]
    fn checkpoint_file_round_trips() {
        let mut params = Parameters::new();
        params.insert("w".into(), Parameter::trainable(vec![0.5, -0.5]));
        let state = ModelState::new("linear", 3, params);

        let dir = std::env::temp_dir().join(format!("fedlink-ckpt-{}", std::process::id()));
        let path = state.save(&dir).unwrap();
        assert!(path.ends_with("linear.3.ckpt"));
        assert_eq!(ModelState::load(&path).unwrap(), state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn truncated_checkpoint_is_rejected() {
        let state = ModelState::new("m", 0, Parameters::new());
        let bytes = state.to_bytes().unwrap();
        assert!(ModelState::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}

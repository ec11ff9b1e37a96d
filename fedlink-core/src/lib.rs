//! # FedLink Core
//!
//! Topology resolution and aggregation primitives for FedLink.
//!
//! This crate is `no_std` compatible (with `alloc`) and provides:
//! - The declarative participant graph (`Node`, `Edge`, `Topology`)
//! - Group/rank resolution (`analysis`)
//! - Task info attached to every contribution
//! - The aggregation engine with Average/Naive/Elastic policies
//! - Reduction of per-round task infos
//!
//! ## Feature Flags
//!
//! - `std` (default): Enable standard library support
//! - `alloc`: Enable allocator for dynamic memory (included with `std`)

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
pub mod aggregation;
#[cfg(feature = "alloc")]
pub mod group;
#[cfg(feature = "alloc")]
pub mod info;
#[cfg(feature = "alloc")]
pub mod reducer;
#[cfg(feature = "alloc")]
pub mod topology;
#[cfg(feature = "alloc")]
pub mod traits;

/// Prelude module for convenient imports
#[cfg(feature = "alloc")]
pub mod prelude {
    pub use crate::aggregation::*;
    pub use crate::group::*;
    pub use crate::info::*;
    pub use crate::reducer::*;
    pub use crate::topology::*;
    pub use crate::traits::*;
}

/// Result type for FedLink core operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for FedLink core operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A contribution's task info lacks a key the active policy requires
    MissingContributionKey(&'static str),
    /// A parameter payload lacks a key required at finalization
    MissingPayloadKey(&'static str),
    /// A node's groups cannot be resolved: a follower missing from its
    /// leader's group, or a node that leads itself
    TopologyInconsistency,
    /// No node with the requested nick name exists
    UnknownNode,
    /// Edge start and end are the same node
    InvalidEdge,
    /// Address endpoint is not `tcp://`, `file://` or `null`
    InvalidAddress,
    /// Elastic quantile outside the open interval (0, 1)
    InvalidQuantile,
    /// Payload length differs from the accumulated state
    ShapeMismatch,
    /// Finalization requested before any contribution arrived
    EmptyRound,
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MissingContributionKey(key) => {
                write!(f, "contribution task info is missing `{key}`")
            }
            Error::MissingPayloadKey(key) => write!(f, "parameter payload is missing `{key}`"),
            Error::TopologyInconsistency => write!(f, "topology groups cannot be resolved consistently"),
            Error::UnknownNode => write!(f, "unknown node"),
            Error::InvalidEdge => write!(f, "edge start and end must differ"),
            Error::InvalidAddress => write!(f, "invalid address endpoint"),
            Error::InvalidQuantile => write!(f, "quantile must lie in (0, 1)"),
            Error::ShapeMismatch => write!(f, "payload shape mismatch"),
            Error::EmptyRound => write!(f, "no contributions received"),
        }
    }
}

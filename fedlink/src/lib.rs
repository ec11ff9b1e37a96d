//! # FedLink
//!
//! Round-based federated consensus over unreliable point-to-point links.
//!
//! A coordinator and its peers are declared as a [`Topology`]. Each process
//! resolves its own groups with [`analysis`], opens one [`Pipe`] per peer and
//! drives them from a [`ControlLoop`]. Peers push contributions, the loop
//! feeds them to an [`Aggregator`] and closes rounds when a hook says so.
//!
//! ```rust,ignore
//! use fedlink::prelude::*;
//!
//! let config = FedConfig::builder()
//!     .policy(PolicyKind::Naive)
//!     .tick_interval(Duration::from_millis(50))
//!     .build()?;
//! let pipes = fedlink::connect(&topo, "aggregator", &hub, runtime.clone(), &config, &ctx).await?;
//! let mut control = ControlLoop::new(pipes.leaders, model, Box::new(Sgd::default()), runtime, &config)?
//!     .with_hook(Box::new(AggregateCount::new(2)))
//!     .with_hook(Box::new(Terminate::at_version(10)));
//! let reason = control.run().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `std` (default): Standard library support
//! - `tokio-runtime` (default): Use Tokio for async
//!
//! ## Crate Structure
//!
//! - [`fedlink_core`]: Topology, aggregation and collaborator traits (no_std compatible)
//! - [`fedlink_net`]: Rendezvous stores, transports and the pipe handshake
//! - [`fedlink_runtime`]: Clock, sleep and spawn glue
//! - [`fedlink_models`]: Parameter store, reference optimizer and checkpoints

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

#[cfg(not(feature = "std"))]
compile_error!("`fedlink` requires the `std` feature. Use `fedlink-core` for no_std targets.");

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Re-export sub-crates
pub use fedlink_core as core;
pub use fedlink_models as models;
pub use fedlink_net as net;
pub use fedlink_runtime as runtime;

pub use fedlink_core::{
    aggregation::{Aggregator, Average, Elastic, Ingestion, Naive},
    group::{analysis, GroupProperties, Role},
    info::TaskInfo,
    topology::{Address, Edge, Node, Topology},
};
pub use fedlink_net::{
    context::{Connector, FedContext, LocalHub},
    pipe::{Pipe, PipeConfig, PipeState},
};

pub mod control;
mod error;
pub mod hooks;
pub mod participant;
pub mod phase;

pub use control::{ControlLoop, ExitReason};
pub use error::{Error, Result};
pub use participant::Participant;

/// Prelude module for convenient imports
///
/// ```rust,ignore
/// use fedlink::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::prelude::*;
    pub use crate::models::prelude::*;
    pub use crate::net::prelude::*;

    pub use crate::control::{ControlLoop, ExitReason};
    pub use crate::hooks::*;
    pub use crate::participant::Participant;
    pub use crate::phase::{reduce_verdicts, Phase, Verdict};
    pub use crate::{FedConfig, FedConfigBuilder, LoopConfig, PolicyConfig, PolicyKind};
}

/// Control loop pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Sleep after an iteration that visited at least one pipe
    pub tick_interval: Duration,
    /// Sleep after an iteration with no live pipes
    pub idle_interval: Duration,
    /// Consecutive idle iterations before the loop gives up
    pub max_idle_iterations: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            idle_interval: Duration::from_secs(5),
            max_idle_iterations: 5,
        }
    }
}

/// Weighting policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    Average,
    Naive,
    Elastic,
}

impl std::str::FromStr for PolicyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" => Ok(Self::Average),
            "naive" => Ok(Self::Naive),
            "elastic" => Ok(Self::Elastic),
            other => Err(Error::Config(format!("unknown policy {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyConfig {
    pub kind: PolicyKind,
    pub ingestion: Ingestion,
    /// Only read by [`PolicyKind::Elastic`]
    pub quantile: f32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Average,
            ingestion: Ingestion::Merge,
            quantile: 0.5,
        }
    }
}

impl PolicyConfig {
    /// Build a fresh aggregator for this policy
    pub fn build(&self) -> Result<Aggregator> {
        let aggregator = match self.kind {
            PolicyKind::Average => Aggregator::new(Average, self.ingestion),
            PolicyKind::Naive => Aggregator::new(Naive, self.ingestion),
            PolicyKind::Elastic => Aggregator::new(Elastic::new(self.quantile)?, self.ingestion),
        };
        Ok(aggregator)
    }
}

/// Configuration for one FedLink participant
#[derive(Debug, Clone, PartialEq)]
pub struct FedConfig {
    /// Name used for checkpoint files
    pub name: String,
    pub pipe: PipeConfig,
    pub control: LoopConfig,
    pub policy: PolicyConfig,
    /// Write a checkpoint after every round when set
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for FedConfig {
    fn default() -> Self {
        Self {
            name: "fedlink".into(),
            pipe: PipeConfig::default(),
            control: LoopConfig::default(),
            policy: PolicyConfig::default(),
            checkpoint_dir: None,
        }
    }
}

impl FedConfig {
    pub fn builder() -> FedConfigBuilder {
        FedConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name must not be empty".into()));
        }
        if self.pipe.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".into()));
        }
        if self.pipe.transfer_deadline < self.pipe.poll_interval {
            return Err(Error::Config("transfer deadline is shorter than the poll interval".into()));
        }
        if self.control.max_idle_iterations == 0 {
            return Err(Error::Config("max idle iterations must be positive".into()));
        }
        if self.policy.kind == PolicyKind::Elastic
            && !(self.policy.quantile > 0.0 && self.policy.quantile < 1.0)
        {
            return Err(Error::Config(format!(
                "elastic quantile {} is outside (0, 1)",
                self.policy.quantile
            )));
        }
        Ok(())
    }
}

/// Builder for FedConfig
#[derive(Debug, Default)]
pub struct FedConfigBuilder {
    config: FedConfig,
}

impl FedConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn transfer_deadline(mut self, deadline: Duration) -> Self {
        self.config.pipe.transfer_deadline = deadline;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.pipe.poll_interval = interval;
        self
    }

    pub fn async_transfers(mut self, enabled: bool) -> Self {
        self.config.pipe.async_transfers = enabled;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.control.tick_interval = interval;
        self
    }

    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.config.control.idle_interval = interval;
        self
    }

    pub fn max_idle_iterations(mut self, iterations: u32) -> Self {
        self.config.control.max_idle_iterations = iterations;
        self
    }

    pub fn policy(mut self, kind: PolicyKind) -> Self {
        self.config.policy.kind = kind;
        self
    }

    pub fn ingestion(mut self, ingestion: Ingestion) -> Self {
        self.config.policy.ingestion = ingestion;
        self
    }

    pub fn quantile(mut self, quantile: f32) -> Self {
        self.config.policy.quantile = quantile;
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = Some(dir.into());
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<FedConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Pipes of one participant, split by the role it plays in each group
#[derive(Debug)]
pub struct Connected<R: fedlink_runtime::FedRuntime> {
    pub leaders: Vec<Pipe<R>>,
    pub followers: Vec<Pipe<R>>,
}

/// Resolve `nick_name`'s groups in `topology` and establish all of them.
pub async fn connect<R: fedlink_runtime::FedRuntime>(
    topology: &Topology,
    nick_name: &str,
    connector: &dyn Connector,
    runtime: Arc<R>,
    config: &FedConfig,
    ctx: &Arc<FedContext>,
) -> Result<Connected<R>> {
    let mut connected = Connected {
        leaders: Vec::new(),
        followers: Vec::new(),
    };
    for props in analysis(topology, nick_name)? {
        let pipes = ctx
            .establish(&props, connector, Arc::clone(&runtime), config.pipe)
            .await?;
        match props.role {
            Role::Leader => connected.leaders.extend(pipes),
            Role::Follower => connected.followers.extend(pipes),
        }
    }
    tracing::debug!(
        nick_name,
        leaders = connected.leaders.len(),
        followers = connected.followers.len(),
        "participant connected"
    );
    Ok(connected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = FedConfig::builder()
            .name("demo")
            .policy(PolicyKind::Elastic)
            .quantile(0.25)
            .max_idle_iterations(3)
            .build()
            .unwrap();

        assert_eq!(config.control.max_idle_iterations, 3);
        assert!((config.policy.quantile - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.policy.build().unwrap().policy_name(), "elastic");
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FedConfig::default();
        assert_eq!(config.control.tick_interval, Duration::from_millis(100));
        assert_eq!(config.control.idle_interval, Duration::from_secs(5));
        assert_eq!(config.control.max_idle_iterations, 5);
        assert_eq!(config.pipe.transfer_deadline, Duration::from_secs(30 * 60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            FedConfig::builder().policy(PolicyKind::Elastic).quantile(1.0).build(),
            Err(Error::Config(_))
        ));
        assert!(FedConfig::builder().max_idle_iterations(0).build().is_err());
        assert!(FedConfig::builder().poll_interval(Duration::ZERO).build().is_err());
        assert!(FedConfig::builder().name("").build().is_err());
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!("Naive".parse::<PolicyKind>().unwrap(), PolicyKind::Naive);
        assert!("median".parse::<PolicyKind>().is_err());
    }
}

//! Follower side of a round
//!
//! A participant fetches the coordinator's model, trains it elsewhere and
//! submits the result back through its single follower pipe.

use fedlink_core::info::{TaskInfo, VERSION};
use fedlink_models::params::ParamStore;
use fedlink_net::pipe::{Pipe, Transfer};
use fedlink_net::protocol::ModelEnvelope;
use fedlink_runtime::FedRuntime;

use crate::{Error, Result};

#[derive(Debug)]
pub struct Participant<R: FedRuntime> {
    pipe: Pipe<R>,
    model: ParamStore,
    version: i64,
    aux_keys: Vec<String>,
    last_info: Option<TaskInfo>,
}

impl<R: FedRuntime> Participant<R> {
    pub fn new(pipe: Pipe<R>, model: ParamStore) -> Result<Self> {
        if !pipe.is_follower() {
            return Err(Error::Config(format!(
                "{} cannot take part as a leader",
                pipe.nick_name()
            )));
        }
        Ok(Self {
            pipe,
            model,
            version: 0,
            aux_keys: Vec::new(),
            last_info: None,
        })
    }

    /// Auxiliary state keys sent along with every parameter (e.g. `importance`)
    pub fn with_aux_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aux_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn model(&self) -> &ParamStore {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ParamStore {
        &mut self.model
    }

    pub fn pipe(&self) -> &Pipe<R> {
        &self.pipe
    }

    /// Task info that came with the last fetched model
    pub fn last_info(&self) -> Option<&TaskInfo> {
        self.last_info.as_ref()
    }

    /// Download the coordinator's model of at least `version` and load it.
    ///
    /// Returns the version actually received.
    pub async fn fetch(&mut self, version: i64) -> Result<i64> {
        let Transfer::Complete(bytes) = self.pipe.download(Some(version)).await? else {
            return Err(Error::HungUp("download"));
        };
        let envelope = ModelEnvelope::from_bytes(&bytes)?;
        self.model.unpack(&envelope.params)?;
        self.version = envelope.version;
        self.last_info = Some(envelope.info);
        tracing::debug!(
            nick_name = %self.pipe.nick_name(),
            version = self.version,
            "model fetched"
        );
        Ok(self.version)
    }

    /// Upload the local model as a contribution to the current version.
    pub async fn submit(&mut self, info: TaskInfo) -> Result<()> {
        let keys: Vec<&str> = self.aux_keys.iter().map(String::as_str).collect();
        let info = info.with(VERSION, self.version);
        let envelope = ModelEnvelope::new(self.version, self.model.pack(&keys), info);
        let Transfer::Complete(()) = self
            .pipe
            .upload(envelope.to_bytes()?, Some(self.version))
            .await?
        else {
            return Err(Error::HungUp("upload"));
        };
        tracing::debug!(
            nick_name = %self.pipe.nick_name(),
            version = self.version,
            "contribution submitted"
        );
        Ok(())
    }

    /// Announce departure and release the connection.
    pub async fn leave(mut self) -> ParamStore {
        self.pipe.destroy().await;
        self.model
    }
}

//! Wire formats
//!
//! Control blobs live in the rendezvous store as JSON. Payloads travel over
//! the transport as postcard-encoded [`ModelEnvelope`]s.

use fedlink_core::aggregation::Contribution;
use fedlink_core::group::Role;
use fedlink_core::info::TaskInfo;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Store key prefix for control blobs
pub const IDENTITY_PREFIX: &str = "fedlink_identity";

/// Store key a role publishes its control blob under
pub fn identity_key(role: Role) -> String {
    format!("{IDENTITY_PREFIX}_{}", role.as_str())
}

/// Pipe status published in the control blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeStatus {
    /// Sending a payload
    Push,
    /// Waiting to receive a payload
    Pull,
    /// Connected and idle
    Zombie,
    /// Gone
    Offline,
    /// Anything this build does not recognise
    #[serde(other)]
    Unknown,
}

/// Control blob, overwritten wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBlob {
    pub status: PipeStatus,
    pub nick_name: String,
    pub upload_version: i64,
    pub download_version: i64,
    /// Follower: last transfer requested
    #[serde(default)]
    pub request: u64,
    /// Leader: last follower request being served
    #[serde(default)]
    pub ack: u64,
    /// Wall-clock of the last write, milliseconds
    #[serde(default)]
    pub timestep_ms: u64,
}

impl ControlBlob {
    /// Blob written when a pipe opens
    pub fn initial(nick_name: impl Into<String>) -> Self {
        Self {
            status: PipeStatus::Zombie,
            nick_name: nick_name.into(),
            upload_version: -1,
            download_version: -1,
            request: 0,
            ack: 0,
            timestep_ms: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Payload exchanged over a pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEnvelope {
    /// Protocol version (major, minor)
    pub protocol: (u8, u8),
    /// Round version the payload belongs to
    pub version: i64,
    pub params: Contribution,
    pub info: TaskInfo,
}

impl ModelEnvelope {
    /// Current protocol version
    pub const CURRENT_PROTOCOL: (u8, u8) = (0, 1);

    pub fn new(version: i64, params: Contribution, info: TaskInfo) -> Self {
        Self {
            protocol: Self::CURRENT_PROTOCOL,
            version,
            params,
            info,
        }
    }

    /// Serialize the envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize from bytes, rejecting other major protocol versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = postcard::from_bytes(bytes)?;
        if envelope.protocol.0 != Self::CURRENT_PROTOCOL.0 {
            return Err(Error::Codec(format!(
                "unsupported protocol {}.{}",
                envelope.protocol.0, envelope.protocol.1
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keys_per_role() {
        assert_eq!(identity_key(Role::Leader), "fedlink_identity_leader");
        assert_eq!(identity_key(Role::Follower), "fedlink_identity_follower");
    }

    #[test]
    fn control_blob_is_json_with_lowercase_status() {
        let blob = ControlBlob::initial("alpha");
        let text = String::from_utf8(blob.encode().unwrap()).unwrap();
        assert!(text.contains("\"status\":\"zombie\""));
        assert!(text.contains("\"upload_version\":-1"));
    }

    #[test]
    fn unknown_status_and_missing_counters_decode() {
        let raw = br#"{"status":"paused","nick_name":"beta","upload_version":2,"download_version":1}"#;
        let blob = ControlBlob::decode(raw).unwrap();
        assert_eq!(blob.status, PipeStatus::Unknown);
        assert_eq!((blob.request, blob.ack), (0, 0));
    }

    #[test]
    fn garbage_blob_is_a_codec_error() {
        assert!(matches!(ControlBlob::decode(b""), Err(Error::Codec(_))));
    }

    #[test]
    fn envelope_rejects_future_major_version() {
        let mut envelope = ModelEnvelope::new(3, Contribution::new(), TaskInfo::new());
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(ModelEnvelope::from_bytes(&bytes).unwrap(), envelope);

        envelope.protocol = (9, 0);
        let bytes = envelope.to_bytes().unwrap();
        assert!(ModelEnvelope::from_bytes(&bytes).is_err());
    }
}

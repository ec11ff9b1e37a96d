/// Errors surfaced by the facade
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] fedlink_core::Error),

    #[error(transparent)]
    Net(#[from] fedlink_net::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] std::io::Error),

    #[error("{0} on a follower pipe hung up")]
    HungUp(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

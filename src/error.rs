use std::net::SocketAddr;

use crate::config::ConfigError;
use crate::link::LinkError;
use crate::recorder::RecordingError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("Cannot bind controller socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

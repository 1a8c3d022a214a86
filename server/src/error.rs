//! Process-level failures.
//!
//! Only startup and configuration problems surface here. Per-connection
//! trouble is latched on the socket and reported as
//! [`UpdateStatus::Destroy`](crate::connection::UpdateStatus::Destroy).

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type NetResult<T> = Result<T, NetError>;

//! HTTProx: an intercepting HTTP proxy in front of depot stores.
//!
//! Plain `GET`/`HEAD` requests for absolute URIs are answered from a remote
//! store that mirrors the requested origin; the store is created on first use.
//! `CONNECT` requests are tunnelled into a one-shot TLS listener that signs a
//! certificate for the requested host and serves the decrypted request the
//! same way.
//!
//! Each client connection is split into a reader and a writer half
//! ([`connection`]); the writer answers what the reader parsed and may direct
//! the reader into a [`tunnel::TunnelRelay`].

pub mod auth;
pub mod config;
pub mod connection;
pub mod mitm;
pub mod reader;
pub mod repo;
pub(crate) mod response;
pub mod server;
pub mod service;
pub mod tunnel;

pub use auth::{AuthCache, ProxyAuth, ProxyAuthenticator, StaticAuthenticator, UserPass};
pub use config::{HttproxConfig, MitmConfig, TrackingType};
pub use mitm::{MitmListener, MitmServer};
pub use reader::{ProxyRequest, RequestReader};
pub use repo::{
    CreationRequest, DefaultRepositoryCreator, ProxyCreation, ProxyRepositories,
    ProxyRepositoryCreator, ProxyTarget, HTTPROX_ORIGIN, PROXY_REPO_PREFIX,
};
pub use response::ALLOW_HEADER_VALUE;
pub use server::{ProxyHandle, ProxyServer, ProxyServerBuilder};
pub use service::{ContentService, ProxySession};
pub use tunnel::{TunnelInlet, TunnelRelay};

use depot_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("malformed request: {0}")]
    Parse(String),
    #[error("{message}")]
    Workflow { status: u16, message: String },
    #[error("data error: {0}")]
    Data(String),
    #[error("tunnel error: {0}")]
    Tunnel(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl ProxyError {
    /// HTTP status reported to the client for this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Workflow { status, .. } => *status,
            Self::Parse(_) => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_errors_keep_their_status() {
        let e = ProxyError::Workflow {
            status: 404,
            message: "gone".to_owned(),
        };
        assert_eq!(e.status(), 404);
        assert_eq!(e.to_string(), "gone");
    }

    #[test]
    fn parse_errors_are_bad_requests() {
        assert_eq!(ProxyError::Parse("bad".to_owned()).status(), 400);
    }

    #[test]
    fn everything_else_is_internal() {
        assert_eq!(ProxyError::Data("no creator".to_owned()).status(), 500);
        assert_eq!(ProxyError::Tunnel("down".to_owned()).status(), 500);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(ProxyError::from(io).status(), 500);
        let remote = ProxyError::from(StoreError::Remote("refused".to_owned()));
        assert_eq!(remote.status(), 500);
    }
}

//! Outbound HTTP for depot.
//!
//! [`HttpFetcher`] pulls artifacts from the upstream of a remote store and
//! plugs into `depot-store` as its `RemoteFetcher`. [`HttpCallbackTransport`]
//! delivers promotion results to caller-supplied callback URLs. The
//! [`TestServer`] helper runs an in-process origin for integration tests.

pub mod callback;
pub mod config;
pub mod http;
pub mod test_server;

pub use callback::{is_success, CallbackTransport, HttpCallbackTransport};
pub use config::SiteConfig;
pub use http::HttpFetcher;
pub use test_server::{ReceivedRequest, TestServer};

/// Sent as `User-Agent` on every outbound request.
pub const USER_AGENT: &str = concat!("depot/", env!("CARGO_PKG_VERSION"));

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("store error: {0}")]
    Store(#[from] depot_store::StoreError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote config error: {0}")]
    Config(String),
}

use crate::{RemoteError, SiteConfig};
use depot_store::{RemoteFetcher, StoreError};
use std::io::{self, Write};
use tracing::debug;

/// Downloads artifacts from remote-store upstreams over HTTP(S).
pub struct HttpFetcher {
    config: SiteConfig,
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(config: SiteConfig) -> Self {
        let agent = config.agent();
        Self { config, agent }
    }

    /// Stream `url` into `dest`. `Ok(false)` on 404.
    pub fn download(&self, url: &str, dest: &mut dyn Write) -> Result<bool, RemoteError> {
        let mut req = self.agent.get(url).header("User-Agent", crate::USER_AGENT);
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        debug!("GET {url}");
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => return Ok(false),
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(RemoteError::Http(e.to_string())),
        };

        let mut reader = resp.into_body().into_reader();
        let copied = io::copy(&mut reader, dest)?;
        debug!("GET {url}: {copied} bytes");
        Ok(true)
    }
}

impl RemoteFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<bool, StoreError> {
        self.download(url, dest).map_err(|e| match e {
            RemoteError::Io(io) => StoreError::Io(io),
            other => StoreError::Remote(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestServer;
    use std::time::Duration;

    #[test]
    fn download_existing_file() {
        let server = TestServer::start();
        server.put_file("/org/foo/1.0/foo.jar", b"foo-bytes");
        let fetcher = HttpFetcher::new(SiteConfig::default());

        let mut out = Vec::new();
        let found = fetcher
            .download(&format!("{}/org/foo/1.0/foo.jar", server.url), &mut out)
            .unwrap();
        assert!(found);
        assert_eq!(out, b"foo-bytes");
    }

    #[test]
    fn download_missing_is_not_an_error() {
        let server = TestServer::start();
        let fetcher = HttpFetcher::new(SiteConfig::default());
        let mut out = Vec::new();
        assert!(!fetcher
            .download(&format!("{}/missing.jar", server.url), &mut out)
            .unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn server_error_maps_to_store_remote_error() {
        let fetcher = HttpFetcher::new(SiteConfig::default().with_timeout(2));
        let mut out = Vec::new();
        let err = fetcher.fetch("http://127.0.0.1:1/x", &mut out).unwrap_err();
        assert!(matches!(err, StoreError::Remote(_)));
    }

    #[test]
    fn bearer_token_is_sent() {
        let server = TestServer::start();
        server.put_file("x", b"x");
        let fetcher = HttpFetcher::new(SiteConfig::default().with_token("secret-42"));
        let mut out = Vec::new();
        fetcher
            .download(&format!("{}/x", server.url), &mut out)
            .unwrap();

        let seen = server.wait_for(1, Duration::from_secs(2));
        assert_eq!(seen[0].header("authorization"), Some("Bearer secret-42"));
        assert!(seen[0]
            .header("user-agent")
            .is_some_and(|ua| ua.starts_with("depot/")));
    }
}

use crate::{RemoteError, SiteConfig};
use depot_model::{CallbackMethod, CallbackTarget};
use tracing::debug;

/// Delivers a JSON body to a callback target.
pub trait CallbackTransport: Send + Sync {
    /// Returns the status the receiver answered with. Transport failures
    /// (refused connection, timeout) are errors; any HTTP status is not.
    fn send(&self, target: &CallbackTarget, body: &[u8]) -> Result<u16, RemoteError>;
}

pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

pub struct HttpCallbackTransport {
    agent: ureq::Agent,
}

impl HttpCallbackTransport {
    pub fn new(config: &SiteConfig) -> Self {
        Self {
            agent: config.agent(),
        }
    }
}

impl CallbackTransport for HttpCallbackTransport {
    fn send(&self, target: &CallbackTarget, body: &[u8]) -> Result<u16, RemoteError> {
        let url = target.url.as_str();
        let mut req = match target.method {
            CallbackMethod::Post => self.agent.post(url),
            CallbackMethod::Put => self.agent.put(url),
        }
        .header("Content-Type", "application/json")
        .header("User-Agent", crate::USER_AGENT);
        if let Some(ref token) = target.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        for (name, value) in &target.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        debug!("{} {url} ({} bytes)", target.method, body.len());
        match req.send(body) {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(ureq::Error::StatusCode(code)) => Ok(code),
            Err(e) => Err(RemoteError::Http(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestServer;
    use std::time::Duration;

    #[test]
    fn post_with_bearer_and_extra_headers() {
        let server = TestServer::start();
        let transport = HttpCallbackTransport::new(&SiteConfig::default());
        let mut target = CallbackTarget::new(format!("{}/hook", server.url), CallbackMethod::Post);
        target.auth_token = Some("cb-token".to_owned());
        target
            .headers
            .insert("X-Request-Source".to_owned(), "depot-tests".to_owned());

        let status = transport.send(&target, br#"{"success":true}"#).unwrap();
        assert_eq!(status, 200);

        let seen = server.wait_for(1, Duration::from_secs(2));
        let req = &seen[0];
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "/hook");
        assert_eq!(req.header("authorization"), Some("Bearer cb-token"));
        assert_eq!(req.header("x-request-source"), Some("depot-tests"));
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.body, br#"{"success":true}"#);
    }

    #[test]
    fn put_reports_receiver_status() {
        let server = TestServer::start();
        server.set_write_status(503);
        let transport = HttpCallbackTransport::new(&SiteConfig::default());
        let target = CallbackTarget::new(format!("{}/hook", server.url), CallbackMethod::Put);

        let status = transport.send(&target, b"{}").unwrap();
        assert_eq!(status, 503);
        assert!(!is_success(status));
        assert_eq!(server.wait_for(1, Duration::from_secs(2))[0].method, "PUT");
    }

    #[test]
    fn unreachable_receiver_is_an_error() {
        let transport = HttpCallbackTransport::new(&SiteConfig::default().with_timeout(2));
        let target = CallbackTarget::new("http://127.0.0.1:1/hook", CallbackMethod::Post);
        assert!(transport.send(&target, b"{}").is_err());
    }

    #[test]
    fn success_range() {
        assert!(is_success(200));
        assert!(is_success(204));
        assert!(!is_success(301));
        assert!(!is_success(500));
    }
}

//! TLS interception for `CONNECT` tunnels.
//!
//! For each tunnel a one-shot listener is bound on loopback. It presents a
//! certificate for the CONNECT host signed by the configured CA, reads a
//! single request from the decrypted stream and serves it through the same
//! store pipeline as plain proxied requests.

use crate::config::MitmConfig;
use crate::reader::RequestReader;
use crate::repo::ProxyTarget;
use crate::response::write_error;
use crate::service::{ContentService, ProxySession};
use crate::ProxyError;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Signs per-host certificates and starts interception listeners.
pub struct MitmServer {
    config: MitmConfig,
    ca_cert: Certificate,
    ca_der: CertificateDer<'static>,
    ca_key: KeyPair,
    /// Server configs by host, kept for the life of the process.
    certs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl MitmServer {
    /// Load the CA named by `config`.
    pub fn load(config: MitmConfig) -> Result<Self, ProxyError> {
        let cert_pem = std::fs::read_to_string(&config.ca_cert).map_err(|e| {
            ProxyError::Config(format!("cannot read MITM CA certificate {}: {e}", config.ca_cert.display()))
        })?;
        let key_pem = std::fs::read_to_string(&config.ca_key).map_err(|e| {
            ProxyError::Config(format!("cannot read MITM CA key {}: {e}", config.ca_key.display()))
        })?;
        Self::from_pem(config, &cert_pem, &key_pem)
    }

    pub fn from_pem(config: MitmConfig, cert_pem: &str, key_pem: &str) -> Result<Self, ProxyError> {
        let ca_key = KeyPair::from_pem(key_pem)?;
        let ca_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| ProxyError::Config(format!("invalid MITM CA certificate: {e}")))?;
        // Re-signing the parsed CA yields an issuer with the same subject and key.
        let ca_cert = CertificateParams::from_ca_cert_pem(cert_pem)?.self_signed(&ca_key)?;
        Ok(Self {
            config,
            ca_cert,
            ca_der,
            ca_key,
            certs: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &MitmConfig {
        &self.config
    }

    /// TLS server config presenting a certificate for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let mut certs = self
            .certs
            .lock()
            .map_err(|_| ProxyError::Tunnel("certificate cache poisoned".to_owned()))?;
        if let Some(config) = certs.get(host) {
            return Ok(Arc::clone(config));
        }
        let config = Arc::new(self.sign(host)?);
        certs.insert(host.to_owned(), Arc::clone(&config));
        Ok(config)
    }

    fn sign(&self, host: &str) -> Result<ServerConfig, ProxyError> {
        let mut params = CertificateParams::new(vec![host.to_owned()])?;
        let mut dn = DistinguishedName::new();
        for (attr, value) in self.config.subject_for(host) {
            match attr.as_str() {
                "CN" => dn.push(DnType::CommonName, value),
                "O" => dn.push(DnType::OrganizationName, value),
                "OU" => dn.push(DnType::OrganizationalUnitName, value),
                "C" => dn.push(DnType::CountryName, value),
                "ST" => dn.push(DnType::StateOrProvinceName, value),
                "L" => dn.push(DnType::LocalityName, value),
                other => debug!("ignoring unsupported subject attribute {other}"),
            }
        }
        params.distinguished_name = dn;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        debug!("signed MITM certificate for {host}");

        let chain = vec![cert.der().clone(), self.ca_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        Ok(config)
    }

    /// Bind a loopback listener that intercepts one TLS session for `target`.
    ///
    /// Returns once the listener is bound.
    pub async fn start(
        &self,
        target: ProxyTarget,
        session: ProxySession,
        content: ContentService,
    ) -> Result<MitmListener, ProxyError> {
        let acceptor = TlsAcceptor::from(self.server_config(&target.host)?);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let so_timeout = self.config.so_timeout();
        let span = tracing::info_span!("mitm", host = %target.host, port = target.port);
        let task = tokio::spawn(
            run_listener(ready_tx, cancel.clone(), acceptor, so_timeout, target, session, content)
                .instrument(span),
        );
        let addr = ready_rx
            .await
            .map_err(|_| ProxyError::Tunnel("MITM listener exited before binding".to_owned()))??;
        Ok(MitmListener { addr, cancel, task })
    }
}

/// A running one-shot interception listener.
pub struct MitmListener {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MitmListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn connect(&self, attempts: u32, backoff: Duration) -> Result<TcpStream, ProxyError> {
        connect_with_retry(self.addr, attempts, backoff).await
    }

    /// Tear down the listener and any session it is serving.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub(crate) async fn connect_with_retry(
    addr: SocketAddr,
    attempts: u32,
    backoff: Duration,
) -> Result<TcpStream, ProxyError> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("MITM connect attempt {attempt}/{attempts} to {addr} failed: {e}");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(ProxyError::Tunnel(format!(
        "cannot reach MITM listener at {addr} after {attempts} attempts: {}",
        last_error.map_or_else(String::new, |e| e.to_string())
    )))
}

async fn run_listener(
    ready: oneshot::Sender<Result<SocketAddr, ProxyError>>,
    cancel: CancellationToken,
    acceptor: TlsAcceptor,
    so_timeout: Duration,
    target: ProxyTarget,
    session: ProxySession,
    content: ContentService,
) {
    let bound = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .and_then(|listener| Ok((listener.local_addr()?, listener)));
    let listener = match bound {
        Ok((addr, listener)) => {
            debug!("MITM listener bound on {addr}");
            if ready.send(Ok(addr)).is_err() {
                return;
            }
            listener
        }
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let accepted = tokio::select! {
        () = cancel.cancelled() => return,
        accepted = listener.accept() => accepted,
    };
    drop(listener);
    let stream = match accepted {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("MITM accept failed: {e}");
            return;
        }
    };

    let served = tokio::select! {
        () = cancel.cancelled() => return,
        served = tokio::time::timeout(so_timeout, serve_session(stream, acceptor, &target, &session, &content)) => served,
    };
    match served {
        Ok(Ok(())) => debug!("MITM session closed"),
        Ok(Err(e)) => warn!("MITM session failed: {e}"),
        Err(_) => warn!("MITM session timed out after {so_timeout:?}"),
    }
}

async fn serve_session(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    target: &ProxyTarget,
    session: &ProxySession,
    content: &ContentService,
) -> Result<(), ProxyError> {
    let mut tls = acceptor.accept(stream).await?;
    let mut reader = RequestReader::new();
    let Some(request) = reader.read_from(&mut tls).await? else {
        debug!("MITM client sent no request");
        return Ok(());
    };
    info!("{} {} (intercepted)", request.method, request.uri);
    let result = match request.method.as_str() {
        "GET" | "HEAD" => {
            let path = origin_path(&request.uri);
            content
                .transfer(&mut tls, &target.with_path(path), session, request.method == "GET")
                .await
                .map(|_| ())
        }
        other => write_error(&mut tls, 405, &format!("method {other} is not supported")).await,
    };
    if let Err(e) = result {
        warn!("intercepted request failed: {e}");
        let _ = write_error(&mut tls, e.status(), &e.to_string()).await;
    }
    tls.shutdown().await?;
    Ok(())
}

/// Path of an origin-form (`/a?b`) or absolute-form request target, without
/// the query.
fn origin_path(uri: &str) -> &str {
    let path = match uri.find("://") {
        Some(scheme_end) => {
            let rest = &uri[scheme_end + 3..];
            rest.find('/').map_or("/", |i| &rest[i..])
        }
        None => uri,
    };
    path.split(['?', '#']).next().unwrap_or(path)
}

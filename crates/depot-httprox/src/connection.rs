//! Per-connection pipeline.
//!
//! A connection is split into a read half and a write half running as
//! separate tasks. The read half parses the request head and hands a
//! [`ReadOutcome`] to the write half, which answers it and replies with a
//! [`Directive`]: either finish, or forward every further client byte into a
//! tunnel.

use crate::auth::{ProxyAuth, UserPass};
use crate::config::{HttproxConfig, TrackingType};
use crate::mitm::MitmServer;
use crate::reader::{ProxyRequest, RequestReader};
use crate::repo::ProxyTarget;
use crate::response::{write_challenge, write_error, write_established, write_options};
use crate::service::{ContentService, ProxySession};
use crate::tunnel::{TunnelInlet, TunnelRelay};
use crate::ProxyError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument};

/// What the read half saw.
#[derive(Debug)]
enum ReadOutcome {
    Request(ProxyRequest),
    /// The client went away before a full head arrived.
    Closed,
    Failed(ProxyError),
}

/// What the read half does once the response is settled.
enum Directive {
    Finish,
    DirectTo(TunnelInlet),
}

/// How the write half disposed of a request.
enum Dispatched {
    Responded(u16),
    /// `CONNECT` succeeded; the stream leads to the MITM listener.
    Tunnel(TcpStream),
}

/// Shared state for every connection of a proxy.
pub struct ProxyContext {
    pub(crate) config: HttproxConfig,
    pub(crate) auth: Arc<ProxyAuth>,
    pub(crate) content: ContentService,
    pub(crate) mitm: Option<Arc<MitmServer>>,
}

impl ProxyContext {
    pub fn new(
        config: HttproxConfig,
        auth: ProxyAuth,
        content: ContentService,
        mitm: Option<MitmServer>,
    ) -> Self {
        Self {
            config,
            auth: Arc::new(auth),
            content,
            mitm: mitm.map(Arc::new),
        }
    }

    pub fn config(&self) -> &HttproxConfig {
        &self.config
    }
}

/// Drive one accepted client connection to completion.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ProxyContext>) {
    let span = info_span!("httprox", %peer);
    async move {
        let (rd, wr) = stream.into_split();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (directive_tx, directive_rx) = oneshot::channel();
        let reader = tokio::spawn(read_half(rd, outcome_tx, directive_rx).in_current_span());
        write_half(wr, outcome_rx, directive_tx, &ctx).await;
        if let Err(e) = reader.await {
            warn!("httprox read task failed: {e}");
        }
    }
    .instrument(span)
    .await;
}

async fn read_half(
    mut rd: OwnedReadHalf,
    outcome: oneshot::Sender<ReadOutcome>,
    directive: oneshot::Receiver<Directive>,
) {
    let mut reader = RequestReader::new();
    let read = match reader.read_from(&mut rd).await {
        Ok(Some(request)) => ReadOutcome::Request(request),
        Ok(None) => ReadOutcome::Closed,
        Err(ProxyError::Io(e)) if is_disconnect(&e) => ReadOutcome::Closed,
        Err(e) => ReadOutcome::Failed(e),
    };
    if outcome.send(read).is_err() {
        return;
    }
    match directive.await {
        Ok(Directive::DirectTo(mut inlet)) => {
            debug!("connection directed into tunnel");
            if let Err(e) = inlet.forward(reader.remainder()).await {
                debug!("tunnel target write failed: {e}");
                inlet.relay().close();
                return;
            }
            inlet.run(rd).await;
        }
        Ok(Directive::Finish) | Err(_) => {}
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
    )
}

async fn write_half(
    mut sink: OwnedWriteHalf,
    outcome: oneshot::Receiver<ReadOutcome>,
    directive: oneshot::Sender<Directive>,
    ctx: &ProxyContext,
) {
    let result = match outcome.await {
        Ok(ReadOutcome::Request(request)) => {
            info!("{} {}", request.method, request.uri);
            ctx.dispatch(&request, &mut sink).await
        }
        Ok(ReadOutcome::Closed) => {
            debug!("client closed the connection before sending a request");
            let _ = directive.send(Directive::Finish);
            return;
        }
        Ok(ReadOutcome::Failed(e)) => Err(e),
        Err(_) => write_error(&mut sink, 400, "no request received")
            .await
            .map(|()| Dispatched::Responded(400)),
    };

    match result {
        Ok(Dispatched::Tunnel(target)) => {
            let (relay, inlet, _pump) = TunnelRelay::open(sink, target, ctx.config.tunnel_idle_timeout());
            if directive.send(Directive::DirectTo(inlet)).is_err() {
                relay.close();
            }
            return;
        }
        Ok(Dispatched::Responded(status)) => debug!("response complete: {status}"),
        Err(e) => {
            warn!("HTTProx request failed: {e}");
            if let Err(write_err) = write_error(&mut sink, e.status(), &e.to_string()).await {
                debug!("cannot report error to client: {write_err}");
            }
        }
    }
    let _ = directive.send(Directive::Finish);
    if let Err(e) = sink.shutdown().await {
        debug!("failed to shut down response stream: {e}");
    }
}

impl ProxyContext {
    async fn dispatch(
        &self,
        request: &ProxyRequest,
        sink: &mut OwnedWriteHalf,
    ) -> Result<Dispatched, ProxyError> {
        let credentials = request
            .header("proxy-authorization")
            .and_then(UserPass::from_basic);
        if credentials.is_none() && self.credentials_required() {
            write_challenge(sink, &self.config.realm).await?;
            return Ok(Dispatched::Responded(407));
        }

        match request.method.as_str() {
            "GET" | "HEAD" => {
                if !self.authenticate(credentials.as_ref()).await? {
                    write_challenge(sink, &self.config.realm).await?;
                    return Ok(Dispatched::Responded(407));
                }
                let target = ProxyTarget::from_absolute(&request.uri)?;
                let session = self.session(credentials);
                let status = self
                    .content
                    .transfer(sink, &target, &session, request.method == "GET")
                    .await?;
                Ok(Dispatched::Responded(status))
            }
            "OPTIONS" => {
                write_options(sink).await?;
                Ok(Dispatched::Responded(200))
            }
            "CONNECT" => self.connect(request, credentials, sink).await,
            other => {
                write_error(sink, 405, &format!("method {other} is not supported")).await?;
                Ok(Dispatched::Responded(405))
            }
        }
    }

    async fn connect(
        &self,
        request: &ProxyRequest,
        credentials: Option<UserPass>,
        sink: &mut OwnedWriteHalf,
    ) -> Result<Dispatched, ProxyError> {
        let Some(mitm) = &self.mitm else {
            write_error(sink, 400, "CONNECT is not supported: MITM is disabled").await?;
            return Ok(Dispatched::Responded(400));
        };
        if !self.authenticate(credentials.as_ref()).await? {
            write_challenge(sink, &self.config.realm).await?;
            return Ok(Dispatched::Responded(407));
        }
        let target = ProxyTarget::from_authority(&request.uri)?;
        let session = self.session(credentials);
        let listener = mitm.start(target, session, self.content.clone()).await?;
        let config = mitm.config();
        let stream = match listener
            .connect(config.connect_attempts, config.connect_backoff())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                listener.stop().await;
                return Err(e);
            }
        };
        if let Err(e) = write_established(sink).await {
            listener.stop().await;
            return Err(e);
        }
        debug!("tunnel to {} established via {}", request.uri, listener.local_addr());
        Ok(Dispatched::Tunnel(stream))
    }

    fn credentials_required(&self) -> bool {
        self.config.secured || self.config.tracking == TrackingType::Always
    }

    /// `true` for absent credentials; those were already challenged if required.
    async fn authenticate(&self, credentials: Option<&UserPass>) -> Result<bool, ProxyError> {
        let Some(credentials) = credentials.cloned() else {
            return Ok(true);
        };
        let auth = Arc::clone(&self.auth);
        tokio::task::spawn_blocking(move || auth.check(&credentials))
            .await
            .map_err(|e| ProxyError::TaskFailed(e.to_string()))?
    }

    fn session(&self, credentials: Option<UserPass>) -> ProxySession {
        let tracking_id = credentials
            .as_ref()
            .and_then(|up| up.tracking_id(self.config.tracking));
        ProxySession {
            credentials,
            tracking_id,
        }
    }
}

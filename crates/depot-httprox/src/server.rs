use crate::auth::{AuthCache, ProxyAuth, ProxyAuthenticator, StaticAuthenticator};
use crate::config::HttproxConfig;
use crate::connection::{handle_connection, ProxyContext};
use crate::mitm::MitmServer;
use crate::repo::{DefaultRepositoryCreator, ProxyRepositories, ProxyRepositoryCreator};
use crate::service::ContentService;
use crate::ProxyError;
use depot_store::{ContentAccess, StoreRegistry};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds a [`ProxyServer`] from its collaborators.
pub struct ProxyServerBuilder {
    config: HttproxConfig,
    registry: Arc<dyn StoreRegistry>,
    content: Arc<dyn ContentAccess>,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    creator: Option<Option<Arc<dyn ProxyRepositoryCreator>>>,
    mitm: Option<MitmServer>,
}

impl ProxyServerBuilder {
    pub fn authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Replace the creator used for stores that do not exist yet.
    pub fn repository_creator(mut self, creator: Arc<dyn ProxyRepositoryCreator>) -> Self {
        self.creator = Some(Some(creator));
        self
    }

    /// Refuse to create stores; unknown origins fail with a data error.
    pub fn without_repository_creator(mut self) -> Self {
        self.creator = Some(None);
        self
    }

    /// Use an already loaded MITM server instead of the CA named in the config.
    pub fn mitm(mut self, mitm: MitmServer) -> Self {
        self.mitm = Some(mitm);
        self
    }

    pub fn build(self) -> Result<ProxyServer, ProxyError> {
        let mitm = match (self.mitm, &self.config.mitm) {
            (Some(mitm), _) => Some(mitm),
            (None, Some(mitm_config)) => Some(MitmServer::load(mitm_config.clone())?),
            (None, None) => None,
        };
        let authenticator: Arc<dyn ProxyAuthenticator> = match self.authenticator {
            Some(authenticator) => authenticator,
            None => Arc::new(StaticAuthenticator::new(self.config.users.clone())),
        };
        let creator = self.creator.unwrap_or_else(|| {
            let default: Arc<dyn ProxyRepositoryCreator> = Arc::new(DefaultRepositoryCreator);
            Some(default)
        });
        let auth = ProxyAuth::new(
            AuthCache::new(self.config.auth_cache_salt.clone(), self.config.auth_cache_ttl()),
            authenticator,
        );
        let repos = ProxyRepositories::new(self.registry, creator);
        let content = ContentService::new(self.content, repos);
        Ok(ProxyServer {
            context: Arc::new(ProxyContext::new(self.config, auth, content, mitm)),
        })
    }
}

/// The HTTProx listener.
pub struct ProxyServer {
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn builder(
        config: HttproxConfig,
        registry: Arc<dyn StoreRegistry>,
        content: Arc<dyn ContentAccess>,
    ) -> ProxyServerBuilder {
        ProxyServerBuilder {
            config,
            registry,
            content,
            authenticator: None,
            creator: None,
            mitm: None,
        }
    }

    pub fn config(&self) -> &HttproxConfig {
        self.context.config()
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("HTTProx shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        tokio::spawn(handle_connection(stream, peer, Arc::clone(&self.context)));
                    }
                    Err(e) => {
                        warn!("HTTProx accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    /// Bind `addr` and serve in the background.
    pub async fn spawn(self, addr: SocketAddr) -> Result<ProxyHandle, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("HTTProx listening on {addr}");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            self.serve(listener, async {
                let _ = shutdown_rx.await;
            })
            .await;
        });
        Ok(ProxyHandle {
            addr,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

/// A proxy serving in the background. Dropping it stops the accept loop.
pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("HTTProx accept loop failed: {e}");
            }
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

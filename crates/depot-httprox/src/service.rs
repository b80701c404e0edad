use crate::auth::UserPass;
use crate::repo::{ProxyRepositories, ProxyTarget};
use crate::response::{write_error, write_file};
use crate::ProxyError;
use depot_store::{ContentAccess, StoreError};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::debug;

/// An origin that could not be reached is a bad gateway; other store
/// failures stay internal.
fn upstream_failure(e: StoreError) -> ProxyError {
    match e {
        StoreError::Remote(message) => ProxyError::Workflow {
            status: 502,
            message: format!("upstream fetch failed: {message}"),
        },
        other => ProxyError::Store(other),
    }
}

/// Who is asking, as far as store resolution cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySession {
    pub credentials: Option<UserPass>,
    pub tracking_id: Option<String>,
}

/// Serves proxied paths out of depot stores.
#[derive(Clone)]
pub struct ContentService {
    content: Arc<dyn ContentAccess>,
    repos: ProxyRepositories,
}

impl ContentService {
    pub fn new(content: Arc<dyn ContentAccess>, repos: ProxyRepositories) -> Self {
        Self { content, repos }
    }

    /// Write `target` to `w` as a full response, or a `404` when no store
    /// holds it. Returns the status written.
    pub async fn transfer<W>(
        &self,
        w: &mut W,
        target: &ProxyTarget,
        session: &ProxySession,
        with_body: bool,
    ) -> Result<u16, ProxyError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if target.store_path().is_empty() {
            return Err(ProxyError::Workflow {
                status: 404,
                message: format!("no path requested from {}", target.url()),
            });
        }
        let this = self.clone();
        let owned_target = target.clone();
        let owned_session = session.clone();
        let (store, hit) = tokio::task::spawn_blocking(move || {
            let store = this.repos.resolve(
                &owned_target,
                owned_session.tracking_id.as_deref(),
                owned_session.credentials.as_ref(),
            )?;
            let hit = this
                .content
                .retrieve(&store, owned_target.store_path())
                .map_err(upstream_failure)?;
            Ok::<_, ProxyError>((store, hit))
        })
        .await
        .map_err(|e| ProxyError::TaskFailed(e.to_string()))??;

        match hit {
            Some(found) => {
                debug!("{} served from {} ({} bytes)", target.path, found.store, found.len);
                write_file(w, &found.file, found.len, with_body).await?;
                Ok(200)
            }
            None => {
                debug!("{} not found in {}", target.path, store.key);
                let message = format!("{} not found in {}", target.store_path(), store.key);
                write_error(w, 404, &message).await?;
                Ok(404)
            }
        }
    }
}

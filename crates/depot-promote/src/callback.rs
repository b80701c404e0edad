use depot_model::CallbackTarget;
use depot_remote::{is_success, CallbackTransport};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delivers promotion results to callback URLs.
///
/// The first attempt is made inline. If it fails the body is stashed in a
/// background task that retries with exponential backoff
/// (`backoff * 2^attempt`) up to `retry_limit` times, then drops it.
#[derive(Clone)]
pub struct CallbackNotifier {
    transport: Arc<dyn CallbackTransport>,
    retry_limit: u32,
    backoff: Duration,
    pending: Arc<AtomicUsize>,
}

impl CallbackNotifier {
    pub fn new(transport: Arc<dyn CallbackTransport>, retry_limit: u32, backoff: Duration) -> Self {
        Self {
            transport,
            retry_limit,
            backoff,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns whether the first attempt was accepted with a 2xx.
    pub async fn notify<T: Serialize>(&self, target: &CallbackTarget, body: &T) -> bool {
        let body = match serde_json::to_vec(body) {
            Ok(body) => Arc::new(body),
            Err(e) => {
                warn!("cannot encode callback body for {}: {e}", target.url);
                return false;
            }
        };
        if self.attempt(target, &body).await {
            return true;
        }
        if self.retry_limit > 0 {
            self.stash(target.clone(), body);
        }
        false
    }

    /// Callbacks waiting for a retry.
    pub fn pending_retries(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn attempt(&self, target: &CallbackTarget, body: &Arc<Vec<u8>>) -> bool {
        let transport = Arc::clone(&self.transport);
        let owned_target = target.clone();
        let owned_body = Arc::clone(body);
        let sent = tokio::task::spawn_blocking(move || transport.send(&owned_target, &owned_body)).await;
        match sent {
            Ok(Ok(status)) if is_success(status) => {
                debug!("callback to {} answered {status}", target.url);
                true
            }
            Ok(Ok(status)) => {
                warn!("callback to {} answered {status}", target.url);
                false
            }
            Ok(Err(e)) => {
                warn!("callback to {} failed: {e}", target.url);
                false
            }
            Err(e) => {
                warn!("callback task for {} failed: {e}", target.url);
                false
            }
        }
    }

    fn stash(&self, target: CallbackTarget, body: Arc<Vec<u8>>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let this = self.clone();
        tokio::spawn(async move {
            let mut delivered = false;
            for attempt in 0..this.retry_limit {
                let delay = this.backoff.saturating_mul(2u32.saturating_pow(attempt));
                tokio::time::sleep(delay).await;
                if this.attempt(&target, &body).await {
                    info!("callback to {} delivered after {} retries", target.url, attempt + 1);
                    delivered = true;
                    break;
                }
            }
            if !delivered {
                warn!(
                    "dropping callback to {} after {} retries",
                    target.url, this.retry_limit
                );
            }
            this.pending.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

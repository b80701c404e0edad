use crate::StoreError;
use std::io::Write;

/// Pulls artifact bytes from the upstream URL of a remote store.
///
/// Returns `Ok(false)` when the upstream does not have the resource.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<bool, StoreError>;
}

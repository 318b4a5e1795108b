//! Lookup of the worker's public IP, resolved once per process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::warn;

type Lookup = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Caches the first successful lookup. Failed lookups are not cached, so the
/// next caller tries again.
#[derive(Clone)]
pub struct PublicIpCache {
    cell: Arc<OnceCell<String>>,
    lookup: Option<Lookup>,
    lookups: Arc<AtomicUsize>,
}

impl std::fmt::Debug for PublicIpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIpCache")
            .field("cached", &self.cell.get())
            .field("lookups", &self.lookups.load(Ordering::SeqCst))
            .finish()
    }
}

impl PublicIpCache {
    pub fn new<F, Fut>(lookup: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String>> + Send + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            lookup: Some(Arc::new(move || Box::pin(lookup()))),
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Never resolves an address.
    pub fn disabled() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            lookup: None,
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fixed(ip: impl Into<String>) -> Self {
        let ip = ip.into();
        Self::new(move || {
            let ip = ip.clone();
            async move { Ok(ip) }
        })
    }

    /// Queries `url`, which must answer with the address as plain text.
    pub fn with_http(client: reqwest::Client, url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let body = client
                    .get(&url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .with_context(|| format!("public IP lookup against {url} failed"))?
                    .text()
                    .await
                    .context("public IP response was not text")?;
                let ip = body.trim();
                anyhow::ensure!(!ip.is_empty(), "public IP response was empty");
                Ok(ip.to_string())
            }
        })
    }

    pub async fn get(&self) -> Option<String> {
        let lookup = self.lookup.as_ref()?;
        let result = self
            .cell
            .get_or_try_init(|| {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                lookup()
            })
            .await;
        match result {
            Ok(ip) => Some(ip.clone()),
            Err(err) => {
                warn!(error = %err, "public IP lookup failed");
                None
            }
        }
    }

    /// Number of lookups attempted so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn resolves_once_and_caches() {
        let cache = PublicIpCache::fixed("203.0.113.7");
        assert_eq!(cache.get().await.as_deref(), Some("203.0.113.7"));
        assert_eq!(cache.clone().get().await.as_deref(), Some("203.0.113.7"));
        assert_eq!(cache.lookups(), 1);
    }

    #[tokio::test]
    async fn failures_are_retried_on_next_use() {
        let fail = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&fail);
        let cache = PublicIpCache::new(move || {
            let fail = flag.load(Ordering::SeqCst);
            async move {
                if fail {
                    anyhow::bail!("network down")
                }
                Ok("198.51.100.1".to_string())
            }
        });

        assert_eq!(cache.get().await, None);
        fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.get().await.as_deref(), Some("198.51.100.1"));
        assert_eq!(cache.lookups(), 2);
    }

    #[tokio::test]
    async fn disabled_cache_never_looks_up() {
        let cache = PublicIpCache::disabled();
        assert_eq!(cache.get().await, None);
        assert_eq!(cache.lookups(), 0);
    }
}

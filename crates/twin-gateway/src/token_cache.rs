//! Single-slot memoization of token exchange and refresh results.
//!
//! CoAP retransmits requests, so a device can present the same authorization
//! code or refresh token twice. Identity providers treat both as single-use;
//! replaying the cached result keeps the retransmitted request working.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::backend::{IdentityProvider, TokenGrant};
use crate::error::{GatewayError, GatewayResult};

/// Remembers the result of the last successful call for its key.
///
/// Not synchronized; each session owns its caches and serializes access.
#[derive(Debug, Clone)]
pub struct TokenCache<T> {
    last: Option<(String, T)>,
}

impl<T: Clone> TokenCache<T> {
    /// Create an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Return the memoized result for `key`, or run `operation` and remember
    /// its result on success. Failures are not memoized.
    ///
    /// # Errors
    ///
    /// Returns whatever `operation` returns on failure.
    pub async fn execute<F, Fut, E>(&mut self, key: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some((cached_key, value)) = &self.last {
            if cached_key == key {
                debug!("token cache hit");
                return Ok(value.clone());
            }
        }
        let value = operation().await?;
        self.last = Some((key.to_string(), value.clone()));
        Ok(value)
    }

    /// Forget the memoized result.
    pub fn clear(&mut self) {
        self.last = None;
    }

    /// True when a result is memoized.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        self.last.is_some()
    }
}

impl<T: Clone> Default for TokenCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh against every provider concurrently.
///
/// The first success wins and the remaining calls are dropped. If every
/// provider fails, the first error observed is returned.
///
/// # Errors
///
/// Returns `Unauthorized` when no provider is configured, otherwise the first
/// provider error.
pub async fn refresh_with_any(
    providers: &[Arc<dyn IdentityProvider>],
    refresh_token: &str,
) -> GatewayResult<TokenGrant> {
    let mut calls: FuturesUnordered<_> = providers
        .iter()
        .map(|provider| provider.refresh(refresh_token))
        .collect();

    let mut first_error = None;
    while let Some(result) = calls.next().await {
        match result {
            Ok(grant) => return Ok(grant),
            Err(e) => {
                debug!(error = %e, "refresh attempt failed");
                first_error.get_or_insert(e);
            }
        }
    }
    Err(first_error.unwrap_or_else(|| {
        GatewayError::Unauthorized("no identity provider configured".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // ==================== TokenCache Tests ====================

    #[tokio::test]
    async fn test_same_key_runs_operation_once() {
        let calls = AtomicUsize::new(0);
        let mut cache = TokenCache::new();
        for _ in 0..2 {
            let v: Result<u32, ()> = cache
                .execute("code", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(v, Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_keys_run_operation_twice() {
        let calls = AtomicUsize::new(0);
        let mut cache = TokenCache::new();
        for key in ["a", "b"] {
            let _: Result<u32, ()> = cache
                .execute(key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_forces_new_call() {
        let calls = AtomicUsize::new(0);
        let mut cache = TokenCache::new();
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(1)
        };
        cache.execute("a", op).await.unwrap();
        cache.clear();
        assert!(!cache.is_cached());
        cache.execute("a", op).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_is_not_memoized() {
        let mut cache: TokenCache<u32> = TokenCache::new();
        let first: Result<u32, &str> = cache.execute("a", || async { Err("boom") }).await;
        assert!(first.is_err());
        let second: Result<u32, &str> = cache.execute("a", || async { Ok(3) }).await;
        assert_eq!(second, Ok(3));
    }

    // ==================== refresh_with_any Tests ====================

    struct FixedProvider {
        name: &'static str,
        delay: Duration,
        result: Result<&'static str, &'static str>,
    }

    impl IdentityProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn exchange<'a>(&'a self, _code: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>> {
            Box::pin(async { Err(GatewayError::Unauthorized("unsupported".into())) })
        }

        fn refresh<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, GatewayResult<TokenGrant>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                match self.result {
                    Ok(token) => Ok(TokenGrant::new(token, "refresh", "owner")),
                    Err(e) => Err(GatewayError::Unauthorized(e.to_string())),
                }
            })
        }
    }

    fn provider(
        name: &'static str,
        delay_ms: u64,
        result: Result<&'static str, &'static str>,
    ) -> Arc<dyn IdentityProvider> {
        Arc::new(FixedProvider {
            name,
            delay: Duration::from_millis(delay_ms),
            result,
        })
    }

    #[tokio::test]
    async fn test_refresh_first_success_wins() {
        let providers = vec![
            provider("slow-fail", 1, Err("nope")),
            provider("ok", 5, Ok("token-ok")),
            provider("late", 500, Ok("token-late")),
        ];
        let grant = refresh_with_any(&providers, "r").await.unwrap();
        assert_eq!(grant.access_token, "token-ok");
    }

    #[tokio::test]
    async fn test_refresh_all_fail_returns_first_error() {
        let providers = vec![
            provider("second", 20, Err("second")),
            provider("first", 1, Err("first")),
        ];
        let err = refresh_with_any(&providers, "r").await.unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[tokio::test]
    async fn test_refresh_without_providers() {
        let err = refresh_with_any(&[], "r").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
    }
}

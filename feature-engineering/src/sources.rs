use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bundle::SignalBundle;

/// Upstream signal adapter. Implementations wrap whatever acquisition stack
/// feeds the pipeline; the pipeline only sees this seam.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<SignalBundle>;
}

/// Historical/last price lookup. `None` means no price is available at the
/// requested time, which callers surface as a stale-price condition.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Result<Option<f64>>;
}

/// Wraps a signal source with a fetch timeout and a per-symbol LRU fallback.
/// A timed-out or failed fetch degrades to the last good bundle, marked
/// `degraded` so the engineer caps its quality score.
pub struct CachedSignalSource {
    inner: Arc<dyn SignalSource>,
    cache: Mutex<LruCache<String, SignalBundle>>,
    fetch_timeout: Duration,
}

impl CachedSignalSource {
    pub fn new(inner: Arc<dyn SignalSource>, capacity: usize, fetch_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            fetch_timeout,
        }
    }

    async fn fallback(&self, symbol: &str, reason: &str) -> Result<SignalBundle> {
        let mut cache = self.cache.lock().await;
        match cache.get(symbol) {
            Some(cached) => {
                warn!("Signal fetch for {} {}; serving cached bundle", symbol, reason);
                let mut bundle = cached.clone();
                bundle.degraded = true;
                Ok(bundle)
            }
            None => Err(anyhow!("signal fetch for {} {} and no cached bundle exists", symbol, reason)),
        }
    }
}

#[async_trait]
impl SignalSource for CachedSignalSource {
    async fn fetch(&self, symbol: &str) -> Result<SignalBundle> {
        match tokio::time::timeout(self.fetch_timeout, self.inner.fetch(symbol)).await {
            Ok(Ok(bundle)) => {
                self.cache.lock().await.put(symbol.to_string(), bundle.clone());
                debug!("Fetched fresh signal bundle for {}", symbol);
                Ok(bundle)
            }
            Ok(Err(err)) => self.fallback(symbol, &format!("failed ({err:#})")).await,
            Err(_) => self.fallback(symbol, "timed out").await,
        }
    }
}

/// Fixed in-memory signal source for tests and dry runs.
#[derive(Default)]
pub struct StaticSignalSource {
    bundles: HashMap<String, SignalBundle>,
}

impl StaticSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(mut self, bundle: SignalBundle) -> Self {
        self.bundles.insert(bundle.symbol.clone(), bundle);
        self
    }

    pub fn insert(&mut self, bundle: SignalBundle) {
        self.bundles.insert(bundle.symbol.clone(), bundle);
    }
}

#[async_trait]
impl SignalSource for StaticSignalSource {
    async fn fetch(&self, symbol: &str) -> Result<SignalBundle> {
        self.bundles
            .get(symbol)
            .cloned()
            .with_context(|| format!("no signal bundle for {symbol}"))
    }
}

/// Fixed in-memory price series for tests and dry runs. `price_at` returns
/// the latest price observed at or before the requested time.
#[derive(Default)]
pub struct StaticPriceSource {
    series: HashMap<String, Vec<(DateTime<Utc>, f64)>>,
}

impl StaticPriceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, symbol: &str, at: DateTime<Utc>, price: f64) -> Self {
        self.push(symbol, at, price);
        self
    }

    pub fn push(&mut self, symbol: &str, at: DateTime<Utc>, price: f64) {
        let series = self.series.entry(symbol.to_string()).or_default();
        series.push((at, price));
        series.sort_by_key(|(ts, _)| *ts);
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    async fn price_at(&self, symbol: &str, at: DateTime<Utc>) -> Result<Option<f64>> {
        Ok(self
            .series
            .get(symbol)
            .and_then(|series| series.iter().rev().find(|(ts, _)| *ts <= at).map(|(_, p)| *p)))
    }
}

//! Venue registry: maps a persisted venue id onto an adapter constructor.
//!
//! Populated once at worker startup and consulted by the runtime when a
//! task arrives; there is no dynamic class lookup anywhere else.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;

use super::prediction::{MarketPeriod, PredictionAdapter};
use super::spot::{SpotAdapter, SpotAdapterConfig};
use super::{ExchangeAdapter, ExchangeKind};

/// Everything an adapter constructor needs, decrypted and validated.
#[derive(Debug, Clone)]
pub struct AdapterParams {
    pub venue_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub symbol: String,
    pub testnet: bool,
}

pub type AdapterFactory =
    Arc<dyn Fn(AdapterParams) -> BoxFuture<'static, Result<Arc<dyn ExchangeAdapter>>> + Send + Sync>;

#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, venue_id: &str, factory: AdapterFactory) {
        self.factories.insert(venue_id.to_string(), factory);
    }

    pub fn contains(&self, venue_id: &str) -> bool {
        self.factories.contains_key(venue_id)
    }

    pub fn venue_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn build(&self, params: AdapterParams) -> Result<Arc<dyn ExchangeAdapter>> {
        let factory = self
            .factories
            .get(&params.venue_id)
            .ok_or_else(|| anyhow!("unknown venue id: {}", params.venue_id))?
            .clone();
        factory(params).await
    }

    /// Registry with every built-in venue.
    pub fn with_builtin_venues() -> Self {
        let mut registry = Self::new();

        for (venue_id, kind) in [
            ("binance", ExchangeKind::Spot),
            ("binanceusdm", ExchangeKind::Futures),
        ] {
            let id = venue_id.to_string();
            registry.register(
                venue_id,
                Arc::new(move |params: AdapterParams| {
                    let id = id.clone();
                    Box::pin(async move {
                        let adapter = SpotAdapter::connect(SpotAdapterConfig {
                            venue_id: id,
                            kind,
                            api_key: params.api_key,
                            api_secret: params.api_secret,
                            symbol: params.symbol,
                            testnet: params.testnet,
                        })
                        .await?;
                        Ok(Arc::new(adapter) as Arc<dyn ExchangeAdapter>)
                    }) as BoxFuture<'static, Result<Arc<dyn ExchangeAdapter>>>
                }),
            );
        }

        for (venue_id, period) in [
            ("polymarket_updown5m", MarketPeriod::FiveMinutes),
            ("polymarket_updown15m", MarketPeriod::FifteenMinutes),
            ("polymarket_updown1h", MarketPeriod::OneHour),
            ("polymarket_updown1d", MarketPeriod::OneDay),
        ] {
            registry.register(
                venue_id,
                Arc::new(move |params: AdapterParams| {
                    Box::pin(async move {
                        let adapter = PredictionAdapter::connect(
                            period,
                            params.api_key,
                            params.api_secret,
                            params.symbol,
                        )
                        .await?;
                        Ok(Arc::new(adapter) as Arc<dyn ExchangeAdapter>)
                    }) as BoxFuture<'static, Result<Arc<dyn ExchangeAdapter>>>
                }),
            );
        }

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_all_venues() {
        let registry = AdapterRegistry::with_builtin_venues();
        for id in [
            "binance",
            "binanceusdm",
            "polymarket_updown5m",
            "polymarket_updown15m",
            "polymarket_updown1h",
            "polymarket_updown1d",
        ] {
            assert!(registry.contains(id), "missing venue {id}");
        }
        assert!(!registry.contains("kraken"));
    }

    #[tokio::test]
    async fn unknown_venue_is_an_error() {
        let registry = AdapterRegistry::with_builtin_venues();
        let err = match registry
            .build(AdapterParams {
                venue_id: "nope".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                symbol: "BTCUSDT".into(),
                testnet: true,
            })
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected unknown venue error"),
        };
        assert!(err.to_string().contains("unknown venue"));
    }
}

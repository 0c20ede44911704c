//! Gas price caching and fee bump arithmetic

use crate::chain::{GasPrice, NetworkService};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Keeps the last known network fee fields for one chain.
///
/// Readers never trigger a network call; the cache is refreshed on a fixed
/// interval by `run`.
pub struct GasPriceService {
    chain_id: u64,
    network: Arc<dyn NetworkService>,
    refresh_interval: Duration,
    cached: RwLock<Option<GasPrice>>,
}

impl GasPriceService {
    pub fn new(chain_id: u64, network: Arc<dyn NetworkService>, refresh_interval: Duration) -> Self {
        Self {
            chain_id,
            network,
            refresh_interval,
            cached: RwLock::new(None),
        }
    }

    /// Fetch the current network fees and cache them. On failure the previous
    /// value stays in place.
    pub async fn set_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.network.get_gas_price().await {
            Ok(price) => {
                debug!("Gas price for chain {}: {:?}", self.chain_id, price);
                crate::metrics::record_gas_price(self.chain_id, &price);
                *self.cached.write().await = Some(price.clone());
                Ok(price)
            }
            Err(e) => {
                warn!("Gas price refresh failed on chain {}: {}", self.chain_id, e);
                crate::metrics::record_gas_price_failure(self.chain_id);
                Err(e)
            }
        }
    }

    /// Last successfully fetched fees
    pub async fn get_gas_price(&self) -> Option<GasPrice> {
        self.cached.read().await.clone()
    }

    /// Cached fees, or a one-off fetch when nothing was cached yet
    pub async fn current_or_fetch(&self) -> RelayerResult<GasPrice> {
        match self.get_gas_price().await {
            Some(price) => Ok(price),
            None => self.set_gas_price().await,
        }
    }

    /// Refresh loop; exits when `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        info!(
            "Gas price refresh every {:?} on chain {}",
            self.refresh_interval, self.chain_id
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are logged and counted inside set_gas_price.
                    let _ = self.set_gas_price().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Fees for a replacement of a transaction priced at `previous`.
///
/// `max(network, previous) * (100 + bump_percentage) / 100`, per fee field,
/// and always strictly above `previous`. A network quote using a different
/// fee model than `previous` is ignored.
pub fn bump_fee(previous: &GasPrice, network: Option<&GasPrice>, bump_percentage: u64) -> GasPrice {
    let bump = |prev: U256, quoted: Option<U256>| {
        let base = quoted.map_or(prev, |q| q.max(prev));
        let bumped = base * (100 + bump_percentage) / 100;
        if bumped > prev {
            bumped
        } else {
            prev + 1
        }
    };

    match (previous, network) {
        (GasPrice::Legacy(prev), Some(GasPrice::Legacy(quoted))) => {
            GasPrice::Legacy(bump(*prev, Some(*quoted)))
        }
        (GasPrice::Legacy(prev), _) => GasPrice::Legacy(bump(*prev, None)),
        (
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            },
            quote,
        ) => {
            let (quoted_max, quoted_priority) = match quote {
                Some(GasPrice::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                }) => (Some(*max_fee_per_gas), Some(*max_priority_fee_per_gas)),
                _ => (None, None),
            };
            GasPrice::Eip1559 {
                max_fee_per_gas: bump(*max_fee_per_gas, quoted_max),
                max_priority_fee_per_gas: bump(*max_priority_fee_per_gas, quoted_priority),
            }
        }
    }
}

/// The price a node compares replacements on
pub fn effective_price(price: &GasPrice) -> U256 {
    match price {
        GasPrice::Legacy(price) => *price,
        GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
    }
}

/// Reject fees above the chain's configured ceiling
pub fn ensure_within_cap(chain_id: u64, price: &GasPrice, cap: U256) -> RelayerResult<()> {
    let effective = effective_price(price);
    if effective > cap {
        return Err(RelayerError::GasEstimation(format!(
            "fee {} exceeds the cap {} on chain {}",
            effective, cap, chain_id
        )));
    }
    Ok(())
}

/// Calculate total cost in wei
pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
    gas_limit * effective_price(gas_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkService;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000u64)
    }

    #[test]
    fn bump_uses_higher_of_network_and_previous() {
        let previous = GasPrice::Legacy(gwei(100));

        let above = bump_fee(&previous, Some(&GasPrice::Legacy(gwei(200))), 10);
        assert_eq!(above, GasPrice::Legacy(gwei(220)));

        let below = bump_fee(&previous, Some(&GasPrice::Legacy(gwei(50))), 10);
        assert_eq!(below, GasPrice::Legacy(gwei(110)));

        let no_quote = bump_fee(&previous, None, 10);
        assert_eq!(no_quote, GasPrice::Legacy(gwei(110)));
    }

    #[test]
    fn bump_applies_to_both_eip1559_fields() {
        let previous = GasPrice::Eip1559 {
            max_fee_per_gas: gwei(40),
            max_priority_fee_per_gas: gwei(2),
        };
        let quote = GasPrice::Eip1559 {
            max_fee_per_gas: gwei(60),
            max_priority_fee_per_gas: gwei(1),
        };

        assert_eq!(
            bump_fee(&previous, Some(&quote), 25),
            GasPrice::Eip1559 {
                max_fee_per_gas: gwei(75),
                max_priority_fee_per_gas: U256::from(2_500_000_000u64),
            }
        );
    }

    #[test]
    fn bump_is_strictly_increasing_even_for_tiny_fees() {
        let mut fee = GasPrice::Legacy(U256::from(3));
        for _ in 0..10 {
            let next = bump_fee(&fee, Some(&GasPrice::Legacy(U256::one())), 10);
            assert!(effective_price(&next) > effective_price(&fee));
            fee = next;
        }
    }

    #[test]
    fn mismatched_quote_is_ignored() {
        let previous = GasPrice::Legacy(gwei(10));
        let quote = GasPrice::Eip1559 {
            max_fee_per_gas: gwei(1_000),
            max_priority_fee_per_gas: gwei(1_000),
        };
        assert_eq!(bump_fee(&previous, Some(&quote), 10), GasPrice::Legacy(gwei(11)));
    }

    #[test]
    fn cap_is_enforced() {
        assert!(ensure_within_cap(1, &GasPrice::Legacy(gwei(10)), gwei(10)).is_ok());
        assert!(ensure_within_cap(1, &GasPrice::Legacy(gwei(11)), gwei(10)).is_err());
        assert_eq!(
            calculate_cost(U256::from(21_000), &GasPrice::Legacy(gwei(1))),
            gwei(21_000)
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_value() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let mut network = MockNetworkService::new();
        network.expect_get_gas_price().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(GasPrice::Legacy(U256::from(42)))
            } else {
                Err(RelayerError::GasEstimation("upstream down".to_string()))
            }
        });
        let service = GasPriceService::new(137, Arc::new(network), Duration::from_secs(600));

        assert!(service.get_gas_price().await.is_none());
        service.set_gas_price().await.unwrap();
        assert!(service.set_gas_price().await.is_err());
        assert_eq!(
            service.get_gas_price().await,
            Some(GasPrice::Legacy(U256::from(42)))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut network = MockNetworkService::new();
        network
            .expect_get_gas_price()
            .returning(|| Ok(GasPrice::Legacy(U256::from(7))));
        let service = Arc::new(GasPriceService::new(
            137,
            Arc::new(network),
            Duration::from_millis(5),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(service.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(service.get_gas_price().await, Some(GasPrice::Legacy(U256::from(7))));
    }
}

use crate::error::RetryPolicy;
use fnv::FnvHashMap;
use garner_instrument::{market::Market, security::Temperature};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the Garner core.
///
/// All fields default to the documented operational values, so a `CoreConfig::default()` is a
/// fully working configuration and partial JSON overrides deserialise cleanly.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bounded worker pool size for event processing.
    pub workers: usize,
    /// Bucket queue count multiplier over the worker pool.
    pub bucket_factor: usize,
    /// Bucket queue depth above which the consumer pauses.
    pub high_watermark: usize,
    /// Bucket queue depth below which a paused consumer resumes.
    pub low_watermark: usize,
    /// Sliding window for event id deduplication.
    pub dedup_window: Duration,
    /// Business-date validity window, in business days either side of today.
    pub business_date_window: u32,
    /// Availability cache time-to-live.
    pub cache_ttl: Duration,
    pub deadlines: Deadlines,
    pub retry: RetryPolicy,
    pub locate: LocateConfig,
    /// Market-specific short-sell availability conventions.
    pub conventions: FnvHashMap<Market, MarketConvention>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            bucket_factor: 8,
            high_watermark: 10_000,
            low_watermark: 2_500,
            dedup_window: Duration::from_secs(24 * 60 * 60),
            business_date_window: 5,
            cache_ttl: Duration::from_secs(1_800),
            deadlines: Deadlines::default(),
            retry: RetryPolicy::default(),
            locate: LocateConfig::default(),
            conventions: default_conventions(),
        }
    }
}

impl CoreConfig {
    /// Number of hash buckets routing events by security.
    pub fn bucket_count(&self) -> usize {
        (self.workers * self.bucket_factor).max(1)
    }

    /// Convention for the provided market, falling back to the neutral default.
    pub fn convention(&self, market: Market) -> MarketConvention {
        self.conventions.get(&market).copied().unwrap_or_default()
    }
}

fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|cpus| cpus.get())
        .unwrap_or(4);
    (cpus * 4).min(64)
}

fn default_conventions() -> FnvHashMap<Market, MarketConvention> {
    FnvHashMap::from_iter([
        (
            Market::Jp,
            MarketConvention {
                include_pledge_in_short_sell: true,
                exclude_borrowed_relending: false,
            },
        ),
        (
            Market::Tw,
            MarketConvention {
                include_pledge_in_short_sell: false,
                exclude_borrowed_relending: true,
            },
        ),
    ])
}

/// Per-operation processing budgets inherited by every suspension point.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Deadlines {
    pub position: Duration,
    pub inventory: Duration,
    pub short_sell: Duration,
    pub locate: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            position: Duration::from_millis(1_000),
            inventory: Duration::from_millis(1_000),
            short_sell: Duration::from_millis(150),
            locate: Duration::from_millis(2_000),
        }
    }
}

/// Locate workflow policy: decrement fractions per temperature and the expiry sweep cadence.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocateConfig {
    pub decrement: DecrementPolicy,
    pub expiry_sweep_interval: Duration,
}

impl Default for LocateConfig {
    fn default() -> Self {
        Self {
            decrement: DecrementPolicy::default(),
            expiry_sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Fraction of the requested quantity reserved against Locate availability on approval.
///
/// The per-temperature defaults (HTB full, GC 20%, otherwise 10%) are operational policy, not
/// a canonical table - markets may override them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DecrementPolicy {
    pub htb: Decimal,
    pub gc: Decimal,
    pub fallback: Decimal,
    pub market_overrides: FnvHashMap<Market, TemperatureFractions>,
}

impl Default for DecrementPolicy {
    fn default() -> Self {
        Self {
            htb: Decimal::ONE,
            gc: Decimal::new(2, 1),
            fallback: Decimal::new(1, 1),
            market_overrides: FnvHashMap::default(),
        }
    }
}

/// Decrement fractions for a single market override.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct TemperatureFractions {
    pub htb: Decimal,
    pub gc: Decimal,
    pub fallback: Decimal,
}

impl DecrementPolicy {
    pub fn fraction(&self, market: Market, temperature: Temperature) -> Decimal {
        match self.market_overrides.get(&market) {
            Some(fractions) => match temperature {
                Temperature::Htb => fractions.htb,
                Temperature::Gc => fractions.gc,
                Temperature::Unknown => fractions.fallback,
            },
            None => match temperature {
                Temperature::Htb => self.htb,
                Temperature::Gc => self.gc,
                Temperature::Unknown => self.fallback,
            },
        }
    }

    /// Quantity to reserve against Locate availability for an approved request.
    pub fn decrement(&self, requested: Decimal, market: Market, temperature: Temperature) -> Decimal {
        requested * self.fraction(market, temperature)
    }
}

/// Market-specific short-sell availability conventions.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct MarketConvention {
    /// JP: settled and for-pledge quantities both count towards short-sell availability.
    pub include_pledge_in_short_sell: bool,
    /// TW: borrowed shares must not be re-lent, so borrowed-provenance positions are excluded.
    pub exclude_borrowed_relending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decrement_policy_defaults() {
        struct TestCase {
            temperature: Temperature,
            requested: Decimal,
            expected: Decimal,
        }

        let policy = DecrementPolicy::default();

        let cases = vec![
            // TC0: hard-to-borrow reserves the full quantity
            TestCase {
                temperature: Temperature::Htb,
                requested: dec!(500),
                expected: dec!(500),
            },
            // TC1: general collateral reserves 20%
            TestCase {
                temperature: Temperature::Gc,
                requested: dec!(500),
                expected: dec!(100.0),
            },
            // TC2: unknown temperature reserves 10%
            TestCase {
                temperature: Temperature::Unknown,
                requested: dec!(500),
                expected: dec!(50.0),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = policy.decrement(test.requested, Market::Us, test.temperature);
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_market_override_takes_precedence() {
        let mut policy = DecrementPolicy::default();
        policy.market_overrides.insert(
            Market::Jp,
            TemperatureFractions {
                htb: Decimal::ONE,
                gc: Decimal::new(5, 1),
                fallback: Decimal::new(25, 2),
            },
        );

        assert_eq!(
            policy.decrement(dec!(100), Market::Jp, Temperature::Gc),
            dec!(50.0)
        );
        assert_eq!(
            policy.decrement(dec!(100), Market::Us, Temperature::Gc),
            dec!(20.0)
        );
    }

    #[test]
    fn test_config_overrides_deserialise_over_defaults() {
        let config: CoreConfig =
            serde_json::from_str(r#"{"workers": 8, "high_watermark": 100}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.high_watermark, 100);
        assert_eq!(config.low_watermark, 2_500);
        assert_eq!(config.bucket_count(), 64);
    }
}

use crate::{Audit, security::SecurityId};
use chrono::NaiveDate;
use derive_more::Constructor;
use fnv::FnvHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Weighted constituent of an [`IndexComposition`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Constituent {
    pub security: SecurityId,
    pub weight: Decimal,
}

/// Effective-dated parent -> constituent linkage for a basket product.
///
/// Basket expansion always selects the composition effective on the business date being
/// processed, never the most recently loaded one.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct IndexComposition {
    pub parent: SecurityId,
    pub constituents: Vec<Constituent>,
    pub effective: NaiveDate,
    pub expiry: Option<NaiveDate>,
    pub audit: Audit,
}

impl IndexComposition {
    /// True if this composition brackets the provided business date.
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.effective <= date && self.expiry.is_none_or(|expiry| date < expiry)
    }
}

/// Collection of [`IndexComposition`]s keyed by parent security.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Compositions {
    by_parent: FnvHashMap<SecurityId, Vec<IndexComposition>>,
}

impl Compositions {
    /// Add or replace the composition for `(parent, effective)`.
    pub fn upsert(&mut self, composition: IndexComposition) {
        let versions = self.by_parent.entry(composition.parent.clone()).or_default();
        match versions
            .iter_mut()
            .find(|existing| existing.effective == composition.effective)
        {
            Some(existing) => *existing = composition,
            None => {
                versions.push(composition);
                versions.sort_by_key(|composition| composition.effective);
            }
        }
    }

    /// Find the composition for `parent` effective on the provided business date.
    ///
    /// When several versions bracket the date, the latest effective wins.
    pub fn composition_on(&self, parent: &SecurityId, date: NaiveDate) -> Option<&IndexComposition> {
        self.by_parent.get(parent).and_then(|versions| {
            versions
                .iter()
                .rev()
                .find(|composition| composition.is_effective_on(date))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn composition(parent: &str, effective: NaiveDate, expiry: Option<NaiveDate>) -> IndexComposition {
        IndexComposition {
            parent: SecurityId::new(parent),
            constituents: vec![
                Constituent::new(SecurityId::new("AAPL"), dec!(0.3)),
                Constituent::new(SecurityId::new("MSFT"), dec!(0.7)),
            ],
            effective,
            expiry,
            audit: Audit::new(chrono::DateTime::<chrono::Utc>::MIN_UTC),
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_composition_on_selects_by_business_date() {
        struct TestCase {
            query: NaiveDate,
            expected_effective: Option<NaiveDate>,
        }

        let mut compositions = Compositions::default();
        compositions.upsert(composition("SPY", date("2024-01-01"), Some(date("2024-06-01"))));
        compositions.upsert(composition("SPY", date("2024-06-01"), None));

        let cases = vec![
            // TC0: before any version is effective
            TestCase {
                query: date("2023-12-31"),
                expected_effective: None,
            },
            // TC1: first version brackets the date
            TestCase {
                query: date("2024-03-15"),
                expected_effective: Some(date("2024-01-01")),
            },
            // TC2: expiry day belongs to the successor version
            TestCase {
                query: date("2024-06-01"),
                expected_effective: Some(date("2024-06-01")),
            },
            // TC3: open-ended version covers far future
            TestCase {
                query: date("2030-01-01"),
                expected_effective: Some(date("2024-06-01")),
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = compositions
                .composition_on(&SecurityId::new("SPY"), test.query)
                .map(|composition| composition.effective);

            assert_eq!(actual, test.expected_effective, "TC{index} failed");
        }
    }

    #[test]
    fn test_upsert_replaces_same_effective_date() {
        let mut compositions = Compositions::default();
        compositions.upsert(composition("SPY", date("2024-01-01"), None));

        let mut replacement = composition("SPY", date("2024-01-01"), None);
        replacement.constituents.truncate(1);
        compositions.upsert(replacement);

        let found = compositions
            .composition_on(&SecurityId::new("SPY"), date("2024-02-01"))
            .unwrap();
        assert_eq!(found.constituents.len(), 1);
    }
}

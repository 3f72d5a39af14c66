use chrono::NaiveDate;
use fnv::FnvHashMap;
use garner_instrument::security::SecurityIndex;
use rust_decimal::Decimal;
use smol_str::SmolStr;

/// External lender availability, keyed by `(security, business date, source)`.
///
/// Feeds overwrite their own previous value - "last value wins by source" - and the total
/// across sources contributes to Short-Sell and Locate calculations.
#[derive(Debug, Default)]
pub struct ExternalAvailability {
    inner: parking_lot::RwLock<FnvHashMap<(SecurityIndex, NaiveDate, SmolStr), Decimal>>,
}

impl ExternalAvailability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest value from a source.
    pub fn record(
        &self,
        security: SecurityIndex,
        business_date: NaiveDate,
        source: SmolStr,
        quantity: Decimal,
    ) {
        self.inner
            .write()
            .insert((security, business_date, source), quantity);
    }

    /// Total external availability across all sources.
    pub fn total(&self, security: SecurityIndex, business_date: NaiveDate) -> Decimal {
        self.inner
            .read()
            .iter()
            .filter(|((sec, date, _), _)| *sec == security && *date == business_date)
            .map(|(_, quantity)| *quantity)
            .sum()
    }
}

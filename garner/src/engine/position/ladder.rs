use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fixed depth of the settlement ladder: offsets 0 (settles today) through 4.
pub const LADDER_DEPTH: usize = 5;

/// Projected receipts and deliveries per offset day from the business date.
///
/// An owned view extracted from a position. Offsets outside `[0, LADDER_DEPTH)` net to zero
/// and have no settlement date; mutations for settlement dates outside the window are
/// silently ignored.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SettlementLadder {
    pub business_date: NaiveDate,
    pub deliver: [Decimal; LADDER_DEPTH],
    pub receipt: [Decimal; LADDER_DEPTH],
}

impl SettlementLadder {
    pub fn empty(business_date: NaiveDate) -> Self {
        Self {
            business_date,
            deliver: [Decimal::ZERO; LADDER_DEPTH],
            receipt: [Decimal::ZERO; LADDER_DEPTH],
        }
    }

    /// Net settlement (receipts minus deliveries) for the provided offset day.
    pub fn net_for_day(&self, offset: usize) -> Decimal {
        if offset >= LADDER_DEPTH {
            return Decimal::ZERO;
        }
        self.receipt[offset] - self.deliver[offset]
    }

    /// Calendar settlement date for the provided offset day.
    pub fn settlement_date_for_day(&self, offset: usize) -> Option<NaiveDate> {
        if offset >= LADDER_DEPTH {
            return None;
        }
        self.business_date.checked_add_days(Days::new(offset as u64))
    }

    pub fn total_deliveries(&self) -> Decimal {
        self.deliver.iter().copied().sum()
    }

    pub fn total_receipts(&self) -> Decimal {
        self.receipt.iter().copied().sum()
    }
}

/// Ladder offset of `settlement_date` relative to `business_date`, if within the window.
pub fn offset_for(business_date: NaiveDate, settlement_date: NaiveDate) -> Option<usize> {
    let offset = settlement_date.signed_duration_since(business_date).num_days();
    (0..LADDER_DEPTH as i64)
        .contains(&offset)
        .then_some(offset as usize)
}

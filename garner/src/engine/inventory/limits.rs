use chrono::NaiveDate;
use garner_instrument::{
    Audit, aggregation::AggregationUnitId, counterparty::CounterpartyId, security::SecurityIndex,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of a sell order being validated against limits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SellSide {
    LongSell,
    ShortSell,
}

/// Key of a client-level trading limit.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct ClientLimitKey {
    pub client: CounterpartyId,
    pub security: SecurityIndex,
    pub business_date: NaiveDate,
}

/// Key of an aggregation-unit-level trading limit.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct AggregationUnitLimitKey {
    pub aggregation_unit: AggregationUnitId,
    pub security: SecurityIndex,
    pub business_date: NaiveDate,
}

/// Daily long/short sell limits and their consumed quantities.
///
/// `0 <= used <= limit` holds for both sides after any completed validation; a successful
/// validation atomically increases the relevant `used` by the order quantity.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct TradingLimit {
    pub long_sell_limit: Decimal,
    pub short_sell_limit: Decimal,
    pub long_sell_used: Decimal,
    pub short_sell_used: Decimal,
    pub audit: Audit,
}

impl TradingLimit {
    pub fn new(long_sell_limit: Decimal, short_sell_limit: Decimal, audit: Audit) -> Self {
        Self {
            long_sell_limit,
            short_sell_limit,
            long_sell_used: Decimal::ZERO,
            short_sell_used: Decimal::ZERO,
            audit,
        }
    }

    pub fn remaining(&self, side: SellSide) -> Decimal {
        match side {
            SellSide::LongSell => self.long_sell_limit - self.long_sell_used,
            SellSide::ShortSell => self.short_sell_limit - self.short_sell_used,
        }
    }

    /// True if `quantity` fits within the remaining limit for the side.
    pub fn accommodates(&self, side: SellSide, quantity: Decimal) -> bool {
        self.remaining(side) >= quantity
    }

    pub fn consume(&mut self, side: SellSide, quantity: Decimal) {
        match side {
            SellSide::LongSell => self.long_sell_used += quantity,
            SellSide::ShortSell => self.short_sell_used += quantity,
        }
    }

    /// Reverse a previous `consume` (rollback path).
    pub fn restore(&mut self, side: SellSide, quantity: Decimal) {
        match side {
            SellSide::LongSell => self.long_sell_used -= quantity,
            SellSide::ShortSell => self.short_sell_used -= quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_boundaries() {
        struct TestCase {
            used: Decimal,
            quantity: Decimal,
            expected: bool,
        }

        let cases = vec![
            // TC0: exact fit approves
            TestCase {
                used: dec!(9500),
                quantity: dec!(500),
                expected: true,
            },
            // TC1: one unit of scale over rejects
            TestCase {
                used: dec!(9500.01),
                quantity: dec!(500),
                expected: false,
            },
            // TC2: zero remaining rejects any quantity
            TestCase {
                used: dec!(10000),
                quantity: dec!(0.01),
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let mut limit = TradingLimit::new(
                dec!(10000),
                dec!(10000),
                Audit::new(DateTime::<Utc>::MIN_UTC),
            );
            limit.short_sell_used = test.used;

            assert_eq!(
                limit.accommodates(SellSide::ShortSell, test.quantity),
                test.expected,
                "TC{index} failed"
            );
        }
    }

    #[test]
    fn test_consume_restore_roundtrip() {
        let mut limit = TradingLimit::new(
            dec!(1000),
            dec!(1000),
            Audit::new(DateTime::<Utc>::MIN_UTC),
        );

        limit.consume(SellSide::ShortSell, dec!(400));
        assert_eq!(limit.short_sell_used, dec!(400));
        assert_eq!(limit.remaining(SellSide::ShortSell), dec!(600));
        assert_eq!(limit.remaining(SellSide::LongSell), dec!(1000));

        limit.restore(SellSide::ShortSell, dec!(400));
        assert_eq!(limit.short_sell_used, dec!(0));
    }
}

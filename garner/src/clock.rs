use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use fnv::{FnvHashMap, FnvHashSet};
use garner_instrument::market::Market;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Defines how Garner components determine the current time and business date.
///
/// Production wiring uses a [`LiveClock`]; tests inject a [`FrozenClock`] so deadline and
/// expiry behaviour is deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current business date for the provided market.
    fn today(&self, market: Market) -> NaiveDate {
        let _ = market;
        self.now().date_naive()
    }
}

/// Live `Clock` using `Utc::now()`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct LiveClock;

impl Clock for LiveClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable `Clock` for tests.
#[derive(Debug, Clone)]
pub struct FrozenClock {
    inner: Arc<parking_lot::RwLock<DateTime<Utc>>>,
}

impl FrozenClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(time)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.inner.write() = time;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut lock = self.inner.write();
        *lock = *lock + duration;
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read()
    }
}

/// Per-market business-day calendar.
///
/// Weekends are non-business days everywhere; additional market holidays are configured per
/// [`Market`]. Settlement offsets remain calendar days - this calendar governs business-date
/// window checks and start-of-day rolls only.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BusinessCalendar {
    holidays: FnvHashMap<Market, FnvHashSet<NaiveDate>>,
}

impl BusinessCalendar {
    pub fn with_holidays<Iter>(mut self, market: Market, holidays: Iter) -> Self
    where
        Iter: IntoIterator<Item = NaiveDate>,
    {
        self.holidays
            .entry(market)
            .or_default()
            .extend(holidays);
        self
    }

    pub fn is_business_day(&self, market: Market, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !self
            .holidays
            .get(&market)
            .is_some_and(|holidays| holidays.contains(&date))
    }

    /// Step the provided date by `days` business days (negative steps backwards).
    pub fn add_business_days(&self, market: Market, date: NaiveDate, days: i64) -> NaiveDate {
        let mut remaining = days.abs();
        let mut current = date;
        while remaining > 0 {
            current = if days >= 0 {
                current.checked_add_days(Days::new(1)).expect("date overflow")
            } else {
                current.checked_sub_days(Days::new(1)).expect("date underflow")
            };
            if self.is_business_day(market, current) {
                remaining -= 1;
            }
        }
        current
    }

    /// Count of business days strictly between `from` and `to` (order-insensitive).
    pub fn business_days_between(&self, market: Market, from: NaiveDate, to: NaiveDate) -> u32 {
        let (start, end) = if from <= to { (from, to) } else { (to, from) };
        let mut count = 0;
        let mut current = start;
        while current < end {
            current = current.checked_add_days(Days::new(1)).expect("date overflow");
            if self.is_business_day(market, current) {
                count += 1;
            }
        }
        count
    }

    /// True if `date` lies within ±`window` business days of `reference`.
    pub fn within_window(
        &self,
        market: Market,
        date: NaiveDate,
        reference: NaiveDate,
        window: u32,
    ) -> bool {
        self.business_days_between(market, date, reference) <= window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_business_day_window() {
        struct TestCase {
            date: NaiveDate,
            reference: NaiveDate,
            window: u32,
            expected: bool,
        }

        // 2024-06-03 is a Monday
        let calendar = BusinessCalendar::default();

        let cases = vec![
            // TC0: same day
            TestCase {
                date: date("2024-06-03"),
                reference: date("2024-06-03"),
                window: 5,
                expected: true,
            },
            // TC1: friday to next monday spans one business day
            TestCase {
                date: date("2024-05-31"),
                reference: date("2024-06-03"),
                window: 1,
                expected: true,
            },
            // TC2: exactly five business days ahead
            TestCase {
                date: date("2024-06-10"),
                reference: date("2024-06-03"),
                window: 5,
                expected: true,
            },
            // TC3: six business days ahead is outside the window
            TestCase {
                date: date("2024-06-11"),
                reference: date("2024-06-03"),
                window: 5,
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual =
                calendar.within_window(Market::Us, test.date, test.reference, test.window);
            assert_eq!(actual, test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_add_business_days_skips_weekends_and_holidays() {
        let calendar = BusinessCalendar::default()
            .with_holidays(Market::Us, [date("2024-06-05")]);

        // Monday + 2 business days skips the Wednesday holiday
        assert_eq!(
            calendar.add_business_days(Market::Us, date("2024-06-03"), 2),
            date("2024-06-06")
        );
        // Monday - 1 business day lands on previous Friday
        assert_eq!(
            calendar.add_business_days(Market::Us, date("2024-06-03"), -1),
            date("2024-05-31")
        );
    }

    #[test]
    fn test_frozen_clock_advances() {
        let clock = FrozenClock::new(date("2024-06-03").and_hms_opt(12, 0, 0).unwrap().and_utc());
        assert_eq!(clock.today(Market::Us), date("2024-06-03"));

        clock.advance(chrono::Duration::days(1));
        assert_eq!(clock.today(Market::Us), date("2024-06-04"));
    }
}

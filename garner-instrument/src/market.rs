use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Trading market a [`Security`](crate::security::Security) is listed on.
///
/// Drives settlement conventions, calculation rule selection, and market-specific availability
/// adjustments.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Us,
    Jp,
    Tw,
    Hk,
    Uk,
    Other,
}

impl Market {
    /// Standard settlement lag in business days (eg/ T+2).
    pub fn settlement_lag(&self) -> u32 {
        // All currently supported markets settle T+2
        2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Us => "us",
            Market::Jp => "jp",
            Market::Tw => "tw",
            Market::Hk => "hk",
            Market::Uk => "uk",
            Market::Other => "other",
        }
    }
}

impl Display for Market {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Unique identifier for a trading book.
///
/// Positions are keyed by `(BookId, SecurityIndex, business date)`.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct BookId(SmolStr);

impl BookId {
    pub fn new<Id>(id: Id) -> Self
    where
        Id: Into<SmolStr>,
    {
        Self(id.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BookId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// Health of a subsystem or of the process as a whole.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum Health {
    Up,
    Degraded,
    Down,
}

/// Subsystems reported on the operational surface.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum Subsystem {
    Ingress,
    PositionEngine,
    InventoryEngine,
    LocateWorkflow,
    ShortSellValidator,
    Publisher,
}

/// Last reported state of a single subsystem.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SubsystemHealth {
    pub health: Health,
    pub last_error: Option<String>,
    pub queue_depth: usize,
    pub updated_at: DateTime<Utc>,
}

/// Registry of per-subsystem health consumed by external CLIs/UIs.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    inner: parking_lot::RwLock<FnvHashMap<Subsystem, SubsystemHealth>>,
}

impl HealthRegistry {
    pub fn report(
        &self,
        subsystem: Subsystem,
        health: Health,
        last_error: Option<String>,
        queue_depth: usize,
        time: DateTime<Utc>,
    ) {
        self.inner.write().insert(
            subsystem,
            SubsystemHealth {
                health,
                last_error,
                queue_depth,
                updated_at: time,
            },
        );
    }

    pub fn subsystem(&self, subsystem: Subsystem) -> Option<SubsystemHealth> {
        self.inner.read().get(&subsystem).cloned()
    }

    /// Worst health across all reporting subsystems; `Up` when nothing has reported.
    pub fn overall(&self) -> Health {
        self.inner
            .read()
            .values()
            .map(|subsystem| subsystem.health)
            .max()
            .unwrap_or(Health::Up)
    }

    pub fn snapshot(&self) -> Vec<(Subsystem, SubsystemHealth)> {
        let mut entries = self
            .inner
            .read()
            .iter()
            .map(|(subsystem, health)| (*subsystem, health.clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(subsystem, _)| *subsystem);
        entries
    }
}

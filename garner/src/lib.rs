#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Garner
//! Garner core is the event-driven position and inventory availability engine for a global
//! prime-brokerage platform.
//! * **Fast**: Indexed per-security state with O(1) lookups, fine-grained per-key locking,
//!   and a warm single-flight cache on the short-sell validation hot path.
//! * **Robust**: Strongly typed. Fixed-scale decimal arithmetic for every quantity. An error
//!   taxonomy that separates validation, conflict, transient, permanent, quarantine and
//!   timeout effects.
//! * **Deterministic**: All events for a security process in producer order, so replaying a
//!   stream from empty state reproduces the incremental end state.
//!
//! ## Overview
//! Events enter through the ingress runtime, which validates, deduplicates, and routes them
//! onto hash-bucketed worker queues keyed by security. Engines mutate their owned state
//! behind per-key locks and publish derived events (`PositionUpdated`, `InventoryUpdated`,
//! `LocateApproved`/`Rejected`, `OrderValidated`) through a durable outbox.
//!
//! At a high level the crate provides:
//! * `PositionEngine` maintaining one position per `(book, security, business date)` with a
//!   fixed-depth settlement ladder and start-of-day rolls.
//! * `InventoryEngine` deriving For-Loan, For-Pledge, Short-Sell, Long-Sell, Locate and
//!   Overborrow availability by evaluating compiled calculation rules.
//! * `LocateWorkflow` driving locate request lifecycles with rule-based auto-approval,
//!   temperature-based decrements and a periodic expiry sweep.
//! * `ShortSellValidator` answering pre-trade limit checks inside a strict deadline.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Keyed TTL cache with single-flight request coalescing.
pub mod cache;

/// `Clock` abstraction and per-market business-day calendar.
pub mod clock;

/// Core configuration with operational defaults.
pub mod config;

/// Position and inventory calculation engines.
pub mod engine;

/// All possible errors in the Garner core, classified by effect.
pub mod error;

/// Ingress and egress event model.
pub mod event;

/// Per-subsystem health reported on the operational surface.
pub mod health;

/// Event ingress: validation, deduplication, bucketed dispatch and retry/dead-letter
/// handling.
pub mod ingress;

/// Locate request lifecycle workflow.
pub mod locate;

/// Fine-grained per-key async locks.
pub mod lock;

/// Provides default Garner Tracing logging initialisers.
pub mod logging;

/// Process-local counters and latency histograms.
pub mod metrics;

/// Durable-until-acknowledged egress outbox and its publisher.
pub mod outbox;

/// Shared reference-data state (securities, compositions, counterparties, units).
pub mod reference;

/// Calculation rule model, compiler and atomically swappable rule-set handle.
pub mod rule;

/// Repository abstraction with optimistic concurrency, plus the in-memory implementation.
pub mod store;

/// Utilities for constructing a fully wired core.
pub mod system;

/// Short-sell / long-sell order validation against client and aggregation unit limits.
pub mod validate;

/// Shared helpers for unit and integration tests.
pub mod test_utils;

/// Monotonically increasing producer offset.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Default,
    Deserialize,
    Serialize,
    Display,
)]
pub struct Sequence(pub u64);

impl Sequence {
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Return the current value and post-increment.
    pub fn fetch_add(&mut self) -> Sequence {
        let current = *self;
        self.0 += 1;
        current
    }
}

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

//! # Garner-Integration
//! Low-level plumbing shared across the Garner inventory ecosystem.
//!
//! ## Core abstractions:
//! - **Tx** trait abstraction over channel kinds: the unbounded implementation carries
//!   ingress work queues and committed offsets, the bounded one feeds egress transmitters
//!   that apply their own backpressure.
//! - **Snapshot** marker wrapper distinguishing full-state values from deltas.
//! - **Terminal** / **Unrecoverable** traits for marking stream ends and fatal errors.

/// Defines a trait [`Tx`](channel::Tx) abstraction over different channel kinds, as well as
/// other channel utilities.
///
/// eg/ `UnboundedTx`, `BoundedTx`, `mpsc_unbounded`, etc.
pub mod channel;

/// Defines the [`Snapshot`](snapshot::Snapshot) value wrapper.
pub mod snapshot;

/// Collection utilities.
///
/// eg/ `OneOrMany`.
pub mod collection;

/// A component that can be terminated, or a stream event that can represent termination.
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

/// An error that could be unrecoverable, requiring intervention rather than retry.
pub trait Unrecoverable {
    fn is_unrecoverable(&self) -> bool;
}

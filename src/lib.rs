//! # workq
//!
//! Work-distribution primitives for processing commands and events:
//!
//! - a lease-based priority queue keyed by discriminator, which keeps items
//!   of one discriminator strictly sequential while different
//!   discriminators proceed in parallel,
//! - a TTL lock store for singleton jobs,
//! - a monotonic consumer progress store,
//! - a notification bus that wakes idle workers.
//!
//! Every store has an in-memory and a Postgres backend. [`backend::Backend`]
//! builds a matching set from a [`config::Config`]; [`worker::Worker`] runs
//! handlers on top of them.

pub mod backend;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod model;
pub mod progress;
pub mod queue;
pub mod telemetry;
pub mod worker;

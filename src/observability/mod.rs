//! Observability for queues and connections.
//!
//! This module provides:
//! - [`Stats`]: read-only snapshot of queue and connection counts
//! - Text, HTML and JSON renderings of a snapshot
//! - An axum router serving them (with the `axum-ui` feature)

mod stats;
pub mod ui;

pub use stats::{active_sign, ConnectionStat, Layout, QueueStat, Stats};

#[cfg(feature = "axum-ui")]
pub use ui::stats_ui;

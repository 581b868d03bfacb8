//! HTTP adapters for the stats page.
//!
//! # Feature Flags
//!
//! - `axum-ui`: Enables the Axum-based endpoints
//!
//! Other frameworks can serve [`Stats::to_html`](crate::Stats::to_html) or
//! the serde form of [`Stats`](crate::Stats) directly.

#[cfg(feature = "axum-ui")]
mod axum;

#[cfg(feature = "axum-ui")]
pub use self::axum::stats_ui;

//! Crash recovery.
//!
//! A [`Cleaner`] sweeps the connection registry, and for every connection
//! whose heartbeat has expired it returns the unacked deliveries of each
//! consumed queue to ready and deregisters the connection. Any number of
//! cleaners may run at once; competing sweeps only ever find less to do.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Outcome of one [`Cleaner::clean`] sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Registered connections looked at
    pub inspected: usize,
    /// Connections with a live heartbeat, left alone
    pub skipped_alive: usize,
    /// Dead connections fully recovered and deregistered
    pub cleaned: usize,
    /// Unacked deliveries moved back to ready
    pub returned_unacked: usize,
    /// Dead connections another actor finished closing first
    pub soft_failures: usize,
}

pub struct Cleaner {
    connection: Arc<Connection>,
}

impl Cleaner {
    /// Cleaner working through `connection`, which is never cleaned itself.
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    /// Run one sweep over all registered connections.
    ///
    /// A failing connection does not stop the sweep. Hard failures are
    /// collected and returned together as [`Error::Cleanup`] once every
    /// connection has been visited; the next sweep retries them.
    pub async fn clean(&self) -> Result<CleanReport> {
        let mut report = CleanReport::default();
        let mut failures = Vec::new();

        for name in self.connection.list_all().await? {
            report.inspected += 1;
            if name == self.connection.name() {
                report.skipped_alive += 1;
                continue;
            }

            let hijacked = self.connection.hijack(&name);
            match hijacked.check().await {
                Ok(true) => {
                    debug!(connection = %name, "connection alive");
                    report.skipped_alive += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(connection = %name, error = %e, "failed to check heartbeat");
                    failures.push(clean_failure(&name, e));
                    continue;
                }
            }

            match Self::clean_connection(&hijacked).await {
                Ok(returned) => {
                    report.returned_unacked += returned;
                    report.cleaned += 1;
                }
                Err(e) if e.is_soft() => {
                    warn!(connection = %name, error = %e, "connection cleaned concurrently");
                    report.soft_failures += 1;
                }
                Err(e) => {
                    error!(connection = %name, error = %e, "failed to clean connection");
                    failures.push(clean_failure(&name, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::Cleanup(failures));
        }
        if report.cleaned > 0 || report.soft_failures > 0 {
            info!(
                inspected = report.inspected,
                cleaned = report.cleaned,
                returned_unacked = report.returned_unacked,
                soft_failures = report.soft_failures,
                "cleanup finished"
            );
        }
        Ok(report)
    }

    /// Recover one dead connection through its hijacked handle and close it.
    /// Returns the number of deliveries returned to ready.
    ///
    /// The connection stays registered if any of its queues could not be
    /// drained, so that a later sweep finds it again.
    pub async fn clean_connection(hijacked: &Connection) -> Result<usize> {
        let returned = hijacked.close_all_queues_in_connection().await?;
        if !hijacked.close().await? {
            return Err(Error::ConnectionAlreadyClosed(hijacked.name().to_string()));
        }
        info!(connection = %hijacked.name(), returned, "cleaned dead connection");
        Ok(returned)
    }

    /// Sweep every `interval` until `shutdown` turns true.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        debug!(connection = %self.connection.name(), "cleaner started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.clean().await {
                error!(error = %e, "cleanup failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.changed() => break,
            }
        }
        debug!(connection = %self.connection.name(), "cleaner stopped");
    }
}

fn clean_failure(connection: &str, source: Error) -> Error {
    Error::ConnectionClean {
        connection: connection.to_string(),
        source: Box::new(source),
    }
}

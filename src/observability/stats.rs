//! Read-only aggregation of queue and connection counts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;

/// One connection's share of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStat {
    pub active: bool,
    #[serde(rename = "unacked")]
    pub unacked_count: usize,
    pub consumers: Vec<String>,
}

impl fmt::Display for ConnectionStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[unacked:{} consumers:{}]",
            self.unacked_count,
            self.consumers.len()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStat {
    #[serde(rename = "ready")]
    pub ready_count: usize,
    #[serde(rename = "rejected")]
    pub rejected_count: usize,
    /// Per consuming connection, keyed by connection name
    #[serde(rename = "connections")]
    pub connection_stats: BTreeMap<String, ConnectionStat>,
}

impl QueueStat {
    pub fn new(ready_count: usize, rejected_count: usize) -> Self {
        Self {
            ready_count,
            rejected_count,
            connection_stats: BTreeMap::new(),
        }
    }

    pub fn unacked_count(&self) -> usize {
        self.connection_stats.values().map(|c| c.unacked_count).sum()
    }

    pub fn consumer_count(&self) -> usize {
        self.connection_stats.values().map(|c| c.consumers.len()).sum()
    }

    pub fn connection_count(&self) -> usize {
        self.connection_stats.len()
    }
}

/// HTML table layout. `Condensed` shows one row per queue only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Full,
    Condensed,
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "full" | "" => Ok(Layout::Full),
            "condensed" => Ok(Layout::Condensed),
            other => Err(format!("unknown layout: {}", other)),
        }
    }
}

/// Snapshot of every queue and connection in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(rename = "queues")]
    pub queue_stats: BTreeMap<String, QueueStat>,
    /// Connections not consuming any queue, with their liveness
    #[serde(rename = "other_connections", default)]
    pub other_connections: BTreeMap<String, bool>,
    pub collected_at: DateTime<Utc>,
}

impl Stats {
    /// Collect counts for `queues`, attributing unacked deliveries and
    /// consumers to every registered connection. Never writes to the store.
    pub async fn collect(connection: &Connection, queues: &[String]) -> Result<Self> {
        let mut stats = Stats {
            collected_at: Utc::now(),
            ..Stats::default()
        };
        for queue_name in queues {
            let queue = connection.queue_handle(queue_name);
            let (ready, rejected) =
                futures::try_join!(queue.ready_count(), queue.rejected_count())?;
            stats
                .queue_stats
                .insert(queue_name.clone(), QueueStat::new(ready, rejected));
        }

        for connection_name in connection.list_all().await? {
            let other = connection.hijack(&connection_name);
            let active = other.check().await?;

            let consuming = other.consuming_queues().await?;
            if consuming.is_empty() {
                stats.other_connections.insert(connection_name, active);
                continue;
            }

            for queue_name in consuming {
                let Some(queue_stat) = stats.queue_stats.get_mut(&queue_name) else {
                    continue;
                };
                let queue = other.queue_handle(&queue_name);
                let (unacked_count, mut consumers) =
                    futures::try_join!(queue.unacked_count(), queue.consumers())?;
                consumers.sort();
                queue_stat.connection_stats.insert(
                    connection_name.clone(),
                    ConnectionStat {
                        active,
                        unacked_count,
                        consumers,
                    },
                );
            }
        }
        Ok(stats)
    }

    /// [`Stats::collect`] over every queue ever opened.
    pub async fn collect_all(connection: &Connection) -> Result<Self> {
        let queues = connection.open_queues().await?;
        if queues.is_empty() {
            warn!(connection = %connection.name(), "no queues opened yet");
        }
        Self::collect(connection, &queues).await
    }

    /// Render as an HTML table, optionally reloading every `refresh` seconds.
    pub fn to_html(&self, layout: Layout, refresh: Option<&str>) -> String {
        let mut html = String::from("<html>");
        if let Some(refresh) = refresh.filter(|r| !r.is_empty()) {
            html.push_str(&format!(
                r#"<head><meta http-equiv="refresh" content="{}"></head>"#,
                escape(refresh)
            ));
        }
        html.push_str(r#"<body><table style="font-family:monospace">"#);
        html.push_str(&row(
            None,
            &[
                "queue",
                "ready",
                "rejected",
                "",
                "connections",
                "unacked",
                "consumers",
            ],
        ));

        for (queue_name, queue_stat) in &self.queue_stats {
            html.push_str(&row(
                None,
                &[
                    &escape(queue_name),
                    &queue_stat.ready_count.to_string(),
                    &queue_stat.rejected_count.to_string(),
                    "",
                    &queue_stat.connection_count().to_string(),
                    &queue_stat.unacked_count().to_string(),
                    &queue_stat.consumer_count().to_string(),
                ],
            ));

            if layout == Layout::Full {
                for (connection_name, stat) in &queue_stat.connection_stats {
                    html.push_str(&row(
                        Some("color:lightgrey"),
                        &[
                            "",
                            "",
                            "",
                            active_sign(stat.active),
                            &escape(connection_name),
                            &stat.unacked_count.to_string(),
                            &stat.consumers.len().to_string(),
                        ],
                    ));
                }
            }
        }

        if layout == Layout::Full {
            html.push_str("<tr><td>-----</td></tr>");
            for (connection_name, active) in &self.other_connections {
                html.push_str(&row(
                    Some("color:lightgrey"),
                    &["", "", "", active_sign(*active), &escape(connection_name), "", ""],
                ));
            }
        }

        html.push_str(&format!(
            r#"</table><p style="font-family:monospace;color:lightgrey">{}</p></body></html>"#,
            self.collected_at.to_rfc3339()
        ));
        html
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (queue_name, queue_stat) in &self.queue_stats {
            writeln!(
                f,
                "    queue:{} ready:{} rejected:{} unacked:{} consumers:{}",
                queue_name,
                queue_stat.ready_count,
                queue_stat.rejected_count,
                queue_stat.unacked_count(),
                queue_stat.consumer_count()
            )?;
            for (connection_name, stat) in &queue_stat.connection_stats {
                writeln!(
                    f,
                    "        connection:{} unacked:{} consumers:{} active:{}",
                    connection_name,
                    stat.unacked_count,
                    stat.consumers.len(),
                    stat.active
                )?;
            }
        }
        for (connection_name, active) in &self.other_connections {
            writeln!(f, "    connection:{} active:{}", connection_name, active)?;
        }
        Ok(())
    }
}

pub fn active_sign(active: bool) -> &'static str {
    if active {
        "✓"
    } else {
        "✗"
    }
}

fn row(style: Option<&str>, cells: &[&str]) -> String {
    let mut out = match style {
        Some(style) => format!(r#"<tr style="{}">"#, style),
        None => String::from("<tr>"),
    };
    for cell in cells {
        out.push_str("<td>");
        out.push_str(cell);
        out.push_str("</td><td></td>");
    }
    out.push_str("</tr>");
    out
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

//! Key layout in the shared store.
//!
//! The names are an integration contract with every other process using the
//! same queues, so they must not change.

pub const CONNECTIONS: &str = "rmq::connections";
pub const QUEUES: &str = "rmq::queues";

const CONNECTION_PREFIX: &str = "rmq::connection::";
const QUEUE_PREFIX: &str = "rmq::queue::";

/// Expiring liveness marker of a connection.
pub fn heartbeat(connection: &str) -> String {
    format!("{}{}::heartbeat", CONNECTION_PREFIX, connection)
}

/// Set of queues a connection is consuming.
pub fn connection_queues(connection: &str) -> String {
    format!("{}{}::queues", CONNECTION_PREFIX, connection)
}

/// Set of consumer names a connection runs on a queue.
pub fn consumers(connection: &str, queue: &str) -> String {
    format!("{}{}::queue::[{}]::consumers", CONNECTION_PREFIX, connection, queue)
}

/// In-flight deliveries a connection holds for a queue.
pub fn unacked(connection: &str, queue: &str) -> String {
    format!("{}{}::queue::[{}]::unacked", CONNECTION_PREFIX, connection, queue)
}

pub fn ready(queue: &str) -> String {
    format!("{}[{}]::ready", QUEUE_PREFIX, queue)
}

pub fn rejected(queue: &str) -> String {
    format!("{}[{}]::rejected", QUEUE_PREFIX, queue)
}

/// Names end up inside `[...]` and `::`-separated keys.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("::")
        && !name.contains(['[', ']'])
        && !name.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(heartbeat("c-1"), "rmq::connection::c-1::heartbeat");
        assert_eq!(connection_queues("c-1"), "rmq::connection::c-1::queues");
        assert_eq!(
            consumers("c-1", "emails"),
            "rmq::connection::c-1::queue::[emails]::consumers"
        );
        assert_eq!(
            unacked("c-1", "emails"),
            "rmq::connection::c-1::queue::[emails]::unacked"
        );
        assert_eq!(ready("emails"), "rmq::queue::[emails]::ready");
        assert_eq!(rejected("emails"), "rmq::queue::[emails]::rejected");
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("emails"));
        assert!(is_valid_name("worker-a1b2c3"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a::b"));
        assert!(!is_valid_name("a[0]"));
        assert!(!is_valid_name("two words"));
    }
}

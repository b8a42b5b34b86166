//! Exchange and queue declarations shared by consumers and publishers.
//!
//! Every declaration here is idempotent, so it is replayed in full on each
//! new connection.

use super::transport::{FieldTable, FieldValue};

/// Default primary exchange.
pub const DEFAULT_EXCHANGE: &str = "datacloud.v2";
/// Default dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE: &str = "datacloud.dlx";
/// Default consumer queue.
pub const DEFAULT_QUEUE: &str = "datacloud-csv-split";

/// Routing key announcing a freshly unpacked TSV file.
pub const TSV_CREATED: &str = "tsv.created";
/// Routing key announcing a cleaned CSV file.
pub const CSV_CREATED: &str = "csv.created";
/// Routing key announcing one partition of a split CSV file.
pub const CSV_PARTITION_CREATED: &str = "csv.partition.created";

/// Exchange type argument key for the delayed-message plugin.
pub const ARG_DELAYED_TYPE: &str = "x-delayed-type";
/// Queue type argument key.
pub const ARG_QUEUE_TYPE: &str = "x-queue-type";
/// Dead-letter exchange argument key.
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Per-message delay header understood by delayed exchanges (milliseconds).
pub const HEADER_DELAY: &str = "x-delay";

/// Exchange routing kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
    /// `x-delayed-message` exchange routing as a topic exchange.
    DelayedTopic,
}

impl ExchangeKind {
    /// Broker-side type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::DelayedTopic => "x-delayed-message",
        }
    }

    /// Routing behaviour once any delay has elapsed.
    pub fn routes_as_topic(&self) -> bool {
        matches!(self, ExchangeKind::Topic | ExchangeKind::DelayedTopic)
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange, delayed-delivery capable when `delayed` is set.
    pub fn primary(name: impl Into<String>, delayed: bool) -> Self {
        Self {
            name: name.into(),
            kind: if delayed {
                ExchangeKind::DelayedTopic
            } else {
                ExchangeKind::Topic
            },
            durable: true,
            auto_delete: false,
        }
    }

    /// Durable fanout exchange receiving rejected messages regardless of routing key.
    pub fn dead_letter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
            auto_delete: false,
        }
    }

    /// Declaration arguments.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::new();
        if self.kind == ExchangeKind::DelayedTopic {
            args.insert(ARG_DELAYED_TYPE.to_string(), FieldValue::from("topic"));
        }
        args
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub quorum: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Durable quorum queue dead-lettering into `dead_letter_exchange`.
    pub fn quorum(name: impl Into<String>, dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            quorum: true,
            dead_letter_exchange: Some(dead_letter_exchange.into()),
        }
    }

    /// Plain durable queue, used for observing dead letters.
    pub fn classic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            quorum: false,
            dead_letter_exchange: None,
        }
    }

    /// Declaration arguments.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::new();
        if self.quorum {
            args.insert(ARG_QUEUE_TYPE.to_string(), FieldValue::from("quorum"));
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(ARG_DEAD_LETTER_EXCHANGE.to_string(), FieldValue::from(dlx.as_str()));
        }
        args
    }
}

/// Everything a consumer declares on each connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: ExchangeSpec,
    pub dead_letter: ExchangeSpec,
    pub queue: QueueSpec,
    pub routing_key: String,
}

impl Topology {
    pub fn new(
        exchange: ExchangeSpec,
        queue: impl Into<String>,
        dead_letter_exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        let dead_letter_exchange = dead_letter_exchange.into();
        Self {
            exchange,
            dead_letter: ExchangeSpec::dead_letter(dead_letter_exchange.clone()),
            queue: QueueSpec::quorum(queue, dead_letter_exchange),
            routing_key: routing_key.into(),
        }
    }
}

/// Topic pattern match: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_exchange_delayed() {
        let exchange = ExchangeSpec::primary("pipeline", true);
        assert_eq!(exchange.kind.as_str(), "x-delayed-message");
        assert!(exchange.durable);
        assert!(!exchange.auto_delete);
        assert_eq!(
            exchange.arguments().get(ARG_DELAYED_TYPE),
            Some(&FieldValue::from("topic"))
        );
    }

    #[test]
    fn test_primary_exchange_plain_topic() {
        let exchange = ExchangeSpec::primary("pipeline", false);
        assert_eq!(exchange.kind, ExchangeKind::Topic);
        assert!(exchange.arguments().is_empty());
    }

    #[test]
    fn test_dead_letter_exchange_is_fanout() {
        let dlx = ExchangeSpec::dead_letter(DEAD_LETTER_EXCHANGE);
        assert_eq!(dlx.kind, ExchangeKind::Fanout);
        assert!(dlx.durable);
    }

    #[test]
    fn test_quorum_queue_arguments() {
        let queue = QueueSpec::quorum(DEFAULT_QUEUE, DEAD_LETTER_EXCHANGE);
        let args = queue.arguments();
        assert_eq!(args.get(ARG_QUEUE_TYPE), Some(&FieldValue::from("quorum")));
        assert_eq!(
            args.get(ARG_DEAD_LETTER_EXCHANGE),
            Some(&FieldValue::from(DEAD_LETTER_EXCHANGE))
        );
    }

    #[test]
    fn test_topology_wires_dead_letter_exchange() {
        let topology = Topology::new(
            ExchangeSpec::primary("pipeline", true),
            "split",
            "pipeline.dlx",
            CSV_PARTITION_CREATED,
        );
        assert_eq!(topology.dead_letter.name, "pipeline.dlx");
        assert_eq!(
            topology.queue.dead_letter_exchange.as_deref(),
            Some("pipeline.dlx")
        );
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("csv.created", "csv.created"));
        assert!(!topic_matches("csv.created", "tsv.created"));
        assert!(topic_matches("csv.*", "csv.created"));
        assert!(!topic_matches("csv.*", "csv.partition.created"));
        assert!(topic_matches("csv.#", "csv.partition.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.created", "csv.partition.created"));
    }
}

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// One later occurrence of a (tag, status) pair that was already recorded.
#[derive(Debug, Clone, Serialize)]
pub struct RewriteEntry {
    pub external_time: Option<DateTime<Utc>>,
    pub correlation_time: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
    pub value: String,
}

/// First occurrence of a (tag, status) pair plus the history of repeats.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub external_time: Option<DateTime<Utc>>,
    pub correlation_time: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
    pub value: String,
    pub rewrites: Vec<RewriteEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Rewritten,
}

/// Per-call append-only history of (tag, status) occurrences. "Has this
/// status occurred" is a presence check, never a latest-value check.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct StatusLedger {
    tags: HashMap<String, HashMap<String, StatusRecord>>,
}

impl StatusLedger {
    pub fn record(
        &mut self,
        tag: &str,
        status: &str,
        external_time: Option<DateTime<Utc>>,
        correlation_time: Option<DateTime<Utc>>,
        value: &str,
    ) -> RecordOutcome {
        let statuses = self.tags.entry(tag.to_string()).or_default();
        match statuses.get_mut(status) {
            None => {
                statuses.insert(
                    status.to_string(),
                    StatusRecord {
                        external_time,
                        correlation_time,
                        recorded_at: Utc::now(),
                        value: value.to_string(),
                        rewrites: Vec::new(),
                    },
                );
                RecordOutcome::Inserted
            }
            Some(record) => {
                record.rewrites.push(RewriteEntry {
                    external_time,
                    correlation_time,
                    recorded_at: Utc::now(),
                    value: value.to_string(),
                });
                RecordOutcome::Rewritten
            }
        }
    }

    pub fn has(&self, tag: &str, status: &str) -> bool {
        self.tags
            .get(tag)
            .map(|statuses| statuses.contains_key(status))
            .unwrap_or(false)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains_key(tag)
    }

    /// When the first record for (tag, status) was written; used for
    /// grace-period reaping.
    pub fn first_time(&self, tag: &str, status: &str) -> Option<DateTime<Utc>> {
        self.tags
            .get(tag)
            .and_then(|statuses| statuses.get(status))
            .map(|record| record.recorded_at)
    }

    /// Value of the first occurrence of (tag, status).
    pub fn first_value(&self, tag: &str, status: &str) -> Option<&str> {
        self.tags
            .get(tag)
            .and_then(|statuses| statuses.get(status))
            .map(|record| record.value.as_str())
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &str, &StatusRecord)> {
        self.tags.iter().flat_map(|(tag, statuses)| {
            statuses
                .iter()
                .map(move |(status, record)| (tag.as_str(), status.as_str(), record))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn first_record_inserts_then_appends_rewrites() {
        let mut ledger = StatusLedger::default();

        let outcome = ledger.record("oper", "ChannelStateChange#Up", None, None, "first");
        assert_eq!(outcome, RecordOutcome::Inserted);

        let outcome = ledger.record("oper", "ChannelStateChange#Up", None, None, "second");
        assert_eq!(outcome, RecordOutcome::Rewritten);

        let record = ledger
            .records()
            .find(|(tag, status, _)| *tag == "oper" && *status == "ChannelStateChange#Up")
            .map(|(_, _, record)| record)
            .unwrap();
        assert_eq!(record.value, "first");
        assert_eq!(record.rewrites.len(), 1);
        assert_eq!(record.rewrites[0].value, "second");
    }

    #[test]
    fn presence_checks() {
        let mut ledger = StatusLedger::default();
        assert!(!ledger.has("room", "ready"));
        assert!(!ledger.has_tag("room"));

        ledger.record("room", "ready", None, None, "");
        assert!(ledger.has("room", "ready"));
        assert!(ledger.has_tag("room"));
        assert!(!ledger.has("room", "stop"));
    }

    #[test]
    fn first_time_is_stable_across_rewrites() {
        let mut ledger = StatusLedger::default();
        ledger.record("room", "stop", None, None, "");
        let first = ledger.first_time("room", "stop").unwrap();

        ledger.record("room", "stop", None, None, "again");
        assert_eq!(ledger.first_time("room", "stop"), Some(first));
        assert!(Utc::now() - first < Duration::seconds(5));
    }

    #[test]
    fn first_value_ignores_rewrites() {
        let mut ledger = StatusLedger::default();
        ledger.record("clip", "PlaybackFinished", None, None, "done");
        ledger.record("clip", "PlaybackFinished", None, None, "failed");
        assert_eq!(ledger.first_value("clip", "PlaybackFinished"), Some("done"));
    }
}

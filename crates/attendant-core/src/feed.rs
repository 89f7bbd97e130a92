//! Live arrival feed: push-event decoding and deduplication.

use crate::types::{ArrivalKey, ArrivalRecord};
use serde::Deserialize;
use std::collections::HashSet;

/// Tagged event from the session push channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    AttendanceUpdate {
        /// Authoritative number of students present.
        count: u64,
        #[serde(default)]
        students: Vec<ArrivalRecord>,
    },
    #[serde(other)]
    Other,
}

impl PushEvent {
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// Incremental decoder for a `text/event-stream` body.
///
/// Only `data:` fields matter here; multi-line data is joined with `\n` and
/// an event is dispatched on the blank line that terminates it.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body; returns the data of every completed event.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }
        events
    }
}

/// What one update batch produced after deduplication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedUpdate {
    /// Arrivals not seen before, in receipt order.
    pub arrivals: Vec<ArrivalRecord>,
    pub present_count: u64,
}

/// Remembers every arrival key seen during one subscription.
#[derive(Debug, Default)]
pub struct ArrivalDeduper {
    seen: HashSet<ArrivalKey>,
    present_count: u64,
}

impl ArrivalDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter a batch down to unseen arrivals and fold in the server count.
    ///
    /// The present count follows the server, never the local set size, and
    /// never decreases.
    pub fn ingest(&mut self, count: u64, students: Vec<ArrivalRecord>) -> FeedUpdate {
        let arrivals: Vec<ArrivalRecord> = students
            .into_iter()
            .filter(|rec| self.seen.insert(rec.key()))
            .collect();
        self.present_count = self.present_count.max(count);
        FeedUpdate {
            arrivals,
            present_count: self.present_count,
        }
    }

    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.present_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, time: &str) -> ArrivalRecord {
        ArrivalRecord {
            student_id: id.into(),
            name: format!("Student {id}"),
            time: time.into(),
            similarity_score: Some(0.9),
            distance_meters: None,
            is_late: false,
        }
    }

    #[test]
    fn test_parse_attendance_update() {
        let payload = r#"{"type":"attendance_update","count":2,"students":[
            {"name":"A","usn":"s1","time":"09:01","similarity":0.91},
            {"name":"B","usn":"s2","time":"09:02","similarity":0.55}]}"#;
        match PushEvent::parse(payload).unwrap() {
            PushEvent::AttendanceUpdate { count, students } => {
                assert_eq!(count, 2);
                assert_eq!(students.len(), 2);
                assert_eq!(students[1].student_id, "s2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_other_tags_ignored() {
        assert_eq!(PushEvent::parse(r#"{"type":"heartbeat"}"#).unwrap(), PushEvent::Other);
        assert!(PushEvent::parse("not json").is_err());
    }

    #[test]
    fn test_sse_decoder_split_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push("data: {\"a\"").is_empty());
        assert!(d.push(":1}\n").is_empty());
        assert_eq!(d.push("\n"), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn test_sse_decoder_multiline_comments_and_crlf() {
        let mut d = SseDecoder::new();
        let events = d.push(": keepalive\r\nevent: x\r\ndata: one\r\ndata:two\r\n\r\ndata: three\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string(), "three".to_string()]);
    }

    #[test]
    fn test_duplicate_record_emitted_once() {
        let mut d = ArrivalDeduper::new();
        let first = d.ingest(1, vec![rec("s1", "t1")]);
        let second = d.ingest(1, vec![rec("s1", "t1")]);
        assert_eq!(first.arrivals.len(), 1);
        assert!(second.arrivals.is_empty());
    }

    #[test]
    fn test_cumulative_batches_forward_only_new() {
        // The server resends the whole list on every update.
        let mut d = ArrivalDeduper::new();
        d.ingest(2, vec![rec("s1", "t1"), rec("s2", "t2")]);
        let update = d.ingest(3, vec![rec("s1", "t1"), rec("s2", "t2"), rec("s3", "t3")]);
        assert_eq!(update.arrivals, vec![rec("s3", "t3")]);
        assert_eq!(update.present_count, 3);
    }

    #[test]
    fn test_receipt_order_preserved() {
        let mut d = ArrivalDeduper::new();
        let update = d.ingest(3, vec![rec("s9", "09:30"), rec("s1", "09:05"), rec("s5", "09:10")]);
        let ids: Vec<&str> = update.arrivals.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["s9", "s1", "s5"]);
    }

    #[test]
    fn test_same_student_different_time_is_new() {
        let mut d = ArrivalDeduper::new();
        let update = d.ingest(2, vec![rec("s1", "t1"), rec("s1", "t2")]);
        assert_eq!(update.arrivals.len(), 2);
    }

    #[test]
    fn test_present_count_follows_server_and_never_decreases() {
        let mut d = ArrivalDeduper::new();
        assert_eq!(d.ingest(5, vec![rec("s1", "t1")]).present_count, 5);
        assert_eq!(d.ingest(3, vec![]).present_count, 5);
        assert_eq!(d.seen(), 1);
    }

    #[test]
    fn test_clear_forgets_keys() {
        let mut d = ArrivalDeduper::new();
        d.ingest(1, vec![rec("s1", "t1")]);
        d.clear();
        assert_eq!(d.ingest(1, vec![rec("s1", "t1")]).arrivals.len(), 1);
    }
}

//! # Change-Data-Capture Stream
//!
//! The CDC stream gives external consumers an ordered, resumable, filterable
//! view of a tenant's event log. Ordering is `timestamp ASC` with ties broken
//! by event id; the cursor (an event id) is interpreted as *strictly after*.
//!
//! ## Catch-Up Then Close
//!
//! A stream drains the buffered events that match its filters, emits one
//! heartbeat marker, and ends. Consumers resume by reconnecting with the id
//! of the last event they saw. There is no push phase; reconnect-with-cursor
//! is the delivery loop.
//!
//! ```text
//! consumer ──since=evt_42──► [evt_43] [evt_44] [evt_45] [heartbeat] ∎
//!          ──since=evt_45──► [evt_46] ...
//! ```

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::{json, Value};

use crate::types::EventRecord;

/// Cap on how many events one stream drains per connection.
pub const CDC_BATCH_LIMIT: u64 = 1_000;

// =============================================================================
// Query
// =============================================================================

/// Parameters for opening a CDC stream.
#[derive(Debug, Clone, Default)]
pub struct CdcQuery {
    /// Cursor: the id of the last event already consumed.
    pub since: Option<String>,
    /// Entity-type filter (empty = all).
    pub types: Vec<String>,
    /// Verb filter (empty = all).
    pub verbs: Vec<String>,
}

impl CdcQuery {
    /// Parses a CSV query parameter (`"Contact,Deal"`) into a filter list.
    pub fn parse_csv(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// =============================================================================
// Stream Items
// =============================================================================

/// One frame of the CDC transport.
#[derive(Debug, Clone)]
pub enum CdcItem {
    Event(EventRecord),
    /// Emitted once after the buffered events; tells the consumer it is
    /// caught up and may reconnect later with its last cursor.
    Heartbeat,
}

impl CdcItem {
    /// Wire form: the event JSON, or `{"heartbeat": true}`.
    pub fn to_json(&self) -> Value {
        match self {
            CdcItem::Event(event) => event.to_json(),
            CdcItem::Heartbeat => json!({ "heartbeat": true }),
        }
    }
}

// =============================================================================
// CdcStream
// =============================================================================

/// A drained batch of events as a `futures::Stream`.
///
/// Yields every buffered event in order, then exactly one
/// [`CdcItem::Heartbeat`], then ends.
pub struct CdcStream {
    buffered: VecDeque<EventRecord>,
    heartbeat_sent: bool,
}

impl CdcStream {
    /// Wraps an ordered batch (the storage layer already applied cursor and
    /// filters).
    pub fn new(events: Vec<EventRecord>) -> Self {
        Self { buffered: events.into(), heartbeat_sent: false }
    }

    /// The cursor to resume from after this stream ends: the last buffered
    /// event's id.
    pub fn resume_cursor(&self) -> Option<&str> {
        self.buffered.back().map(|e| e.id.as_str())
    }

    /// Number of events this stream will yield.
    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

impl Stream for CdcStream {
    type Item = CdcItem;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(event) = this.buffered.pop_front() {
            return Poll::Ready(Some(CdcItem::Event(event)));
        }
        if !this.heartbeat_sent {
            this.heartbeat_sent = true;
            return Poll::Ready(Some(CdcItem::Heartbeat));
        }
        Poll::Ready(None)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conjugate::conjugate;
    use crate::types::{from_millis, Sequence};
    use futures::StreamExt;

    fn event(n: u64) -> EventRecord {
        EventRecord {
            id: format!("evt_{:012}", n),
            event_type: "Contact.create".to_string(),
            entity_type: "Contact".to_string(),
            entity_id: format!("contact_{:010}", n),
            verb: "create".to_string(),
            conjugation: conjugate("create"),
            data: None,
            before: None,
            after: None,
            sequence: Sequence::FIRST,
            timestamp: from_millis(1_700_000_000_000 + n as i64),
        }
    }

    #[tokio::test]
    async fn test_events_then_heartbeat_then_end() {
        let mut stream = CdcStream::new(vec![event(1), event(2)]);
        assert!(matches!(stream.next().await, Some(CdcItem::Event(e)) if e.id.ends_with("1")));
        assert!(matches!(stream.next().await, Some(CdcItem::Event(e)) if e.id.ends_with("2")));
        assert!(matches!(stream.next().await, Some(CdcItem::Heartbeat)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_still_heartbeats() {
        let mut stream = CdcStream::new(Vec::new());
        assert!(stream.is_empty());
        assert!(matches!(stream.next().await, Some(CdcItem::Heartbeat)));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_resume_cursor_is_last_event() {
        let stream = CdcStream::new(vec![event(1), event(2), event(3)]);
        assert_eq!(stream.resume_cursor(), Some("evt_000000000003"));
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn test_parse_csv() {
        assert_eq!(CdcQuery::parse_csv("Contact,Deal"), vec!["Contact", "Deal"]);
        assert_eq!(CdcQuery::parse_csv(" Contact , "), vec!["Contact"]);
        assert!(CdcQuery::parse_csv("").is_empty());
    }

    #[test]
    fn test_heartbeat_wire_form() {
        assert_eq!(CdcItem::Heartbeat.to_json(), serde_json::json!({"heartbeat": true}));
        let wire = CdcItem::Event(event(9)).to_json();
        assert_eq!(wire["type"], serde_json::json!("Contact.create"));
    }
}

use std::cmp::Ordering;

/// Kind of a captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A request sent by the client. The body is replayed.
    QueryStart,
    /// The server's response. Dropped on replay; the target produces its own.
    QueryResponse,
    /// The session closed.
    End,
}

impl EventKind {
    /// Parses the state word of a capture stanza header. Capture files written
    /// by the MySQL logger use `Quit` for session end.
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "QueryStart" => Some(EventKind::QueryStart),
            "QueryResponse" => Some(EventKind::QueryResponse),
            "Quit" | "End" => Some(EventKind::End),
            _ => None,
        }
    }

    pub fn is_end(self) -> bool {
        self == EventKind::End
    }
}

/// One captured client↔server interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Capture timestamp in seconds.
    pub time: f64,
    /// Connection identifier, e.g. `10.0.0.1:5432` or `host:port:thread`.
    pub session_id: String,
    /// Where the event was captured, when the logger recorded it.
    pub source: String,
    pub kind: EventKind,
    pub body: String,
}

impl Event {
    /// Replay order: ascending by time, with `End` sorting after any other
    /// kind at the same instant so a session never closes before its last
    /// query is seen.
    pub fn replay_cmp(&self, other: &Event) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.kind.is_end().cmp(&other.kind.is_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(time: f64, kind: EventKind) -> Event {
        Event {
            time,
            session_id: "10.0.0.1:5432".to_string(),
            source: String::new(),
            kind,
            body: String::new(),
        }
    }

    #[test]
    fn orders_by_time() {
        let a = event(1.0, EventKind::QueryStart);
        let b = event(2.0, EventKind::QueryStart);
        assert_eq!(a.replay_cmp(&b), Ordering::Less);
        assert_eq!(b.replay_cmp(&a), Ordering::Greater);
    }

    #[test]
    fn end_sorts_last_at_equal_times() {
        let query = event(1.0, EventKind::QueryStart);
        let end = event(1.0, EventKind::End);
        assert_eq!(end.replay_cmp(&query), Ordering::Greater);
        assert_eq!(query.replay_cmp(&end), Ordering::Less);
        assert_eq!(end.replay_cmp(&end.clone()), Ordering::Equal);
    }

    #[test]
    fn parses_state_words() {
        assert_eq!(EventKind::parse("QueryStart"), Some(EventKind::QueryStart));
        assert_eq!(EventKind::parse("Quit"), Some(EventKind::End));
        assert_eq!(EventKind::parse("End"), Some(EventKind::End));
        assert_eq!(EventKind::parse("Banana"), None);
    }
}

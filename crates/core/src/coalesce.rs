//! Groups an interleaved, time-ordered event stream into self-contained jobs.
//!
//! Sessions are keyed by connection id. A session closes when its `End` event
//! arrives, when it has been quiet for `shelf_life` seconds, or when it has
//! been open for `max_life` seconds (capture streams routinely lose `End`
//! markers, and without the timeouts memory would grow without bound). Jobs
//! are always emitted in order of session start time, so the index produced
//! from them can be streamed without seeking; a session missing its end stalls
//! emission until it ages out.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use crate::event::{Event, EventKind};
use crate::job::{Job, Task};

pub const DEFAULT_SHELF_LIFE: f64 = 300.0;
pub const DEFAULT_MAX_LIFE: f64 = 900.0;

#[derive(Debug, Clone, Copy)]
pub struct CoalesceConfig {
    /// Seconds of quiescence after which an open session is force-closed.
    pub shelf_life: f64,
    /// Seconds after which an open session is force-closed regardless of
    /// activity.
    pub max_life: f64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            shelf_life: DEFAULT_SHELF_LIFE,
            max_life: DEFAULT_MAX_LIFE,
        }
    }
}

/// A job ready to be written, tagged with the rebased session start time the
/// index entry should carry.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedJob {
    pub start_time: f64,
    pub job: Job,
}

#[derive(Debug)]
struct Session {
    id: String,
    first_time: f64,
    shelf_deadline: f64,
    max_deadline: f64,
    ended: bool,
    queries: Vec<(f64, String)>,
}

impl Session {
    fn new(cfg: &CoalesceConfig, first: &Event) -> Self {
        let mut session = Self {
            id: first.session_id.clone(),
            first_time: first.time,
            shelf_deadline: first.time + cfg.shelf_life,
            max_deadline: first.time + cfg.max_life,
            ended: false,
            queries: Vec::new(),
        };
        session.add(cfg, first);
        session
    }

    fn add(&mut self, cfg: &CoalesceConfig, event: &Event) {
        self.shelf_deadline = event.time + cfg.shelf_life;
        match event.kind {
            EventKind::QueryStart => self.queries.push((event.time, event.body.clone())),
            EventKind::End => self.ended = true,
            // Replay drives requests only; the target produces its own
            // responses.
            EventKind::QueryResponse => {}
        }
    }
}

struct PendKey {
    first_time: f64,
    seq: u64,
}

impl PartialEq for PendKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendKey {}

impl PartialOrd for PendKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.first_time
            .total_cmp(&other.first_time)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Counters reported when the coalescer finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceSummary {
    pub events: u64,
    pub sessions: u64,
    pub aged_out: u64,
}

pub struct Coalescer {
    cfg: CoalesceConfig,
    /// Capture origin: the time of the first event seen. Task times and index
    /// start times are rebased against it so replay always starts near zero,
    /// even for captures stamped with epoch seconds.
    origin: Option<f64>,
    now: f64,
    open: HashMap<String, u64>,
    sessions: HashMap<u64, Session>,
    pending: BinaryHeap<Reverse<PendKey>>,
    next_seq: u64,
    summary: CoalesceSummary,
}

impl Coalescer {
    pub fn new(cfg: CoalesceConfig) -> Self {
        Self {
            cfg,
            origin: None,
            now: 0.0,
            open: HashMap::new(),
            sessions: HashMap::new(),
            pending: BinaryHeap::new(),
            next_seq: 0,
            summary: CoalesceSummary::default(),
        }
    }

    /// Feeds one event, returning any jobs whose sessions are now complete.
    /// Jobs come out ordered by session start time.
    pub fn push(&mut self, event: Event) -> Vec<CoalescedJob> {
        self.summary.events += 1;
        if self.summary.events % 10_000 == 0 {
            tracing::debug!(
                events = self.summary.events,
                open = self.open.len(),
                waiting = self.pending.len(),
                "coalescing"
            );
        }

        if self.origin.is_none() {
            self.origin = Some(event.time);
        }
        self.now = event.time;

        let seq = match self.open.get(&event.session_id).copied() {
            Some(seq) if !self.age_out(seq) => {
                let session = self
                    .sessions
                    .get_mut(&seq)
                    .expect("open session must be pending");
                session.add(&self.cfg, &event);
                seq
            }
            // Either a brand-new id, or its previous session just aged out.
            _ => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.summary.sessions += 1;
                let session = Session::new(&self.cfg, &event);
                self.pending.push(Reverse(PendKey {
                    first_time: session.first_time,
                    seq,
                }));
                self.sessions.insert(seq, session);
                self.open.insert(event.session_id.clone(), seq);
                seq
            }
        };

        if event.kind == EventKind::End {
            // Closed sessions leave the open map but stay pending until every
            // earlier session has been emitted.
            self.open.remove(&event.session_id);
            debug_assert!(self.sessions[&seq].ended);
        }

        self.flush_ready()
    }

    /// Force-closes the session if it is stale or too old. Returns whether it
    /// was closed.
    fn age_out(&mut self, seq: u64) -> bool {
        let Some(session) = self.sessions.get_mut(&seq) else {
            return false;
        };
        if session.ended {
            return false;
        }
        let stale = self.now >= session.shelf_deadline;
        let maxed = self.now >= session.max_deadline;
        if !stale && !maxed {
            return false;
        }
        tracing::debug!(
            id = %session.id,
            reason = if stale { "stale" } else { "maxed out" },
            "expiring session without an end marker"
        );
        session.ended = true;
        let id = session.id.clone();
        // The id may already map to a newer session; only drop our own entry.
        if self.open.get(&id) == Some(&seq) {
            self.open.remove(&id);
        }
        self.summary.aged_out += 1;
        true
    }

    /// Emits every leading pending session that has ended. A stuck head (no
    /// end marker yet) is given one aging attempt; if it is still open,
    /// emission stalls to preserve start-time order.
    fn flush_ready(&mut self) -> Vec<CoalescedJob> {
        let mut out = Vec::new();
        while let Some(Reverse(top)) = self.pending.peek() {
            let seq = top.seq;
            let ended = self
                .sessions
                .get(&seq)
                .map(|s| s.ended)
                .unwrap_or_default();
            if !ended && !self.age_out(seq) {
                break;
            }
            self.pending.pop();
            let session = self
                .sessions
                .remove(&seq)
                .expect("pending session must exist");
            if let Some(job) = self.build(seq, session) {
                out.push(job);
            }
        }
        out
    }

    /// Ends every remaining session and flushes the lot, in order.
    pub fn finish(mut self) -> (Vec<CoalescedJob>, CoalesceSummary) {
        for seq in self.open.drain().map(|(_, seq)| seq).collect::<Vec<_>>() {
            if let Some(session) = self.sessions.get_mut(&seq) {
                session.ended = true;
            }
        }

        let mut out = Vec::new();
        while let Some(Reverse(top)) = self.pending.pop() {
            let session = self
                .sessions
                .remove(&top.seq)
                .expect("pending session must exist");
            if let Some(job) = self.build(top.seq, session) {
                out.push(job);
            }
        }

        tracing::info!(
            events = self.summary.events,
            sessions = self.summary.sessions,
            aged_out = self.summary.aged_out,
            "coalesce complete"
        );
        (out, self.summary)
    }

    /// Sessions with no queries (a lone `End`, or responses only) have
    /// nothing to replay and are dropped.
    fn build(&self, seq: u64, session: Session) -> Option<CoalescedJob> {
        if session.queries.is_empty() {
            return None;
        }
        let origin = self.origin.unwrap_or(session.first_time);
        let tasks = session
            .queries
            .into_iter()
            .map(|(at, body)| Task {
                at: at - origin,
                request: body.into_bytes(),
            })
            .collect();
        Some(CoalescedJob {
            start_time: session.first_time - origin,
            job: Job {
                // Connection ids repeat once a connection closes; the session
                // sequence number keeps job ids unique within the capture.
                id: format!("{}#{}", session.id, seq),
                tasks,
            },
        })
    }
}

//! K-way merge of sorted event streams.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::event::Event;

struct Head {
    event: Event,
    source: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties resolve in input order, so duplicates across sources come out
        // in the order the sources were given.
        self.event
            .replay_cmp(&other.event)
            .then(self.source.cmp(&other.source))
    }
}

/// Merges any number of event streams, each already sorted in replay order,
/// into one globally ordered stream. Source errors are passed through and end
/// the merge.
pub struct MergedEvents<I> {
    sources: Vec<I>,
    heap: BinaryHeap<Reverse<Head>>,
    primed: bool,
    failed: bool,
}

impl<I> MergedEvents<I> {
    pub fn new(sources: Vec<I>) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
            primed: false,
            failed: false,
        }
    }
}

impl<I, E> MergedEvents<I>
where
    I: Iterator<Item = Result<Event, E>>,
{
    fn pull(&mut self, source: usize) -> Result<(), E> {
        match self.sources[source].next() {
            Some(Ok(event)) => {
                self.heap.push(Reverse(Head { event, source }));
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => Ok(()),
        }
    }
}

impl<I, E> Iterator for MergedEvents<I>
where
    I: Iterator<Item = Result<Event, E>>,
{
    type Item = Result<Event, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(err) = self.pull(source) {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }

        let Reverse(head) = self.heap.pop()?;
        if let Err(err) = self.pull(head.source) {
            self.failed = true;
            return Some(Err(err));
        }
        Some(Ok(head.event))
    }
}

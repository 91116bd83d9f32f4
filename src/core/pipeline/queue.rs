//! Download queue: serializes `request-file` messages so that at most one
//! request is outstanding and aggregate progress can be computed.
//!
//! The next request goes out only after the current head's `end-transfer`
//! (or a stall) has been processed. When the queue drains the caller sends
//! `download-complete` and discards the queue.

use crate::core::catalog::Catalog;
use crate::core::protocol::ControlMessage;
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFile {
    pub name: String,
    pub size: u64,
}

/// What the caller must do after the head of the queue resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStep {
    /// The name was not the in-flight head; nothing changed.
    NotHead,
    /// Send this `request-file` next.
    Next(ControlMessage),
    /// Nothing left. Send `download-complete`.
    Drained,
}

#[derive(Debug, Default)]
pub struct DownloadQueue {
    waiting: VecDeque<QueuedFile>,
    in_flight: Option<QueuedFile>,
    batch_total: u64,
    batch_completed: u64,
    reported: u8,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> Option<&QueuedFile> {
        self.in_flight.as_ref()
    }

    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_none() && self.waiting.is_empty()
    }

    fn contains(&self, name: &str) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.name == name)
            || self.waiting.iter().any(|f| f.name == name)
    }

    fn push(&mut self, name: &str, size: u64) -> bool {
        if self.contains(name) {
            debug!(event = "queue_duplicate", file = %name, "Already queued");
            return false;
        }
        self.waiting.push_back(QueuedFile {
            name: name.to_string(),
            size,
        });
        self.batch_total = self.batch_total.saturating_add(size);
        true
    }

    /// Queue every remote file not already queued. Returns the request to
    /// send if the queue was idle.
    pub fn request_all(&mut self, remote: &Catalog) -> Option<ControlMessage> {
        for record in remote.iter() {
            self.push(&record.name, record.size);
        }
        self.advance()
    }

    /// Queue one remote file. Returns the request to send if the queue was
    /// idle.
    pub fn request_one(&mut self, remote: &Catalog, name: &str) -> Option<ControlMessage> {
        let Some(record) = remote.get(name) else {
            warn!(event = "queue_unknown_file", file = %name, "Peer does not offer this file");
            return None;
        };
        self.push(&record.name, record.size);
        self.advance()
    }

    fn advance(&mut self) -> Option<ControlMessage> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = self.waiting.pop_front()?;
        let request = ControlMessage::RequestFile {
            name: next.name.clone(),
        };
        debug!(event = "queue_request", file = %next.name, remaining = self.waiting.len());
        self.in_flight = Some(next);
        Some(request)
    }

    /// The head finished (or was abandoned). Moves on to the next entry.
    pub fn complete(&mut self, name: &str) -> QueueStep {
        match self.in_flight.as_ref() {
            Some(head) if head.name == name => {}
            _ => return QueueStep::NotHead,
        }
        if let Some(done) = self.in_flight.take() {
            self.batch_completed = self.batch_completed.saturating_add(done.size);
        }
        match self.advance() {
            Some(request) => QueueStep::Next(request),
            None => QueueStep::Drained,
        }
    }

    /// The last value returned by [`DownloadQueue::aggregate_percent`].
    pub fn last_reported(&self) -> u8 {
        self.reported
    }

    /// Aggregate batch progress given the bytes received so far for the
    /// in-flight file. Floored, and never lower than a previous report.
    pub fn aggregate_percent(&mut self, in_flight_received: u64) -> u8 {
        let pct = if self.batch_total == 0 {
            if self.is_empty() {
                100
            } else {
                0
            }
        } else {
            let current = self
                .in_flight
                .as_ref()
                .map_or(0, |f| in_flight_received.min(f.size));
            let done = self.batch_completed.saturating_add(current).min(self.batch_total);
            ((done as u128 * 100) / self.batch_total as u128) as u8
        };
        self.reported = self.reported.max(pct);
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Origin;
    use crate::core::protocol::FileMeta;

    fn remote(files: &[(&str, u64)]) -> Catalog {
        let mut catalog = Catalog::new(Origin::Remote);
        catalog.apply_announcement(
            files
                .iter()
                .map(|(name, size)| FileMeta {
                    name: name.to_string(),
                    size: *size,
                    mime_type: "application/octet-stream".into(),
                })
                .collect(),
        );
        catalog
    }

    fn request(name: &str) -> ControlMessage {
        ControlMessage::RequestFile { name: name.into() }
    }

    #[test]
    fn one_request_outstanding_at_a_time() {
        let catalog = remote(&[("x", 100), ("y", 300)]);
        let mut queue = DownloadQueue::new();

        assert_eq!(queue.request_all(&catalog), Some(request("x")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.complete("y"), QueueStep::NotHead);
        assert_eq!(queue.complete("x"), QueueStep::Next(request("y")));
        assert_eq!(queue.complete("y"), QueueStep::Drained);
        assert!(queue.is_empty());
    }

    #[test]
    fn request_all_twice_does_not_duplicate() {
        let catalog = remote(&[("x", 1), ("y", 1)]);
        let mut queue = DownloadQueue::new();

        queue.request_all(&catalog);
        assert_eq!(queue.request_all(&catalog), None);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn request_one_appends_while_busy() {
        let catalog = remote(&[("x", 1), ("y", 1)]);
        let mut queue = DownloadQueue::new();

        assert_eq!(queue.request_one(&catalog, "x"), Some(request("x")));
        assert_eq!(queue.request_one(&catalog, "y"), None);
        assert_eq!(queue.request_one(&catalog, "nope"), None);
        assert_eq!(queue.complete("x"), QueueStep::Next(request("y")));
    }

    #[test]
    fn aggregate_is_floored_and_monotonic() {
        let catalog = remote(&[("x", 100), ("y", 200)]);
        let mut queue = DownloadQueue::new();
        queue.request_all(&catalog);

        assert_eq!(queue.aggregate_percent(0), 0);
        assert_eq!(queue.aggregate_percent(50), 16);
        assert_eq!(queue.aggregate_percent(100), 33);
        // A late, smaller report never pulls the bar back.
        assert_eq!(queue.aggregate_percent(10), 33);

        queue.complete("x");
        assert_eq!(queue.aggregate_percent(100), 66);
        assert_eq!(queue.complete("y"), QueueStep::Drained);
        assert_eq!(queue.aggregate_percent(0), 100);
    }

    #[test]
    fn empty_files_count_as_done() {
        let catalog = remote(&[("e", 0)]);
        let mut queue = DownloadQueue::new();
        queue.request_all(&catalog);
        assert_eq!(queue.aggregate_percent(0), 0);
        assert_eq!(queue.complete("e"), QueueStep::Drained);
        assert_eq!(queue.aggregate_percent(0), 100);
    }

    #[test]
    fn announced_sizes_near_u64_max_saturate() {
        let catalog = remote(&[("a", u64::MAX), ("b", 1), ("c", u64::MAX)]);
        let mut queue = DownloadQueue::new();

        assert_eq!(queue.request_all(&catalog), Some(request("a")));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.aggregate_percent(u64::MAX / 2), 49);

        assert_eq!(queue.complete("a"), QueueStep::Next(request("b")));
        assert_eq!(queue.aggregate_percent(1), 100);
        assert_eq!(queue.complete("b"), QueueStep::Next(request("c")));
        assert_eq!(queue.complete("c"), QueueStep::Drained);
        assert_eq!(queue.aggregate_percent(0), 100);
    }
}

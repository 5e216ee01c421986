//! Read-only operational snapshots.
//!
//! Each component keeps its scalar counters behind a `std::sync::RwLock`
//! and only ever takes the write side for an instant. The agent gathers a
//! [`Snapshot`] on demand without holding any lock across an await point,
//! so a metrics adapter can poll freely.

use std::sync::{Arc, RwLock};

/// Counters owned by the publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherMetrics {
    /// Log lines acknowledged by the upstream.
    pub lines_published: u64,
    /// Payloads currently awaiting acknowledgement.
    pub payloads_pending: usize,
}

/// Counters owned by the prospector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProspectorMetrics {
    /// Files with an active harvester.
    pub files_open: usize,
    /// Files tracked, including orphaned ones awaiting release.
    pub files_tracked: usize,
}

/// Counters owned by the registrar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrarMetrics {
    /// Entries in the durable state map.
    pub files_tracked: usize,
}

/// A point-in-time view across the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub publisher: PublisherMetrics,
    pub prospector: ProspectorMetrics,
    pub registrar: RegistrarMetrics,
}

/// Shared handle to one component's counters.
pub type Shared<T> = Arc<RwLock<T>>;

/// Copies the counters out, tolerating a poisoned lock.
pub fn read<T: Copy + Default>(shared: &Shared<T>) -> T {
    shared.read().map(|guard| *guard).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_copies_current_value() {
        let shared: Shared<PublisherMetrics> = Arc::new(RwLock::new(PublisherMetrics::default()));
        shared.write().unwrap().lines_published = 7;
        let snapshot = read(&shared);
        assert_eq!(snapshot.lines_published, 7);
    }
}

//! Tracked-file records and the arena that owns them.
//!
//! Every file the prospector knows about is a [`ProspectorInfo`] owned
//! exclusively by the prospector inside an [`InfoArena`]. Other components
//! refer to a file by its stable integer id; events additionally carry the
//! file's shared [`AckCell`]. Nothing outside the prospector ever holds a
//! reference to the info itself, which is what keeps the
//! harvester/prospector relationship acyclic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::event::{AckCell, FileId};
use crate::harvester::HarvesterHandle;
use crate::prospector::identity::FileIdentity;

/// Lifecycle status of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// A harvester is actively tailing the file.
    Running,
    /// The harvester stopped cleanly; nothing left to do.
    Done,
    /// The harvester went idle past the dead time, or the file vanished.
    Dead,
    /// The file could not be opened or read.
    Invalid,
    /// The harvester exited (rename, transient failure) and may be
    /// restarted by a later scan.
    Resumable,
}

/// Live record of one tracked file. Mutated only by the prospector.
pub struct ProspectorInfo {
    pub id: FileId,
    pub identity: FileIdentity,
    pub path: PathBuf,
    pub status: FileStatus,
    pub harvester: Option<HarvesterHandle>,
    /// Shared with the publisher, which advances it as acks arrive.
    pub ack: AckCell,
    /// End offset of the last event handed to the pipeline. Seeded with the
    /// starting offset so a file that never produced events is releasable.
    pub last_event_offset: u64,
    /// Last scan at which the identity was observed on disk.
    pub last_seen: Instant,
    /// Set when a scan fails to observe the identity; cleared when it
    /// reappears.
    pub orphaned_since: Option<Instant>,
    /// Size from the most recent stat.
    pub last_size: u64,
    /// Custom fields inherited from the matching file group.
    pub fields: Map<String, Value>,
    /// Dead time inherited from the matching file group.
    pub dead_time: Duration,
    /// Codec name inherited from the matching file group.
    pub codec: String,
}

impl ProspectorInfo {
    /// Whether all produced events have been acknowledged upstream.
    #[must_use]
    pub fn fully_acked(&self) -> bool {
        self.ack.get() >= self.last_event_offset
    }
}

/// Prospector-owned arena of tracked files with stable integer ids.
///
/// Id 0 is reserved for stdin; real files start at 1.
#[derive(Default)]
pub struct InfoArena {
    next_id: FileId,
    infos: HashMap<FileId, ProspectorInfo>,
    by_identity: HashMap<FileIdentity, FileId>,
}

impl InfoArena {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            infos: HashMap::new(),
            by_identity: HashMap::new(),
        }
    }

    /// Allocates an id and stores the info built from it.
    pub fn insert(&mut self, build: impl FnOnce(FileId) -> ProspectorInfo) -> FileId {
        let id = self.next_id;
        self.next_id += 1;
        let info = build(id);
        self.by_identity.insert(info.identity, id);
        self.infos.insert(id, info);
        id
    }

    #[must_use]
    pub fn lookup(&self, identity: FileIdentity) -> Option<FileId> {
        self.by_identity.get(&identity).copied()
    }

    #[must_use]
    pub fn get_mut(&mut self, id: FileId) -> Option<&mut ProspectorInfo> {
        self.infos.get_mut(&id)
    }

    pub fn remove(&mut self, id: FileId) -> Option<ProspectorInfo> {
        let info = self.infos.remove(&id)?;
        self.by_identity.remove(&info.identity);
        Some(info)
    }

    /// Ids in no particular order, for iteration that mutates the arena.
    #[must_use]
    pub fn ids(&self) -> Vec<FileId> {
        self.infos.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.infos
            .values()
            .filter(|info| info.harvester.is_some())
            .count()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ProspectorInfo> + '_ {
        self.by_identity.clear();
        self.infos.drain().map(|(_, info)| info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_info(id: FileId, identity: FileIdentity) -> ProspectorInfo {
        ProspectorInfo {
            id,
            identity,
            path: PathBuf::from("/tmp/test.log"),
            status: FileStatus::Running,
            harvester: None,
            ack: AckCell::new(),
            last_event_offset: 0,
            last_seen: Instant::now(),
            orphaned_since: None,
            last_size: 0,
            fields: Map::new(),
            dead_time: Duration::from_secs(60),
            codec: "plain".to_string(),
        }
    }

    #[test]
    fn test_ids_are_stable_and_unique() {
        let mut arena = InfoArena::new();
        let a = arena.insert(|id| create_test_info(id, FileIdentity { device: 1, inode: 1 }));
        let b = arena.insert(|id| create_test_info(id, FileIdentity { device: 1, inode: 2 }));
        assert_ne!(a, b);
        assert!(a >= 1, "id 0 is reserved for stdin");
    }

    #[test]
    fn test_lookup_by_identity() {
        let mut arena = InfoArena::new();
        let identity = FileIdentity { device: 3, inode: 9 };
        let id = arena.insert(|id| create_test_info(id, identity));
        assert_eq!(arena.lookup(identity), Some(id));
        assert_eq!(arena.lookup(FileIdentity { device: 3, inode: 10 }), None);
    }

    #[test]
    fn test_remove_clears_identity_index() {
        let mut arena = InfoArena::new();
        let identity = FileIdentity { device: 1, inode: 5 };
        let id = arena.insert(|id| create_test_info(id, identity));
        arena.remove(id).unwrap();
        assert_eq!(arena.lookup(identity), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_fully_acked_gate() {
        let mut info = create_test_info(1, FileIdentity::default());
        info.last_event_offset = 10;
        assert!(!info.fully_acked());
        info.ack.advance(10);
        assert!(info.fully_acked());
    }
}

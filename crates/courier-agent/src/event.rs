//! The event model: a single shipped log line and its ack bookkeeping.
//!
//! An [`Event`] is an ordered map of fields. Five keys are always present —
//! `host`, `file`, `offset`, `line`, `message` — followed by any user-defined
//! fields from the matching file group's configuration. Field order is
//! preserved through serialization (`serde_json` with `preserve_order`), so
//! the wire body is stable and readable.
//!
//! Events never hold an owning reference back into the prospector's state.
//! They carry the file's stable arena id ([`FileId`]) for registrar routing
//! and a shared [`AckCell`] that the publisher advances as acknowledgements
//! arrive; the prospector reads the cell to decide when a deleted file's
//! state can finally be dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};

/// Stable identifier of a tracked file, assigned by the prospector's arena.
///
/// Id `0` is reserved for the stdin pseudo-file, which has no persisted
/// state.
pub type FileId = u64;

/// Highest byte offset of a file acknowledged by the upstream.
///
/// One cell is shared between the prospector (reader) and the publisher
/// (writer). [`AckCell::advance`] is monotonic, so out-of-order updates from
/// interleaved payloads can never move the watermark backwards.
#[derive(Debug, Clone, Default)]
pub struct AckCell(Arc<AtomicU64>);

impl AckCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the acked watermark to `offset` if it is higher.
    pub fn advance(&self, offset: u64) {
        self.0.fetch_max(offset, Ordering::AcqRel);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// A single log event travelling through the pipeline.
///
/// Ownership is single-holder: a harvester builds the event, hands it to the
/// spooler, which hands the batch to the publisher; the publisher keeps it
/// until the payload containing it is fully acknowledged or abandoned.
#[derive(Debug, Clone)]
pub struct Event {
    /// Arena id of the originating file, for registrar routing.
    pub file_id: FileId,
    /// Byte offset of the end of this line within the file.
    pub offset: u64,
    /// Shared acked-offset cell of the originating file.
    pub ack: AckCell,
    fields: Map<String, Value>,
}

impl Event {
    /// Builds an event with the mandated keys first, then any custom fields.
    ///
    /// Custom fields cannot shadow the mandated keys; a colliding name is
    /// skipped.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_id: FileId,
        ack: AckCell,
        host: &str,
        file: &str,
        offset: u64,
        line: u64,
        message: String,
        extra: &Map<String, Value>,
    ) -> Self {
        let mut fields = Map::with_capacity(5 + extra.len());
        fields.insert("host".into(), Value::from(host));
        fields.insert("file".into(), Value::from(file));
        fields.insert("offset".into(), Value::from(offset));
        fields.insert("line".into(), Value::from(line));
        fields.insert("message".into(), Value::from(message));
        for (key, value) in extra {
            if !fields.contains_key(key) {
                fields.insert(key.clone(), value.clone());
            }
        }
        Self {
            file_id,
            offset,
            ack,
            fields,
        }
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serializes the field map to its wire body.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        // A map of JSON values cannot fail to serialize.
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }
}

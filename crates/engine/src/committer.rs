//! Writer-side index updates
//!
//! [`IndexCommitter`] is how committed events reach the index. It adds the
//! entries to the [`TableIndex`] and then publishes each stream's new last
//! event number to the [`IndexBackend`] cache, so a value a reader cached
//! earlier never outlives the write. Writing a metastream (`$$<stream>`)
//! also drops the cached metadata of `<stream>`.
//!
//! Adding entries straight to the table index bypasses the cache; only do
//! that when no reader shares the backend, as in a rebuild before startup.

use std::collections::HashMap;
use std::sync::Arc;

use streamindex_core::{LastEventNumber, Result};
use streamindex_storage::TableIndex;
use tracing::debug;

use crate::backend::IndexBackend;
use crate::reader::METASTREAM_PREFIX;

/// Indexes committed events and keeps the stream cache current
pub struct IndexCommitter {
    backend: Arc<dyn IndexBackend>,
    table_index: TableIndex,
}

impl IndexCommitter {
    /// Create a committer writing to `table_index` and `backend`
    pub fn new(backend: Arc<dyn IndexBackend>, table_index: TableIndex) -> Self {
        IndexCommitter {
            backend,
            table_index,
        }
    }

    /// The table index
    pub fn table_index(&self) -> &TableIndex {
        &self.table_index
    }

    /// Index a single event committed at `commit_position`
    pub fn commit_event(
        &self,
        commit_position: u64,
        stream_id: &str,
        event_number: u32,
        log_position: u64,
    ) -> Result<()> {
        self.commit(commit_position, &[(stream_id, event_number, log_position)])
    }

    /// Index `(stream_id, event_number, log_position)` entries committed at
    /// `commit_position`
    ///
    /// The cache is only touched once the table index accepted the whole
    /// batch.
    pub fn commit<S: AsRef<str>>(
        &self,
        commit_position: u64,
        entries: &[(S, u32, u64)],
    ) -> Result<()> {
        self.table_index.add_entries(
            commit_position,
            entries.iter().map(|(stream_id, event_number, log_position)| {
                let stream_id: &str = stream_id.as_ref();
                (stream_id, *event_number, *log_position)
            }),
        )?;

        let mut last: HashMap<&str, u32> = HashMap::new();
        for (stream_id, event_number, _) in entries {
            last.entry(stream_id.as_ref())
                .and_modify(|n| *n = (*n).max(*event_number))
                .or_insert(*event_number);
        }
        for (stream_id, event_number) in &last {
            self.backend
                .set_stream_last_event_number(stream_id, LastEventNumber::Found(*event_number));
            if let Some(base) = stream_id.strip_prefix(METASTREAM_PREFIX) {
                self.backend.invalidate_stream_metadata(base);
            }
        }

        debug!(
            target: "streamindex::committer",
            commit_position,
            entries = entries.len(),
            streams = last.len(),
            "Committed to index"
        );
        Ok(())
    }
}

impl std::fmt::Debug for IndexCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCommitter")
            .field("table_index", &self.table_index)
            .finish()
    }
}

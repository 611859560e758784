//! Stream info cache and log reader access
//!
//! [`IndexBackend`] is what the reader needs besides the table index: a cache
//! of per-stream facts (last event number, metadata) and leased log readers.
//!
//! # Cache versions
//!
//! Every cached stream carries a version token. A read returns the token it
//! observed; a conditional update applies only if the token still matches,
//! and bumps it. A reader that resolved a value from the index while a
//! writer changed the stream therefore cannot overwrite the writer's newer
//! value: its update loses the race and the winner's value is returned.
//! Token 0 means "no entry existed when I looked".

use std::collections::BTreeMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use streamindex_core::{EventNumberCached, LastEventNumber, ReaderLease, ReaderPool};
use tracing::trace;

/// Access control list carried in stream metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAcl {
    /// Roles allowed to read
    #[serde(rename = "$r", default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<String>,
    /// Roles allowed to write
    #[serde(rename = "$w", default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<String>,
    /// Roles allowed to delete
    #[serde(rename = "$d", default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<String>,
    /// Roles allowed to read metadata
    #[serde(rename = "$mr", default, skip_serializing_if = "Vec::is_empty")]
    pub meta_read: Vec<String>,
    /// Roles allowed to write metadata
    #[serde(rename = "$mw", default, skip_serializing_if = "Vec::is_empty")]
    pub meta_write: Vec<String>,
}

/// Stream metadata
///
/// The index does not interpret metadata; it only caches it alongside the
/// last event number. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Maximum number of events to keep
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u64>,
    /// Maximum event age, in seconds
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    pub max_age_secs: Option<u64>,
    /// Events before this number are truncated
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<u32>,
    /// Cache control hint for readers, in seconds
    #[serde(rename = "$cacheControl", default, skip_serializing_if = "Option::is_none")]
    pub cache_control_secs: Option<u64>,
    /// Access control
    #[serde(rename = "$acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<StreamAcl>,
    /// User-defined keys
    #[serde(flatten)]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl StreamMetadata {
    /// Parse metadata from its JSON encoding
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode as JSON
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Default ACLs applied to streams without their own
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Default ACL for user streams
    #[serde(rename = "$userStreamAcl", default, skip_serializing_if = "Option::is_none")]
    pub user_stream_acl: Option<StreamAcl>,
    /// Default ACL for system streams
    #[serde(rename = "$systemStreamAcl", default, skip_serializing_if = "Option::is_none")]
    pub system_stream_acl: Option<StreamAcl>,
}

impl SystemSettings {
    /// Parse settings from their JSON encoding
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A cache read of a stream's metadata
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataCached {
    /// Cache version token, 0 when the stream has no entry
    pub version: u64,
    /// Cached metadata, `None` when not cached
    pub metadata: Option<StreamMetadata>,
}

/// Cache and log access the reader depends on
pub trait IndexBackend: Send + Sync {
    /// Lease a transaction log reader; it returns to the pool on drop
    fn borrow_reader(&self) -> ReaderLease;

    /// Cached last event number and the version it was observed at
    fn try_get_stream_last_event_number(&self, stream_id: &str) -> EventNumberCached;

    /// Cached metadata and the version it was observed at
    fn try_get_stream_metadata(&self, stream_id: &str) -> MetadataCached;

    /// Cache `value` if the entry is still at `cache_version`
    ///
    /// Returns the value cached afterwards: `value` if the update applied,
    /// otherwise whatever the winning update stored.
    fn update_stream_last_event_number(
        &self,
        cache_version: u64,
        stream_id: &str,
        value: LastEventNumber,
    ) -> LastEventNumber;

    /// Cache `metadata` if the entry is still at `cache_version`
    fn update_stream_metadata(
        &self,
        cache_version: u64,
        stream_id: &str,
        metadata: StreamMetadata,
    ) -> StreamMetadata;

    /// Store the last event number unconditionally, returning the new version
    fn set_stream_last_event_number(&self, stream_id: &str, value: LastEventNumber) -> u64;

    /// Store metadata unconditionally, returning the new version
    fn set_stream_metadata(&self, stream_id: &str, metadata: StreamMetadata) -> u64;

    /// Drop cached metadata and move the version forward, returning it
    ///
    /// Used when the metastream is written and the new metadata is not
    /// known to the writer.
    fn invalidate_stream_metadata(&self, stream_id: &str) -> u64;

    /// Replace the system settings
    fn set_system_settings(&self, settings: SystemSettings);

    /// Current system settings
    fn get_system_settings(&self) -> Option<SystemSettings>;
}

/// Cached facts about one stream
#[derive(Debug, Clone, Default)]
struct StreamCacheInfo {
    version: u64,
    last_event_number: Option<LastEventNumber>,
    metadata: Option<StreamMetadata>,
}

/// [`IndexBackend`] over a `DashMap` cache and a [`ReaderPool`]
///
/// The cache is unbounded; entries leave it only through
/// [`CachingIndexBackend::invalidate`].
pub struct CachingIndexBackend {
    readers: ReaderPool,
    streams: DashMap<String, StreamCacheInfo>,
    system_settings: RwLock<Option<SystemSettings>>,
}

impl CachingIndexBackend {
    /// Create a backend leasing readers from `readers`
    pub fn new(readers: ReaderPool) -> Self {
        CachingIndexBackend {
            readers,
            streams: DashMap::new(),
            system_settings: RwLock::new(None),
        }
    }

    /// The log reader pool
    pub fn readers(&self) -> &ReaderPool {
        &self.readers
    }

    /// Forget the cached facts for `stream_id`
    ///
    /// The version still moves forward, also for a stream without an entry,
    /// so that in-flight conditional updates based on what was observed
    /// before are rejected.
    pub fn invalidate(&self, stream_id: &str) {
        let mut info = self.streams.entry(stream_id.to_string()).or_default();
        info.version += 1;
        info.last_event_number = None;
        info.metadata = None;
    }

    /// Number of streams with a cache entry
    pub fn cached_streams(&self) -> usize {
        self.streams.len()
    }

    fn conditional_update<T, R>(
        &self,
        cache_version: u64,
        stream_id: &str,
        value: T,
        field: impl Fn(&mut StreamCacheInfo) -> &mut Option<T>,
        winner: impl FnOnce(&Option<T>, T) -> R,
        applied: impl FnOnce(&T) -> R,
    ) -> R
    where
        T: Clone,
    {
        match self.streams.entry(stream_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let info = occupied.get_mut();
                if info.version == cache_version {
                    info.version += 1;
                    let result = applied(&value);
                    *field(info) = Some(value);
                    result
                } else {
                    trace!(
                        target: "streamindex::backend",
                        stream_id,
                        cache_version,
                        current = info.version,
                        "Cache update lost the race"
                    );
                    winner(field(info), value)
                }
            }
            Entry::Vacant(vacant) => {
                if cache_version == 0 {
                    let result = applied(&value);
                    let mut info = StreamCacheInfo {
                        version: 1,
                        ..StreamCacheInfo::default()
                    };
                    *field(&mut info) = Some(value);
                    vacant.insert(info);
                    result
                } else {
                    winner(&None, value)
                }
            }
        }
    }

    fn set_unconditionally<T>(
        &self,
        stream_id: &str,
        value: T,
        field: impl Fn(&mut StreamCacheInfo) -> &mut Option<T>,
    ) -> u64 {
        let mut info = self.streams.entry(stream_id.to_string()).or_default();
        info.version += 1;
        *field(&mut *info) = Some(value);
        info.version
    }
}

impl IndexBackend for CachingIndexBackend {
    fn borrow_reader(&self) -> ReaderLease {
        self.readers.borrow_reader()
    }

    fn try_get_stream_last_event_number(&self, stream_id: &str) -> EventNumberCached {
        match self.streams.get(stream_id) {
            Some(info) => EventNumberCached {
                version: info.version,
                last_event_number: info.last_event_number,
            },
            None => EventNumberCached::uncached(0),
        }
    }

    fn try_get_stream_metadata(&self, stream_id: &str) -> MetadataCached {
        match self.streams.get(stream_id) {
            Some(info) => MetadataCached {
                version: info.version,
                metadata: info.metadata.clone(),
            },
            None => MetadataCached {
                version: 0,
                metadata: None,
            },
        }
    }

    fn update_stream_last_event_number(
        &self,
        cache_version: u64,
        stream_id: &str,
        value: LastEventNumber,
    ) -> LastEventNumber {
        self.conditional_update(
            cache_version,
            stream_id,
            value,
            |info| &mut info.last_event_number,
            |current, ours| current.unwrap_or(ours),
            |ours| *ours,
        )
    }

    fn update_stream_metadata(
        &self,
        cache_version: u64,
        stream_id: &str,
        metadata: StreamMetadata,
    ) -> StreamMetadata {
        self.conditional_update(
            cache_version,
            stream_id,
            metadata,
            |info| &mut info.metadata,
            |current, ours| current.clone().unwrap_or(ours),
            |ours| ours.clone(),
        )
    }

    fn set_stream_last_event_number(&self, stream_id: &str, value: LastEventNumber) -> u64 {
        self.set_unconditionally(stream_id, value, |info| &mut info.last_event_number)
    }

    fn set_stream_metadata(&self, stream_id: &str, metadata: StreamMetadata) -> u64 {
        self.set_unconditionally(stream_id, metadata, |info| &mut info.metadata)
    }

    fn invalidate_stream_metadata(&self, stream_id: &str) -> u64 {
        let mut info = self.streams.entry(stream_id.to_string()).or_default();
        info.version += 1;
        info.metadata = None;
        info.version
    }

    fn set_system_settings(&self, settings: SystemSettings) {
        *self.system_settings.write() = Some(settings);
    }

    fn get_system_settings(&self) -> Option<SystemSettings> {
        self.system_settings.read().clone()
    }
}

impl std::fmt::Debug for CachingIndexBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingIndexBackend")
            .field("cached_streams", &self.streams.len())
            .field("readers", &self.readers.leased())
            .finish()
    }
}

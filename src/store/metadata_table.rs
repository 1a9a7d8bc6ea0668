use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::models::StationMetadata;
use crate::store::changelog::{Changelog, ChangelogBackend, FileChangelog, MemoryChangelog};
use crate::utils::constants::STATION_CHANGELOG_FILE;

/// Latest metadata per station, materialized from the registrations stream.
pub struct MetadataTable {
    entries: DashMap<u32, StationMetadata>,
    changelog: Changelog<StationMetadata>,
}

impl MetadataTable {
    /// Open a table over `backend`, rebuilding it by replaying the changelog.
    pub fn open(backend: Arc<dyn ChangelogBackend>) -> Result<Self> {
        let changelog = Changelog::new(backend);
        let entries = DashMap::new();

        for (station_id, metadata) in changelog.replay()? {
            entries.insert(station_id, metadata);
        }

        info!(stations = entries.len(), "Restored station metadata table");
        Ok(Self { entries, changelog })
    }

    pub fn open_dir(state_dir: &Path) -> Result<Self> {
        let backend = FileChangelog::open(&state_dir.join(STATION_CHANGELOG_FILE))?;
        Self::open(Arc::new(backend))
    }

    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            changelog: Changelog::new(Arc::new(MemoryChangelog::new())),
        }
    }

    /// Replace any existing metadata for `station_id`.
    pub fn upsert(&self, station_id: u32, metadata: StationMetadata) -> Result<()> {
        let entry = self.entries.entry(station_id);
        self.changelog.append(station_id, &metadata)?;
        entry.insert(metadata);
        Ok(())
    }

    /// Point read of the latest upserted metadata.
    pub fn lookup(&self, station_id: u32) -> Option<StationMetadata> {
        self.entries.get(&station_id).map(|metadata| metadata.clone())
    }

    pub fn flush(&self) -> Result<()> {
        self.changelog.sync()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

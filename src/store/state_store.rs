use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{AggregateRecord, Reading};
use crate::store::changelog::{Changelog, ChangelogBackend, FileChangelog, MemoryChangelog};
use crate::utils::constants::AGGREGATE_CHANGELOG_FILE;

/// Durable per-station aggregate state.
///
/// Updates for the same station are serialized by the map's entry lock, so
/// `apply_reading` never loses an update to a concurrent read-modify-write.
/// Every write reaches the changelog before it becomes visible to readers.
pub struct StateStore {
    entries: DashMap<u32, AggregateRecord>,
    changelog: Changelog<AggregateRecord>,
}

impl StateStore {
    /// Open a store over `backend`, restoring state from its changelog.
    pub fn open(backend: Arc<dyn ChangelogBackend>) -> Result<Self> {
        let changelog = Changelog::new(backend);
        let entries = DashMap::new();

        let replayed = changelog.replay()?;
        let applied = replayed.len();
        for (station_id, record) in replayed {
            entries.insert(station_id, record);
        }

        info!(
            changelog_entries = applied,
            stations = entries.len(),
            "Restored aggregate state store"
        );

        Ok(Self { entries, changelog })
    }

    /// Open a store persisted under `state_dir`.
    pub fn open_dir(state_dir: &Path) -> Result<Self> {
        let backend = FileChangelog::open(&state_dir.join(AGGREGATE_CHANGELOG_FILE))?;
        Self::open(Arc::new(backend))
    }

    /// A store with no durability beyond the process.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            changelog: Changelog::new(Arc::new(MemoryChangelog::new())),
        }
    }

    pub fn read(&self, station_id: u32) -> Option<AggregateRecord> {
        self.entries.get(&station_id).map(|record| record.clone())
    }

    /// Replace the record for `station_id`.
    pub fn write(&self, station_id: u32, record: AggregateRecord) -> Result<()> {
        let entry = self.entries.entry(station_id);
        self.changelog.append(station_id, &record)?;
        entry.insert(record);
        Ok(())
    }

    /// Fold `reading` into the station's aggregate and return the new record.
    ///
    /// A missing record starts from zero. `name` replaces the stored station
    /// name when present. On a changelog failure the stored record is left
    /// untouched and the error is returned.
    pub fn apply_reading(
        &self,
        station_id: u32,
        reading: &Reading,
        name: Option<&str>,
    ) -> Result<AggregateRecord> {
        let entry = self.entries.entry(station_id);
        let updated = match &entry {
            Entry::Occupied(occupied) => occupied.get().updated(reading.value, name),
            Entry::Vacant(_) => AggregateRecord::empty(station_id).updated(reading.value, name),
        };
        self.changelog.append(station_id, &updated)?;
        entry.insert(updated.clone());

        debug!(
            station_id,
            count = updated.count,
            average = updated.average,
            "Applied reading"
        );
        Ok(updated)
    }

    /// Make all writes so far durable.
    pub fn flush(&self) -> Result<()> {
        self.changelog.sync()
    }

    /// All aggregates ordered by station id.
    pub fn snapshot(&self) -> Vec<AggregateRecord> {
        let mut records: Vec<AggregateRecord> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(|record| record.station_id);
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessingError;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use rayon::prelude::*;
    use tempfile::TempDir;

    fn reading(station_id: u32, value: f64) -> Reading {
        Reading::new(station_id, Utc::now(), value)
    }

    #[test]
    fn test_count_and_average() -> Result<()> {
        let store = StateStore::in_memory();
        let values = [12.5, -3.0, 7.25, 20.0, 0.5];

        for value in values {
            store.apply_reading(1, &reading(1, value), None)?;
        }

        let record = store.read(1).unwrap();
        let expected = values.iter().sum::<f64>() / values.len() as f64;
        assert_eq!(record.count, values.len() as u64);
        assert!((record.average - expected).abs() < 1e-9);
        assert_eq!(record.min, -3.0);
        assert_eq!(record.max, 20.0);
        Ok(())
    }

    #[test]
    fn test_absent_station_reads_none() {
        let store = StateStore::in_memory();
        assert!(store.read(42).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_name_is_kept_when_later_reading_has_none() -> Result<()> {
        let store = StateStore::in_memory();
        store.apply_reading(1, &reading(1, 10.0), Some("Station 1"))?;
        let record = store.apply_reading(1, &reading(1, 30.0), None)?;

        assert_eq!(record.station_name.as_deref(), Some("Station 1"));
        assert_eq!(record.average, 20.0);
        Ok(())
    }

    #[test]
    fn test_replay_is_deterministic() -> Result<()> {
        let readings: Vec<(u32, f64, Option<&str>)> = vec![
            (1, 15.0, Some("Station 1")),
            (2, 3.5, None),
            (1, 25.0, Some("Station 1")),
            (2, 4.5, Some("Station 2")),
            (1, -1.0, None),
        ];

        let run = || -> Result<Vec<AggregateRecord>> {
            let store = StateStore::in_memory();
            for (station_id, value, name) in &readings {
                store.apply_reading(*station_id, &reading(*station_id, *value), *name)?;
            }
            Ok(store.snapshot())
        };

        assert_eq!(run()?, run()?);
        Ok(())
    }

    #[test]
    fn test_concurrent_same_station_updates_are_not_lost() -> Result<()> {
        let store = StateStore::in_memory();
        let n = 10_000;

        (0..n).into_par_iter().try_for_each(|i| {
            store
                .apply_reading(7, &reading(7, i as f64), None)
                .map(|_| ())
        })?;

        let record = store.read(7).unwrap();
        assert_eq!(record.count, n as u64);
        assert_eq!(record.sum, (0..n).map(|i| i as f64).sum::<f64>());
        Ok(())
    }

    #[test]
    fn test_concurrent_different_stations_do_not_interfere() -> Result<()> {
        let store = StateStore::in_memory();
        let stations = 16u32;
        let per_station = 500u32;

        (0..stations * per_station)
            .into_par_iter()
            .try_for_each(|i| {
                let station_id = i % stations;
                store
                    .apply_reading(station_id, &reading(station_id, 1.0), None)
                    .map(|_| ())
            })?;

        for station_id in 0..stations {
            assert_eq!(store.read(station_id).unwrap().count, per_station as u64);
        }
        Ok(())
    }

    #[test]
    fn test_failed_append_leaves_record_untouched() -> Result<()> {
        let backend = Arc::new(MemoryChangelog::new());
        let store = StateStore::open(backend.clone())?;

        store.apply_reading(1, &reading(1, 10.0), None)?;
        backend.fail_next_appends(1);

        let err = store.apply_reading(1, &reading(1, 50.0), None).unwrap_err();
        assert!(matches!(err, ProcessingError::StoreUnavailable(_)));
        assert_eq!(store.read(1).unwrap().count, 1);

        backend.fail_next_appends(1);
        assert!(store.apply_reading(2, &reading(2, 1.0), None).is_err());
        assert!(store.read(2).is_none());
        Ok(())
    }

    #[test]
    fn test_state_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;

        {
            let store = StateStore::open_dir(dir.path())?;
            store.apply_reading(1, &reading(1, 15.0), Some("Station 1"))?;
            store.apply_reading(1, &reading(1, 25.0), None)?;
            store.apply_reading(2, &reading(2, 5.0), None)?;
            store.flush()?;
        }

        let reopened = StateStore::open_dir(dir.path())?;
        let record = reopened.read(1).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.average, 20.0);
        assert_eq!(record.station_name.as_deref(), Some("Station 1"));
        assert_eq!(reopened.len(), 2);
        Ok(())
    }

    #[test]
    fn test_recovers_every_write_after_a_torn_tail() -> Result<()> {
        use std::io::Write;

        let dir = TempDir::new()?;
        {
            let store = StateStore::open_dir(dir.path())?;
            store.apply_reading(1, &reading(1, 1.0), None)?;
            store.flush()?;
        }

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(AGGREGATE_CHANGELOG_FILE))?;
        file.write_all(br#"{"key":1,"val"#)?;
        drop(file);

        {
            let store = StateStore::open_dir(dir.path())?;
            assert_eq!(store.read(1).map(|r| r.count), Some(1));
            for _ in 0..5 {
                store.apply_reading(1, &reading(1, 2.0), None)?;
            }
            store.apply_reading(2, &reading(2, 3.0), None)?;
            store.flush()?;
        }

        let reopened = StateStore::open_dir(dir.path())?;
        assert_eq!(reopened.read(1).map(|r| r.count), Some(6));
        assert_eq!(reopened.read(2).map(|r| r.count), Some(1));
        Ok(())
    }

    #[test]
    fn test_empty_record_does_not_hide_later_writes() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = StateStore::open_dir(dir.path())?;
            store.write(9, AggregateRecord::empty(9))?;
            store.apply_reading(1, &reading(1, 4.0), None)?;
            store.flush()?;
        }

        let reopened = StateStore::open_dir(dir.path())?;
        assert_eq!(reopened.read(9), Some(AggregateRecord::empty(9)));
        assert_eq!(reopened.read(1).map(|r| r.count), Some(1));
        Ok(())
    }

    #[test]
    fn test_changelog_holds_one_entry_per_station() -> Result<()> {
        let backend = Arc::new(MemoryChangelog::new());
        let store = StateStore::open(backend.clone())?;

        for i in 0..100_000 {
            store.apply_reading(1, &reading(1, i as f64), None)?;
        }

        assert_eq!(store.read(1).map(|r| r.count), Some(100_000));
        assert_eq!(backend.len(), 1);
        Ok(())
    }

    #[test]
    fn test_write_replaces_record() -> Result<()> {
        let store = StateStore::in_memory();
        store.apply_reading(3, &reading(3, 1.0), None)?;

        let replacement = AggregateRecord::empty(3).updated(9.0, Some("Replaced"));
        store.write(3, replacement.clone())?;
        assert_eq!(store.read(3), Some(replacement));
        Ok(())
    }
}

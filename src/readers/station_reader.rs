use serde::Deserialize;
use std::path::Path;
use validator::Validate;

use crate::error::Result;
use crate::models::StationMetadata;

#[derive(Debug, Deserialize)]
struct StationRow {
    station_id: u32,
    name: String,
}

/// Reads station registrations from a `station_id,name` CSV file.
pub struct StationReader {
    skip_headers: bool,
}

impl StationReader {
    pub fn new() -> Self {
        Self { skip_headers: true }
    }

    pub fn with_skip_headers(skip_headers: bool) -> Self {
        Self { skip_headers }
    }

    /// Registrations in file order. Later rows for a station supersede earlier ones
    /// once replayed, so duplicates are kept.
    pub fn read_stations(&self, path: &Path) -> Result<Vec<StationMetadata>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.skip_headers)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut stations = Vec::new();
        for row in reader.deserialize::<StationRow>() {
            let row = row?;
            let station = StationMetadata::new(row.station_id, row.name);
            station.validate()?;
            stations.push(station);
        }

        Ok(stations)
    }
}

impl Default for StationReader {
    fn default() -> Self {
        Self::new()
    }
}

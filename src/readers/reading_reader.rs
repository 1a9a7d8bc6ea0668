use serde::Deserialize;
use std::path::Path;

use crate::error::{ProcessingError, Result};

#[derive(Debug, Deserialize)]
struct ReadingRow {
    station_id: u32,
    payload: String,
}

/// Reads raw reading records from a `station_id,payload` CSV file.
///
/// Payloads are passed through untouched; malformed ones are the pipeline's
/// concern, not the reader's.
pub struct ReadingReader {
    skip_headers: bool,
}

impl ReadingReader {
    pub fn new() -> Self {
        Self { skip_headers: true }
    }

    pub fn with_skip_headers(skip_headers: bool) -> Self {
        Self { skip_headers }
    }

    pub fn read_readings(&self, path: &Path) -> Result<Vec<(u32, String)>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.skip_headers)
            .trim(csv::Trim::All)
            .from_path(path)?;

        reader
            .deserialize::<ReadingRow>()
            .map(|row| {
                row.map(|r| (r.station_id, r.payload))
                    .map_err(ProcessingError::from)
            })
            .collect()
    }
}

impl Default for ReadingReader {
    fn default() -> Self {
        Self::new()
    }
}

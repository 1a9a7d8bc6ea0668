use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};
use crate::utils::constants::READING_DELIMITER;

/// A single timestamped measurement from a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub station_id: u32,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Reading {
    pub fn new(station_id: u32, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            station_id,
            timestamp,
            value,
        }
    }

    /// Parse a raw `"<ISO-8601 timestamp>;<number>"` payload.
    ///
    /// Only the first delimiter splits; anything after it must be a finite number.
    pub fn parse(station_id: u32, payload: &str) -> Result<Self> {
        let (timestamp, value) = payload
            .split_once(READING_DELIMITER)
            .ok_or_else(|| ProcessingError::decode(payload, "missing ';' delimiter"))?;

        let timestamp = DateTime::parse_from_rfc3339(timestamp.trim())
            .map_err(|e| ProcessingError::decode(payload, format!("invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        let value = value
            .trim()
            .parse::<f64>()
            .map_err(|e| ProcessingError::decode(payload, format!("invalid value: {}", e)))?;

        if !value.is_finite() {
            return Err(ProcessingError::decode(payload, "value is not finite"));
        }

        Ok(Self::new(station_id, timestamp, value))
    }

    /// Render the reading back into its raw payload form.
    pub fn to_payload(&self) -> String {
        format!(
            "{}{}{}",
            self.timestamp.to_rfc3339(),
            READING_DELIMITER,
            self.value
        )
    }
}

/// A reading joined with the station name known at join time.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedReading {
    pub reading: Reading,
    pub name: Option<String>,
}

impl EnrichedReading {
    pub fn new(reading: Reading, name: Option<String>) -> Self {
        Self { reading, name }
    }

    pub fn station_id(&self) -> u32 {
        self.reading.station_id
    }
}

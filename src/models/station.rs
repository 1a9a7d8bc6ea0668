use serde::{Deserialize, Serialize};
use validator::Validate;

/// Registration event for a weather station, keyed by `station_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StationMetadata {
    #[serde(rename = "id", alias = "stationId")]
    pub station_id: u32,

    #[validate(length(min = 1))]
    pub name: String,
}

impl StationMetadata {
    pub fn new(station_id: u32, name: impl Into<String>) -> Self {
        Self {
            station_id,
            name: name.into(),
        }
    }
}

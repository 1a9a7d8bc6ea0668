use std::sync::Arc;

use crate::models::{EnrichedReading, Reading};
use crate::store::MetadataTable;

/// Enriches readings with the station name currently in the metadata table.
///
/// The name is copied at join time, so later metadata updates never reach
/// readings that were already joined.
pub struct JoinStage {
    stations: Arc<MetadataTable>,
}

impl JoinStage {
    pub fn new(stations: Arc<MetadataTable>) -> Self {
        Self { stations }
    }

    pub fn join(&self, reading: Reading) -> EnrichedReading {
        let name = self
            .stations
            .lookup(reading.station_id)
            .map(|metadata| metadata.name);
        EnrichedReading::new(reading, name)
    }
}

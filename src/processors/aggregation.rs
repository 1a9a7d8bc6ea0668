use std::sync::Arc;

use crate::error::Result;
use crate::models::{AggregateRecord, EnrichedReading};
use crate::store::StateStore;

/// Folds enriched readings into the per-station running aggregate.
pub struct AggregationStage {
    store: Arc<StateStore>,
}

impl AggregationStage {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Apply one reading. Store failures are returned, never swallowed.
    pub fn aggregate(&self, enriched: &EnrichedReading) -> Result<AggregateRecord> {
        self.store.apply_reading(
            enriched.station_id(),
            &enriched.reading,
            enriched.name.as_deref(),
        )
    }
}

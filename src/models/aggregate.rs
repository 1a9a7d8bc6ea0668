use serde::{Deserialize, Serialize};

/// Running aggregate for one station. Emitted after every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub station_id: u32,
    pub station_name: Option<String>,
    pub count: u64,
    pub sum: f64,
    #[serde(rename = "avg")]
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

impl AggregateRecord {
    /// Starting point before the first reading: `count == 0`, average undefined.
    ///
    /// Every field stays finite so the record round-trips through JSON.
    pub fn empty(station_id: u32) -> Self {
        Self {
            station_id,
            station_name: None,
            count: 0,
            sum: 0.0,
            average: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    /// Fold one value into a copy of this aggregate.
    ///
    /// A present name replaces the stored one; an absent name keeps it.
    pub fn updated(&self, value: f64, name: Option<&str>) -> Self {
        let count = self.count + 1;
        let sum = self.sum + value;

        Self {
            station_id: self.station_id,
            station_name: name
                .map(str::to_string)
                .or_else(|| self.station_name.clone()),
            count,
            sum,
            average: sum / count as f64,
            min: if self.count == 0 { value } else { self.min.min(value) },
            max: if self.count == 0 { value } else { self.max.max(value) },
        }
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then_some(self.average)
    }
}

/// Topic names
pub const WEATHER_STATIONS_TOPIC: &str = "weather-stations";
pub const TEMPERATURE_VALUES_TOPIC: &str = "temperature-values";
pub const TEMPERATURES_AGGREGATED_TOPIC: &str = "temperatures-aggregated";

/// Reading payload delimiter between timestamp and value
pub const READING_DELIMITER: char = ';';

/// Changelog file names inside the state directory
pub const AGGREGATE_CHANGELOG_FILE: &str = "aggregates.changelog";
pub const STATION_CHANGELOG_FILE: &str = "stations.changelog";

/// Superseded changelog entries tolerated before a file changelog is rewritten
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 10_000;

/// Processing defaults
pub const DEFAULT_POLL_WAIT_MS: u64 = 100;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2_000;
pub const DEFAULT_GROUP_ID: &str = "temperature-aggregator";
pub const DEFAULT_STATE_DIR: &str = "state";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "STATION_AGG";

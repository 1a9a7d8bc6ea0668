pub mod changelog;
pub mod metadata_table;
pub mod state_store;

pub use changelog::{Changelog, ChangelogBackend, FileChangelog, MemoryChangelog};
pub use metadata_table::MetadataTable;
pub use state_store::StateStore;

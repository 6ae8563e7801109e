//! redb table definitions for the stats store.

use redb::TableDefinition;

/// Historical dump stats keyed by `{host}:{device}`.
pub const STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("stats");

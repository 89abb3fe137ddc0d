//! redb table definitions for the metadata journal.
//!
//! Keys are database names; values are JSON-serialized `DatabaseRecord`s.

use redb::TableDefinition;

/// Database records keyed by name.
pub const DATABASES: TableDefinition<&str, &[u8]> = TableDefinition::new("databases");

//! redb table definitions for the devpulse registry.

use redb::TableDefinition;

/// Service entries keyed by service name.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

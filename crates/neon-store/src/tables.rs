//! redb table definitions for the embedded cluster store.
//!
//! Every table uses `&str` keys and `&[u8]` values. Keys are slash-separated
//! paths (`neon/service/neon-proxy-manager/conf/...`) so prefix scans select
//! a namespace.

use redb::TableDefinition;

/// Config key/value entries, raw bytes keyed by path.
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Lease records (JSON `LeaseRecord`) keyed by lock path.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Secret documents (JSON) keyed by secret path.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

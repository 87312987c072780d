//! Statement registry
//!
//! Aggregate event tables are named after the aggregate id, so their SQL
//! cannot be written out ahead of time. The registry validates ids, formats
//! each aggregate's statement bundle exactly once per process, and hands out
//! shared references afterwards.

use std::sync::Arc;

use dashmap::DashMap;

use super::error::{StoreError, StoreResult};

/// Maximum identifier length accepted for aggregate ids
const MAX_AGGREGATE_ID_LEN: usize = 63;

/// Table names an aggregate id may not shadow
const RESERVED_TABLES: [&str; 2] = ["outbox", "snapshots"];

/// SQL dialect a statement bundle is formatted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Dialect {
    Postgres,
    Sqlite,
}

/// Pre-formatted statements for one aggregate's event table
#[derive(Debug)]
pub(crate) struct AggregateStatements {
    /// DDL run by `ensure_schema`, in order
    pub ddl: Vec<String>,
    pub insert_event: String,
    pub select_after_version: String,
    pub select_after_version_below_height: String,
    pub select_max_version: String,
    pub delete_above_height: String,
    pub delete_below_height: String,
}

/// Validate an aggregate id for use as a table identifier.
///
/// Accepted: `[a-z_][a-z0-9_]*`, at most 63 bytes. Everything else is
/// rejected before any SQL is formatted.
pub(crate) fn validate_aggregate_id(id: &str) -> StoreResult<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
        _ => false,
    };

    if !valid || id.len() > MAX_AGGREGATE_ID_LEN || RESERVED_TABLES.contains(&id) {
        return Err(StoreError::InvalidAggregateId(id.to_string()));
    }
    Ok(())
}

/// Per-dialect cache of aggregate statement bundles
#[derive(Debug)]
pub(crate) struct StatementRegistry {
    dialect: Dialect,
    bundles: DashMap<String, Arc<AggregateStatements>>,
}

impl StatementRegistry {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            bundles: DashMap::new(),
        }
    }

    /// Get (or build once) the statement bundle for an aggregate
    pub(crate) fn get(&self, aggregate_id: &str) -> StoreResult<Arc<AggregateStatements>> {
        if let Some(bundle) = self.bundles.get(aggregate_id) {
            return Ok(bundle.clone());
        }

        validate_aggregate_id(aggregate_id)?;
        let bundle = Arc::new(build_statements(self.dialect, aggregate_id));
        self.bundles
            .insert(aggregate_id.to_string(), bundle.clone());
        Ok(bundle)
    }
}

fn build_statements(dialect: Dialect, agg: &str) -> AggregateStatements {
    match dialect {
        Dialect::Postgres => AggregateStatements {
            ddl: vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS "{agg}" (
                        id BIGSERIAL PRIMARY KEY,
                        version BIGINT NOT NULL CHECK (version >= 0),
                        request_id TEXT NOT NULL,
                        event_type TEXT NOT NULL,
                        payload BYTEA NOT NULL,
                        block_height BIGINT CHECK (block_height IS NULL OR block_height >= 0),
                        is_compressed BOOLEAN NOT NULL DEFAULT FALSE,
                        timestamp BIGINT NOT NULL,
                        UNIQUE (version, request_id)
                    )
                    "#
                ),
                format!(
                    r#"CREATE INDEX IF NOT EXISTS "idx_{agg}_block_height" ON "{agg}" (block_height)"#
                ),
            ],
            insert_event: format!(
                r#"
                INSERT INTO "{agg}" (version, request_id, event_type, payload, block_height, is_compressed, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (version, request_id) DO NOTHING
                "#
            ),
            select_after_version: format!(
                r#"
                SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp
                FROM "{agg}" WHERE version > $1 ORDER BY version ASC LIMIT $2
                "#
            ),
            select_after_version_below_height: format!(
                r#"
                SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp
                FROM "{agg}"
                WHERE version > $1 AND block_height IS NOT NULL AND block_height <= $2
                ORDER BY version ASC LIMIT $3
                "#
            ),
            select_max_version: format!(r#"SELECT MAX(version) FROM "{agg}""#),
            delete_above_height: format!(r#"DELETE FROM "{agg}" WHERE block_height > $1"#),
            delete_below_height: format!(
                r#"DELETE FROM "{agg}" WHERE block_height IS NOT NULL AND block_height < $1"#
            ),
        },
        Dialect::Sqlite => AggregateStatements {
            ddl: vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS "{agg}" (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        version INTEGER NOT NULL,
                        request_id TEXT NOT NULL,
                        event_type TEXT NOT NULL,
                        payload BLOB NOT NULL,
                        block_height INTEGER,
                        is_compressed INTEGER NOT NULL DEFAULT 0,
                        timestamp INTEGER NOT NULL,
                        UNIQUE (version, request_id)
                    )
                    "#
                ),
                format!(
                    r#"CREATE INDEX IF NOT EXISTS "idx_{agg}_block_height" ON "{agg}" (block_height)"#
                ),
                format!(
                    r#"
                    CREATE TRIGGER IF NOT EXISTS "trg_{agg}_version_nonneg"
                    BEFORE INSERT ON "{agg}"
                    FOR EACH ROW WHEN NEW.version < 0
                    BEGIN SELECT RAISE(ABORT, 'version must be non-negative'); END
                    "#
                ),
                format!(
                    r#"
                    CREATE TRIGGER IF NOT EXISTS "trg_{agg}_height_nonneg"
                    BEFORE INSERT ON "{agg}"
                    FOR EACH ROW WHEN NEW.block_height IS NOT NULL AND NEW.block_height < 0
                    BEGIN SELECT RAISE(ABORT, 'block_height must be non-negative'); END
                    "#
                ),
            ],
            insert_event: format!(
                r#"
                INSERT OR IGNORE INTO "{agg}" (version, request_id, event_type, payload, block_height, is_compressed, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#
            ),
            select_after_version: format!(
                r#"
                SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp
                FROM "{agg}" WHERE version > ?1 ORDER BY version ASC LIMIT ?2
                "#
            ),
            select_after_version_below_height: format!(
                r#"
                SELECT id, version, request_id, event_type, payload, block_height, is_compressed, timestamp
                FROM "{agg}"
                WHERE version > ?1 AND block_height IS NOT NULL AND block_height <= ?2
                ORDER BY version ASC LIMIT ?3
                "#
            ),
            select_max_version: format!(r#"SELECT MAX(version) FROM "{agg}""#),
            delete_above_height: format!(r#"DELETE FROM "{agg}" WHERE block_height > ?1"#),
            delete_below_height: format!(
                r#"DELETE FROM "{agg}" WHERE block_height IS NOT NULL AND block_height < ?1"#
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_plain_identifiers() {
        assert!(validate_aggregate_id("wallet").is_ok());
        assert!(validate_aggregate_id("btc_utxo_set").is_ok());
        assert!(validate_aggregate_id("_internal").is_ok());
        assert!(validate_aggregate_id("agg2").is_ok());
    }

    #[test]
    fn test_validate_rejects_unsafe_ids() {
        assert!(validate_aggregate_id("").is_err());
        assert!(validate_aggregate_id("2fast").is_err());
        assert!(validate_aggregate_id("Wallet").is_err());
        assert!(validate_aggregate_id("wallet; DROP TABLE outbox").is_err());
        assert!(validate_aggregate_id(r#"wallet" (x)"#).is_err());
        assert!(validate_aggregate_id(&"a".repeat(64)).is_err());
        assert!(validate_aggregate_id("outbox").is_err());
        assert!(validate_aggregate_id("snapshots").is_err());
    }

    #[test]
    fn test_bundle_is_built_once() {
        let registry = StatementRegistry::new(Dialect::Sqlite);
        let first = registry.get("wallet").unwrap();
        let second = registry.get("wallet").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_dialect_placeholders() {
        let pg = StatementRegistry::new(Dialect::Postgres)
            .get("wallet")
            .unwrap();
        assert!(pg.insert_event.contains("$7"));
        assert!(pg.insert_event.contains("ON CONFLICT"));

        let lite = StatementRegistry::new(Dialect::Sqlite).get("wallet").unwrap();
        assert!(lite.insert_event.contains("?7"));
        assert!(lite.insert_event.contains("INSERT OR IGNORE"));
    }
}

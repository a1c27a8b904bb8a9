//! Schema migrations for the query-index tables.
//!
//! Tenant and organization keys are stored as text so the subsystem stays
//! agnostic of the host application's id formats. The coalesced generated
//! column on `entity_indexes` makes the `(entity_type, record_id, org)`
//! uniqueness enforceable when the organization is null.

use crate::migration::Migration;

/// Get all migrations in order.
#[must_use]
pub fn all_migrations() -> Vec<Migration> {
    vec![
        v001_create_entity_indexes(),
        v002_create_entity_index_jobs(),
        v003_create_entity_index_coverage(),
        v004_create_search_tokens(),
        v005_create_indexer_logs(),
    ]
}

/// V001: Create the `entity_indexes` table.
#[must_use]
pub fn v001_create_entity_indexes() -> Migration {
    Migration::new(
        20240601000001,
        "create_entity_indexes",
        r#"
            -- Denormalized JSON documents, one row per (entity, record, org)
            CREATE TABLE IF NOT EXISTS entity_indexes (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                entity_type VARCHAR(255) NOT NULL,
                record_id TEXT NOT NULL,
                organization_id TEXT,
                organization_id_coalesced TEXT GENERATED ALWAYS AS
                    (COALESCE(organization_id, '00000000-0000-0000-0000-000000000000')) STORED,
                tenant_id TEXT,
                doc JSONB NOT NULL DEFAULT '{}',
                index_version INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deleted_at TIMESTAMPTZ
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uq_entity_indexes_record
                ON entity_indexes(entity_type, record_id, organization_id_coalesced);

            CREATE INDEX IF NOT EXISTS idx_entity_indexes_tenant
                ON entity_indexes(entity_type, tenant_id);
            CREATE INDEX IF NOT EXISTS idx_entity_indexes_updated_at
                ON entity_indexes(entity_type, updated_at);
            CREATE INDEX IF NOT EXISTS idx_entity_indexes_doc
                ON entity_indexes USING gin (doc);
        "#,
    )
    .with_down(
        r"
            DROP TABLE IF EXISTS entity_indexes CASCADE;
        ",
    )
}

/// V002: Create the `entity_index_jobs` ledger.
#[must_use]
pub fn v002_create_entity_index_jobs() -> Migration {
    Migration::new(
        20240601000002,
        "create_entity_index_jobs",
        r#"
            -- Reindex/purge job ledger; finalized rows are kept for observability
            CREATE TABLE IF NOT EXISTS entity_index_jobs (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                entity_type VARCHAR(255) NOT NULL,
                organization_id TEXT,
                tenant_id TEXT,
                partition_index INTEGER,
                partition_count INTEGER,
                status VARCHAR(20) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                heartbeat_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                finished_at TIMESTAMPTZ,
                processed_count BIGINT NOT NULL DEFAULT 0,
                total_count BIGINT NOT NULL DEFAULT 0
            );

            -- One active job per scope+partition; nulls compare equal here
            CREATE UNIQUE INDEX IF NOT EXISTS uq_entity_index_jobs_active
                ON entity_index_jobs(
                    entity_type,
                    COALESCE(organization_id, ''),
                    COALESCE(tenant_id, ''),
                    COALESCE(partition_index, -1),
                    COALESCE(partition_count, -1)
                )
                WHERE finished_at IS NULL;

            CREATE INDEX IF NOT EXISTS idx_entity_index_jobs_entity
                ON entity_index_jobs(entity_type, started_at);
        "#,
    )
    .with_down(
        r"
            DROP TABLE IF EXISTS entity_index_jobs CASCADE;
        ",
    )
}

/// V003: Create the `entity_index_coverage` snapshot table.
#[must_use]
pub fn v003_create_entity_index_coverage() -> Migration {
    Migration::new(
        20240601000003,
        "create_entity_index_coverage",
        r#"
            -- Coverage snapshots per (entity, tenant, org, with_deleted);
            -- the null organization is stored as the sentinel UUID
            CREATE TABLE IF NOT EXISTS entity_index_coverage (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                entity_type VARCHAR(255) NOT NULL,
                tenant_id TEXT NOT NULL,
                organization_id TEXT,
                with_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                base_count BIGINT NOT NULL DEFAULT 0,
                indexed_count BIGINT NOT NULL DEFAULT 0,
                vector_indexed_count BIGINT NOT NULL DEFAULT 0,
                refreshed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uq_entity_index_coverage_scope
                ON entity_index_coverage(entity_type, tenant_id, organization_id, with_deleted);
        "#,
    )
    .with_down(
        r"
            DROP TABLE IF EXISTS entity_index_coverage CASCADE;
        ",
    )
}

/// V004: Create the `search_tokens` table.
#[must_use]
pub fn v004_create_search_tokens() -> Migration {
    Migration::new(
        20240601000004,
        "create_search_tokens",
        r#"
            -- Tokenized search rows derived from index documents
            CREATE TABLE IF NOT EXISTS search_tokens (
                id BIGSERIAL PRIMARY KEY,
                entity_type VARCHAR(255) NOT NULL,
                record_id TEXT NOT NULL,
                field VARCHAR(255) NOT NULL,
                token_hash VARCHAR(64) NOT NULL,
                token TEXT,
                organization_id TEXT,
                tenant_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE UNIQUE INDEX IF NOT EXISTS uq_search_tokens_field_hash
                ON search_tokens(
                    entity_type,
                    record_id,
                    field,
                    token_hash,
                    COALESCE(organization_id, ''),
                    COALESCE(tenant_id, '')
                );

            CREATE INDEX IF NOT EXISTS idx_search_tokens_lookup
                ON search_tokens(entity_type, token_hash);
            CREATE INDEX IF NOT EXISTS idx_search_tokens_record
                ON search_tokens(entity_type, record_id);
        "#,
    )
    .with_down(
        r"
            DROP TABLE IF EXISTS search_tokens CASCADE;
        ",
    )
}

/// V005: Create the diagnostic log tables.
#[must_use]
pub fn v005_create_indexer_logs() -> Migration {
    Migration::new(
        20240601000005,
        "create_indexer_logs",
        r#"
            -- Append-only diagnostics; never read by control logic
            CREATE TABLE IF NOT EXISTS indexer_error_logs (
                id BIGSERIAL PRIMARY KEY,
                source VARCHAR(255) NOT NULL,
                handler VARCHAR(255) NOT NULL,
                message TEXT NOT NULL,
                detail JSONB,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_indexer_error_logs_source
                ON indexer_error_logs(source, occurred_at);

            CREATE TABLE IF NOT EXISTS indexer_status_logs (
                id BIGSERIAL PRIMARY KEY,
                source VARCHAR(255) NOT NULL,
                handler VARCHAR(255) NOT NULL,
                message TEXT NOT NULL,
                detail JSONB,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX IF NOT EXISTS idx_indexer_status_logs_source
                ON indexer_status_logs(source, occurred_at);
        "#,
    )
    .with_down(
        r"
            DROP TABLE IF EXISTS indexer_error_logs CASCADE;
            DROP TABLE IF EXISTS indexer_status_logs CASCADE;
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = all_migrations();
        assert_eq!(migrations.len(), 5);
        for pair in migrations.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn test_all_migrations_support_rollback() {
        for migration in all_migrations() {
            assert!(migration.supports_rollback(), "{migration} missing down SQL");
        }
    }

    #[test]
    fn test_entity_indexes_ddl_has_coalesced_unique_key() {
        let ddl = &v001_create_entity_indexes().up_sql;
        assert!(ddl.contains("organization_id_coalesced"));
        assert!(ddl.contains("uq_entity_indexes_record"));
        assert!(ddl.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_jobs_ddl_has_partial_unique_index() {
        let ddl = &v002_create_entity_index_jobs().up_sql;
        assert!(ddl.contains("WHERE finished_at IS NULL"));
    }
}

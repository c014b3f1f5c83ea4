#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_sentinel_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS source_configs (
    source_name TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0,
    priority TEXT NOT NULL,
    config_json TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS opportunities (
    opportunity_id INTEGER PRIMARY KEY AUTOINCREMENT,
    dedup_key TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    url TEXT,
    organization TEXT,
    opportunity_type TEXT NOT NULL,
    source TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    discovered_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS discovery_jobs (
    record_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    discoverer TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    result_json TEXT,
    metadata_json TEXT,
    created_at_unix_ms INTEGER NOT NULL,
    start_time_unix_ms INTEGER,
    end_time_unix_ms INTEGER,
    UNIQUE (job_id, created_at_unix_ms)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS discovery_jobs;
DROP TABLE IF EXISTS opportunities;
DROP TABLE IF EXISTS source_configs;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_discovery_lookup_indexes",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_discovery_jobs_discoverer_time
    ON discovery_jobs (discoverer, created_at_unix_ms DESC);

CREATE INDEX IF NOT EXISTS idx_opportunities_source_time
    ON opportunities (source, discovered_at_unix DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_opportunities_source_time;
DROP INDEX IF EXISTS idx_discovery_jobs_discoverer_time;
"#,
};

static MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

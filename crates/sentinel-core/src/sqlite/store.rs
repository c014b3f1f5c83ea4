use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};

use crate::discovery::{DeduplicationService, DiscoveryResult, dedup_key};
use crate::models::{
    CoreError, CoreErrorKind, DiscoveryJobId, DiscoveryJobState, DiscoveryJobStatus,
    DuplicateCheck, Opportunity, PluginConfig, PluginPriority,
};
use crate::persistence::{
    ConfigManager, DiscoveryJobStore, MigrationStore, OpportunityRepository, PersistenceResult,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "sentinel_schema_migrations";

/// SQLite-backed implementation of every storage collaborator. Each call
/// opens its own connection, so one store can be shared across threads.
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    pub fn count_opportunities(&self) -> PersistenceResult<usize> {
        self.with_connection("count_opportunities", |connection| {
            ensure_schema_ready(connection)?;
            let count: i64 =
                connection.query_row("SELECT COUNT(*) FROM opportunities", [], |row| row.get(0))?;
            usize::try_from(count).map_err(|_| storage_error_sqlite("negative row count"))
        })
    }

    /// Stored opportunities, most recently discovered first.
    pub fn list_opportunities(&self, limit: usize) -> PersistenceResult<Vec<Opportunity>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_opportunities", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT payload_json
FROM opportunities
ORDER BY discovered_at_unix DESC, opportunity_id DESC
LIMIT ?1
",
            )?;
            let rows = statement.query_map(params![to_i64(limit)?], |row| {
                let payload: String = row.get(0)?;
                from_json(&payload)
            })?;
            rows.collect()
        })
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Recorded versions with missing tables are repaired by
                // replaying the idempotent DDL.
                for version in 1..=target_version {
                    connection.execute_batch(known_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, known_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, known_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl ConfigManager for SqliteStore {
    fn initialize(&self) -> PersistenceResult<()> {
        self.migrate_to_latest()
    }

    fn get_source_config(&self, name: &str) -> PersistenceResult<Option<PluginConfig>> {
        self.with_connection("get_source_config", |connection| {
            ensure_schema_ready(connection)?;
            let raw: Option<String> = connection
                .query_row(
                    "SELECT config_json FROM source_configs WHERE source_name = ?1",
                    [name],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| from_json(&raw)).transpose()
        })
    }

    fn update_source_config(&self, name: &str, config: &PluginConfig) -> PersistenceResult<()> {
        self.with_connection("update_source_config", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO source_configs (source_name, enabled, priority, config_json, updated_at_unix)
VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now'))
ON CONFLICT(source_name) DO UPDATE SET
    enabled = excluded.enabled,
    priority = excluded.priority,
    config_json = excluded.config_json,
    updated_at_unix = excluded.updated_at_unix
",
                params![
                    name,
                    bool_to_sqlite(config.enabled),
                    plugin_priority_to_str(config.priority),
                    to_json(config)?,
                ],
            )?;
            Ok(())
        })
    }
}

impl OpportunityRepository for SqliteStore {
    fn initialize(&self) -> PersistenceResult<()> {
        self.migrate_to_latest()
    }

    fn create(&self, opportunity: &Opportunity) -> PersistenceResult<()> {
        self.with_connection("create_opportunity", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO opportunities (
    dedup_key, title, url, organization, opportunity_type, source, payload_json, discovered_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
",
                params![
                    dedup_key(opportunity),
                    opportunity.title,
                    opportunity.url,
                    opportunity.organization,
                    opportunity.opportunity_type.as_str(),
                    opportunity.source,
                    to_json(opportunity)?,
                    to_unix_seconds(opportunity.discovered_at)?,
                ],
            )?;
            Ok(())
        })
    }
}

impl DeduplicationService for SqliteStore {
    fn initialize(&self) -> DiscoveryResult<()> {
        self.migrate_to_latest()
    }

    /// A key is a duplicate once an opportunity with it has been stored.
    fn check_duplicate(&self, opportunity: &Opportunity) -> DiscoveryResult<DuplicateCheck> {
        let key = dedup_key(opportunity);
        self.with_connection("check_duplicate", |connection| {
            ensure_schema_ready(connection)?;
            let exists: i64 = connection.query_row(
                "SELECT EXISTS(SELECT 1 FROM opportunities WHERE dedup_key = ?1)",
                [key.as_str()],
                |row| row.get(0),
            )?;
            Ok(DuplicateCheck {
                is_duplicate: sqlite_to_bool(exists),
                dedup_key: key,
            })
        })
    }
}

impl DiscoveryJobStore for SqliteStore {
    fn initialize(&self) -> PersistenceResult<()> {
        self.migrate_to_latest()
    }

    fn record_job(&self, job: &DiscoveryJobStatus) -> PersistenceResult<()> {
        self.with_connection("record_job", |connection| {
            ensure_schema_ready(connection)?;
            let result_json = job.result.as_ref().map(to_json).transpose()?;
            connection.execute(
                "
INSERT INTO discovery_jobs (
    job_id, discoverer, status, progress, error, result_json, metadata_json,
    created_at_unix_ms, start_time_unix_ms, end_time_unix_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(job_id, created_at_unix_ms) DO UPDATE SET
    discoverer = excluded.discoverer,
    status = excluded.status,
    progress = excluded.progress,
    error = excluded.error,
    result_json = excluded.result_json,
    metadata_json = excluded.metadata_json,
    start_time_unix_ms = excluded.start_time_unix_ms,
    end_time_unix_ms = excluded.end_time_unix_ms
",
                params![
                    job_id_to_i64(job.id)?,
                    job.discoverer,
                    job.status.as_str(),
                    i64::from(job.progress),
                    job.error,
                    result_json,
                    to_json(&job.metadata)?,
                    to_unix_millis(job.created_at)?,
                    job.start_time.map(to_unix_millis).transpose()?,
                    job.end_time.map(to_unix_millis).transpose()?,
                ],
            )?;
            Ok(())
        })
    }

    fn list_recent_jobs(&self, limit: usize) -> PersistenceResult<Vec<DiscoveryJobStatus>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.with_connection("list_recent_jobs", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT job_id, discoverer, status, progress, error, result_json, metadata_json,
       created_at_unix_ms, start_time_unix_ms, end_time_unix_ms
FROM discovery_jobs
ORDER BY created_at_unix_ms DESC, record_id DESC
LIMIT ?1
",
            )?;
            let rows = statement.query_map(params![to_i64(limit)?], |row| {
                let job_id_raw: i64 = row.get(0)?;
                let discoverer: String = row.get(1)?;
                let status_raw: String = row.get(2)?;
                let progress_raw: i64 = row.get(3)?;
                let error: Option<String> = row.get(4)?;
                let result_raw: Option<String> = row.get(5)?;
                let metadata_raw: Option<String> = row.get(6)?;
                let created_at_raw: i64 = row.get(7)?;
                let start_time_raw: Option<i64> = row.get(8)?;
                let end_time_raw: Option<i64> = row.get(9)?;

                Ok(DiscoveryJobStatus {
                    id: DiscoveryJobId(i64_to_u64(job_id_raw)?),
                    discoverer,
                    status: parse_job_state(&status_raw)?,
                    created_at: from_unix_millis(created_at_raw)?,
                    start_time: start_time_raw.map(from_unix_millis).transpose()?,
                    end_time: end_time_raw.map(from_unix_millis).transpose()?,
                    progress: u8::try_from(progress_raw.clamp(0, 100)).unwrap_or(100),
                    error,
                    result: result_raw.as_deref().map(from_json).transpose()?,
                    metadata: match metadata_raw.as_deref() {
                        Some(raw) => from_json(raw)?,
                        None => serde_json::Value::Null,
                    },
                })
            })?;

            rows.collect()
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before storage operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn known_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    tracing::debug!(
        version = migration.version,
        name = migration.name,
        "applied sqlite migration"
    );
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn plugin_priority_to_str(value: PluginPriority) -> &'static str {
    match value {
        PluginPriority::Low => "low",
        PluginPriority::Medium => "medium",
        PluginPriority::High => "high",
    }
}

fn parse_job_state(raw: &str) -> rusqlite::Result<DiscoveryJobState> {
    raw.parse::<DiscoveryJobState>().map_err(|()| {
        storage_error_sqlite(&format!(
            "unknown discovery job status '{raw}' in sqlite record"
        ))
    })
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|error| storage_error_sqlite(&format!("invalid json in sqlite record: {error}")))
}

fn bool_to_sqlite(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

fn sqlite_to_bool(value: i64) -> bool {
    value != 0
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp milliseconds exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn job_id_to_i64(value: DiscoveryJobId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("job id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative job id in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
    .with_operation(operation)
}

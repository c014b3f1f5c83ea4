use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sentinel_core::discovery::{DeduplicationService, SentinelCollaborators, SentinelConfig, SentinelService};
use sentinel_core::models::{
    CoreErrorKind, DiscoveryContext, DiscoveryJobId, DiscoveryJobState, DiscoveryJobStatus,
    Opportunity, OpportunityType, PluginConfig, PluginPriority,
};
use sentinel_core::persistence::{
    ConfigManager, DiscoveryJobStore, MigrationStore, OpportunityRepository,
};
use sentinel_core::sqlite::{SqliteStore, current_schema_version};
use serde_json::json;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be after epoch")
        .as_nanos();
    std::env::temp_dir()
        .join("sentinel-core-tests")
        .join(format!("{test_name}-{}-{nanos}.sqlite3", std::process::id()))
}

fn migrated_store(test_name: &str) -> SqliteStore {
    let store = SqliteStore::new(test_db_path(test_name));
    store.migrate_to_latest().expect("migrations should apply");
    store
}

fn job_record(id: u64, status: DiscoveryJobState, created_at: SystemTime) -> DiscoveryJobStatus {
    DiscoveryJobStatus {
        id: DiscoveryJobId(id),
        discoverer: "grants-gov".to_string(),
        status,
        created_at,
        start_time: Some(created_at),
        end_time: Some(created_at + Duration::from_millis(250)),
        progress: 100,
        error: None,
        result: Some(json!({ "opportunities": 2 })),
        metadata: json!({ "trigger": "schedule" }),
    }
}

#[test]
fn migrations_apply_and_roll_back() {
    let store = SqliteStore::new(test_db_path("migrations"));
    assert_eq!(store.current_version().unwrap(), 0);
    assert_eq!(store.planned_migrations(0).len() as i64, current_schema_version());

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.planned_migrations(current_schema_version()).is_empty());

    store.migrate_to_latest().unwrap();
    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);

    let error = store.apply_migration(current_schema_version() + 1).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
}

#[test]
fn migrating_again_recreates_missing_tables() {
    let store = migrated_store("repair");
    let connection = rusqlite::Connection::open(store.database_path()).unwrap();
    connection
        .execute_batch("DROP TABLE source_configs;")
        .unwrap();
    drop(connection);

    assert!(store.get_source_config("linkedin").is_err());

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    store
        .update_source_config("linkedin", &PluginConfig::default())
        .unwrap();
    assert_eq!(
        store.get_source_config("linkedin").unwrap(),
        Some(PluginConfig::default())
    );
}

#[test]
fn storage_calls_fail_before_migration() {
    let store = SqliteStore::new(test_db_path("unmigrated"));
    let error = store.get_source_config("anything").unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert_eq!(error.operation.as_deref(), Some("get_source_config"));
}

#[test]
fn source_configs_round_trip_and_update() {
    let store = migrated_store("configs");
    assert_eq!(store.get_source_config("linkedin").unwrap(), None);

    let mut config = PluginConfig {
        enabled: true,
        priority: PluginPriority::High,
        rate_limit_per_minute: 12,
        timeout: Duration::from_millis(4500),
        retry_attempts: 2,
        settings: json!({ "keywords": ["residency", "grant"] }),
    };
    store.update_source_config("linkedin", &config).unwrap();
    assert_eq!(store.get_source_config("linkedin").unwrap(), Some(config.clone()));

    config.enabled = false;
    store.update_source_config("linkedin", &config).unwrap();
    assert_eq!(
        store.get_source_config("linkedin").unwrap().map(|c| c.enabled),
        Some(false)
    );
}

#[test]
fn opportunities_are_deduplicated_by_key() {
    let store = migrated_store("opportunities");
    let first = Opportunity::new("Open call", OpportunityType::Residency, "source-a")
        .with_url("https://www.example.org/calls/open/")
        .with_organization("Example Foundation");
    let mirror = Opportunity::new("Open call (mirror)", OpportunityType::Residency, "source-b")
        .with_url("https://example.org/calls/open?utm_campaign=spring");

    assert!(!store.check_duplicate(&first).unwrap().is_duplicate);
    store.create(&first).unwrap();

    let check = store.check_duplicate(&mirror).unwrap();
    assert!(check.is_duplicate);
    assert_eq!(check.dedup_key, "url:example.org/calls/open");

    let error = store.create(&mirror).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    assert_eq!(store.count_opportunities().unwrap(), 1);
    let listed = store.list_opportunities(10).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "Open call");
    assert_eq!(listed[0].organization.as_deref(), Some("Example Foundation"));
}

#[test]
fn discovery_jobs_are_upserted_and_listed_newest_first() {
    let store = migrated_store("jobs");
    let older = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
    let newer = older + Duration::from_secs(60);

    let mut first = job_record(1, DiscoveryJobState::Completed, older);
    store.record_job(&first).unwrap();
    store
        .record_job(&job_record(2, DiscoveryJobState::Cancelled, newer))
        .unwrap();

    first.status = DiscoveryJobState::Failed;
    first.error = Some("HTTP 500".to_string());
    first.result = None;
    store.record_job(&first).unwrap();

    let jobs = store.list_recent_jobs(10).unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, DiscoveryJobId(2));
    assert_eq!(jobs[1], first);
    assert_eq!(jobs[1].execution_time(), Some(Duration::from_millis(250)));

    assert_eq!(store.list_recent_jobs(1).unwrap().len(), 1);
    assert!(store.list_recent_jobs(0).unwrap().is_empty());
}

#[tokio::test]
async fn sentinel_service_runs_against_sqlite() {
    use async_trait::async_trait;
    use sentinel_core::discovery::{Discoverer, DiscoveryResult};
    use sentinel_core::models::{DiscoveryOutput, SourceType};

    struct FixedDiscoverer;

    #[async_trait]
    impl Discoverer for FixedDiscoverer {
        fn name(&self) -> &str {
            "fixed"
        }

        fn source_type(&self) -> SourceType {
            SourceType::Rss
        }

        async fn discover(&self, _context: &DiscoveryContext) -> DiscoveryResult<DiscoveryOutput> {
            Ok(DiscoveryOutput {
                opportunities: vec![
                    Opportunity::new("Fellowship", OpportunityType::Fellowship, "fixed")
                        .with_url("https://fellowships.example.org/2026"),
                ],
                ..DiscoveryOutput::default()
            })
        }
    }

    let store = Arc::new(SqliteStore::new(test_db_path("service")));
    let service = SentinelService::new(
        SentinelConfig::default(),
        SentinelCollaborators {
            config_manager: store.clone(),
            repository: store.clone(),
            deduplication: store.clone(),
            job_store: Some(store.clone()),
        },
    );
    service.initialize().await.unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    let config = PluginConfig {
        enabled: true,
        retry_attempts: 1,
        ..PluginConfig::default()
    };
    ConfigManager::update_source_config(store.as_ref(), "fixed", &config).unwrap();
    service.register_discoverer(Arc::new(FixedDiscoverer)).await.unwrap();

    let first = service.run_discovery(DiscoveryContext::default()).await.unwrap();
    assert_eq!(first.new_opportunities, 1);

    let second = service.run_discovery(DiscoveryContext::default()).await.unwrap();
    assert_eq!(second.new_opportunities, 0);
    assert_eq!(second.duplicates_removed, 1);

    assert_eq!(store.count_opportunities().unwrap(), 1);
    let jobs = store.list_recent_jobs(10).unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|job| job.status == DiscoveryJobState::Completed));
}

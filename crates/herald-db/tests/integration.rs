//! Offline tests for herald-db pool configuration and row conversion.
//! These tests do not require a live database connection.

use chrono::{NaiveDate, TimeZone, Utc};
use herald_core::{
    AppConfig, Delivery, DeliveryStatus, Environment, GenerationJob, JobStatus, ProcessRole,
};
use herald_db::{DbError, DeliveryRow, GenerationJobRow, PoolConfig, RecipientRow};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

fn app_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://example".to_string(),
        env: Environment::Test,
        bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000),
        log_level: "info".to_string(),
        role: ProcessRole::All,
        db_max_connections: 42,
        db_min_connections: 7,
        db_acquire_timeout_secs: 9,
        scheduler_tick_secs: 60,
        generation_workers: 2,
        delivery_concurrency: 4,
        worker_poll_min_ms: 500,
        worker_poll_max_ms: 30_000,
        generation_timeout_secs: 600,
        send_timeout_secs: 60,
        job_max_retries: 3,
        delivery_max_retries: 3,
        retry_backoff_secs: vec![30, 120, 600],
        stale_job_after_secs: 1200,
        stale_delivery_after_secs: 300,
        generation_lead_minutes: 30,
        generation_window_minutes: 60,
        generator_url: None,
        sender_url: None,
        api_keys: Vec::new(),
        api_rate_limit: 120,
        api_rate_window_secs: 60,
    }
}

fn job_row(status: &str) -> GenerationJobRow {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    GenerationJobRow {
        id: Uuid::new_v4(),
        recipient_id: Uuid::new_v4(),
        spec: serde_json::json!({"genre": "noir"}),
        status: status.to_string(),
        claimed_by: Some("worker-1".to_string()),
        claimed_at: Some(now),
        retry_count: 1,
        max_retries: 3,
        not_before: None,
        error_message: None,
        artifact_ref: None,
        scheduling_period: NaiveDate::from_ymd_opt(2026, 3, 1),
        immediate_delivery: false,
        created_at: now,
        started_at: Some(now),
        completed_at: None,
        updated_at: now,
    }
}

#[test]
fn pool_config_from_app_config_uses_core_values() {
    let pool_config = PoolConfig::from_app_config(&app_config());
    assert_eq!(pool_config.max_connections, 42);
    assert_eq!(pool_config.min_connections, 7);
    assert_eq!(pool_config.acquire_timeout_secs, 9);
}

#[test]
fn job_row_converts_to_domain_type() {
    let row = job_row("running");
    let id = row.id;
    let job = GenerationJob::try_from(row).expect("valid row");
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.is_held_by("worker-1"));
    assert_eq!(job.retry_count, 1);
}

#[test]
fn job_row_with_unknown_status_is_corrupt() {
    let err = GenerationJob::try_from(job_row("paused")).unwrap_err();
    assert!(
        matches!(err, DbError::Corrupt(ref m) if m.contains("paused")),
        "got {err:?}"
    );
}

#[test]
fn delivery_row_converts_to_domain_type() {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let row = DeliveryRow {
        id: Uuid::new_v4(),
        artifact_ref: "art-7".to_string(),
        recipient_id: Uuid::new_v4(),
        job_id: Some(Uuid::new_v4()),
        deliver_at: now,
        status: "sent".to_string(),
        claimed_by: None,
        claimed_at: None,
        retry_count: 0,
        max_retries: 3,
        not_before: None,
        sent_at: Some(now),
        provider_receipt_id: Some("rcpt-1".to_string()),
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    let delivery = Delivery::try_from(row).expect("valid row");
    assert_eq!(delivery.status, DeliveryStatus::Sent);
    assert_eq!(delivery.provider_receipt_id.as_deref(), Some("rcpt-1"));
}

#[test]
fn recipient_row_preference_applies_fallbacks() {
    let now = Utc::now();
    let row = RecipientRow {
        id: Uuid::new_v4(),
        delivery_time: "not a time".to_string(),
        timezone: "Nowhere/Special".to_string(),
        spec: serde_json::json!({}),
        is_active: true,
        last_generated_at: None,
        created_at: now,
        updated_at: now,
    };
    let pref = row.preference();
    assert_eq!(pref.delivery_time.to_string(), "08:00:00");
    assert_eq!(pref.timezone.name(), "UTC");
}

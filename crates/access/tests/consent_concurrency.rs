//! Concurrent consent capture must leave exactly one active record, on both backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clinic_access::{AccessContext, AccessCore, AccessStore, MemoryStore, SqliteStore};
use clinic_core::config::AccessConfig;
use clinic_core::error::ClinicError;
use clinic_core::types::{
    CaptureContext, ConsentClauses, ConsentStatus, PatientId, Tenant, TenantId,
};

const WRITERS: usize = 16;

async fn concurrent_submits<S: AccessStore + 'static>(store: Arc<S>) {
    let core = Arc::new(AccessCore::new(
        store,
        &AccessConfig::default(),
        Duration::from_secs(10),
    ));
    let tenant = TenantId::parse("clinic-1").unwrap();
    let patient = PatientId::parse("patient-1").unwrap();
    core.upsert_tenant(Tenant::new(tenant.clone(), "Clinic"), None, &AccessContext::default())
        .await
        .unwrap();
    core.submit_consent(&tenant, &patient, ConsentClauses::mandatory(), "sig-0", &CaptureContext::default())
        .await
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let core = core.clone();
        let (tenant, patient, done) = (tenant.clone(), patient.clone(), done.clone());
        tokio::spawn(async move {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) {
                assert!(core.is_consent_valid(&tenant, &patient).await.unwrap());
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    let mut writers = Vec::new();
    for i in 0..WRITERS {
        let core = core.clone();
        let (tenant, patient) = (tenant.clone(), patient.clone());
        writers.push(tokio::spawn(async move {
            core.submit_consent(
                &tenant,
                &patient,
                ConsentClauses::mandatory(),
                &format!("sig-{}", i + 1),
                &CaptureContext::default(),
            )
            .await
        }));
    }

    let mut succeeded = 0;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(ClinicError::ConcurrentModification(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    done.store(true, Ordering::SeqCst);
    reader.await.unwrap();

    assert!(succeeded >= 1);
    let history = core.consent_history(&tenant, &patient).await.unwrap();
    assert_eq!(history.len(), succeeded + 1);
    assert_eq!(
        history.iter().filter(|r| r.status == ConsentStatus::Active).count(),
        1
    );
    assert_eq!(history[0].status, ConsentStatus::Active);
    assert!(core.is_consent_valid(&tenant, &patient).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_keeps_one_active_consent() {
    concurrent_submits(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_keeps_one_active_consent() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open_path(dir.path().join("consent.db"), 8, Duration::from_secs(5)).unwrap();
    concurrent_submits(Arc::new(store)).await;
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gate.db");
    let tenant = TenantId::parse("clinic-1").unwrap();
    let patient = PatientId::parse("patient-1").unwrap();
    {
        let store = Arc::new(SqliteStore::open_path(&path, 2, Duration::from_secs(2)).unwrap());
        let core = AccessCore::new(store.clone(), &AccessConfig::default(), Duration::from_secs(2));
        core.submit_consent(&tenant, &patient, ConsentClauses::mandatory(), "sig", &CaptureContext::default())
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = Arc::new(SqliteStore::open_path(&path, 2, Duration::from_secs(2)).unwrap());
    let core = AccessCore::new(store, &AccessConfig::default(), Duration::from_secs(2));
    assert!(core.is_consent_valid(&tenant, &patient).await.unwrap());
    let verification = core.verify_audit_chain().await.unwrap();
    assert_eq!(verification.total_events, 1);
    assert!(verification.chain_intact);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_submit_that_times_out_leaves_no_consent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gate.db");
    let store = Arc::new(SqliteStore::open_path(&path, 4, Duration::from_secs(2)).unwrap());
    let core = AccessCore::new(store, &AccessConfig::default(), Duration::from_millis(100));
    let tenant = TenantId::parse("clinic-1").unwrap();
    let patient = PatientId::parse("patient-1").unwrap();

    let locker = rusqlite::Connection::open(&path).unwrap();
    locker.execute_batch("BEGIN IMMEDIATE").unwrap();
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(400));
        locker.execute_batch("COMMIT").unwrap();
    });

    let submitted = core
        .submit_consent(&tenant, &patient, ConsentClauses::mandatory(), "sig", &CaptureContext::default())
        .await;
    assert!(matches!(submitted, Err(ClinicError::StorageUnavailable(_))));

    tokio::task::spawn_blocking(move || holder.join().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!core.is_consent_valid(&tenant, &patient).await.unwrap());
    assert!(core.consent_history(&tenant, &patient).await.unwrap().is_empty());
}

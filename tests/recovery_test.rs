//! Durability and pacing of the job queues.

mod common;

use common::{t, Harness};
use marker_window_agent::queue::ANALYZER_PACING;
use marker_window_agent::store::{HistoryRepository, JobRepository, WindowRepository};
use marker_window_agent::{
    EngineSettings, JobKind, JobStatus, Marker, Measurement, MemoryStore, Period, Window, WindowStats,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_job_interrupted_mid_flight_is_resumed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let marker = Marker::new(t(0), "pasta");

    let job_id = {
        let store = Arc::new(MemoryStore::open(&path).await.unwrap());
        let h = Harness::with_store(store, EngineSettings::default());
        h.engine.insert_marker(marker.clone()).await.unwrap();
        let report = h
            .engine
            .ingest_measurements(vec![
                Measurement::new(t(15), 150.0),
                Measurement::new(t(45), 190.0),
            ])
            .await
            .unwrap();
        assert_eq!(report.scheduled, 1);

        // Simulate a crash while the analyzer call was in flight.
        let mut job = h
            .store
            .list_jobs(JobKind::WindowAnalysis, &[JobStatus::Pending])
            .await
            .unwrap()
            .remove(0);
        job.start(t(1));
        h.store.update_job(job.clone()).await.unwrap();
        job.id
    };

    let store = Arc::new(MemoryStore::open(&path).await.unwrap());
    assert_eq!(
        store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Processing
    );

    let mut h = Harness::with_store(store, EngineSettings::default());
    let cancel = CancellationToken::new();
    let handles = h.start(&cancel);
    h.settle(JobKind::WindowAnalysis).await;

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(h.store.list_history(marker.id).await.unwrap().len(), 1);
    assert_eq!(h.analyzer.contexts().len(), 1);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_calls_are_spaced_by_pacing_delay() {
    let mut h = Harness::new();
    for offset in [0, 600, 1200] {
        let marker = Marker::new(t(offset), "meal");
        h.engine.insert_marker(marker).await.unwrap();
        h.engine
            .ingest_measurements(vec![Measurement::new(t(offset + 30), 130.0)])
            .await
            .unwrap();
    }
    assert_eq!(
        h.store
            .list_jobs(JobKind::WindowAnalysis, &[JobStatus::Pending])
            .await
            .unwrap()
            .len(),
        3
    );

    let cancel = CancellationToken::new();
    let handles = h.start(&cancel);
    h.settle(JobKind::WindowAnalysis).await;

    let times = h.analyzer.call_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= ANALYZER_PACING);
    }

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_window_without_marker_stops_the_worker() {
    let mut h = Harness::new();
    let ghost = Marker::new(t(0), "never stored");
    let stats = WindowStats {
        count: 1,
        ..WindowStats::default()
    };
    h.store
        .upsert_window(Window::new(&ghost, Period::new(t(-180), t(240)), stats))
        .await
        .unwrap();

    let job_id = h
        .engine
        .request_window_analysis(ghost.id, None)
        .await
        .unwrap();
    assert!(h
        .engine
        .request_window_analysis(uuid::Uuid::new_v4(), None)
        .await
        .is_err());

    let cancel = CancellationToken::new();
    let mut handles = h.start(&cancel);
    let window_worker = handles.remove(0);
    let err = window_worker.await.unwrap().unwrap_err();
    assert!(err.is_fatal());

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(h.analyzer.contexts().is_empty());

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

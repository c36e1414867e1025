mod common;

use common::{batch, catalog, client, processor, songs, RecordingSink};
use enrich::resilience::{CircuitBreaker, CircuitBreakerConfig};
use enrich::store::{Checkpoint, CheckpointStore, MemorySink, Sink};
use enrich::upstream::{FixtureTransport, Outcome};
use enrich::{RunState, ShardSpec, ShutdownSignal};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn rerunning_a_range_writes_each_item_once() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=20)));
    let sink = Arc::new(RecordingSink::new(Arc::clone(&memory)));
    let transport = Arc::new(FixtureTransport::new(catalog(1..=20)));
    let shard = ShardSpec::new(0, 1, 20).unwrap();

    let first = processor(client(transport.clone()), sink.clone(), dir.path(), shard, batch(5, 3))
        .run()
        .await
        .unwrap();
    assert_eq!(first.state, RunState::Completed);
    assert_eq!(first.completed, 20);

    // Lose the checkpoint: the sink alone must prevent duplicate writes.
    std::fs::remove_file(CheckpointStore::for_shard(dir.path(), 0).path()).unwrap();
    let second = processor(client(transport.clone()), sink.clone(), dir.path(), shard, batch(5, 3))
        .run()
        .await
        .unwrap();
    assert_eq!(second.state, RunState::Completed);

    assert_eq!(sink.inserted(), 20);
    assert_eq!(memory.result_count().unwrap(), 20);
    assert_eq!(
        memory.tags_for(7).await.unwrap(),
        BTreeSet::from(["genre-2".to_string(), "rock".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn resume_never_touches_settled_ids() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=20)));
    let transport = Arc::new(FixtureTransport::new(catalog(1..=20)));
    let shard = ShardSpec::new(0, 1, 20).unwrap();

    let mut checkpoint = Checkpoint::new(1).for_shard(0, 1, 20);
    checkpoint.completed_ids.extend(1..=5);
    checkpoint.failed_ids.extend([6, 7]);
    CheckpointStore::for_shard(dir.path(), 0).save(&checkpoint).unwrap();

    let summary = processor(client(transport.clone()), memory.clone(), dir.path(), shard, batch(10, 2))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.state, RunState::Completed);

    for id in 1..=7 {
        assert_eq!(transport.calls(&format!("search:Song {id}")), 0, "id {id} was searched");
    }
    for id in 8..=20 {
        assert_eq!(transport.calls(&format!("search:Song {id}")), 1);
    }
    assert_eq!(memory.result_count().unwrap(), 13);
    assert_eq!(summary.completed, 18);
    assert_eq!(summary.failed, 2);
}

#[tokio::test(start_paused = true)]
async fn window_dispatches_only_unclassified_items() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=100)));
    for id in (1..=100).filter(|id| id % 5 < 2) {
        memory.seed_result(id, ["seeded".to_string()]).unwrap();
    }
    let transport = Arc::new(FixtureTransport::new(catalog(1..=100)));
    let shard = ShardSpec::new(0, 1, 100).unwrap();

    let client = client(transport.clone());
    let stats = Arc::clone(client.stats());
    let summary = processor(client, memory.clone(), dir.path(), shard, batch(100, 4))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.windows, 1);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.items_skipped, 40);
    assert_eq!(snapshot.items_completed + snapshot.items_failed, 60);

    let searched = (1..=100)
        .filter(|id| transport.calls(&format!("search:Song {id}")) > 0)
        .count();
    assert_eq!(searched, 60);
    // Seeded items keep their original tags.
    assert_eq!(
        memory.tags_for(5).await.unwrap(),
        BTreeSet::from(["seeded".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_resumes_from_boundary() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=40)));
    let transport =
        Arc::new(FixtureTransport::new(catalog(1..=40)).with_latency(Duration::from_secs(1)));
    let shard = ShardSpec::new(2, 1, 40).unwrap();

    let (trigger, signal) = ShutdownSignal::manual();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        trigger.trigger();
    });

    let first_sink = Arc::new(RecordingSink::new(Arc::clone(&memory)));
    let first = processor(client(transport.clone()), first_sink.clone(), dir.path(), shard, batch(5, 2))
        .with_shutdown(signal)
        .run()
        .await
        .unwrap();
    assert_eq!(first.state, RunState::Interrupted);
    assert!(first.boundary_id <= 40);

    let saved = CheckpointStore::for_shard(dir.path(), 2).load().unwrap().unwrap();
    assert_eq!(saved.boundary_id, first.boundary_id);
    assert_eq!(saved.process_id, Some(2));

    let second_sink = Arc::new(RecordingSink::new(Arc::clone(&memory)));
    let second = processor(client(transport.clone()), second_sink.clone(), dir.path(), shard, batch(5, 2))
        .run()
        .await
        .unwrap();
    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.boundary_id, 41);

    let windows = second_sink.windows();
    assert!(!windows.is_empty());
    assert!(windows.iter().all(|w| *w.start() >= first.boundary_id), "{windows:?}");

    assert_eq!(memory.result_count().unwrap(), 40);
    assert_eq!(first_sink.inserted() + second_sink.inserted(), 40);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=10)));
    let transport = Arc::new(
        FixtureTransport::new(catalog(1..=10)).with_fallback(Outcome::Unauthorized { status: 401 }),
    );
    let shard = ShardSpec::new(0, 1, 10).unwrap();

    let err = processor(client(transport.clone()), memory.clone(), dir.path(), shard, batch(5, 2))
        .run()
        .await
        .unwrap_err();
    assert!(err.is_auth());
    assert_eq!(memory.result_count().unwrap(), 0);

    let saved = CheckpointStore::for_shard(dir.path(), 0).load().unwrap().unwrap();
    assert_eq!(saved.boundary_id, 1);
    assert!(saved.failed_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn open_circuit_fails_items_then_next_window_waits_for_recovery() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=6)));
    let transport = Arc::new(
        FixtureTransport::new(catalog(1..=6))
            .script("search:Song 1", vec![Outcome::ServerError { status: 503 }; 3]),
    );
    let breaker = Arc::new(CircuitBreaker::new(
        "integration",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(1)
            .with_reset_timeout(Duration::from_secs(30)),
    ));
    let shard = ShardSpec::new(0, 1, 6).unwrap();

    let started = Instant::now();
    let summary = processor(
        client(transport.clone()).with_breaker(Arc::clone(&breaker)),
        memory.clone(),
        dir.path(),
        shard,
        batch(3, 1),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert!(started.elapsed() >= Duration::from_secs(30));
    // The first window hit the open breaker; the second ran after the cooldown.
    let saved = CheckpointStore::for_shard(dir.path(), 0).load().unwrap().unwrap();
    assert_eq!(saved.failed_ids, BTreeSet::from([1, 2, 3]));
    assert_eq!(saved.completed_ids, BTreeSet::from([4, 5, 6]));
    assert_eq!(memory.result_count().unwrap(), 3);
    assert_eq!(transport.calls("search:Song 2"), 0);
    assert_eq!(breaker.snapshot().trips, 1);
}

#[cfg(feature = "backend-redb")]
#[tokio::test(start_paused = true)]
async fn runs_end_to_end_from_config() {
    use enrich::store::SinkConfig;
    use enrich::{CheckpointedBatchProcessor, EnrichConfig, EnrichContext};

    let dir = TempDir::new().unwrap();
    let config = EnrichConfig {
        state_dir: dir.path().join("state"),
        sink: SinkConfig::redb(dir.path().join("catalog.redb")),
        batch: batch(4, 2),
        ..EnrichConfig::default()
    };
    let transport = Arc::new(FixtureTransport::new(catalog(1..=10)));

    let ctx = EnrichContext::from_config(&config, 5, transport).await.unwrap();
    assert_eq!(ctx.sink.import_items(songs(1..=10)).await.unwrap(), 10);
    ctx.client.probe().await.unwrap();

    let sink = Arc::clone(&ctx.sink);
    let summary = CheckpointedBatchProcessor::new(
        ctx,
        config.batch.clone(),
        ShardSpec::new(5, 1, 10).unwrap(),
        CheckpointStore::for_shard(&config.state_dir, 5),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.completed, 10);
    let progress = sink.progress(1..=10).await.unwrap();
    assert_eq!((progress.classified, progress.total), (10, 10));
    assert!(config.state_dir.join("hit_cache_5.json").exists());
    assert!(config.state_dir.join("checkpoint_5.json").exists());
}

#[tokio::test(start_paused = true)]
async fn overlapping_shards_share_the_sink_safely() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemorySink::with_items(songs(1..=30)));
    let sink = Arc::new(RecordingSink::new(Arc::clone(&memory)));
    let transport =
        Arc::new(FixtureTransport::new(catalog(1..=30)).with_latency(Duration::from_millis(200)));

    let a = processor(
        client(transport.clone()),
        sink.clone(),
        dir.path(),
        ShardSpec::new(0, 1, 30).unwrap(),
        batch(6, 3),
    );
    let b = processor(
        client(transport.clone()),
        sink.clone(),
        dir.path(),
        ShardSpec::new(1, 1, 30).unwrap(),
        batch(6, 3),
    );
    let (ra, rb) = tokio::join!(a.run(), b.run());
    assert_eq!(ra.unwrap().state, RunState::Completed);
    assert_eq!(rb.unwrap().state, RunState::Completed);

    assert_eq!(sink.inserted(), 30);
    assert_eq!(memory.result_count().unwrap(), 30);
}

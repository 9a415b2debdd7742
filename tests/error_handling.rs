//! Failure and shutdown paths of the feed.

use chronicle_feed::{
    pump, Broadcaster, CancellationToken, ChangeFeedReader, FeedConfig, FeedError, FeedSupervisor,
    FileConnector, LineConnection, MemoryStore, NewRecord, OperationFilter, PollOutcome, PumpExit,
    Sequence,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn config(connection: &str, collection: &str) -> FeedConfig {
    FeedConfig {
        connection: connection.to_string(),
        collection: collection.to_string(),
        retry_delay: Duration::from_millis(5),
        subscriber_capacity: 16,
    }
}

// --- Connection failures ---

#[test]
fn test_unreachable_store_fails_without_retry() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nowhere").to_string_lossy().to_string();

    let supervisor = FeedSupervisor::new(
        config(&missing, "posts"),
        Arc::new(FileConnector),
        Broadcaster::default(),
    );
    let errors = supervisor.errors();
    supervisor.start().unwrap();

    let outcome = supervisor.join().unwrap();
    assert!(matches!(outcome.error(), Some(FeedError::Connection(_))));

    let reported = errors.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(*reported, FeedError::Connection(_)));
    assert!(errors.try_recv().is_err());
    assert!(!supervisor.is_running());
}

#[test]
fn test_unknown_collection_reported() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let supervisor =
        FeedSupervisor::new(config("mem://blog", "missing"), store, Broadcaster::default());
    supervisor.start().unwrap();

    let outcome = supervisor.join().unwrap();
    assert!(matches!(
        outcome.error(),
        Some(FeedError::CollectionNotFound(name)) if name == "missing"
    ));
}

#[test]
fn test_invalid_config_rejected_at_start() {
    let mut bad = config("mem://blog", "posts");
    bad.collection.clear();
    let supervisor = FeedSupervisor::new(bad, Arc::new(MemoryStore::new()), Broadcaster::default());

    assert!(matches!(supervisor.start(), Err(FeedError::Config(_))));
    assert!(!supervisor.is_running());
}

#[test]
fn test_poll_failure_ends_run_and_releases_session() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let posts = store.collection("posts");
    let supervisor = FeedSupervisor::new(
        config("mem://blog", "posts"),
        store.clone(),
        Broadcaster::default(),
    );
    supervisor.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || posts.open_sessions() == 1));

    posts.fail_next_poll("connection reset");
    let outcome = supervisor.join().unwrap();

    assert!(matches!(outcome.error(), Some(FeedError::Connection(m)) if m == "connection reset"));
    assert_eq!(posts.open_sessions(), 0);
    // No silent reconnect.
    assert_eq!(posts.sessions_opened(), 1);
}

#[test]
fn test_truncated_history_invalidates_cursor() {
    init_tracing();
    let store = MemoryStore::new();
    let posts = store.collection("posts");
    let reader = ChangeFeedReader::new(Arc::new(posts.clone()), Duration::from_millis(5));
    let mut feed = reader
        .produce(OperationFilter::creates_only(), CancellationToken::new())
        .unwrap();

    for n in 1..=3 {
        posts
            .insert(NewRecord::new("Admin", format!("post {}", n)).with_content("body"))
            .unwrap();
    }
    posts.truncate_before(Sequence(3));

    match feed.next() {
        Some(Err(FeedError::CursorInvalidated { position, earliest })) => {
            assert_eq!(position, Sequence(1));
            assert_eq!(earliest, Sequence(3));
        }
        other => panic!("expected invalidated cursor, got {:?}", other.map(|r| r.map(|x| x.title))),
    }
    assert!(feed.next().is_none());
    assert_eq!(posts.open_sessions(), 0);
}

// --- Cancellation ---

#[test]
fn test_shared_shutdown_stops_feed_and_clients() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let posts = store.collection("posts");
    let broadcaster = Broadcaster::default();
    let shutdown = CancellationToken::new();

    let supervisor = FeedSupervisor::with_cancellation(
        config("mem://blog", "posts"),
        store.clone(),
        broadcaster.clone(),
        shutdown.clone(),
    );
    supervisor.start().unwrap();

    let client = {
        let subscription = broadcaster.subscribe();
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            let mut connection = LineConnection::new(Vec::new());
            let exit = pump(subscription, &mut connection, &shutdown).unwrap();
            (exit, connection.into_inner())
        })
    };

    assert!(wait_until(Duration::from_secs(5), || posts.open_sessions() == 1));
    posts
        .insert(NewRecord::new("Admin", "hello").with_content("world"))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || supervisor.forwarded() == 1));

    let started = Instant::now();
    shutdown.cancel();

    let outcome = supervisor.join().unwrap();
    assert!(outcome.is_cancelled());
    assert!(supervisor.errors().try_recv().is_err());
    assert_eq!(posts.open_sessions(), 0);

    let (exit, bytes) = client.join().unwrap();
    assert_eq!(exit, PumpExit::Cancelled);
    assert_eq!(broadcaster.subscriber_count(), 0);
    assert!(started.elapsed() < Duration::from_secs(2));

    let text = String::from_utf8(bytes).unwrap();
    let frame: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(frame["type"], "RecordCreated");
    assert_eq!(frame["record"]["title"], "hello");
}

#[test]
fn test_cancel_interrupts_long_backoff() {
    let store = MemoryStore::new();
    let posts = store.collection("posts");
    let reader = ChangeFeedReader::new(Arc::new(posts.clone()), Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let mut feed = reader
        .produce(OperationFilter::creates_only(), cancel.clone())
        .unwrap();

    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        })
    };

    let started = Instant::now();
    assert_eq!(feed.poll().unwrap(), PollOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!feed.is_open());
    assert_eq!(posts.open_sessions(), 0);
    canceller.join().unwrap();
}

#[test]
fn test_idle_feed_backs_off_between_polls() {
    let store = MemoryStore::new();
    let posts = store.collection("posts");
    let delay = Duration::from_millis(20);
    let reader = ChangeFeedReader::new(Arc::new(posts.clone()), delay);
    let mut feed = reader
        .produce(OperationFilter::creates_only(), CancellationToken::new())
        .unwrap();

    for _ in 0..3 {
        assert_eq!(feed.poll().unwrap(), PollOutcome::Idle);
    }

    let times = posts.poll_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= delay);
    }
    assert_eq!(feed.idle_polls(), 3);
}

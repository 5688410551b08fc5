use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bedrock::coordinator::{
    CommitLog, CommitState, Coordinator, CoordinatorConfig, LogEntry, Participant,
};
use bedrock::error::{BedrockError, Result};
use bedrock::lock::LockConfig;
use bedrock::rm::ResourceManager;
use bedrock::storage::StorageConfig;
use bedrock::types::{Resource, TxnId};
use tempfile::tempdir;

fn open_rm(name: &str, dir: &Path) -> Arc<ResourceManager> {
    Arc::new(
        ResourceManager::open(
            name,
            &dir.join(name),
            LockConfig {
                deadlock_timeout_ms: 500,
            },
            StorageConfig::small(),
        )
        .unwrap(),
    )
}

fn log_path(dir: &Path) -> std::path::PathBuf {
    dir.join("commit.log")
}

fn coordinator(dir: &Path, rms: &[&Arc<ResourceManager>]) -> Coordinator {
    let coord = Coordinator::new(CoordinatorConfig::responsive(log_path(dir))).unwrap();
    for rm in rms {
        coord.register(Arc::clone(*rm) as Arc<dyn Participant>).unwrap();
    }
    coord
}

fn participants(rms: &[&Arc<ResourceManager>]) -> Vec<Arc<dyn Participant>> {
    rms.iter()
        .map(|rm| Arc::clone(*rm) as Arc<dyn Participant>)
        .collect()
}

/// Delegates to a resource manager but refuses to prepare
struct Refusing {
    inner: Arc<ResourceManager>,
    prepares: AtomicUsize,
}

impl Participant for Refusing {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn prepare(&self, _txn: TxnId) -> Result<()> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        Err(BedrockError::Participant("disk full".into()))
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        self.inner.commit(txn)
    }

    fn abort(&self, txn: TxnId) -> Result<()> {
        self.inner.abort(txn)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_spans_two_stores() {
    let dir = tempdir().unwrap();
    let flights = open_rm("flights", dir.path());
    let cars = open_rm("cars", dir.path());
    let coord = coordinator(dir.path(), &[&flights, &cars]);
    coord.init().await.unwrap();

    let txn = TxnId::generate();
    flights.add(txn, "flight", "AC101", 100, 450).unwrap();
    cars.add(txn, "car", "YVR", 10, 60).unwrap();

    let mut handle = coord.commit(txn, participants(&[&flights, &cars])).await.unwrap();
    assert_eq!(handle.wait().await, CommitState::Done);

    let reader = TxnId::generate();
    assert_eq!(
        flights.query(reader, "flight", "AC101").unwrap(),
        Some(Resource::new("AC101", 100, 450))
    );
    assert_eq!(cars.query(reader, "car", "YVR").unwrap().unwrap().count, 10);
    flights.abort(reader).unwrap();
    cars.abort(reader).unwrap();

    // Locks went with the commit
    assert_eq!(flights.locks().resource_count(), 0);

    let entries = CommitLog::open(log_path(dir.path())).unwrap().load().unwrap();
    assert_eq!(
        entries,
        vec![LogEntry {
            txn,
            state: CommitState::Done,
            participants: vec!["flights".into(), "cars".into()],
        }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refused_prepare_rolls_back_every_store() {
    let dir = tempdir().unwrap();
    let flights = open_rm("flights", dir.path());
    let cars = open_rm("cars", dir.path());
    let coord = coordinator(dir.path(), &[&flights, &cars]);

    let setup = TxnId::generate();
    cars.add(setup, "car", "YVR", 10, 60).unwrap();
    let mut handle = coord.commit(setup, participants(&[&cars])).await.unwrap();
    assert_eq!(handle.wait().await, CommitState::Done);

    let txn = TxnId::generate();
    flights.add(txn, "flight", "AC101", 100, 450).unwrap();
    cars.reserve(txn, "car", "YVR", 3).unwrap();

    let refusing = Arc::new(Refusing {
        inner: Arc::clone(&cars),
        prepares: AtomicUsize::new(0),
    });
    let group = vec![
        Arc::clone(&flights) as Arc<dyn Participant>,
        Arc::clone(&refusing) as Arc<dyn Participant>,
    ];
    let mut handle = coord.commit(txn, group).await.unwrap();
    assert_eq!(handle.wait().await, CommitState::Rollbacked);
    assert_eq!(
        refusing.prepares.load(Ordering::SeqCst) as u32,
        1 + coord.config().max_prepare_retries
    );

    let reader = TxnId::generate();
    assert_eq!(flights.query(reader, "flight", "AC101").unwrap(), None);
    assert_eq!(cars.query(reader, "car", "YVR").unwrap().unwrap().count, 10);
    assert_eq!(flights.database().pending(txn), 0);
    assert_eq!(cars.database().pending(txn), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_restarted_before_prepare_aborts_everywhere() {
    let dir = tempdir().unwrap();
    let flights = open_rm("flights", dir.path());
    let txn = TxnId::generate();
    {
        let cars = open_rm("cars", dir.path());
        cars.add(txn, "car", "YVR", 10, 60).unwrap();
    }

    // The car store came back without the buffered write
    let cars = open_rm("cars", dir.path());
    flights.add(txn, "flight", "AC101", 5, 100).unwrap();
    let coord = coordinator(dir.path(), &[&flights, &cars]);
    let mut handle = coord.commit(txn, participants(&[&flights, &cars])).await.unwrap();
    assert_eq!(handle.wait().await, CommitState::Rollbacked);

    let reader = TxnId::generate();
    assert_eq!(flights.query(reader, "flight", "AC101").unwrap(), None);
    assert_eq!(cars.query(reader, "car", "YVR").unwrap(), None);
    assert!(flights.database().transactions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_after_prepared_commits_without_new_prepare() {
    let dir = tempdir().unwrap();
    let txn = TxnId::generate();
    {
        let flights = open_rm("flights", dir.path());
        let cars = open_rm("cars", dir.path());
        flights.add(txn, "flight", "AC101", 100, 450).unwrap();
        cars.add(txn, "car", "YVR", 10, 60).unwrap();
        flights.prepare(txn).unwrap();
        cars.prepare(txn).unwrap();

        // The coordinator died right after logging Prepared
        CommitLog::open(log_path(dir.path()))
            .unwrap()
            .flush_with(|| {
                vec![LogEntry {
                    txn,
                    state: CommitState::Prepared,
                    participants: vec!["flights".into(), "cars".into()],
                }]
            })
            .unwrap();
    }

    let flights = open_rm("flights", dir.path());
    let cars = open_rm("cars", dir.path());
    assert_eq!(flights.database().transactions(), vec![txn]);

    let coord = coordinator(dir.path(), &[&flights, &cars]);
    coord.init().await.unwrap();

    assert!(flights.database().transactions().is_empty());
    assert!(cars.database().transactions().is_empty());
    let reader = TxnId::generate();
    assert_eq!(flights.query(reader, "flight", "AC101").unwrap().unwrap().count, 100);
    assert_eq!(cars.query(reader, "car", "YVR").unwrap().unwrap().count, 10);

    let entries = CommitLog::open(log_path(dir.path())).unwrap().load().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, CommitState::Done);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_before_prepared_aborts() {
    let dir = tempdir().unwrap();
    let txn = TxnId::generate();
    {
        let flights = open_rm("flights", dir.path());
        flights.add(txn, "flight", "AC101", 100, 450).unwrap();
        flights.prepare(txn).unwrap();
        CommitLog::open(log_path(dir.path()))
            .unwrap()
            .flush_with(|| {
                vec![LogEntry {
                    txn,
                    state: CommitState::Committed,
                    participants: vec!["flights".into()],
                }]
            })
            .unwrap();
    }

    let flights = open_rm("flights", dir.path());
    let coord = coordinator(dir.path(), &[&flights]);
    coord.init().await.unwrap();

    assert!(flights.database().transactions().is_empty());
    assert_eq!(flights.query(TxnId::generate(), "flight", "AC101").unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_request_releases_locks() {
    let dir = tempdir().unwrap();
    let flights = open_rm("flights", dir.path());
    let coord = coordinator(dir.path(), &[&flights]);

    let txn = TxnId::generate();
    flights.add(txn, "flight", "AC101", 1, 1).unwrap();
    let mut handle = coord.abort(txn, participants(&[&flights])).await.unwrap();
    assert_eq!(handle.wait().await, CommitState::Rollbacked);

    let other = TxnId::generate();
    flights.add(other, "flight", "AC101", 5, 1).unwrap();
    assert_eq!(flights.query(other, "flight", "AC101").unwrap().unwrap().count, 5);
    flights.abort(other).unwrap();
}

//! Two-phase commit coordinator
//!
//! ## Protocol
//! 1. BEGIN: the transaction is logged as `Committed` (commit requested).
//! 2. PREPARE: fanned out to every participant in parallel. Once every participant
//!    has acknowledged, the log records `Prepared`.
//! 3. COMMIT: fanned out in parallel. Once every participant has acknowledged, the log
//!    records `Done`, the completion handle fires and the transaction leaves the
//!    active set.
//!
//! Each phase waits at most `step_timeout_ms` for its answers, then re-sends the phase
//! to the participants that have not acknowledged, after an exponential backoff.
//! Prepare gives up after `max_prepare_retries` retries and the transaction is
//! aborted. Commit and abort never give up: a prepared participant is obliged to
//! accept them eventually.
//!
//! ## Aggregate state
//! The transaction state is the minimum of the participants' last acknowledged states
//! (see [`state::aggregate`]).
//!
//! ## Recovery
//! [`Coordinator::init`] reads the commit log once. `Prepared` lines resume at the
//! commit phase; `Committed` lines (prepare outcome unknown) are aborted. Everything
//! else is already resolved and is dropped. New commit requests wait for recovery to
//! finish.
//!
//! ## Threading
//! Drivers are tokio tasks. Participant calls are blocking and run on the blocking
//! pool, reporting back over a channel.

pub mod log;
pub mod participant;
pub mod state;

pub use self::log::{CommitLog, LogEntry};
pub use participant::Participant;
pub use state::CommitState;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::Instant;

use crate::error::{BedrockError, Result};
use crate::types::TxnId;

/// Configuration for the commit coordinator.
///
/// # Presets
///
/// - [`CoordinatorConfig::default()`] - 5s step timeout, 3 prepare retries
/// - [`CoordinatorConfig::responsive()`] - short timeouts, for local participants
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Commit log location
    pub log_path: PathBuf,
    /// How long one phase waits for all participants before retrying (milliseconds)
    pub step_timeout_ms: u64,
    /// Prepare retries before the transaction is aborted
    pub max_prepare_retries: u32,
    /// First retry delay (milliseconds); doubles on every retry
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay (milliseconds)
    pub backoff_max_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./data/commit.log"),
            step_timeout_ms: 5_000,
            max_prepare_retries: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            ..Default::default()
        }
    }

    /// Short timeouts and backoff, for in-process participants
    pub fn responsive(log_path: PathBuf) -> Self {
        Self {
            log_path,
            step_timeout_ms: 200,
            max_prepare_retries: 2,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Prepare,
    Commit,
    Abort,
}

impl Phase {
    fn target(self) -> CommitState {
        match self {
            Phase::Prepare => CommitState::Prepared,
            Phase::Commit => CommitState::Done,
            Phase::Abort => CommitState::Rollbacked,
        }
    }

    fn invoke(self, participant: &dyn Participant, txn: TxnId) -> Result<()> {
        match self {
            Phase::Prepare => participant.prepare(txn),
            Phase::Commit => participant.commit(txn),
            Phase::Abort => participant.abort(txn),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Prepare => write!(f, "prepare"),
            Phase::Commit => write!(f, "commit"),
            Phase::Abort => write!(f, "abort"),
        }
    }
}

/// In-memory state of one active transaction
struct TxnRecord {
    participants: Vec<Arc<dyn Participant>>,
    /// Last acknowledged state per participant, same order as `participants`
    states: Vec<CommitState>,
    status: watch::Sender<CommitState>,
}

impl TxnRecord {
    fn new(participants: Vec<Arc<dyn Participant>>, initial: CommitState) -> Self {
        let states = vec![initial; participants.len()];
        let (status, _) = watch::channel(initial);
        Self {
            participants,
            states,
            status,
        }
    }

    fn aggregate(&self) -> CommitState {
        state::aggregate(&self.states)
    }

    fn log_entry(&self, txn: TxnId) -> LogEntry {
        LogEntry {
            txn,
            state: self.aggregate(),
            participants: self.participants.iter().map(|p| p.name()).collect(),
        }
    }

    fn handle(&self, txn: TxnId) -> CommitHandle {
        CommitHandle {
            txn,
            status: self.status.subscribe(),
        }
    }
}

/// Completion handle returned by [`Coordinator::commit`] and [`Coordinator::abort`]
#[derive(Clone)]
pub struct CommitHandle {
    txn: TxnId,
    status: watch::Receiver<CommitState>,
}

impl CommitHandle {
    /// A handle for a transaction that needed no work
    fn finished(txn: TxnId, state: CommitState) -> Self {
        let (_, status) = watch::channel(state);
        Self { txn, status }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Latest aggregate state, without waiting
    pub fn state(&self) -> CommitState {
        *self.status.borrow()
    }

    /// Wait until the transaction is Done or Rollbacked
    pub async fn wait(&mut self) -> CommitState {
        loop {
            let current = *self.status.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Option<CommitState> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

struct Shared {
    config: CoordinatorConfig,
    log: CommitLog,
    txns: Mutex<HashMap<TxnId, TxnRecord>>,
    /// Participants by name, for recovery
    directory: RwLock<HashMap<String, Arc<dyn Participant>>>,
    /// Recovered lines whose participants are unknown; kept in the log verbatim
    orphans: Mutex<Vec<LogEntry>>,
    recovered: OnceCell<()>,
}

/// The two-phase commit coordinator.
///
/// Cheap to clone; clones share the same log and transaction map.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Create a coordinator. Nothing is read from disk until [`init`](Self::init).
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let log = CommitLog::open(config.log_path.clone())?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                log,
                txns: Mutex::new(HashMap::new()),
                directory: RwLock::new(HashMap::new()),
                orphans: Mutex::new(Vec::new()),
                recovered: OnceCell::new(),
            }),
        })
    }

    /// Make a participant known by name so recovery can resume its transactions.
    ///
    /// Register every participant before calling [`init`](Self::init).
    pub fn register(&self, participant: Arc<dyn Participant>) -> Result<()> {
        let name = participant.name();
        if !self::log::valid_participant_name(&name) {
            return Err(BedrockError::Participant(format!(
                "Invalid participant name '{}'",
                name
            )));
        }
        self.shared
            .directory
            .write()
            .unwrap()
            .insert(name, participant);
        Ok(())
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Run recovery once. Later and concurrent callers wait for the first run.
    pub async fn init(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        self.shared
            .recovered
            .get_or_try_init(|| recover(shared))
            .await?;
        Ok(())
    }

    /// Start two-phase commit of `txn` across `participants`.
    ///
    /// Returns as soon as the request is logged; the protocol runs in the background.
    /// Asking again for a transaction that is still active returns a handle to the
    /// running commit.
    pub async fn commit(
        &self,
        txn: TxnId,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Result<CommitHandle> {
        self.start(txn, participants, Phase::Prepare).await
    }

    /// Roll `txn` back on every participant.
    pub async fn abort(
        &self,
        txn: TxnId,
        participants: Vec<Arc<dyn Participant>>,
    ) -> Result<CommitHandle> {
        self.start(txn, participants, Phase::Abort).await
    }

    /// Handle to an active (or recovered) transaction
    pub fn handle(&self, txn: TxnId) -> Option<CommitHandle> {
        let txns = self.shared.txns.lock().unwrap();
        txns.get(&txn).map(|record| record.handle(txn))
    }

    /// Active transactions and their aggregate states
    pub fn active(&self) -> Vec<(TxnId, CommitState)> {
        let txns = self.shared.txns.lock().unwrap();
        txns.iter()
            .map(|(txn, record)| (*txn, record.aggregate()))
            .collect()
    }

    async fn start(
        &self,
        txn: TxnId,
        participants: Vec<Arc<dyn Participant>>,
        phase: Phase,
    ) -> Result<CommitHandle> {
        self.init().await?;

        if participants.is_empty() {
            let outcome = match phase {
                Phase::Abort => CommitState::Rollbacked,
                _ => CommitState::Done,
            };
            return Ok(CommitHandle::finished(txn, outcome));
        }
        for participant in &participants {
            self.register(Arc::clone(participant))?;
        }

        let handle = {
            let mut txns = self.shared.txns.lock().unwrap();
            if let Some(record) = txns.get(&txn) {
                ::log::debug!("{} already active, returning existing handle", txn);
                return Ok(record.handle(txn));
            }
            let record = TxnRecord::new(participants, CommitState::Committed);
            let handle = record.handle(txn);
            txns.insert(txn, record);
            handle
        };

        if let Err(e) = flush_log(&self.shared) {
            self.shared.txns.lock().unwrap().remove(&txn);
            return Err(e);
        }
        ::log::info!("{}: {} requested", txn, phase);

        tokio::spawn(drive(Arc::clone(&self.shared), txn, phase));
        Ok(handle)
    }
}

fn flush_log(shared: &Shared) -> Result<()> {
    shared.log.flush_with(|| {
        let mut entries: Vec<LogEntry> = shared.orphans.lock().unwrap().clone();
        let txns = shared.txns.lock().unwrap();
        entries.extend(txns.iter().map(|(txn, record)| record.log_entry(*txn)));
        entries
    })
}

/// Trace line for a retried step; always carries "sleep and retry N".
fn retry_trace(txn: TxnId, what: &str, attempt: u32, delay: Duration) -> String {
    format!("{}: {} sleep and retry {} (delay {:?})", txn, what, attempt, delay)
}

/// Flush, retrying with backoff until the write succeeds.
async fn flush_log_durably(shared: &Shared, txn: TxnId) {
    let mut attempt = 0;
    while let Err(e) = flush_log(shared) {
        attempt += 1;
        let delay = shared.config.backoff(attempt);
        ::log::error!("{}", retry_trace(txn, &format!("commit log write failed ({})", e), attempt, delay));
        tokio::time::sleep(delay).await;
    }
}

/// Run a transaction from `phase` to a terminal state.
async fn drive(shared: Arc<Shared>, txn: TxnId, phase: Phase) {
    let outcome = match phase {
        Phase::Prepare => {
            if run_phase(&shared, txn, Phase::Prepare).await {
                flush_log_durably(&shared, txn).await;
                run_phase(&shared, txn, Phase::Commit).await;
            } else {
                ::log::warn!("{}: prepare failed, aborting", txn);
                run_phase(&shared, txn, Phase::Abort).await;
            }
            current_state(&shared, txn)
        }
        Phase::Commit | Phase::Abort => {
            run_phase(&shared, txn, phase).await;
            current_state(&shared, txn)
        }
    };

    flush_log_durably(&shared, txn).await;
    let record = shared.txns.lock().unwrap().remove(&txn);
    if let Some(record) = record {
        record.status.send_replace(record.aggregate());
    }
    ::log::info!("{}: finished ({})", txn, outcome.unwrap_or(CommitState::None));
}

fn current_state(shared: &Shared, txn: TxnId) -> Option<CommitState> {
    shared
        .txns
        .lock()
        .unwrap()
        .get(&txn)
        .map(TxnRecord::aggregate)
}

/// Participants of `txn` that have not yet reached `target`
fn outstanding(shared: &Shared, txn: TxnId, target: CommitState) -> Vec<(usize, Arc<dyn Participant>)> {
    let txns = shared.txns.lock().unwrap();
    match txns.get(&txn) {
        Some(record) => record
            .participants
            .iter()
            .enumerate()
            .filter(|(idx, _)| record.states[*idx] != target)
            .map(|(idx, p)| (idx, Arc::clone(p)))
            .collect(),
        None => Vec::new(),
    }
}

/// Record one acknowledgement. Returns true once the aggregate reached `target`.
fn acknowledge(shared: &Shared, txn: TxnId, idx: usize, target: CommitState) -> bool {
    let mut txns = shared.txns.lock().unwrap();
    match txns.get_mut(&txn) {
        Some(record) => {
            record.states[idx] = target;
            let aggregate = record.aggregate();
            // Terminal states are published by the driver, after the log flush.
            if !aggregate.is_terminal() {
                record.status.send_replace(aggregate);
            }
            aggregate == target
        }
        None => true,
    }
}

/// Drive one phase to completion.
///
/// Returns false only when prepare exhausted its retry budget.
async fn run_phase(shared: &Shared, txn: TxnId, phase: Phase) -> bool {
    let target = phase.target();
    let step_timeout = Duration::from_millis(shared.config.step_timeout_ms);
    let (sender, mut replies) = mpsc::unbounded_channel::<(u32, usize, Result<()>)>();
    let mut attempt: u32 = 0;

    loop {
        let pending = outstanding(shared, txn, target);
        if pending.is_empty() {
            return true;
        }

        for (idx, participant) in &pending {
            let participant = Arc::clone(participant);
            let sender = sender.clone();
            let idx = *idx;
            tokio::task::spawn_blocking(move || {
                let outcome = phase.invoke(participant.as_ref(), txn);
                let _ = sender.send((attempt, idx, outcome));
            });
        }

        let deadline = Instant::now() + step_timeout;
        let mut waiting = pending.len();
        while waiting > 0 {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Ok(Some((sent_in, idx, outcome))) => {
                    if sent_in == attempt {
                        waiting -= 1;
                    }
                    match outcome {
                        // Late acknowledgements from earlier attempts count too.
                        Ok(()) => {
                            if acknowledge(shared, txn, idx, target) {
                                return true;
                            }
                        }
                        Err(e) => {
                            let name = pending
                                .iter()
                                .find(|(i, _)| *i == idx)
                                .map(|(_, p)| p.name())
                                .unwrap_or_else(|| format!("#{}", idx));
                            ::log::error!("{}: {} failed on {}: {}", txn, phase, name, e);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    ::log::warn!("{}: {} timed out after {:?}", txn, phase, step_timeout);
                    break;
                }
            }
        }

        if outstanding(shared, txn, target).is_empty() {
            return true;
        }

        attempt += 1;
        if let Phase::Prepare = phase {
            if attempt > shared.config.max_prepare_retries {
                return false;
            }
        }
        let delay = shared.config.backoff(attempt);
        ::log::warn!("{}", retry_trace(txn, &format!("{} incomplete", phase), attempt, delay));
        tokio::time::sleep(delay).await;
    }
}

/// Load the commit log and resume every unresolved transaction.
async fn recover(shared: Arc<Shared>) -> Result<()> {
    let entries = shared.log.load()?;
    if entries.is_empty() {
        return Ok(());
    }
    ::log::info!("Recovering {} commit log entries...", entries.len());

    let mut resumed = Vec::new();
    {
        let directory = shared.directory.read().unwrap();
        let mut txns = shared.txns.lock().unwrap();
        let mut orphans = shared.orphans.lock().unwrap();

        for entry in entries {
            let phase = match entry.state {
                CommitState::Prepared => Phase::Commit,
                CommitState::Committed => Phase::Abort,
                _ => {
                    ::log::debug!("{}: already {}, dropping", entry.txn, entry.state);
                    continue;
                }
            };
            let participants: Option<Vec<Arc<dyn Participant>>> = entry
                .participants
                .iter()
                .map(|name| directory.get(name).cloned())
                .collect();
            match participants {
                Some(participants) => {
                    ::log::info!("{}: recovered as {}, resuming {}", entry.txn, entry.state, phase);
                    txns.insert(entry.txn, TxnRecord::new(participants, entry.state));
                    resumed.push((entry.txn, phase));
                }
                None => {
                    ::log::warn!(
                        "{}: participants {:?} not registered, leaving it in the log",
                        entry.txn,
                        entry.participants
                    );
                    orphans.push(entry);
                }
            }
        }
    }

    flush_log(&shared)?;

    let drivers: Vec<_> = resumed
        .into_iter()
        .map(|(txn, phase)| tokio::spawn(drive(Arc::clone(&shared), txn, phase)))
        .collect();
    for driver in drivers {
        driver
            .await
            .map_err(|e| BedrockError::Internal(format!("Recovery driver failed: {}", e)))?;
    }

    ::log::info!("Commit log recovery complete");
    Ok(())
}

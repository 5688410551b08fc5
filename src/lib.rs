//! bedrock - transactional core of a distributed reservation service
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Reservation clients                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Two-phase commit coordinator               │
//! │     (Prepare/Commit/Abort fan-out, retries, commit log)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  Participant
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Resource manager                       │
//! │            (inventory operations on one store)              │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │       Lock manager       │ │     Shadow-paged storage       │
//! │ (strict 2PL, timeouts)   │ │ (update logs, two data files)  │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                                        │
//!                                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         File System                         │
//! │        (manifest, data/index files, commit log)             │
//! └─────────────────────────────────────────────────────────────┘

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

pub mod coordinator;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod rm;
pub mod storage;
pub mod types;

use crate::coordinator::{CommitHandle, Coordinator, CoordinatorConfig, Participant};
use crate::error::Result;
use crate::lock::LockConfig;
use crate::rm::ResourceManager;
use crate::storage::StorageConfig;
use crate::types::TxnId;

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the commit log and the resource manager's store
    pub data_dir: PathBuf,
    /// Participant name of the local resource manager; also its subdirectory
    pub rm_name: String,
    pub lock: LockConfig,
    pub coordinator: CoordinatorConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_dir(PathBuf::from("./data"))
    }
}

impl Config {
    /// Defaults, with every path under `data_dir`
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            coordinator: CoordinatorConfig::new(data_dir.join("commit.log")),
            data_dir,
            rm_name: "inventory".to_string(),
            lock: LockConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// One node: a coordinator plus the resource manager it drives.
///
/// Opening a node runs both recoveries in order: the store rebuilds the update logs
/// of prepared transactions, then the coordinator replays its log against the store.
pub struct Node {
    config: Config,
    coordinator: Coordinator,
    resources: Arc<ResourceManager>,
}

impl Node {
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let resources = Arc::new(ResourceManager::open(
            config.rm_name.clone(),
            &config.data_dir.join(&config.rm_name),
            config.lock.clone(),
            config.storage.clone(),
        )?);
        let in_doubt = resources.database().transactions().len();

        let coordinator = Coordinator::new(config.coordinator.clone())?;
        coordinator.register(resources.clone())?;
        coordinator.init().await?;

        info!(
            "Node ready: {} prepared transaction(s) found in '{}', {} left after recovery",
            in_doubt,
            config.rm_name,
            resources.database().transactions().len()
        );
        Ok(Self {
            config,
            coordinator,
            resources,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Commit `txn` on the local resource manager through the coordinator
    pub async fn commit(&self, txn: TxnId) -> Result<CommitHandle> {
        let participant: Arc<dyn Participant> = self.resources.clone();
        self.coordinator.commit(txn, vec![participant]).await
    }

    pub async fn abort(&self, txn: TxnId) -> Result<CommitHandle> {
        let participant: Arc<dyn Participant> = self.resources.clone();
        self.coordinator.abort(txn, vec![participant]).await
    }
}

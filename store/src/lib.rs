//! `store` is a replicated key-value store engine: an embedded,
//! strongly-consistent, per-partition persistent dictionary. Arbitrary
//! `(type, key) -> value` rows are inserted, updated, deleted and enumerated
//! under transactions, and every committed write is replicated to a quorum
//! of secondary replicas before it is acknowledged. A primary survives
//! failover without divergence, and a fresh or lagging secondary is rebuilt
//! from a live primary through the copy protocol.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use store::config::StoreSettings;
//! use store::error::CResult;
//! use store::notify::{NotificationManager, NotificationMode};
//! use store::replica::{ReplicaRole, ReplicatedStore};
//! use store::replicator::loopback::LoopbackReplicator;
//! use store::storage::log_store::LogStore;
//!
//! #[tokio::main]
//! async fn main() -> CResult<()> {
//!     let replicator = Arc::new(LoopbackReplicator::new(1, 0));
//!     let replica = ReplicatedStore::open(
//!         StoreSettings::default(),
//!         "/var/data/partition-0".into(),
//!         1,
//!         Arc::new(|dir: &Path| {
//!             Ok(Box::new(LogStore::open(dir)?) as Box<dyn store::storage::engine::Engine>)
//!         }),
//!         replicator,
//!         NotificationManager::new(NotificationMode::None, None),
//!     )
//!     .await?;
//!
//!     replica.change_role(ReplicaRole::Primary).await?;
//!
//!     let mut tx = replica.create_transaction()?;
//!     tx.insert("accounts", "alice", b"{\"balance\": 10}")?;
//!     let lsn = tx.commit().await?;
//!     println!("committed at lsn {}", lsn);
//!
//!     replica.close().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod copy;
pub mod error;
pub mod file_stream;
pub mod health;
pub mod local;
pub mod notify;
pub mod progress;
pub mod pump;
pub mod replica;
pub mod replication;
pub mod replicator;
pub mod state;
pub mod storage;
pub mod throttle;
pub mod tombstone;
pub mod txn;
pub mod wire;

pub use error::{CResult, Error};
pub use local::Lsn;

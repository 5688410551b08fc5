//! Participant capability interface

use crate::error::Result;
use crate::types::TxnId;

/// A resource manager enlisted in a distributed transaction.
///
/// The transport (RPC, in-process call, ...) is the implementor's business. Every
/// operation may be delivered more than once because the coordinator retries on
/// timeout, so implementations must be idempotent.
pub trait Participant: Send + Sync {
    /// Stable name, written to the commit log and used to find the participant again
    /// during recovery.
    fn name(&self) -> String;

    /// Make the transaction's changes durable without exposing them.
    fn prepare(&self, txn: TxnId) -> Result<()>;

    /// Expose prepared changes. Must eventually succeed once prepare has.
    fn commit(&self, txn: TxnId) -> Result<()>;

    /// Discard the transaction's changes.
    fn abort(&self, txn: TxnId) -> Result<()>;
}

//! Transfer record storage for the relay.
//!
//! Defines the `TransferStore` trait that all storage backends must implement.
//! Provides a `MemoryStore` that keeps records for the process lifetime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use relay_types::{Address, Amount, Direction, Result, TransferId, TransferStatus, TxHash, Volume};

pub mod memory;

pub use memory::MemoryStore;

/// One cross-ledger transfer intent, keyed by its `transfer_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub user_address: Address,
    pub amount: Amount,
    pub origin_tx_hash: Option<TxHash>,
    pub destination_tx_hash: Option<TxHash>,
    pub status: TransferStatus,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    /// Set exactly when `status` is terminal.
    pub processed_at: Option<u64>,
}

impl TransferRecord {
    /// A freshly observed transfer, not yet acted on.
    pub fn pending(
        transfer_id: TransferId,
        direction: Direction,
        user_address: Address,
        amount: Amount,
        origin_tx_hash: Option<TxHash>,
        created_at: u64,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            user_address,
            amount,
            origin_tx_hash,
            destination_tx_hash: None,
            status: TransferStatus::Pending,
            created_at,
            processed_at: None,
        }
    }

    /// Move a pending record to a terminal status.
    ///
    /// Returns `false` and leaves the record untouched if it is already
    /// terminal or `status` is not a terminal status.
    pub fn apply_status(
        &mut self,
        status: TransferStatus,
        counterpart_tx_hash: Option<TxHash>,
        at: u64,
    ) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if counterpart_tx_hash.is_some() {
            self.destination_tx_hash = counterpart_tx_hash;
        }
        self.processed_at = Some(at);
        true
    }
}

/// Aggregate view over all stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub total_deposits: u64,
    pub total_withdrawals: u64,
    /// Sum of `amount` over processed deposits.
    pub total_volume: Volume,
    pub pending_deposits: u64,
    pub pending_withdrawals: u64,
}

impl BridgeStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TransferRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            let pending = record.status == TransferStatus::Pending;
            match record.direction {
                Direction::SourceToDestination => {
                    stats.total_deposits += 1;
                    if pending {
                        stats.pending_deposits += 1;
                    }
                    if record.status == TransferStatus::Processed {
                        stats.total_volume += Volume::from(record.amount);
                    }
                }
                Direction::DestinationToSource => {
                    stats.total_withdrawals += 1;
                    if pending {
                        stats.pending_withdrawals += 1;
                    }
                }
            }
        }
        stats
    }
}

/// The transfer store trait.
///
/// All methods are async to support both in-memory and persistent backends.
/// Each call is a single mutation or read; callers may interleave them freely.
#[async_trait]
pub trait TransferStore: Send + Sync {
    // --- Lifecycle ---
    async fn init(&self) -> Result<()> { Ok(()) }
    async fn close(&self) -> Result<()> { Ok(()) }

    // --- Writes ---

    /// Insert or overwrite the record with the same `transfer_id`.
    async fn put(&self, record: &TransferRecord) -> Result<()>;

    /// Move a pending record to a terminal status.
    ///
    /// Unknown ids and already-terminal records are left alone; the return
    /// value says whether anything changed.
    async fn update_status(
        &self,
        transfer_id: &TransferId,
        status: TransferStatus,
        counterpart_tx_hash: Option<TxHash>,
    ) -> Result<bool>;

    // --- Reads ---
    async fn get(&self, transfer_id: &TransferId) -> Result<Option<TransferRecord>>;

    /// Records of one direction, newest `created_at` first, at most `limit`.
    async fn recent(&self, direction: Direction, limit: usize) -> Result<Vec<TransferRecord>>;

    async fn recent_deposits(&self, limit: usize) -> Result<Vec<TransferRecord>> {
        self.recent(Direction::SourceToDestination, limit).await
    }

    async fn recent_withdrawals(&self, limit: usize) -> Result<Vec<TransferRecord>> {
        self.recent(Direction::DestinationToSource, limit).await
    }

    async fn stats(&self) -> Result<BridgeStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(direction: Direction, amount: u64, status: TransferStatus) -> TransferRecord {
        let mut r = TransferRecord::pending(
            TransferId([amount as u8; 32]),
            direction,
            Address([7; 20]),
            Amount::from(amount),
            None,
            1,
        );
        r.apply_status(status, None, 2);
        r
    }

    #[test]
    fn test_apply_status_is_monotonic() {
        let mut r = record(Direction::SourceToDestination, 10, TransferStatus::Pending);
        assert!(r.processed_at.is_none());

        let hash = TxHash([9; 32]);
        assert!(r.apply_status(TransferStatus::Processed, Some(hash), 5));
        assert_eq!(r.processed_at, Some(5));
        assert_eq!(r.destination_tx_hash, Some(hash));

        assert!(!r.apply_status(TransferStatus::Failed, None, 6));
        assert!(!r.apply_status(TransferStatus::Pending, None, 7));
        assert_eq!(r.status, TransferStatus::Processed);
        assert_eq!(r.processed_at, Some(5));
    }

    #[test]
    fn test_pending_target_is_ignored() {
        let mut r = record(Direction::DestinationToSource, 3, TransferStatus::Pending);
        assert!(!r.apply_status(TransferStatus::Pending, Some(TxHash([1; 32])), 4));
        assert!(r.destination_tx_hash.is_none());
        assert!(r.processed_at.is_none());
    }

    #[test]
    fn test_stats_from_records() {
        let records = vec![
            record(Direction::SourceToDestination, 100, TransferStatus::Processed),
            record(Direction::SourceToDestination, 50, TransferStatus::Processed),
            record(Direction::SourceToDestination, 70, TransferStatus::Failed),
            record(Direction::SourceToDestination, 20, TransferStatus::Pending),
            record(Direction::DestinationToSource, 30, TransferStatus::Processed),
            record(Direction::DestinationToSource, 40, TransferStatus::Pending),
        ];
        let stats = BridgeStats::from_records(&records);
        assert_eq!(stats.total_deposits, 4);
        assert_eq!(stats.total_withdrawals, 2);
        assert_eq!(stats.total_volume, Volume::from(150u64));
        assert_eq!(stats.pending_deposits, 1);
        assert_eq!(stats.pending_withdrawals, 1);
    }

    #[test]
    fn test_stats_serialize_camel_case() {
        let json = serde_json::to_value(BridgeStats::default()).unwrap();
        assert!(json.get("totalDeposits").is_some());
        assert!(json.get("pendingWithdrawals").is_some());
    }
}

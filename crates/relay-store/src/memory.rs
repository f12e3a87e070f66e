//! In-memory transfer store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::*;
use relay_types::now_ms;

struct Entry {
    /// Insertion order, breaks `created_at` ties in recency listings.
    seq: u64,
    record: TransferRecord,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    records: HashMap<TransferId, Entry>,
}

/// In-memory transfer store (reference backend; records live as long as the process).
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn put(&self, record: &TransferRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            record.transfer_id,
            Entry {
                seq,
                record: record.clone(),
            },
        );
        debug!(
            transfer_id = %record.transfer_id,
            direction = %record.direction,
            "saved transfer record"
        );
        Ok(())
    }

    async fn update_status(
        &self,
        transfer_id: &TransferId,
        status: TransferStatus,
        counterpart_tx_hash: Option<TxHash>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.records.get_mut(transfer_id) else {
            debug!(%transfer_id, ?status, "status update for unknown transfer ignored");
            return Ok(false);
        };
        let applied = entry.record.apply_status(status, counterpart_tx_hash, now_ms());
        if !applied {
            debug!(
                %transfer_id,
                current = ?entry.record.status,
                requested = ?status,
                "status update ignored"
            );
        }
        Ok(applied)
    }

    async fn get(&self, transfer_id: &TransferId) -> Result<Option<TransferRecord>> {
        let inner = self.inner.lock();
        Ok(inner.records.get(transfer_id).map(|e| e.record.clone()))
    }

    async fn recent(&self, direction: Direction, limit: usize) -> Result<Vec<TransferRecord>> {
        let inner = self.inner.lock();
        let mut matching: Vec<&Entry> = inner
            .records
            .values()
            .filter(|e| e.record.direction == direction)
            .collect();
        matching.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn stats(&self) -> Result<BridgeStats> {
        let inner = self.inner.lock();
        Ok(BridgeStats::from_records(
            inner.records.values().map(|e| &e.record),
        ))
    }
}

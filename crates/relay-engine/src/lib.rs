//! Relay engine for the two-ledger bridge.
//!
//! Watches `Locked` events on the source ledger and `CreditBurned` events on
//! the destination ledger, and submits the mirrored call on the opposite side:
//! - deposit: `Locked` on source -> `mintCredit` on destination
//! - withdrawal: `CreditBurned` on destination -> `releaseLock` on source
//!
//! Every transfer is recorded in a [`TransferStore`]. The opposite ledger's
//! replay guard, not the store, is what prevents double application.

mod monitor;
pub mod permissions;
pub mod processor;
mod stats;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use relay_ledger::{EventKind, LedgerClient};
use relay_store::{BridgeStats, TransferRecord, TransferStore};
use relay_types::{
    Address, Amount, Direction, LedgerError, RelayError, Result, TransferId, TxHash,
};

pub use permissions::{check_permissions, PermissionReport};
pub use processor::{RelayOutcome, RelayProcessor};

/// Relay engine configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Period of the stats snapshot. Zero disables the reporter.
    pub stats_interval_ms: u64,
    /// Decimals used when amounts are logged.
    pub amount_decimals: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 60_000,
            amount_decimals: 18,
        }
    }
}

/// Contract addresses the relay talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressBook {
    /// Lock contract on the source ledger.
    pub origin_lock_contract: Address,
    /// Credit-issuing contract on the destination ledger.
    pub destination_credit_contract: Address,
    /// Credit token on the destination ledger, when it is separate from the
    /// credit contract. Only used for balance and supply views.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_credit_token: Option<Address>,
}

impl AddressBook {
    /// Token queried for credit balance and supply.
    pub fn credit_token(&self) -> Address {
        self.destination_credit_token
            .unwrap_or(self.destination_credit_contract)
    }
}

/// Relay lifecycle event for progress reporting.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Observed {
        direction: Direction,
        transfer_id: TransferId,
        user: Address,
        amount: Amount,
    },
    Processed {
        direction: Direction,
        transfer_id: TransferId,
        tx_hash: TxHash,
    },
    /// The opposite ledger had already applied the transfer.
    Reconciled {
        direction: Direction,
        transfer_id: TransferId,
    },
    Failed {
        direction: Direction,
        transfer_id: TransferId,
        error: LedgerError,
    },
    /// A subscription could not be opened (`error` set) or its feed closed.
    SubscriptionLost {
        ledger: String,
        event: EventKind,
        error: Option<LedgerError>,
    },
    Stats(BridgeStats),
}

/// Callback type for relay events.
pub type RelayEventHandler = Arc<dyn Fn(RelayEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Notifier(Option<RelayEventHandler>);

impl Notifier {
    pub(crate) fn new(handler: Option<RelayEventHandler>) -> Self {
        Self(handler)
    }

    pub(crate) fn emit(&self, event: RelayEvent) {
        if let Some(ref handler) = self.0 {
            handler(event);
        }
    }
}

/// Point-in-time view of the relay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub running: bool,
    pub addresses: AddressBook,
    pub permissions: Option<PermissionReport>,
    /// Destination credit supply, if it could be read.
    pub credit_supply: Option<Amount>,
    pub stats: BridgeStats,
}

/// The relay engine wires both ledgers, the store and the processor together.
pub struct RelayEngine {
    config: RelayConfig,
    addresses: AddressBook,
    store: Arc<dyn TransferStore>,
    source: Arc<dyn LedgerClient>,
    destination: Arc<dyn LedgerClient>,
    notifier: Notifier,
    /// Background tasks while running; `None` when stopped.
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
    permissions: Mutex<Option<PermissionReport>>,
}

impl RelayEngine {
    pub fn new(
        config: RelayConfig,
        addresses: AddressBook,
        store: Arc<dyn TransferStore>,
        source: Arc<dyn LedgerClient>,
        destination: Arc<dyn LedgerClient>,
    ) -> Self {
        Self {
            config,
            addresses,
            store,
            source,
            destination,
            notifier: Notifier::default(),
            tasks: Mutex::new(None),
            permissions: Mutex::new(None),
        }
    }

    pub fn with_event_handler(
        mut self,
        handler: impl Fn(RelayEvent) + Send + Sync + 'static,
    ) -> Self {
        self.notifier = Notifier::new(Some(Arc::new(handler)));
        self
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    /// Processor bound to this engine's ledgers, store and handler.
    pub fn processor(&self) -> RelayProcessor {
        RelayProcessor::new(
            self.store.clone(),
            self.source.clone(),
            self.destination.clone(),
            self.addresses.clone(),
            self.config.amount_decimals,
            self.notifier.clone(),
        )
    }

    /// Check roles, open both subscriptions and start the stats reporter.
    ///
    /// Missing roles and failed subscriptions are logged and reported but do
    /// not fail startup.
    pub async fn start(&self) -> Result<PermissionReport> {
        {
            let mut tasks = self.tasks.lock();
            if tasks.is_some() {
                return Err(RelayError::AlreadyRunning);
            }
            *tasks = Some(Vec::new());
        }

        info!(
            source = self.source.name(),
            destination = self.destination.name(),
            origin_lock_contract = %self.addresses.origin_lock_contract,
            destination_credit_contract = %self.addresses.destination_credit_contract,
            "starting relay engine"
        );

        if let Err(e) = self.store.init().await {
            *self.tasks.lock() = None;
            return Err(e);
        }

        let report =
            check_permissions(self.source.as_ref(), self.destination.as_ref(), &self.addresses)
                .await;
        *self.permissions.lock() = Some(report.clone());
        info!(
            source_signer = ?report.source_signer,
            destination_signer = ?report.destination_signer,
            "relay identity"
        );

        let processor = Arc::new(self.processor());
        let decimals = self.config.amount_decimals;
        let mut handles = Vec::new();
        handles.extend(
            monitor::open_listener(
                self.source.clone(),
                self.addresses.origin_lock_contract,
                EventKind::Locked,
                processor.clone(),
                decimals,
                self.notifier.clone(),
            )
            .await,
        );
        handles.extend(
            monitor::open_listener(
                self.destination.clone(),
                self.addresses.destination_credit_contract,
                EventKind::CreditBurned,
                processor,
                decimals,
                self.notifier.clone(),
            )
            .await,
        );

        if self.config.stats_interval_ms > 0 {
            handles.push(stats::spawn_stats_reporter(
                self.store.clone(),
                Duration::from_millis(self.config.stats_interval_ms),
                decimals,
                self.notifier.clone(),
            ));
        }

        let mut tasks = self.tasks.lock();
        match tasks.as_mut() {
            Some(running) => running.extend(handles),
            None => {
                // Stopped while starting.
                for handle in handles {
                    handle.abort();
                }
                warn!("relay engine stopped during startup");
                return Ok(report);
            }
        }
        info!("relay engine running");
        Ok(report)
    }

    /// Abort the listeners and the stats reporter. Transfers already being
    /// processed run to completion. Returns whether the engine was running.
    pub fn stop(&self) -> bool {
        let Some(handles) = self.tasks.lock().take() else {
            return false;
        };
        for handle in handles {
            handle.abort();
        }
        info!("relay engine stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Result of the last startup role check.
    pub fn permissions(&self) -> Option<PermissionReport> {
        self.permissions.lock().clone()
    }

    pub async fn stats(&self) -> Result<BridgeStats> {
        self.store.stats().await
    }

    pub async fn recent_deposits(&self, limit: usize) -> Result<Vec<TransferRecord>> {
        self.store.recent_deposits(limit).await
    }

    pub async fn recent_withdrawals(&self, limit: usize) -> Result<Vec<TransferRecord>> {
        self.store.recent_withdrawals(limit).await
    }

    pub async fn transfer(&self, transfer_id: &TransferId) -> Result<Option<TransferRecord>> {
        self.store.get(transfer_id).await
    }

    /// Credit balance of `account` on the destination ledger.
    pub async fn credit_balance(&self, account: &Address) -> Result<Amount> {
        Ok(self
            .destination
            .balance_of(&self.addresses.credit_token(), account)
            .await?)
    }

    pub async fn status(&self) -> Result<RelayStatus> {
        let credit_supply = match self
            .destination
            .total_supply(&self.addresses.credit_token())
            .await
        {
            Ok(supply) => Some(supply),
            Err(e) => {
                warn!(ledger = self.destination.name(), error = %e, "could not read credit supply");
                None
            }
        };
        Ok(RelayStatus {
            running: self.is_running(),
            addresses: self.addresses.clone(),
            permissions: self.permissions(),
            credit_supply,
            stats: self.store.stats().await?,
        })
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        if let Some(handles) = self.tasks.get_mut().take() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_ledger::MockLedger;
    use relay_store::MemoryStore;
    use relay_types::TransferStatus;

    const SIGNER: Address = Address([0x51; 20]);
    const USER: Address = Address([0xa1; 20]);
    const LOCK_CONTRACT: Address = Address([0x11; 20]);
    const CREDIT_CONTRACT: Address = Address([0x22; 20]);

    struct Harness {
        source: Arc<MockLedger>,
        destination: Arc<MockLedger>,
        store: Arc<MemoryStore>,
        events: Arc<Mutex<Vec<RelayEvent>>>,
        engine: RelayEngine,
    }

    fn addresses() -> AddressBook {
        AddressBook {
            origin_lock_contract: LOCK_CONTRACT,
            destination_credit_contract: CREDIT_CONTRACT,
            destination_credit_token: None,
        }
    }

    fn harness_with(config: RelayConfig) -> Harness {
        let source = Arc::new(MockLedger::new("source", SIGNER));
        let destination = Arc::new(MockLedger::new("destination", SIGNER));
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let engine = RelayEngine::new(
            config,
            addresses(),
            store.clone(),
            source.clone(),
            destination.clone(),
        )
        .with_event_handler(move |e| sink.lock().push(e));
        Harness {
            source,
            destination,
            store,
            events,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(RelayConfig {
            stats_interval_ms: 0,
            ..RelayConfig::default()
        })
    }

    async fn wait_for_status(store: &MemoryStore, id: &TransferId, status: TransferStatus) -> TransferRecord {
        for _ in 0..200 {
            if let Some(record) = store.get(id).await.unwrap() {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transfer {id} never reached {status:?}");
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_deposit_is_minted_on_destination() {
        let h = harness();
        let report = h.engine.start().await.unwrap();
        assert!(report.is_fully_authorized());
        assert_eq!(report.source_signer, Some(SIGNER));
        assert_eq!(report.destination_signer, Some(SIGNER));

        let event = h.source.lock(LOCK_CONTRACT, USER, Amount::from(1_000u64));
        let record = wait_for_status(&h.store, &event.transfer_id, TransferStatus::Processed).await;

        assert_eq!(record.direction, Direction::SourceToDestination);
        assert_eq!(record.origin_tx_hash, event.tx_hash);
        assert!(record.destination_tx_hash.is_some());
        assert_eq!(h.destination.balance(&USER), Amount::from(1_000u64));
        assert_eq!(h.engine.credit_balance(&USER).await.unwrap(), Amount::from(1_000u64));

        let deposits = h.engine.recent_deposits(10).await.unwrap();
        assert_eq!(deposits.len(), 1);
        assert!(h.engine.recent_withdrawals(10).await.unwrap().is_empty());
        h.engine.stop();
    }

    #[tokio::test]
    async fn test_oversized_amount_decimals_keep_monitor_alive() {
        let h = harness_with(RelayConfig {
            stats_interval_ms: 0,
            amount_decimals: 160,
        });
        h.engine.start().await.unwrap();

        let first = h.source.lock(LOCK_CONTRACT, USER, Amount::from(1u64));
        wait_for_status(&h.store, &first.transfer_id, TransferStatus::Processed).await;
        let second = h.source.lock(LOCK_CONTRACT, USER, Amount::from(2u64));
        wait_for_status(&h.store, &second.transfer_id, TransferStatus::Processed).await;

        assert_eq!(h.source.subscriber_count(), 1);
        assert!(!h
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, RelayEvent::SubscriptionLost { .. })));
        h.engine.stop();
    }

    #[tokio::test]
    async fn test_withdrawal_is_released_on_source() {
        let h = harness();
        h.engine.start().await.unwrap();

        let event = h.destination.burn_credit(CREDIT_CONTRACT, USER, Amount::from(70u64));
        let record = wait_for_status(&h.store, &event.transfer_id, TransferStatus::Processed).await;

        assert_eq!(record.direction, Direction::DestinationToSource);
        assert_eq!(h.source.balance(&USER), Amount::from(70u64));
        assert_eq!(
            h.engine.transfer(&event.transfer_id).await.unwrap(),
            Some(record)
        );
        h.engine.stop();
    }

    #[tokio::test]
    async fn test_redelivered_event_credits_once() {
        let h = harness();
        h.engine.start().await.unwrap();

        let event = h.source.lock(LOCK_CONTRACT, USER, Amount::from(5u64));
        wait_for_status(&h.store, &event.transfer_id, TransferStatus::Processed).await;
        h.source.emit(LOCK_CONTRACT, event.clone());

        let events = h.events.clone();
        wait_until(|| {
            events
                .lock()
                .iter()
                .any(|e| matches!(e, RelayEvent::Reconciled { .. }))
        })
        .await;
        wait_for_status(&h.store, &event.transfer_id, TransferStatus::Processed).await;
        assert_eq!(h.destination.balance(&USER), Amount::from(5u64));
        assert_eq!(h.destination.included_calls().len(), 1);
        h.engine.stop();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let h = harness();
        h.engine.start().await.unwrap();
        assert!(matches!(
            h.engine.start().await,
            Err(RelayError::AlreadyRunning)
        ));
        assert!(h.engine.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_unsubscribes() {
        let h = harness();
        assert!(!h.engine.stop());
        h.engine.start().await.unwrap();
        assert_eq!(h.source.subscriber_count(), 1);
        assert_eq!(h.destination.subscriber_count(), 1);

        assert!(h.engine.stop());
        assert!(!h.engine.stop());
        assert!(!h.engine.is_running());

        let (source, destination) = (h.source.clone(), h.destination.clone());
        wait_until(|| source.subscriber_count() == 0 && destination.subscriber_count() == 0).await;

        // Can be started again.
        h.engine.start().await.unwrap();
        assert!(h.engine.is_running());
    }

    #[tokio::test]
    async fn test_missing_roles_do_not_block_startup() {
        let h = harness();
        h.destination.set_owner(Address([0xee; 20]));

        let report = h.engine.start().await.unwrap();
        assert!(!report.is_fully_authorized());
        assert!(h.engine.is_running());
        assert_eq!(h.engine.permissions(), Some(report));

        let event = h.source.lock(LOCK_CONTRACT, USER, Amount::from(9u64));
        wait_for_status(&h.store, &event.transfer_id, TransferStatus::Failed).await;
        assert_eq!(h.destination.balance(&USER), Amount::zero());
    }

    #[tokio::test]
    async fn test_failed_subscription_leaves_other_side_running() {
        let h = harness();
        h.source
            .fail_subscribe(LedgerError::Subscription("filter not supported".into()));

        h.engine.start().await.unwrap();
        assert!(h.events.lock().iter().any(|e| matches!(
            e,
            RelayEvent::SubscriptionLost {
                event: EventKind::Locked,
                error: Some(_),
                ..
            }
        )));

        let event = h.destination.burn_credit(CREDIT_CONTRACT, USER, Amount::from(3u64));
        wait_for_status(&h.store, &event.transfer_id, TransferStatus::Processed).await;
    }

    #[tokio::test]
    async fn test_closed_feed_is_reported() {
        let h = harness();
        h.engine.start().await.unwrap();
        h.destination.close_subscriptions();

        let events = h.events.clone();
        wait_until(|| {
            events.lock().iter().any(|e| {
                matches!(
                    e,
                    RelayEvent::SubscriptionLost {
                        event: EventKind::CreditBurned,
                        error: None,
                        ..
                    }
                )
            })
        })
        .await;
    }

    #[tokio::test]
    async fn test_stats_reporter_emits_snapshots() {
        let h = harness_with(RelayConfig {
            stats_interval_ms: 20,
            ..RelayConfig::default()
        });
        h.engine.start().await.unwrap();
        h.source.lock(LOCK_CONTRACT, USER, Amount::from(2u64));

        let events = h.events.clone();
        wait_until(|| {
            events.lock().iter().any(|e| {
                matches!(e, RelayEvent::Stats(stats) if stats.total_deposits == 1 && stats.pending_deposits == 0)
            })
        })
        .await;
        h.engine.stop();
    }

    #[tokio::test]
    async fn test_status_reports_supply_and_stats() {
        let h = harness();
        h.engine.start().await.unwrap();
        let event = h.source.lock(LOCK_CONTRACT, USER, Amount::from(400u64));
        wait_for_status(&h.store, &event.transfer_id, TransferStatus::Processed).await;

        let status = h.engine.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.credit_supply, Some(Amount::from(400u64)));
        assert_eq!(status.stats.total_deposits, 1);
        assert!(status.permissions.unwrap().is_fully_authorized());

        h.destination
            .fail_reads(Some(LedgerError::Transport("connection refused".into())));
        let status = h.engine.status().await.unwrap();
        assert_eq!(status.credit_supply, None);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["stats"]["totalDeposits"], 1);
        assert_eq!(json["permissions"]["sourceSigner"], SIGNER.to_string());
        assert_eq!(json["permissions"]["destinationOwner"], SIGNER.to_string());
        assert_eq!(
            json["addresses"]["originLockContract"],
            LOCK_CONTRACT.to_string()
        );
    }

    #[test]
    fn test_address_book_parses_camel_case() {
        let book: AddressBook = serde_json::from_str(
            r#"{
                "originLockContract": "0x1111111111111111111111111111111111111111",
                "destinationCreditContract": "0x2222222222222222222222222222222222222222"
            }"#,
        )
        .unwrap();
        assert_eq!(book, addresses());
        assert_eq!(book.credit_token(), CREDIT_CONTRACT);
    }
}

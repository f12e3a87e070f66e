//! Ledger capability used by the relay.
//!
//! - Submit bridge calls and wait for inclusion
//! - Read role and balance views
//! - Subscribe to bridge events
//!
//! `EvmLedger` signs and calls the bridge contracts over JSON-RPC;
//! `GatewayClient` talks to a signing ledger gateway over HTTP; `MockLedger`
//! is an in-memory ledger for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relay_types::{Address, Amount, Direction, LedgerError, TransferId, TxHash};

pub mod evm;
pub mod gateway;
pub mod mock;

pub use evm::{EvmConfig, EvmLedger, EvmSigner};
pub use gateway::{GatewayClient, GatewayConfig};
pub use mock::MockLedger;

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Privileged bridge call the relay submits on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LedgerCall {
    /// Destination: credit `amount` to `user` for a lock observed on source.
    MintCredit {
        user: Address,
        amount: Amount,
        transfer_id: TransferId,
    },
    /// Source: release locked value to `user` for a burn observed on destination.
    ReleaseLock {
        user: Address,
        amount: Amount,
        transfer_id: TransferId,
    },
}

impl LedgerCall {
    /// The call that mirrors an origin event of `direction` on the opposite ledger.
    pub fn mirror(direction: Direction, user: Address, amount: Amount, transfer_id: TransferId) -> Self {
        match direction {
            Direction::SourceToDestination => LedgerCall::MintCredit { user, amount, transfer_id },
            Direction::DestinationToSource => LedgerCall::ReleaseLock { user, amount, transfer_id },
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::MintCredit { .. } => "mintCredit",
            LedgerCall::ReleaseLock { .. } => "releaseLock",
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        match self {
            LedgerCall::MintCredit { transfer_id, .. } | LedgerCall::ReleaseLock { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn user(&self) -> Address {
        match self {
            LedgerCall::MintCredit { user, .. } | LedgerCall::ReleaseLock { user, .. } => *user,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            LedgerCall::MintCredit { amount, .. } | LedgerCall::ReleaseLock { amount, .. } => *amount,
        }
    }
}

/// A submitted, not yet included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxHandle {
    pub tx_hash: TxHash,
    pub transfer_id: TransferId,
}

/// Inclusion receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
}

/// Bridge events the relay listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `Locked(user, amount, transferId, ts)` on the source ledger.
    Locked,
    /// `CreditBurned(user, amount, transferId, ts)` on the destination ledger.
    CreditBurned,
}

impl EventKind {
    /// Direction of the transfer an event of this kind starts.
    pub fn direction(&self) -> Direction {
        match self {
            EventKind::Locked => Direction::SourceToDestination,
            EventKind::CreditBurned => Direction::DestinationToSource,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Locked => "Locked",
            EventKind::CreditBurned => "CreditBurned",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One observed bridge event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub kind: EventKind,
    pub user: Address,
    pub amount: Amount,
    pub transfer_id: TransferId,
    /// Ledger timestamp in seconds.
    pub timestamp: u64,
    pub tx_hash: Option<TxHash>,
    pub block_number: Option<u64>,
}

/// Live event feed. Dropping it unsubscribes.
pub struct EventSubscription {
    events: mpsc::Receiver<LedgerEvent>,
    feeder: Option<JoinHandle<()>>,
}

impl EventSubscription {
    /// `feeder` is the task producing into `events`, if any; it is aborted on drop.
    pub fn new(events: mpsc::Receiver<LedgerEvent>, feeder: Option<JoinHandle<()>>) -> Self {
        Self { events, feeder }
    }

    /// Next event, or `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<LedgerEvent> {
        self.events.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

/// Client for one ledger, signing as the relay identity.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Human-readable ledger name for logs.
    fn name(&self) -> &str;

    /// Address of the relay identity on this ledger.
    async fn signer_address(&self) -> LedgerResult<Address>;

    // --- Writes ---
    async fn submit(&self, contract: &Address, call: &LedgerCall) -> LedgerResult<TxHandle>;

    /// Resolves once the transaction is included. No upper bound on waiting.
    async fn wait_for_inclusion(&self, tx: &TxHandle) -> LedgerResult<Receipt>;

    // --- Views ---
    async fn is_authorized_relayer(&self, contract: &Address, account: &Address) -> LedgerResult<bool>;
    async fn owner(&self, contract: &Address) -> LedgerResult<Address>;
    async fn balance_of(&self, token: &Address, account: &Address) -> LedgerResult<Amount>;
    async fn total_supply(&self, token: &Address) -> LedgerResult<Amount>;

    // --- Events ---
    async fn subscribe(&self, contract: &Address, kind: EventKind) -> LedgerResult<EventSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_call_per_direction() {
        let user = Address([1; 20]);
        let id = TransferId([2; 32]);
        let amount = Amount::from(100u64);

        let mint = LedgerCall::mirror(Direction::SourceToDestination, user, amount, id);
        assert_eq!(mint.method(), "mintCredit");
        let release = LedgerCall::mirror(Direction::DestinationToSource, user, amount, id);
        assert_eq!(release.method(), "releaseLock");

        for call in [mint, release] {
            assert_eq!(call.user(), user);
            assert_eq!(call.amount(), amount);
            assert_eq!(call.transfer_id(), id);
        }
    }

    #[test]
    fn test_event_kind_direction() {
        assert_eq!(EventKind::Locked.direction(), Direction::SourceToDestination);
        assert_eq!(EventKind::CreditBurned.direction(), Direction::DestinationToSource);
    }

    #[test]
    fn test_call_serializes_with_method_tag() {
        let call = LedgerCall::MintCredit {
            user: Address([1; 20]),
            amount: Amount::from(5u64),
            transfer_id: TransferId([2; 32]),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["method"], "mintCredit");
        assert_eq!(json["user"], Address([1; 20]).to_string());
        assert_eq!(json["transferId"], TransferId([2; 32]).to_string());
        assert!(json.get("transfer_id").is_none());
    }

    #[tokio::test]
    async fn test_subscription_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = EventSubscription::new(rx, None);
        let event = LedgerEvent {
            kind: EventKind::Locked,
            user: Address([1; 20]),
            amount: Amount::from(1u64),
            transfer_id: TransferId([3; 32]),
            timestamp: 0,
            tx_hash: None,
            block_number: None,
        };
        tx.send(event.clone()).await.unwrap();
        drop(tx);
        assert_eq!(sub.next().await, Some(event));
        assert_eq!(sub.next().await, None);
    }
}

//! In-memory ledger for tests.
//!
//! Behaves like the bridge contracts as far as the relay can tell: role
//! checks on privileged calls, a replay guard keyed by transfer id, balances
//! and credit supply, and event delivery to subscribers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::mpsc;

use relay_types::{now_ms, Address, Amount, LedgerError, TransferId, TxHash};

use crate::{EventKind, EventSubscription, LedgerCall, LedgerClient, LedgerEvent, LedgerResult, Receipt, TxHandle};

const SUBSCRIPTION_BUFFER: usize = 64;

struct MockState {
    signer: Address,
    owner: Address,
    relayers: HashSet<Address>,
    consumed: HashSet<TransferId>,
    balances: HashMap<Address, Amount>,
    total_supply: Amount,
    block_number: u64,
    tx_count: u64,
    nonce: u64,
    in_flight: HashMap<TxHash, (Address, LedgerCall)>,
    included: Vec<(Address, LedgerCall)>,
    submit_failures: VecDeque<LedgerError>,
    inclusion_failures: VecDeque<LedgerError>,
    read_failure: Option<LedgerError>,
    subscribe_failure: Option<LedgerError>,
    subscribers: Vec<(Address, EventKind, mpsc::Sender<LedgerEvent>)>,
}

impl MockState {
    fn permits(&self, call: &LedgerCall) -> bool {
        match call {
            LedgerCall::MintCredit { .. } => self.signer == self.owner,
            LedgerCall::ReleaseLock { .. } => self.relayers.contains(&self.signer),
        }
    }

    fn check(&self, call: &LedgerCall) -> LedgerResult<()> {
        if !self.permits(call) {
            return Err(LedgerError::NotAuthorized(format!(
                "{} may not call {}",
                self.signer,
                call.method()
            )));
        }
        if self.consumed.contains(&call.transfer_id()) {
            return Err(LedgerError::AlreadyProcessed(call.transfer_id()));
        }
        Ok(())
    }

    fn credit(&mut self, account: Address, amount: Amount) {
        let balance = self.balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
    }
}

/// In-memory ledger. The signer starts out as owner and authorized relayer.
pub struct MockLedger {
    name: String,
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new(name: &str, signer: Address) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState {
                signer,
                owner: signer,
                relayers: HashSet::from([signer]),
                consumed: HashSet::new(),
                balances: HashMap::new(),
                total_supply: Amount::zero(),
                block_number: 0,
                tx_count: 0,
                nonce: 0,
                in_flight: HashMap::new(),
                included: Vec::new(),
                submit_failures: VecDeque::new(),
                inclusion_failures: VecDeque::new(),
                read_failure: None,
                subscribe_failure: None,
                subscribers: Vec::new(),
            }),
        }
    }

    // --- Configuration ---

    pub fn set_owner(&self, owner: Address) {
        self.state.lock().owner = owner;
    }

    pub fn set_relayer(&self, account: Address, authorized: bool) {
        let mut state = self.state.lock();
        if authorized {
            state.relayers.insert(account);
        } else {
            state.relayers.remove(&account);
        }
    }

    /// Mark a transfer id as already consumed by the replay guard.
    pub fn mark_consumed(&self, transfer_id: TransferId) {
        self.state.lock().consumed.insert(transfer_id);
    }

    /// The next `submit` fails with `error`.
    pub fn fail_next_submit(&self, error: LedgerError) {
        self.state.lock().submit_failures.push_back(error);
    }

    /// The next `wait_for_inclusion` fails with `error`; the transaction has no effect.
    pub fn fail_next_inclusion(&self, error: LedgerError) {
        self.state.lock().inclusion_failures.push_back(error);
    }

    /// All view calls fail with `error` (or succeed again with `None`).
    pub fn fail_reads(&self, error: Option<LedgerError>) {
        self.state.lock().read_failure = error;
    }

    pub fn fail_subscribe(&self, error: LedgerError) {
        self.state.lock().subscribe_failure = Some(error);
    }

    // --- User actions ---

    /// A user locks `amount` on this ledger; emits `Locked` with a fresh id.
    pub fn lock(&self, contract: Address, user: Address, amount: Amount) -> LedgerEvent {
        let transfer_id = self.next_transfer_id(&user, amount);
        let event = self.build_event(EventKind::Locked, user, amount, transfer_id);
        self.emit(contract, event.clone());
        event
    }

    /// A user burns `amount` of credit on this ledger; emits `CreditBurned`.
    pub fn burn_credit(&self, contract: Address, user: Address, amount: Amount) -> LedgerEvent {
        let transfer_id = self.next_transfer_id(&user, amount);
        {
            let mut state = self.state.lock();
            let balance = state.balances.entry(user).or_default();
            *balance = balance.saturating_sub(amount);
            state.total_supply = state.total_supply.saturating_sub(amount);
        }
        let event = self.build_event(EventKind::CreditBurned, user, amount, transfer_id);
        self.emit(contract, event.clone());
        event
    }

    /// Deliver `event` to every open subscription on `contract` for its kind.
    /// Returns how many subscribers received it.
    pub fn emit(&self, contract: Address, event: LedgerEvent) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, _, tx)| !tx.is_closed());
        state
            .subscribers
            .iter()
            .filter(|(c, kind, _)| *c == contract && *kind == event.kind)
            .filter(|(_, _, tx)| tx.try_send(event.clone()).is_ok())
            .count()
    }

    /// Close every open subscription, as a dropped connection would.
    pub fn close_subscriptions(&self) {
        self.state.lock().subscribers.clear();
    }

    // --- Inspection ---

    /// Calls that were included, in order.
    pub fn included_calls(&self) -> Vec<LedgerCall> {
        self.state.lock().included.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn balance(&self, account: &Address) -> Amount {
        self.state.lock().balances.get(account).copied().unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|(_, _, tx)| !tx.is_closed());
        state.subscribers.len()
    }

    fn next_transfer_id(&self, user: &Address, amount: Amount) -> TransferId {
        let mut state = self.state.lock();
        let nonce = state.nonce;
        state.nonce += 1;
        TransferId::derive(user, amount, nonce)
    }

    fn build_event(&self, kind: EventKind, user: Address, amount: Amount, transfer_id: TransferId) -> LedgerEvent {
        let mut state = self.state.lock();
        state.block_number += 1;
        state.tx_count += 1;
        LedgerEvent {
            kind,
            user,
            amount,
            transfer_id,
            timestamp: now_ms() / 1000,
            tx_hash: Some(tx_hash_for(&self.name, state.tx_count)),
            block_number: Some(state.block_number),
        }
    }

    fn read_guard(&self) -> LedgerResult<()> {
        match &self.state.lock().read_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn tx_hash_for(ledger: &str, count: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    let tag = ledger.as_bytes();
    let n = tag.len().min(24);
    bytes[..n].copy_from_slice(&tag[..n]);
    bytes[24..].copy_from_slice(&count.to_be_bytes());
    TxHash(bytes)
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn signer_address(&self) -> LedgerResult<Address> {
        Ok(self.state.lock().signer)
    }

    async fn submit(&self, contract: &Address, call: &LedgerCall) -> LedgerResult<TxHandle> {
        let mut state = self.state.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        // Gas estimation runs the call, so guard failures surface here.
        state.check(call)?;

        state.tx_count += 1;
        let tx_hash = tx_hash_for(&self.name, state.tx_count);
        state.in_flight.insert(tx_hash, (*contract, call.clone()));
        Ok(TxHandle {
            tx_hash,
            transfer_id: call.transfer_id(),
        })
    }

    async fn wait_for_inclusion(&self, tx: &TxHandle) -> LedgerResult<Receipt> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        let (contract, call) = state
            .in_flight
            .remove(&tx.tx_hash)
            .ok_or_else(|| LedgerError::Transport(format!("unknown transaction {}", tx.tx_hash)))?;
        if let Some(err) = state.inclusion_failures.pop_front() {
            return Err(err);
        }
        // A concurrent submission may have consumed the id since `submit`.
        state.check(&call)?;

        state.consumed.insert(call.transfer_id());
        match &call {
            LedgerCall::MintCredit { user, amount, .. } => {
                state.credit(*user, *amount);
                state.total_supply = state.total_supply.saturating_add(*amount);
            }
            LedgerCall::ReleaseLock { user, amount, .. } => state.credit(*user, *amount),
        }
        state.block_number += 1;
        state.included.push((contract, call));
        Ok(Receipt {
            tx_hash: tx.tx_hash,
            block_number: state.block_number,
        })
    }

    async fn is_authorized_relayer(&self, _contract: &Address, account: &Address) -> LedgerResult<bool> {
        self.read_guard()?;
        Ok(self.state.lock().relayers.contains(account))
    }

    async fn owner(&self, _contract: &Address) -> LedgerResult<Address> {
        self.read_guard()?;
        Ok(self.state.lock().owner)
    }

    async fn balance_of(&self, _token: &Address, account: &Address) -> LedgerResult<Amount> {
        self.read_guard()?;
        Ok(self.balance(account))
    }

    async fn total_supply(&self, _token: &Address) -> LedgerResult<Amount> {
        self.read_guard()?;
        Ok(self.state.lock().total_supply)
    }

    async fn subscribe(&self, contract: &Address, kind: EventKind) -> LedgerResult<EventSubscription> {
        let mut state = self.state.lock();
        if let Some(err) = state.subscribe_failure.clone() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        state.subscribers.push((*contract, kind, tx));
        Ok(EventSubscription::new(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: Address = Address([0xc0; 20]);
    const SIGNER: Address = Address([0x51; 20]);
    const USER: Address = Address([0xa1; 20]);

    fn mint(id: u8, amount: u64) -> LedgerCall {
        LedgerCall::MintCredit {
            user: USER,
            amount: Amount::from(amount),
            transfer_id: TransferId([id; 32]),
        }
    }

    #[tokio::test]
    async fn test_mint_credits_user_once() {
        let ledger = MockLedger::new("destination", SIGNER);
        let tx = ledger.submit(&CONTRACT, &mint(1, 100)).await.unwrap();
        let receipt = ledger.wait_for_inclusion(&tx).await.unwrap();
        assert_eq!(receipt.tx_hash, tx.tx_hash);
        assert_eq!(ledger.balance(&USER), Amount::from(100u64));
        assert_eq!(ledger.total_supply(&CONTRACT).await.unwrap(), Amount::from(100u64));

        let err = ledger.submit(&CONTRACT, &mint(1, 100)).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyProcessed(TransferId([1; 32])));
        assert_eq!(ledger.balance(&USER), Amount::from(100u64));
    }

    #[tokio::test]
    async fn test_replay_guard_applies_at_inclusion() {
        let ledger = MockLedger::new("destination", SIGNER);
        let first = ledger.submit(&CONTRACT, &mint(2, 10)).await.unwrap();
        let second = ledger.submit(&CONTRACT, &mint(2, 10)).await.unwrap();

        ledger.wait_for_inclusion(&first).await.unwrap();
        let err = ledger.wait_for_inclusion(&second).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyProcessed(_)));
        assert_eq!(ledger.included_calls().len(), 1);
        assert_eq!(ledger.balance(&USER), Amount::from(10u64));
    }

    #[tokio::test]
    async fn test_mint_requires_owner() {
        let ledger = MockLedger::new("destination", SIGNER);
        ledger.set_owner(Address([0xee; 20]));
        let err = ledger.submit(&CONTRACT, &mint(3, 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_release_requires_relayer_role() {
        let ledger = MockLedger::new("source", SIGNER);
        ledger.set_relayer(SIGNER, false);
        let call = LedgerCall::ReleaseLock {
            user: USER,
            amount: Amount::from(5u64),
            transfer_id: TransferId([4; 32]),
        };
        let err = ledger.submit(&CONTRACT, &call).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotAuthorized(_)));
        assert!(!ledger.is_authorized_relayer(&CONTRACT, &SIGNER).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_inclusion_failure_has_no_effect() {
        let ledger = MockLedger::new("destination", SIGNER);
        ledger.fail_next_inclusion(LedgerError::Reverted("out of gas".into()));
        let tx = ledger.submit(&CONTRACT, &mint(5, 10)).await.unwrap();
        assert!(ledger.wait_for_inclusion(&tx).await.is_err());
        assert_eq!(ledger.balance(&USER), Amount::zero());

        // Not consumed, so a re-drive goes through.
        let tx = ledger.submit(&CONTRACT, &mint(5, 10)).await.unwrap();
        ledger.wait_for_inclusion(&tx).await.unwrap();
        assert_eq!(ledger.balance(&USER), Amount::from(10u64));
    }

    #[tokio::test]
    async fn test_events_reach_matching_subscribers() {
        let ledger = MockLedger::new("source", SIGNER);
        let mut locked = ledger.subscribe(&CONTRACT, EventKind::Locked).await.unwrap();
        let _burned = ledger.subscribe(&CONTRACT, EventKind::CreditBurned).await.unwrap();

        let event = ledger.lock(CONTRACT, USER, Amount::from(100u64));
        assert_eq!(event.transfer_id, TransferId::derive(&USER, Amount::from(100u64), 0));
        assert_eq!(locked.next().await, Some(event));

        ledger.close_subscriptions();
        assert_eq!(locked.next().await, None);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let ledger = MockLedger::new("source", SIGNER);
        let sub = ledger.subscribe(&CONTRACT, EventKind::Locked).await.unwrap();
        assert_eq!(ledger.subscriber_count(), 1);
        drop(sub);
        assert_eq!(ledger.subscriber_count(), 0);
    }
}

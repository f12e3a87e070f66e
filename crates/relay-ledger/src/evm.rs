//! JSON-RPC adapter for EVM ledgers.
//!
//! Calls the bridge contracts with a local wallet and follows their logs by
//! polling `eth_getLogs` in block ranges. Revert data is turned into
//! `LedgerError` here and nowhere else.

use async_trait::async_trait;
use ethers::abi::AbiDecode;
use ethers::contract::{abigen, ContractError, EthError, LogMeta};
use ethers::middleware::{NonceManagerMiddleware, SignerMiddleware};
use ethers::providers::{Http, Middleware, MiddlewareError, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{BlockId, BlockNumber, TransactionRequest, H160, H256, U256 as EvmU256, U64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_types::{bytes_to_hex, Address, Amount, LedgerError, RelayError, TransferId, TxHash};

use crate::{EventKind, EventSubscription, LedgerCall, LedgerClient, LedgerEvent, LedgerResult, Receipt, TxHandle};

abigen!(
    BridgeContract,
    r#"[
        event Locked(address indexed user, uint256 amount, bytes32 indexed transferId, uint256 timestamp)
        event CreditBurned(address indexed user, uint256 amount, bytes32 indexed transferId, uint256 timestamp)
        function releaseLock(address user, uint256 amount, bytes32 transferId)
        function mintCredit(address user, uint256 amount, bytes32 transferId)
        function isAuthorizedRelayer(address account) external view returns (bool)
        function owner() external view returns (address)
        function balanceOf(address account) external view returns (uint256)
        function totalSupply() external view returns (uint256)
    ]"#
);

/// Wallet-signing client with local nonce tracking, so concurrent relays do
/// not reuse a nonce.
pub type EvmSigner = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

const SUBSCRIPTION_BUFFER: usize = 256;

/// `OwnableUnauthorizedAccount(address)` custom error.
const OWNABLE_UNAUTHORIZED: &str = "OwnableUnauthorizedAccount(address)";

/// EVM ledger configuration.
#[derive(Debug, Clone)]
pub struct EvmConfig {
    pub rpc_url: String,
    /// Delay between receipt and log polls.
    pub poll_ms: u64,
    /// Most blocks covered by one `eth_getLogs` request.
    pub block_range: u64,
}

impl EvmConfig {
    pub fn new(rpc_url: &str) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            poll_ms: 2_000,
            block_range: 1_000,
        }
    }
}

/// Ledger client for an EVM chain.
pub struct EvmLedger<M> {
    name: String,
    client: Arc<M>,
    signer: Address,
    poll: Duration,
    block_range: u64,
}

impl EvmLedger<EvmSigner> {
    /// Connect to `config.rpc_url` and sign with `private_key` (hex).
    pub async fn connect(name: &str, config: &EvmConfig, private_key: &str) -> relay_types::Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| RelayError::Other(format!("invalid rpc url {}: {e}", config.rpc_url)))?
            .interval(Duration::from_millis(config.poll_ms));
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| LedgerError::Transport(format!("{name}: failed to read chain id: {e}")))?;

        let key = private_key.trim();
        let key = key
            .strip_prefix("0x")
            .or_else(|| key.strip_prefix("0X"))
            .unwrap_or(key);
        let wallet: LocalWallet = key
            .parse()
            .map_err(|e| RelayError::Other(format!("invalid private key: {e}")))?;
        let wallet = wallet.with_chain_id(chain_id.as_u64());
        let address = wallet.address();

        info!(ledger = name, chain_id = chain_id.as_u64(), rpc_url = %config.rpc_url, "connected");
        let client = NonceManagerMiddleware::new(SignerMiddleware::new(provider, wallet), address);
        Ok(Self::with_client(name, Arc::new(client), from_h160(address), config))
    }
}

impl<M: Middleware + 'static> EvmLedger<M> {
    pub fn with_client(name: &str, client: Arc<M>, signer: Address, config: &EvmConfig) -> Self {
        Self {
            name: name.to_string(),
            client,
            signer,
            poll: Duration::from_millis(config.poll_ms),
            block_range: config.block_range.max(1),
        }
    }

    fn contract(&self, address: &Address) -> BridgeContract<M> {
        BridgeContract::new(to_h160(address), self.client.clone())
    }

    /// Why an included transaction reverted: replay it at its block.
    async fn revert_reason(&self, tx: &TxHandle, block: u64) -> LedgerError {
        let sent = match self.client.get_transaction(H256(tx.tx_hash.0)).await {
            Ok(Some(sent)) => sent,
            _ => return LedgerError::Reverted(format!("transaction {} reverted", tx.tx_hash)),
        };
        let mut request = TransactionRequest::new()
            .from(sent.from)
            .data(sent.input.clone())
            .value(sent.value);
        if let Some(to) = sent.to {
            request = request.to(to);
        }
        let at = BlockId::Number(BlockNumber::Number(U64::from(block)));
        match self.client.call(&request.into(), Some(at)).await {
            Err(e) => match e.as_error_response().and_then(|r| r.as_revert_data()) {
                Some(data) => classify_revert(&data, tx.transfer_id),
                None => LedgerError::Reverted(e.to_string()),
            },
            Ok(_) => LedgerError::Reverted(format!("transaction {} reverted", tx.tx_hash)),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> LedgerClient for EvmLedger<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn signer_address(&self) -> LedgerResult<Address> {
        Ok(self.signer)
    }

    async fn submit(&self, contract: &Address, call: &LedgerCall) -> LedgerResult<TxHandle> {
        let bridge = self.contract(contract);
        let user = to_h160(&call.user());
        let amount = to_u256(call.amount());
        let transfer_id = call.transfer_id();
        let tx = match call {
            LedgerCall::MintCredit { .. } => bridge.mint_credit(user, amount, transfer_id.0),
            LedgerCall::ReleaseLock { .. } => bridge.release_lock(user, amount, transfer_id.0),
        };
        // Gas estimation executes the call, so guard reverts surface here.
        let pending = tx.send().await.map_err(|e| contract_error(&e, transfer_id))?;
        Ok(TxHandle {
            tx_hash: TxHash(pending.tx_hash().0),
            transfer_id,
        })
    }

    async fn wait_for_inclusion(&self, tx: &TxHandle) -> LedgerResult<Receipt> {
        loop {
            let receipt = self
                .client
                .get_transaction_receipt(H256(tx.tx_hash.0))
                .await
                .map_err(|e| LedgerError::Transport(e.to_string()))?;
            if let Some(receipt) = receipt {
                let block_number = receipt.block_number.map(|n| n.as_u64()).unwrap_or_default();
                if receipt.status == Some(U64::zero()) {
                    return Err(self.revert_reason(tx, block_number).await);
                }
                return Ok(Receipt {
                    tx_hash: tx.tx_hash,
                    block_number,
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    async fn is_authorized_relayer(&self, contract: &Address, account: &Address) -> LedgerResult<bool> {
        self.contract(contract)
            .is_authorized_relayer(to_h160(account))
            .call()
            .await
            .map_err(view_error)
    }

    async fn owner(&self, contract: &Address) -> LedgerResult<Address> {
        self.contract(contract)
            .owner()
            .call()
            .await
            .map(from_h160)
            .map_err(view_error)
    }

    async fn balance_of(&self, token: &Address, account: &Address) -> LedgerResult<Amount> {
        self.contract(token)
            .balance_of(to_h160(account))
            .call()
            .await
            .map(from_u256)
            .map_err(view_error)
    }

    async fn total_supply(&self, token: &Address) -> LedgerResult<Amount> {
        self.contract(token)
            .total_supply()
            .call()
            .await
            .map(from_u256)
            .map_err(view_error)
    }

    async fn subscribe(&self, contract: &Address, kind: EventKind) -> LedgerResult<EventSubscription> {
        // Only logs after the current head are delivered.
        let head = self
            .client
            .get_block_number()
            .await
            .map_err(|e| LedgerError::Subscription(e.to_string()))?
            .as_u64();

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let feeder = tokio::spawn(feed_logs(
            self.name.clone(),
            self.client.clone(),
            self.contract(contract),
            kind,
            head + 1,
            self.block_range,
            self.poll,
            tx,
        ));
        Ok(EventSubscription::new(rx, Some(feeder)))
    }
}

#[allow(clippy::too_many_arguments)]
async fn feed_logs<M: Middleware + 'static>(
    ledger: String,
    client: Arc<M>,
    contract: BridgeContract<M>,
    kind: EventKind,
    mut from: u64,
    block_range: u64,
    poll: Duration,
    events: mpsc::Sender<LedgerEvent>,
) {
    loop {
        match client.get_block_number().await {
            Ok(latest) => {
                let latest = latest.as_u64();
                while from <= latest {
                    let to = latest.min(from + block_range - 1);
                    match contract.events().from_block(from).to_block(to).query_with_meta().await {
                        Ok(logs) => {
                            for (log, meta) in logs {
                                let Some(event) = to_ledger_event(log, &meta, kind) else {
                                    continue;
                                };
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            }
                            debug!(ledger = %ledger, event = %kind, from, to, "scanned logs");
                            from = to + 1;
                        }
                        Err(e) => {
                            warn!(ledger = %ledger, event = %kind, from, to, error = %e, "log query failed");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(ledger = %ledger, event = %kind, error = %e, "block number poll failed"),
        }

        if events.is_closed() {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}

fn to_ledger_event(log: BridgeContractEvents, meta: &LogMeta, kind: EventKind) -> Option<LedgerEvent> {
    let (observed, user, amount, transfer_id, timestamp) = match log {
        BridgeContractEvents::LockedFilter(e) => {
            (EventKind::Locked, e.user, e.amount, e.transfer_id, e.timestamp)
        }
        BridgeContractEvents::CreditBurnedFilter(e) => {
            (EventKind::CreditBurned, e.user, e.amount, e.transfer_id, e.timestamp)
        }
    };
    if observed != kind {
        return None;
    }
    Some(LedgerEvent {
        kind,
        user: from_h160(user),
        amount: from_u256(amount),
        transfer_id: TransferId(transfer_id),
        timestamp: timestamp.low_u64(),
        tx_hash: Some(TxHash(meta.transaction_hash.0)),
        block_number: Some(meta.block_number.as_u64()),
    })
}

/// Map revert data to the ledger error it stands for.
pub fn classify_revert(data: &[u8], transfer_id: TransferId) -> LedgerError {
    if let Some(reason) = <String as EthError>::decode_with_selector(data) {
        return classify_reason(&reason, transfer_id);
    }
    if data.len() >= 4 && data[..4] == ethers::utils::id(OWNABLE_UNAUTHORIZED) {
        let account = H160::decode(&data[4..])
            .map(|a| from_h160(a).to_string())
            .unwrap_or_default();
        return LedgerError::NotAuthorized(format!("{account} is not the owner"));
    }
    LedgerError::Reverted(format!("execution reverted: {}", bytes_to_hex(data)))
}

/// The bridge contracts revert with `require` strings; this is the single
/// place their wording is interpreted.
fn classify_reason(reason: &str, transfer_id: TransferId) -> LedgerError {
    let lower = reason.to_lowercase();
    if lower.contains("already processed") {
        LedgerError::AlreadyProcessed(transfer_id)
    } else if lower.contains("not an operator")
        || lower.contains("not authorized")
        || lower.contains("caller is not the owner")
    {
        LedgerError::NotAuthorized(reason.to_string())
    } else {
        LedgerError::Reverted(reason.to_string())
    }
}

fn contract_error<M: Middleware>(err: &ContractError<M>, transfer_id: TransferId) -> LedgerError {
    if let Some(data) = err.as_revert() {
        return classify_revert(data, transfer_id);
    }
    // Some nodes only put the reason in the error message.
    let message = err.to_string();
    match message.split_once("execution reverted") {
        Some((_, reason)) => {
            let reason = reason.trim_start_matches(':').trim();
            classify_reason(if reason.is_empty() { &message } else { reason }, transfer_id)
        }
        None => LedgerError::Transport(message),
    }
}

fn view_error<M: Middleware>(err: ContractError<M>) -> LedgerError {
    LedgerError::Transport(err.to_string())
}

fn to_h160(address: &Address) -> H160 {
    H160(address.0)
}

fn from_h160(address: H160) -> Address {
    Address(address.0)
}

fn to_u256(amount: Amount) -> EvmU256 {
    let mut buf = [0u8; 32];
    amount.to_big_endian(&mut buf);
    EvmU256::from_big_endian(&buf)
}

fn from_u256(value: EvmU256) -> Amount {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    Amount::from_big_endian(&buf)
}

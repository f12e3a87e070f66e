//! HTTP client for a signing ledger gateway.
//!
//! The gateway holds the relay identity's key and exposes one ledger.
//!
//! Endpoints:
//! - GET  /api/v1/signer
//! - POST /api/v1/submit
//! - GET  /api/v1/receipt?txhash=<tx_hash>
//! - GET  /api/v1/view/<method>?contract=<addr>[&account=<addr>]
//! - GET  /api/v1/events?contract=<addr>&event=<name>&offset=N&limit=L

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_types::{Address, Amount, LedgerError, TransferId, TxHash};

use crate::{EventKind, EventSubscription, LedgerCall, LedgerClient, LedgerEvent, LedgerResult, Receipt, TxHandle};

/// Gateway result codes carried in the response envelope.
pub const CODE_OK: i32 = 0;
pub const CODE_ALREADY_PROCESSED: i32 = 1001;
pub const CODE_NOT_AUTHORIZED: i32 = 1002;
pub const CODE_REVERTED: i32 = 1003;

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    /// Bearer credential for the relay identity.
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    /// Delay between receipt and event polls.
    pub poll_ms: u64,
    /// Events fetched per page.
    pub page_size: u64,
}

impl GatewayConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout_ms: 30_000,
            poll_ms: 2_000,
            page_size: 100,
        }
    }
}

/// Gateway API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse<T> {
    pub code: Option<i32>,
    pub message: Option<String>,
    pub data: Option<T>,
}

/// Submit request body.
#[derive(Debug, Clone, Serialize)]
struct SubmitRequest<'a> {
    contract: &'a Address,
    #[serde(flatten)]
    call: &'a LedgerCall,
}

/// One page of the events endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub items: Vec<LedgerEvent>,
    /// Number of events of this kind the gateway has seen in total.
    pub total: u64,
}

/// Map a non-zero gateway code to the ledger error it stands for.
pub fn classify(code: i32, message: &str, transfer_id: Option<TransferId>) -> LedgerError {
    match (code, transfer_id) {
        (CODE_ALREADY_PROCESSED, Some(id)) => LedgerError::AlreadyProcessed(id),
        (CODE_ALREADY_PROCESSED, None) => LedgerError::Reverted(format!("already processed: {message}")),
        (CODE_NOT_AUTHORIZED, _) => LedgerError::NotAuthorized(message.to_string()),
        (CODE_REVERTED, _) => LedgerError::Reverted(message.to_string()),
        (other, _) => LedgerError::Transport(format!("gateway error {other}: {message}")),
    }
}

/// Ledger client backed by a gateway.
#[derive(Clone)]
pub struct GatewayClient {
    name: String,
    config: GatewayConfig,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(name: &str, config: GatewayConfig) -> Self {
        Self {
            name: name.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.request_timeout_ms))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Send a request and unwrap the envelope.
    ///
    /// `transfer_id` lets an "already processed" code become `AlreadyProcessed`.
    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        transfer_id: Option<TransferId>,
    ) -> LedgerResult<Option<T>> {
        let request = match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        let resp = request
            .timeout(Duration::from_millis(self.config.request_timeout_ms))
            .send()
            .await
            .map_err(|e| LedgerError::Transport(format!("gateway request failed: {}", e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| LedgerError::Transport(format!("failed to read gateway response: {}", e)))?;

        let envelope: GatewayResponse<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(LedgerError::Transport(format!(
                    "gateway returned status {}: {}",
                    status, body
                )));
            }
            Err(e) => {
                return Err(LedgerError::Transport(format!(
                    "failed to parse gateway response: {}",
                    e
                )));
            }
        };

        let code = envelope.code.unwrap_or(CODE_OK);
        let message = envelope.message.unwrap_or_default();
        if code != CODE_OK {
            return Err(classify(code, &message, transfer_id));
        }
        if !status.is_success() {
            return Err(LedgerError::Transport(format!(
                "gateway returned status {}: {}",
                status, message
            )));
        }
        Ok(envelope.data)
    }

    /// Like `send`, but an empty `data` field is an error.
    async fn send_required<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        transfer_id: Option<TransferId>,
    ) -> LedgerResult<T> {
        self.send(request, transfer_id)
            .await?
            .ok_or_else(|| LedgerError::Transport("gateway response missing data".into()))
    }

    async fn view<T: DeserializeOwned>(
        &self,
        method: &str,
        contract: &Address,
        account: Option<&Address>,
    ) -> LedgerResult<T> {
        let mut query = vec![("contract", contract.to_string())];
        if let Some(account) = account {
            query.push(("account", account.to_string()));
        }
        let request = self
            .client
            .get(self.url(&format!("/api/v1/view/{}", method)))
            .query(&query);
        self.send_required(request, None).await
    }

    /// Fetch the receipt of a transaction, `None` while it is not included.
    pub async fn get_receipt(&self, tx: &TxHandle) -> LedgerResult<Option<Receipt>> {
        let request = self
            .client
            .get(self.url("/api/v1/receipt"))
            .query(&[("txhash", tx.tx_hash.to_string())]);
        self.send(request, Some(tx.transfer_id)).await
    }

    /// Fetch one page of events of `kind` emitted by `contract`.
    pub async fn list_events(
        &self,
        contract: &Address,
        kind: EventKind,
        offset: u64,
        limit: u64,
    ) -> LedgerResult<EventPage> {
        let request = self.client.get(self.url("/api/v1/events")).query(&[
            ("contract", contract.to_string()),
            ("event", kind.name().to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]);
        self.send_required(request, None).await
    }

    /// Page through new events from `offset`, forwarding them until the
    /// subscriber goes away.
    async fn feed_events(
        self,
        contract: Address,
        kind: EventKind,
        mut offset: u64,
        events: mpsc::Sender<LedgerEvent>,
    ) {
        let poll = Duration::from_millis(self.config.poll_ms);
        let page_size = self.config.page_size.max(1);

        loop {
            match self.list_events(&contract, kind, offset, page_size).await {
                Ok(page) => {
                    let count = page.items.len() as u64;
                    for event in page.items {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    offset += count;
                    if count > 0 {
                        debug!(ledger = %self.name, event = %kind, offset, "fetched events");
                    }
                    // Full page: more may be waiting.
                    if count == page_size {
                        continue;
                    }
                }
                Err(e) => {
                    warn!(ledger = %self.name, event = %kind, error = %e, "event poll failed");
                }
            }

            if events.is_closed() {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl LedgerClient for GatewayClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn signer_address(&self) -> LedgerResult<Address> {
        let request = self.client.get(self.url("/api/v1/signer"));
        self.send_required(request, None).await
    }

    async fn submit(&self, contract: &Address, call: &LedgerCall) -> LedgerResult<TxHandle> {
        let request = self
            .client
            .post(self.url("/api/v1/submit"))
            .json(&SubmitRequest { contract, call });
        let tx_hash: TxHash = self.send_required(request, Some(call.transfer_id())).await?;
        Ok(TxHandle {
            tx_hash,
            transfer_id: call.transfer_id(),
        })
    }

    async fn wait_for_inclusion(&self, tx: &TxHandle) -> LedgerResult<Receipt> {
        let poll = Duration::from_millis(self.config.poll_ms);
        loop {
            if let Some(receipt) = self.get_receipt(tx).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn is_authorized_relayer(&self, contract: &Address, account: &Address) -> LedgerResult<bool> {
        self.view("isAuthorizedRelayer", contract, Some(account)).await
    }

    async fn owner(&self, contract: &Address) -> LedgerResult<Address> {
        self.view("owner", contract, None).await
    }

    async fn balance_of(&self, token: &Address, account: &Address) -> LedgerResult<Amount> {
        self.view("balanceOf", token, Some(account)).await
    }

    async fn total_supply(&self, token: &Address) -> LedgerResult<Amount> {
        self.view("totalSupply", token, None).await
    }

    async fn subscribe(&self, contract: &Address, kind: EventKind) -> LedgerResult<EventSubscription> {
        // Only events emitted after this point are delivered.
        let head = self
            .list_events(contract, kind, 0, 0)
            .await
            .map_err(|e| LedgerError::Subscription(e.to_string()))?
            .total;

        let (tx, rx) = mpsc::channel(self.config.page_size.max(1) as usize);
        let feeder = tokio::spawn(self.clone().feed_events(*contract, kind, head, tx));
        Ok(EventSubscription::new(rx, Some(feeder)))
    }
}

//! Turns one origin event into a stored record and one mirrored call.
//!
//! Steps per event: record as pending, submit the mirrored call to the
//! opposite ledger, wait for inclusion, settle the record. Two deliveries of
//! the same transfer may run these steps concurrently; the opposite ledger's
//! replay guard decides which one takes effect.

use std::sync::Arc;
use tracing::{error, info, warn};

use relay_ledger::{LedgerCall, LedgerClient, LedgerEvent, LedgerResult, Receipt};
use relay_store::{TransferRecord, TransferStore};
use relay_types::{
    format_units, now_ms, Address, Direction, FailureKind, LedgerError, Result, TransferId,
    TransferStatus,
};

use crate::{AddressBook, Notifier, RelayEvent};

/// How a relayed transfer settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The mirrored call was included.
    Processed(Receipt),
    /// The opposite ledger had already applied this transfer.
    AlreadyProcessed,
}

/// Relay processor shared by both event directions.
pub struct RelayProcessor {
    store: Arc<dyn TransferStore>,
    source: Arc<dyn LedgerClient>,
    destination: Arc<dyn LedgerClient>,
    addresses: AddressBook,
    amount_decimals: usize,
    notifier: Notifier,
}

impl RelayProcessor {
    pub(crate) fn new(
        store: Arc<dyn TransferStore>,
        source: Arc<dyn LedgerClient>,
        destination: Arc<dyn LedgerClient>,
        addresses: AddressBook,
        amount_decimals: usize,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            source,
            destination,
            addresses,
            amount_decimals,
            notifier,
        }
    }

    /// Ledger and contract that receive the mirrored call for `direction`.
    fn target(&self, direction: Direction) -> (&dyn LedgerClient, &Address) {
        match direction {
            Direction::SourceToDestination => (
                self.destination.as_ref(),
                &self.addresses.destination_credit_contract,
            ),
            Direction::DestinationToSource => {
                (self.source.as_ref(), &self.addresses.origin_lock_contract)
            }
        }
    }

    /// Relay one origin event.
    ///
    /// Returns an error for unauthorized and transient failures after the
    /// record has been marked `Failed`.
    pub async fn process(&self, event: &LedgerEvent) -> Result<RelayOutcome> {
        let direction = event.kind.direction();
        let transfer_id = event.transfer_id;

        // Overwrites any earlier record for this id, which lets an operator
        // re-drive a failed transfer by replaying its event.
        let record = TransferRecord::pending(
            transfer_id,
            direction,
            event.user,
            event.amount,
            event.tx_hash,
            now_ms(),
        );
        self.store.put(&record).await?;
        self.notifier.emit(RelayEvent::Observed {
            direction,
            transfer_id,
            user: event.user,
            amount: event.amount,
        });

        let (ledger, contract) = self.target(direction);
        let call = LedgerCall::mirror(direction, event.user, event.amount, transfer_id);
        info!(
            %transfer_id,
            %direction,
            ledger = ledger.name(),
            method = call.method(),
            user = %event.user,
            amount = %format_units(event.amount, self.amount_decimals),
            "relaying transfer"
        );

        match dispatch(ledger, contract, &call).await {
            Ok(receipt) => {
                info!(
                    %transfer_id,
                    %direction,
                    tx_hash = %receipt.tx_hash,
                    block = receipt.block_number,
                    "transfer processed"
                );
                self.store
                    .update_status(&transfer_id, TransferStatus::Processed, Some(receipt.tx_hash))
                    .await?;
                self.notifier.emit(RelayEvent::Processed {
                    direction,
                    transfer_id,
                    tx_hash: receipt.tx_hash,
                });
                Ok(RelayOutcome::Processed(receipt))
            }
            Err(err) => self.settle_failure(direction, transfer_id, err).await,
        }
    }

    async fn settle_failure(
        &self,
        direction: Direction,
        transfer_id: TransferId,
        err: LedgerError,
    ) -> Result<RelayOutcome> {
        match err.kind() {
            FailureKind::AlreadyProcessed => {
                warn!(%transfer_id, %direction, "transfer already processed on ledger, reconciling");
                self.store
                    .update_status(&transfer_id, TransferStatus::Processed, None)
                    .await?;
                self.notifier.emit(RelayEvent::Reconciled {
                    direction,
                    transfer_id,
                });
                Ok(RelayOutcome::AlreadyProcessed)
            }
            FailureKind::NotAuthorized | FailureKind::Transient => {
                if err.kind() == FailureKind::NotAuthorized {
                    error!(
                        %transfer_id,
                        %direction,
                        error = %err,
                        "relay identity lacks the bridge role, transfer will not be retried"
                    );
                }
                self.store
                    .update_status(&transfer_id, TransferStatus::Failed, None)
                    .await?;
                self.notifier.emit(RelayEvent::Failed {
                    direction,
                    transfer_id,
                    error: err.clone(),
                });
                Err(err.into())
            }
        }
    }
}

async fn dispatch(
    ledger: &dyn LedgerClient,
    contract: &Address,
    call: &LedgerCall,
) -> LedgerResult<Receipt> {
    let tx = ledger.submit(contract, call).await?;
    info!(
        transfer_id = %tx.transfer_id,
        tx_hash = %tx.tx_hash,
        ledger = ledger.name(),
        "transaction sent"
    );
    ledger.wait_for_inclusion(&tx).await
}

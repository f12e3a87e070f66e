//! Event monitor: one listener task per subscription.
//!
//! Every event is handed to the processor in its own task, so a slow ledger
//! never holds up delivery. The monitor does not deduplicate.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relay_ledger::{EventKind, EventSubscription, LedgerClient};
use relay_types::{format_units, Address};

use crate::processor::RelayProcessor;
use crate::{Notifier, RelayEvent};

/// Subscribe to `kind` events of `contract` and start forwarding them.
///
/// A failed subscription is logged and reported, and yields `None`; the
/// engine keeps running without it.
pub(crate) async fn open_listener(
    ledger: Arc<dyn LedgerClient>,
    contract: Address,
    kind: EventKind,
    processor: Arc<RelayProcessor>,
    amount_decimals: usize,
    notifier: Notifier,
) -> Option<JoinHandle<()>> {
    match ledger.subscribe(&contract, kind).await {
        Ok(subscription) => {
            info!(ledger = ledger.name(), event = %kind, %contract, "monitoring events");
            Some(tokio::spawn(listen(
                subscription,
                ledger.name().to_string(),
                kind,
                processor,
                amount_decimals,
                notifier,
            )))
        }
        Err(e) => {
            error!(ledger = ledger.name(), event = %kind, error = %e, "failed to subscribe");
            notifier.emit(RelayEvent::SubscriptionLost {
                ledger: ledger.name().to_string(),
                event: kind,
                error: Some(e),
            });
            None
        }
    }
}

async fn listen(
    mut subscription: EventSubscription,
    ledger: String,
    kind: EventKind,
    processor: Arc<RelayProcessor>,
    amount_decimals: usize,
    notifier: Notifier,
) {
    while let Some(event) = subscription.next().await {
        info!(
            ledger = %ledger,
            event = %kind,
            user = %event.user,
            amount = %format_units(event.amount, amount_decimals),
            transfer_id = %event.transfer_id,
            timestamp = event.timestamp,
            tx_hash = ?event.tx_hash,
            "bridge event detected"
        );

        let processor = processor.clone();
        tokio::spawn(async move {
            match processor.process(&event).await {
                Ok(outcome) => debug!(transfer_id = %event.transfer_id, ?outcome, "event handled"),
                Err(e) => error!(
                    transfer_id = %event.transfer_id,
                    direction = %event.kind.direction(),
                    error = %e,
                    "failed to relay transfer"
                ),
            }
        });
    }

    warn!(ledger = %ledger, event = %kind, "event subscription closed");
    notifier.emit(RelayEvent::SubscriptionLost {
        ledger,
        event: kind,
        error: None,
    });
}

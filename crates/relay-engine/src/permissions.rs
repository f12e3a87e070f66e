//! Startup role checks.
//!
//! The relay identity should be an authorized relayer on the source lock
//! contract and the owner of the destination credit contract. Anything else is
//! reported and logged; the engine starts regardless.

use serde::Serialize;
use tracing::{info, warn};

use relay_ledger::LedgerClient;
use relay_types::Address;

use crate::AddressBook;

/// What the ledgers said about the relay identity. `None` means the view
/// could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionReport {
    pub source_signer: Option<Address>,
    pub destination_signer: Option<Address>,
    pub source_relayer: Option<bool>,
    pub destination_owner: Option<Address>,
}

impl PermissionReport {
    /// Whether the destination owner is the relay identity, if both are known.
    pub fn destination_owner_matches(&self) -> Option<bool> {
        match (self.destination_owner, self.destination_signer) {
            (Some(owner), Some(signer)) => Some(owner == signer),
            _ => None,
        }
    }

    pub fn is_fully_authorized(&self) -> bool {
        self.source_relayer == Some(true) && self.destination_owner_matches() == Some(true)
    }
}

/// Read both role views and log every mismatch. Never fails.
pub async fn check_permissions(
    source: &dyn LedgerClient,
    destination: &dyn LedgerClient,
    addresses: &AddressBook,
) -> PermissionReport {
    let mut report = PermissionReport::default();

    match source.signer_address().await {
        Ok(signer) => {
            report.source_signer = Some(signer);
            match source
                .is_authorized_relayer(&addresses.origin_lock_contract, &signer)
                .await
            {
                Ok(authorized) => report.source_relayer = Some(authorized),
                Err(e) => warn!(ledger = source.name(), error = %e, "could not read relayer role"),
            }
        }
        Err(e) => warn!(ledger = source.name(), error = %e, "could not resolve signer"),
    }

    match destination.signer_address().await {
        Ok(signer) => report.destination_signer = Some(signer),
        Err(e) => warn!(ledger = destination.name(), error = %e, "could not resolve signer"),
    }
    match destination.owner(&addresses.destination_credit_contract).await {
        Ok(owner) => report.destination_owner = Some(owner),
        Err(e) => warn!(ledger = destination.name(), error = %e, "could not read contract owner"),
    }

    if report.source_relayer == Some(false) {
        warn!(
            ledger = source.name(),
            signer = ?report.source_signer,
            contract = %addresses.origin_lock_contract,
            "signer is not an authorized relayer; releases will fail until the role is granted"
        );
    }
    if report.destination_owner_matches() == Some(false) {
        warn!(
            ledger = destination.name(),
            signer = ?report.destination_signer,
            owner = ?report.destination_owner,
            "signer is not the credit contract owner; mints will fail"
        );
    }
    if report.is_fully_authorized() {
        info!("relay identity holds the bridge roles on both ledgers");
    }

    report
}

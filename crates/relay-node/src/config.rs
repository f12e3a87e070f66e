//! Deployment files.
//!
//! Each ledger's deployment tooling writes a JSON file shaped
//! `{"contracts": {...}}`. The source file supplies `lockContract`; the
//! destination file supplies `creditContract` and optionally `creditToken`.

use serde::Deserialize;
use std::path::Path;

use relay_engine::AddressBook;
use relay_types::{Address, RelayError, Result};

#[derive(Debug, Default, Deserialize)]
struct Deployment {
    #[serde(default)]
    contracts: DeployedContracts,
}

/// Contract addresses found in one deployment file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedContracts {
    #[serde(default)]
    pub lock_contract: Option<Address>,
    #[serde(default)]
    pub credit_contract: Option<Address>,
    #[serde(default)]
    pub credit_token: Option<Address>,
}

pub fn parse_deployment(json: &str) -> Result<DeployedContracts> {
    let deployment: Deployment = serde_json::from_str(json)
        .map_err(|e| RelayError::AddressBook(format!("invalid deployment file: {e}")))?;
    Ok(deployment.contracts)
}

/// Read a deployment file. A missing file reads as empty.
pub fn read_deployment(path: &Path) -> Result<DeployedContracts> {
    if !path.exists() {
        return Ok(DeployedContracts::default());
    }
    let json = std::fs::read_to_string(path)
        .map_err(|e| RelayError::AddressBook(format!("{}: {e}", path.display())))?;
    parse_deployment(&json)
}

pub fn address_book(
    source: &DeployedContracts,
    destination: &DeployedContracts,
) -> Result<AddressBook> {
    let origin_lock_contract = source.lock_contract.ok_or_else(|| {
        RelayError::AddressBook("lock contract address not found in source deployment".into())
    })?;
    let destination_credit_contract = destination.credit_contract.ok_or_else(|| {
        RelayError::AddressBook(
            "credit contract address not found in destination deployment".into(),
        )
    })?;
    Ok(AddressBook {
        origin_lock_contract,
        destination_credit_contract,
        destination_credit_token: destination.credit_token,
    })
}

pub fn load_address_book(source: &Path, destination: &Path) -> Result<AddressBook> {
    address_book(&read_deployment(source)?, &read_deployment(destination)?)
}

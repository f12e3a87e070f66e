//! Core types shared across the relay workspace.
//!
//! Fixed-size ledger identifiers (`TransferId`, `Address`, `TxHash`), amounts,
//! transfer direction/status and the error taxonomy.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

pub mod error;

pub use error::{FailureKind, LedgerError, RelayError, Result};

/// Ledger amount in base units (uint256 on both ledgers).
pub type Amount = primitive_types::U256;

/// Accumulator wide enough to sum any number of `Amount`s without overflow.
pub type Volume = primitive_types::U512;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(bytes: &[u8]) -> Result<Self> {
                if bytes.len() != $len {
                    return Err(RelayError::InvalidLength {
                        kind: stringify!($name),
                        expected: $len,
                        actual: bytes.len(),
                    });
                }
                let mut out = [0u8; $len];
                out.copy_from_slice(bytes);
                Ok(Self(out))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = RelayError;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_slice(&hex_to_bytes(s)?)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&bytes_to_hex(&self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// Ledger-issued identifier of one cross-ledger transfer intent.
    TransferId,
    32
);

fixed_bytes!(
    /// 20-byte account or contract address. Parsing ignores hex case.
    Address,
    20
);

fixed_bytes!(
    /// Transaction hash.
    TxHash,
    32
);

impl TransferId {
    /// Derive the id the source ledger assigns to a lock:
    /// `keccak256(user ‖ amount ‖ nonce)` with 32-byte big-endian integers.
    pub fn derive(user: &Address, amount: Amount, nonce: u64) -> Self {
        let mut amount_be = [0u8; 32];
        amount.to_big_endian(&mut amount_be);
        let mut nonce_be = [0u8; 32];
        nonce_be[24..].copy_from_slice(&nonce.to_be_bytes());

        let mut hasher = Keccak256::new();
        hasher.update(user.as_bytes());
        hasher.update(amount_be);
        hasher.update(nonce_be);
        let digest = hasher.finalize();

        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }
}

/// Which way value moves across the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Lock on source, mint credit on destination (a deposit).
    SourceToDestination,
    /// Burn credit on destination, release lock on source (a withdrawal).
    DestinationToSource,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::SourceToDestination => "deposit",
            Direction::DestinationToSource => "withdrawal",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Relay-side status of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Processed,
    Failed,
}

impl TransferStatus {
    /// `Processed` and `Failed` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Processed | TransferStatus::Failed)
    }
}

/// Parse a decimal amount string in base units.
pub fn parse_amount(s: &str) -> Result<Amount> {
    Amount::from_dec_str(s.trim()).map_err(|e| RelayError::InvalidAmount(format!("{s}: {e:?}")))
}

/// Render base units as a decimal string with `decimals` fractional digits,
/// trimming trailing zeros but keeping at least one (`1.0`, `0.05`).
pub fn format_units(value: impl Into<Volume>, decimals: usize) -> String {
    let value: Volume = value.into();
    if decimals == 0 {
        return value.to_string();
    }
    // Past the range of the unit, fall back to plain base units.
    let Some(unit) = Volume::from(10u64).checked_pow(Volume::from(decimals as u64)) else {
        return value.to_string();
    };
    let (whole, frac) = value.div_mod(unit);
    let frac = format!("{:0>width$}", frac.to_string(), width = decimals);
    let frac = frac.trim_end_matches('0');
    let frac = if frac.is_empty() { "0" } else { frac };
    format!("{whole}.{frac}")
}

/// Parse a hex string (optional `0x` prefix) into bytes.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str
        .strip_prefix("0x")
        .or_else(|| hex_str.strip_prefix("0X"))
        .unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| RelayError::InvalidHex(e.to_string()))
}

/// Convert bytes to a 0x-prefixed lowercase hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

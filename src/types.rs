//! Wire types for the x402 protocol as spoken by this facilitator.
//!
//! Mirrors the request/response structures of the x402 SDKs: payment
//! requirements stated by the merchant, the signed payment header submitted
//! by the client, and the settlement status vocabulary shared with the
//! transaction store.

use alloy::hex::FromHex;
use alloy::primitives::AddressError;
use alloy::{hex, primitives};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::registry::Network;

/// Represents the protocol version. Currently only version 1 is supported.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum X402Version {
    V1,
}

#[derive(Debug)]
pub struct X402VersionError(pub u8);

impl Display for X402VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unsupported x402Version: {}", self.0)
    }
}

impl std::error::Error for X402VersionError {}

impl TryFrom<u8> for X402Version {
    type Error = X402VersionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(X402Version::V1),
            _ => Err(X402VersionError(value)),
        }
    }
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(1)
    }
}

impl<'de> Deserialize<'de> for X402Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        X402Version::try_from(num).map_err(Error::custom)
    }
}

/// Enumerates payment schemes. Only "exact" is supported, meaning the payer
/// authorizes a specific amount rather than an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Exact => write!(f, "exact"),
        }
    }
}

/// Wrapper around [`primitives::Address`] providing display and
/// serialization support for typed Ethereum address handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvmAddress(pub primitives::Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<EvmAddress> for primitives::Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

impl From<primitives::Address> for EvmAddress {
    fn from(address: primitives::Address) -> Self {
        EvmAddress(address)
    }
}

impl FromStr for EvmAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EvmAddress(primitives::Address::from_hex(s)?))
    }
}

/// A 32-byte EVM transaction hash, encoded as 0x-prefixed hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHash(pub [u8; 32]);

impl<'de> Deserialize<'de> for TransactionHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        static TX_HASH_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid regex"));

        if !TX_HASH_REGEX.is_match(&s) {
            return Err(Error::custom("Invalid transaction hash format"));
        }

        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|_| Error::custom("Invalid hex in transaction hash"))?;

        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::custom("Transaction hash must be exactly 32 bytes"))?;

        Ok(TransactionHash(array))
    }
}

impl Serialize for TransactionHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl Display for TransactionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl From<primitives::B256> for TransactionHash {
    fn from(hash: primitives::B256) -> Self {
        TransactionHash(hash.0)
    }
}

impl FromStr for TransactionHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim_start_matches("0x"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(TransactionHash(array))
    }
}

/// Requirements set by the merchant for an acceptable payment.
///
/// `max_amount_required` stays a string here: it is parsed during
/// verification so a malformed amount surfaces as an invalid-reason rather
/// than a deserialization failure.
#[derive(Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: Scheme,
    pub network: Network,
    /// Token symbol (e.g. `usdc`) or 0x-prefixed contract address.
    pub asset: String,
    pub pay_to: EvmAddress,
    /// Required amount in token base units, as a decimal string.
    pub max_amount_required: String,
    /// Opaque URI path binding the payment to a resource.
    pub resource: String,
    #[serde(default = "default_timeout_seconds")]
    pub max_timeout_seconds: u64,
    #[serde(default)]
    pub description: String,
}

fn default_timeout_seconds() -> u64 {
    60
}

/// The payment header as submitted: either a base64-encoded JSON string or
/// one of the structured shapes the normalizer accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPaymentHeader {
    Encoded(String),
    Structured(serde_json::Value),
}

/// Wrapper for a payment header and requirements sent by the client to be
/// verified or settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: X402Version,
    pub payment_header: RawPaymentHeader,
    pub payment_requirements: PaymentRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Settlement uses the same request shape as verification.
pub type SettleRequest = VerifyRequest;

/// Lifecycle of a settlement transaction as tracked by the store.
///
/// `Confirmed` and `Failed` are terminal; the finality confirmer sweeps
/// everything else. Transitions are monotonic, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    PartialSettlement,
    Confirmed,
    Failed,
}

impl SettlementStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Confirmed | SettlementStatus::Failed)
    }
}

impl Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::PartialSettlement => "partial_settlement",
            SettlementStatus::Confirmed => "confirmed",
            SettlementStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown settlement status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SettlementStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SettlementStatus::Pending),
            "partial_settlement" => Ok(SettlementStatus::PartialSettlement),
            "confirmed" => Ok(SettlementStatus::Confirmed),
            "failed" => Ok(SettlementStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

//! Payment-header normalization.
//!
//! Clients submit the `X-PAYMENT` header in one of several shapes: a
//! base64-encoded JSON string, an envelope carrying `payload.authorization`
//! plus a combined signature, or a flat authorization object keyed by `from`
//! or (legacy) `sender`. This module folds all of them into one canonical
//! [`Authorization`] with a split `(v, r, s)` signature, failing with a
//! descriptive [`HeaderError`] on anything else.

use alloy::primitives::B256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timestamp::UnixTimestamp;
use crate::types::{EvmAddress, RawPaymentHeader};

/// Canonical payment authorization, produced by [`normalize`].
///
/// `value` stays a base-unit decimal string: the settler parses it at
/// submission time so the on-chain amount is exactly what the payer signed.
/// `nonce` is canonicalized to a 0x-prefixed 64-hex-char string but not
/// otherwise validated; the chain rejects malformed nonces on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_after: Option<UnixTimestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_before: Option<UnixTimestamp>,
    pub nonce: String,
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

/// A decomposed 65-byte ECDSA signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSignature {
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("Invalid payment header: {0}")]
    Invalid(String),
    #[error("Missing signature")]
    MissingSignature,
}

/// Intermediate shape shared by the flat and envelope forms.
///
/// The legacy `sender` key is folded into `from` during deserialization.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderFields {
    #[serde(alias = "sender")]
    from: Option<EvmAddress>,
    to: Option<EvmAddress>,
    value: Option<ValueField>,
    valid_after: Option<UnixTimestamp>,
    valid_before: Option<UnixTimestamp>,
    nonce: Option<String>,
    v: Option<u8>,
    r: Option<B256>,
    s: Option<B256>,
    signature: Option<String>,
}

/// Base-unit amount accepted as either a JSON string or an integer.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ValueField {
    Text(String),
    Number(u128),
}

impl ValueField {
    fn into_string(self) -> String {
        match self {
            ValueField::Text(text) => text,
            ValueField::Number(number) => number.to_string(),
        }
    }
}

/// Produce the canonical [`Authorization`] from any accepted header shape.
pub fn normalize(header: &RawPaymentHeader) -> Result<Authorization, HeaderError> {
    match header {
        RawPaymentHeader::Encoded(text) => {
            let bytes = b64
                .decode(text.as_bytes())
                .map_err(|_| HeaderError::Invalid("header is not valid base64".to_string()))?;
            let value: Value = serde_json::from_slice(&bytes).map_err(|_| {
                HeaderError::Invalid("decoded header is not valid JSON".to_string())
            })?;
            normalize_value(&value)
        }
        RawPaymentHeader::Structured(value) => normalize_value(value),
    }
}

fn normalize_value(value: &Value) -> Result<Authorization, HeaderError> {
    // A structured header may still carry the base64 form as a bare string.
    if let Some(text) = value.as_str() {
        return normalize(&RawPaymentHeader::Encoded(text.to_string()));
    }
    let object = value
        .as_object()
        .ok_or_else(|| HeaderError::Invalid("header must be an object".to_string()))?;

    if let Some(authorization) = object
        .get("payload")
        .and_then(|payload| payload.get("authorization"))
    {
        let mut fields: HeaderFields = serde_json::from_value(authorization.clone())
            .map_err(|e| HeaderError::Invalid(e.to_string()))?;
        fields.signature = object
            .get("payload")
            .and_then(|payload| payload.get("signature"))
            .and_then(|signature| signature.as_str())
            .map(str::to_string);
        // Split components may ride at the top level of the envelope.
        if let Some(v) = object.get("v").and_then(|v| v.as_u64()) {
            fields.v = Some(v as u8);
        }
        if let Some(r) = read_word(object.get("r")) {
            fields.r = Some(r);
        }
        if let Some(s) = read_word(object.get("s")) {
            fields.s = Some(s);
        }
        return build(fields);
    }

    let fields: HeaderFields =
        serde_json::from_value(value.clone()).map_err(|e| HeaderError::Invalid(e.to_string()))?;
    if fields.from.is_some() && fields.nonce.is_some() {
        return build(fields);
    }
    Err(HeaderError::Invalid(
        "unrecognized payment header shape".to_string(),
    ))
}

fn read_word(value: Option<&Value>) -> Option<B256> {
    value
        .and_then(|value| value.as_str())
        .and_then(|text| text.parse().ok())
}

fn build(fields: HeaderFields) -> Result<Authorization, HeaderError> {
    let from = fields
        .from
        .ok_or_else(|| HeaderError::Invalid("missing from address".to_string()))?;
    let to = fields
        .to
        .ok_or_else(|| HeaderError::Invalid("missing to address".to_string()))?;
    let value = fields
        .value
        .ok_or_else(|| HeaderError::Invalid("missing value".to_string()))?
        .into_string();
    let nonce = canonicalize_nonce(
        &fields
            .nonce
            .ok_or_else(|| HeaderError::Invalid("missing nonce".to_string()))?,
    )?;
    let signature = resolve_signature(
        fields.v,
        fields.r,
        fields.s,
        fields.signature.as_deref(),
    )?;
    Ok(Authorization {
        from,
        to,
        value,
        valid_after: fields.valid_after,
        valid_before: fields.valid_before,
        nonce,
        v: signature.v,
        r: signature.r,
        s: signature.s,
    })
}

/// Pick the signature out of its possible carriers: split `(v, r, s)` when
/// present and non-zero, otherwise a combined 65-byte hex string.
fn resolve_signature(
    v: Option<u8>,
    r: Option<B256>,
    s: Option<B256>,
    combined: Option<&str>,
) -> Result<SplitSignature, HeaderError> {
    if let (Some(v), Some(r), Some(s)) = (v, r, s) {
        if v != 0 && !r.is_zero() && !s.is_zero() {
            return Ok(SplitSignature { v, r, s });
        }
    }
    match combined {
        Some(combined) => split_signature(combined),
        None => Err(HeaderError::MissingSignature),
    }
}

/// Decompose a 65-byte hex signature into `(r, s, v)` words.
pub fn split_signature(signature: &str) -> Result<SplitSignature, HeaderError> {
    let stripped = signature.strip_prefix("0x").unwrap_or(signature);
    let bytes = hex::decode(stripped)
        .map_err(|_| HeaderError::Invalid("signature is not valid hex".to_string()))?;
    if bytes.len() != 65 {
        return Err(HeaderError::Invalid(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(SplitSignature {
        r: B256::from_slice(&bytes[0..32]),
        s: B256::from_slice(&bytes[32..64]),
        v: bytes[64],
    })
}

/// Reassemble a split signature into its combined 65-byte hex form.
pub fn combine_signature(signature: &SplitSignature) -> String {
    format!(
        "0x{}{}{:02x}",
        hex::encode(signature.r),
        hex::encode(signature.s),
        signature.v
    )
}

/// Ensure a nonce is 0x-prefixed and 32 bytes of hex long.
///
/// No hex validation happens here: a garbled nonce is rejected by the chain
/// when the transaction is submitted.
pub fn canonicalize_nonce(nonce: &str) -> Result<String, HeaderError> {
    let prefixed = if nonce.starts_with("0x") {
        nonce.to_string()
    } else {
        format!("0x{nonce}")
    };
    if prefixed.len() != 66 {
        return Err(HeaderError::Invalid(format!(
            "nonce must be 32 bytes of hex, got {} characters",
            prefixed.len()
        )));
    }
    Ok(prefixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAYER: &str = "0x1111111111111111111111111111111111111111";
    const MERCHANT: &str = "0x2222222222222222222222222222222222222222";
    const NONCE: &str = "0x00000000000000000000000000000000000000000000000000000000000000aa";

    fn combined_signature() -> String {
        format!("0x{}{}{:02x}", "11".repeat(32), "22".repeat(32), 0x1c)
    }

    fn flat_header() -> Value {
        json!({
            "from": PAYER,
            "to": MERCHANT,
            "value": "1000000",
            "validAfter": "0",
            "validBefore": "9999999999",
            "nonce": NONCE,
            "signature": combined_signature(),
        })
    }

    #[test]
    fn accepts_flat_shape() {
        let auth = normalize(&RawPaymentHeader::Structured(flat_header())).unwrap();
        assert_eq!(auth.from.to_string().to_lowercase(), PAYER);
        assert_eq!(auth.value, "1000000");
        assert_eq!(auth.nonce, NONCE);
        assert_eq!(auth.v, 0x1c);
    }

    #[test]
    fn accepts_sender_shape() {
        let mut header = flat_header();
        let from = header.as_object_mut().unwrap().remove("from").unwrap();
        header
            .as_object_mut()
            .unwrap()
            .insert("sender".to_string(), from);
        let auth = normalize(&RawPaymentHeader::Structured(header)).unwrap();
        assert_eq!(auth.from.to_string().to_lowercase(), PAYER);
    }

    #[test]
    fn accepts_envelope_shape() {
        let header = json!({
            "payload": {
                "authorization": {
                    "from": PAYER,
                    "to": MERCHANT,
                    "value": 1000000u64,
                    "nonce": NONCE,
                },
                "signature": combined_signature(),
            }
        });
        let auth = normalize(&RawPaymentHeader::Structured(header)).unwrap();
        assert_eq!(auth.value, "1000000");
        assert_eq!(auth.r, B256::from([0x11; 32]));
        assert_eq!(auth.s, B256::from([0x22; 32]));
    }

    #[test]
    fn envelope_prefers_split_components_when_non_zero() {
        let header = json!({
            "payload": {
                "authorization": {
                    "from": PAYER,
                    "to": MERCHANT,
                    "value": "5",
                    "nonce": NONCE,
                },
                "signature": combined_signature(),
            },
            "v": 27,
            "r": format!("0x{}", "33".repeat(32)),
            "s": format!("0x{}", "44".repeat(32)),
        });
        let auth = normalize(&RawPaymentHeader::Structured(header)).unwrap();
        assert_eq!(auth.v, 27);
        assert_eq!(auth.r, B256::from([0x33; 32]));
    }

    #[test]
    fn accepts_base64_encoded_header() {
        let encoded = b64.encode(serde_json::to_vec(&flat_header()).unwrap());
        let auth = normalize(&RawPaymentHeader::Encoded(encoded)).unwrap();
        assert_eq!(auth.value, "1000000");
    }

    #[test]
    fn normalize_round_trips_canonical_form() {
        let auth = normalize(&RawPaymentHeader::Structured(flat_header())).unwrap();
        let serialized = serde_json::to_value(&auth).unwrap();
        let again = normalize(&RawPaymentHeader::Structured(serialized)).unwrap();
        assert_eq!(auth, again);
    }

    #[test]
    fn missing_signature_is_reported() {
        let mut header = flat_header();
        header.as_object_mut().unwrap().remove("signature");
        let error = normalize(&RawPaymentHeader::Structured(header)).unwrap_err();
        assert_eq!(error, HeaderError::MissingSignature);
    }

    #[test]
    fn unrecognized_shape_is_rejected() {
        let error =
            normalize(&RawPaymentHeader::Structured(json!({"hello": "world"}))).unwrap_err();
        assert!(matches!(error, HeaderError::Invalid(_)));
    }

    #[test]
    fn nonce_gains_prefix_and_is_length_checked() {
        let bare = &NONCE[2..];
        assert_eq!(canonicalize_nonce(bare).unwrap(), NONCE);
        assert!(canonicalize_nonce("0xdead").is_err());
    }

    #[test]
    fn split_and_combine_are_inverse() {
        let original = combined_signature();
        let split = split_signature(&original).unwrap();
        assert_eq!(combine_signature(&split), original);
        let without_prefix = original.trim_start_matches("0x");
        assert_eq!(split_signature(without_prefix).unwrap(), split);
    }

    #[test]
    fn short_signature_is_rejected() {
        let error = split_signature("0x1234").unwrap_err();
        assert!(matches!(error, HeaderError::Invalid(_)));
    }
}

//! Agent identity anchoring.
//!
//! When a request carries an `agentId` and the integration is enabled, a
//! successful settlement is anchored on an external reputation registry. The
//! collaborator sits behind [`IdentityAnchor`] so deployments without the
//! integration run with no anchor at all, and anchoring failures never fail a
//! settlement: the settler logs them and omits the evidence fields from the
//! response.

use alloy::primitives::keccak256;
use async_trait::async_trait;

use crate::registry::Network;
use crate::types::TransactionHash;

/// Evidence returned by a successful anchoring call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorEvidence {
    pub evidence_hash: String,
    pub proof_of_agency: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity registry rejected the anchor: {0}")]
    Rejected(String),
}

/// External collaborator anchoring `{agentId, txHash, chain, amount,
/// paymentData}` tuples.
#[async_trait]
pub trait IdentityAnchor: Send + Sync {
    async fn anchor(
        &self,
        agent_id: &str,
        tx_hash: &TransactionHash,
        chain: Network,
        amount: u128,
        payment_data: &serde_json::Value,
    ) -> Result<AnchorEvidence, IdentityError>;
}

/// Anchor that derives evidence locally from the settlement tuple.
///
/// Stands in for the remote registry client: the evidence hash is the keccak
/// commitment the registry would store, so downstream consumers receive
/// stable identifiers either way.
pub struct LocalEvidenceAnchor;

#[async_trait]
impl IdentityAnchor for LocalEvidenceAnchor {
    async fn anchor(
        &self,
        agent_id: &str,
        tx_hash: &TransactionHash,
        chain: Network,
        amount: u128,
        payment_data: &serde_json::Value,
    ) -> Result<AnchorEvidence, IdentityError> {
        let commitment = format!("{agent_id}:{tx_hash}:{chain}:{amount}:{payment_data}");
        let evidence_hash = format!("0x{}", hex::encode(keccak256(commitment.as_bytes())));
        let proof_of_agency = format!("poa_{}", &evidence_hash[2..18]);
        Ok(AnchorEvidence {
            evidence_hash,
            proof_of_agency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn evidence_is_deterministic_per_settlement() {
        let anchor = LocalEvidenceAnchor;
        let hash = TransactionHash([0x11; 32]);
        let payment = serde_json::json!({ "nonce": "0xaa" });
        let first = anchor
            .anchor("agent-7", &hash, Network::BaseSepolia, 1_000_000, &payment)
            .await
            .unwrap();
        let second = anchor
            .anchor("agent-7", &hash, Network::BaseSepolia, 1_000_000, &payment)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(first.evidence_hash.starts_with("0x"));
        assert_eq!(first.evidence_hash.len(), 66);

        let other = anchor
            .anchor("agent-8", &hash, Network::BaseSepolia, 1_000_000, &payment)
            .await
            .unwrap();
        assert_ne!(first.evidence_hash, other.evidence_hash);
    }
}

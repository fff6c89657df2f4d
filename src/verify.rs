//! Payment verification against live chain state.
//!
//! The verifier runs the fail-fast precondition sequence for a payment:
//! network and asset support, header well-formedness, amount syntax, the
//! authorization time window, payer balance, and replay state (ERC-3009
//! nonce, or facilitator allowance for relayed tokens).
//!
//! It never returns an error: every failure, including RPC outages, is
//! reported as `{is_valid: false, invalid_reason}` so `/verify` can answer
//! 200 with a structured reason.

use std::sync::Arc;

use alloy::primitives::{B256, U256};
use tracing::instrument;

use crate::fee;
use crate::header;
use crate::registry::Registry;
use crate::timestamp::UnixTimestamp;
use crate::types::VerifyRequest;

/// Result of a verification pass.
///
/// `decimals`, `symbol`, and `amount` are populated as soon as they are
/// resolved so response assembly can render the fee breakdown even for
/// rejected payments.
#[derive(Debug, Clone, Default)]
pub struct VerifyOutcome {
    pub is_valid: bool,
    pub invalid_reason: Option<String>,
    pub decimals: Option<u8>,
    pub symbol: Option<String>,
    pub amount: Option<u128>,
}

impl VerifyOutcome {
    fn invalid(reason: impl Into<String>) -> Self {
        VerifyOutcome {
            is_valid: false,
            invalid_reason: Some(reason.into()),
            ..VerifyOutcome::default()
        }
    }

    fn with_token(mut self, decimals: u8, symbol: &str) -> Self {
        self.decimals = Some(decimals);
        self.symbol = Some(symbol.to_string());
        self
    }

    fn with_amount(mut self, amount: u128) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// Verifies payment authorizations against requirements and chain state.
#[derive(Clone)]
pub struct Verifier {
    registry: Arc<Registry>,
}

impl Verifier {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Run the verification sequence for a request.
    #[instrument(skip_all, fields(network = %request.payment_requirements.network))]
    pub async fn verify(&self, request: &VerifyRequest) -> VerifyOutcome {
        let requirements = &request.payment_requirements;
        let network = requirements.network;

        if self.registry.chain_of(network).is_err() {
            return VerifyOutcome::invalid(format!("Unsupported network: {network}"));
        }

        let auth = match header::normalize(&request.payment_header) {
            Ok(auth) => auth,
            Err(e) => return VerifyOutcome::invalid(e.to_string()),
        };

        let (token, token_address) = match self.registry.resolve_asset(network, &requirements.asset)
        {
            Ok(resolved) => resolved,
            Err(e) => return VerifyOutcome::invalid(e.to_string()),
        };
        let decimals = token.decimals;
        let symbol = token.symbol.clone();
        let supports_eip3009 = token.supports_eip3009;

        let amount = match fee::parse_base_units(&requirements.max_amount_required) {
            Ok(amount) => amount,
            Err(e) => return VerifyOutcome::invalid(e.to_string()).with_token(decimals, &symbol),
        };

        let now = match UnixTimestamp::try_now() {
            Ok(now) => now,
            Err(e) => {
                return VerifyOutcome::invalid(format!("Cannot read system clock: {e}"))
                    .with_token(decimals, &symbol)
                    .with_amount(amount);
            }
        };
        if let Some(valid_after) = auth.valid_after {
            if now < valid_after {
                return VerifyOutcome::invalid(format!(
                    "Authorization not yet valid (validAfter: {valid_after}, now: {now})"
                ))
                .with_token(decimals, &symbol)
                .with_amount(amount);
            }
        }
        if let Some(valid_before) = auth.valid_before {
            if now > valid_before {
                return VerifyOutcome::invalid(format!(
                    "Authorization expired (validBefore: {valid_before}, now: {now})"
                ))
                .with_token(decimals, &symbol)
                .with_amount(amount);
            }
        }

        let public = match self.registry.public_client(network) {
            Ok(client) => client,
            Err(e) => {
                return VerifyOutcome::invalid(e.to_string())
                    .with_token(decimals, &symbol)
                    .with_amount(amount);
            }
        };

        let required = U256::from(amount);
        let balance = match public.balance_of(token_address, auth.from.into()).await {
            Ok(balance) => balance,
            Err(e) => {
                return VerifyOutcome::invalid(e.to_string())
                    .with_token(decimals, &symbol)
                    .with_amount(amount);
            }
        };
        if balance < required {
            return VerifyOutcome::invalid(format!(
                "Insufficient {} balance. Required: {required}, Available: {balance}",
                symbol.to_uppercase()
            ))
            .with_token(decimals, &symbol)
            .with_amount(amount);
        }

        if supports_eip3009 {
            let nonce: B256 = match auth.nonce.parse() {
                Ok(nonce) => nonce,
                Err(_) => {
                    return VerifyOutcome::invalid(format!(
                        "Invalid nonce: {} is not 32 bytes of hex",
                        auth.nonce
                    ))
                    .with_token(decimals, &symbol)
                    .with_amount(amount);
                }
            };
            match public
                .authorization_state(token_address, auth.from.into(), nonce)
                .await
            {
                Ok(true) => {
                    return VerifyOutcome::invalid(format!(
                        "Authorization already used (nonce: {})",
                        auth.nonce
                    ))
                    .with_token(decimals, &symbol)
                    .with_amount(amount);
                }
                Ok(false) => {}
                Err(e) => {
                    return VerifyOutcome::invalid(e.to_string())
                        .with_token(decimals, &symbol)
                        .with_amount(amount);
                }
            }
        } else {
            let facilitator = match self.registry.facilitator_address(network) {
                Ok(address) => address,
                Err(e) => {
                    return VerifyOutcome::invalid(e.to_string())
                        .with_token(decimals, &symbol)
                        .with_amount(amount);
                }
            };
            let allowance = match public
                .allowance(token_address, auth.from.into(), facilitator.into())
                .await
            {
                Ok(allowance) => allowance,
                Err(e) => {
                    return VerifyOutcome::invalid(e.to_string())
                        .with_token(decimals, &symbol)
                        .with_amount(amount);
                }
            };
            if allowance < required {
                return VerifyOutcome::invalid(format!(
                    "Insufficient allowance for relayed transfer. Required: {required}, Approved: {allowance}"
                ))
                .with_token(decimals, &symbol)
                .with_amount(amount);
            }
        }

        VerifyOutcome {
            is_valid: true,
            invalid_reason: None,
            decimals: Some(decimals),
            symbol: Some(symbol),
            amount: Some(amount),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Network;
    use crate::registry::testing::mock_registry;
    use crate::types::{PaymentRequirements, RawPaymentHeader, Scheme, X402Version};
    use alloy::primitives::U256;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const PAYER: &str = "0x1111111111111111111111111111111111111111";
    const MERCHANT: &str = "0x2222222222222222222222222222222222222222";
    const NONCE: &str = "0x00000000000000000000000000000000000000000000000000000000000000aa";

    fn header(valid_before: u64) -> RawPaymentHeader {
        RawPaymentHeader::Structured(json!({
            "from": PAYER,
            "to": MERCHANT,
            "value": "1000000",
            "validAfter": "0",
            "validBefore": valid_before.to_string(),
            "nonce": NONCE,
            "signature": format!("0x{}{}1b", "11".repeat(32), "22".repeat(32)),
        }))
    }

    fn request(network: Network, asset: &str, valid_before: u64) -> VerifyRequest {
        VerifyRequest {
            x402_version: X402Version::V1,
            payment_header: header(valid_before),
            payment_requirements: PaymentRequirements {
                scheme: Scheme::Exact,
                network,
                asset: asset.to_string(),
                pay_to: MERCHANT.parse().unwrap(),
                max_amount_required: "1000000".to_string(),
                resource: "/reports/weather".to_string(),
                max_timeout_seconds: 30,
                description: String::new(),
            },
            agent_id: None,
        }
    }

    fn far_future() -> u64 {
        UnixTimestamp::try_now().unwrap().seconds_since_epoch() + 3600
    }

    #[tokio::test]
    async fn happy_path_reports_valid_with_decimals() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        let verifier = Verifier::new(Arc::new(registry));

        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", far_future()))
            .await;
        assert!(outcome.is_valid, "reason: {:?}", outcome.invalid_reason);
        assert_eq!(outcome.decimals, Some(6));
        assert_eq!(outcome.amount, Some(1_000_000));
    }

    #[tokio::test]
    async fn unsupported_network_is_reported() {
        let (registry, _gateway) = mock_registry(Network::BaseSepolia);
        let verifier = Verifier::new(Arc::new(registry));

        let outcome = verifier
            .verify(&request(Network::ZgMainnet, "w0g", far_future()))
            .await;
        assert!(!outcome.is_valid);
        assert!(
            outcome
                .invalid_reason
                .unwrap()
                .contains("Unsupported network: 0g-mainnet")
        );
    }

    #[tokio::test]
    async fn expired_authorization_is_reported() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        let verifier = Verifier::new(Arc::new(registry));

        let now = UnixTimestamp::try_now().unwrap().seconds_since_epoch();
        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", now - 10))
            .await;
        assert!(!outcome.is_valid);
        assert!(outcome.invalid_reason.unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn window_bounds_are_inclusive() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        let verifier = Verifier::new(Arc::new(registry));

        // validBefore exactly now is still acceptable.
        let now = UnixTimestamp::try_now().unwrap().seconds_since_epoch();
        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", now))
            .await;
        assert!(outcome.is_valid, "reason: {:?}", outcome.invalid_reason);
    }

    #[tokio::test]
    async fn future_valid_after_is_reported() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        let verifier = Verifier::new(Arc::new(registry));

        let mut request = request(Network::BaseSepolia, "usdc", far_future());
        let not_yet = UnixTimestamp::try_now().unwrap().seconds_since_epoch() + 30;
        request.payment_header = RawPaymentHeader::Structured(json!({
            "from": PAYER,
            "to": MERCHANT,
            "value": "1000000",
            "validAfter": not_yet.to_string(),
            "validBefore": (not_yet + 3600).to_string(),
            "nonce": NONCE,
            "signature": format!("0x{}{}1b", "11".repeat(32), "22".repeat(32)),
        }));
        let outcome = verifier.verify(&request).await;
        assert!(!outcome.is_valid);
        assert!(outcome.invalid_reason.unwrap().contains("not yet valid"));
    }

    #[tokio::test]
    async fn balance_boundary_is_exact() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        let verifier = Verifier::new(Arc::new(registry));

        // amount == balance is acceptable.
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(1_000_000u64));
        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", far_future()))
            .await;
        assert!(outcome.is_valid);

        // amount == balance + 1 is not.
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(999_999u64));
        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", far_future()))
            .await;
        assert!(!outcome.is_valid);
        let reason = outcome.invalid_reason.unwrap();
        assert!(reason.contains("Insufficient USDC balance"));
        assert!(reason.contains("Required: 1000000"));
        assert!(reason.contains("Available: 999999"));
    }

    #[tokio::test]
    async fn consumed_nonce_is_reported() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        gateway.used_nonces.insert(NONCE.parse().unwrap());
        let verifier = Verifier::new(Arc::new(registry));

        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", far_future()))
            .await;
        assert!(!outcome.is_valid);
        assert!(outcome.invalid_reason.unwrap().contains("already used"));
    }

    #[tokio::test]
    async fn relayer_mode_checks_allowance() {
        let (registry, gateway) = mock_registry(Network::ZgMainnet);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        let verifier = Verifier::new(Arc::new(registry));

        let outcome = verifier
            .verify(&request(Network::ZgMainnet, "w0g", far_future()))
            .await;
        assert!(!outcome.is_valid);
        assert!(
            outcome
                .invalid_reason
                .unwrap()
                .contains("Insufficient allowance")
        );

        gateway.allowances.insert(
            (PAYER.parse().unwrap(), gateway.signer.into()),
            U256::from(1_000_000u64),
        );
        let outcome = verifier
            .verify(&request(Network::ZgMainnet, "w0g", far_future()))
            .await;
        assert!(outcome.is_valid, "reason: {:?}", outcome.invalid_reason);
    }

    #[tokio::test]
    async fn rpc_failure_is_reported_not_thrown() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway.fail_reads.store(true, Ordering::Relaxed);
        let verifier = Verifier::new(Arc::new(registry));

        let outcome = verifier
            .verify(&request(Network::BaseSepolia, "usdc", far_future()))
            .await;
        assert!(!outcome.is_valid);
        assert!(
            outcome
                .invalid_reason
                .unwrap()
                .contains("simulated RPC outage")
        );
    }

    #[tokio::test]
    async fn malformed_amount_is_reported() {
        let (registry, gateway) = mock_registry(Network::BaseSepolia);
        gateway
            .balances
            .insert(PAYER.parse().unwrap(), U256::from(5_000_000u64));
        let verifier = Verifier::new(Arc::new(registry));

        let mut request = request(Network::BaseSepolia, "usdc", far_future());
        request.payment_requirements.max_amount_required = "1.21 gigawatts".to_string();
        let outcome = verifier.verify(&request).await;
        assert!(!outcome.is_valid);
        assert!(outcome.invalid_reason.unwrap().contains("Invalid amount"));
    }
}

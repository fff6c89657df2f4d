//! On-chain settlement of verified payments.
//!
//! The settler dispatches on the token's capabilities: tokens implementing
//! ERC-3009 settle through a single `transferWithAuthorization` carrying the
//! payer's signature, everything else goes through the relayer path, which
//! spends a prior allowance with two `transferFrom` legs (merchant net,
//! treasury fee). Both run behind the shared [`SettlementStrategy`] seam;
//! header parsing and receipt classification stay outside the strategies.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::chain::{AuthorizedTransfer, ChainError, EvmGateway, TxOutcome, TxStatus};
use crate::header::{self, Authorization, HeaderError};
use crate::identity::{AnchorEvidence, IdentityAnchor};
use crate::registry::{Network, Registry, RegistryError};
use crate::store::{TransactionRecord, TransactionStore};
use crate::types::{EvmAddress, SettleRequest, SettlementStatus, TransactionHash};

/// Default validity horizon when the authorization omits `validBefore`.
const DEFAULT_VALIDITY_SECS: u64 = 3600;
/// Bounds applied to the client-advertised settlement deadline.
const MIN_DEADLINE_SECS: u64 = 1;
const MAX_DEADLINE_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("Invalid signed value: {0}")]
    InvalidValue(String),
    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),
    #[error("TREASURY_ADDRESS is required for relayed settlement")]
    MissingTreasury,
    #[error("Authorization nonce was already relayed (nonce: {0})")]
    NonceAlreadyRelayed(String),
    #[error("Cannot read system clock: {0}")]
    Clock(String),
    #[error("Settlement failed: {0}")]
    Chain(#[from] ChainError),
}

/// Result of a settlement attempt.
#[derive(Debug, Clone)]
pub struct SettleOutcome {
    pub tx_hash: TransactionHash,
    pub tx_hash_fee: Option<TransactionHash>,
    pub status: SettlementStatus,
    pub confirmations: u64,
    pub network: Network,
    pub anchor: Option<AnchorEvidence>,
}

/// Everything a strategy needs to submit a settlement.
struct SettleContext<'a> {
    wallet: &'a Arc<dyn EvmGateway>,
    token_address: Address,
    auth: &'a Authorization,
    pay_to: Address,
    treasury: Option<Address>,
    fee: u128,
    net: u128,
    confirmations: u64,
    deadline: Duration,
}

/// What a strategy reports back before record persistence and anchoring.
struct StrategyOutcome {
    tx_hash: TransactionHash,
    tx_hash_fee: Option<TransactionHash>,
    status: SettlementStatus,
    confirmations: u64,
}

/// One way of moving the authorized funds on-chain.
#[async_trait]
trait SettlementStrategy: Send + Sync {
    async fn submit(&self, ctx: &SettleContext<'_>) -> Result<StrategyOutcome, SettlementError>;
}

/// ERC-3009 `transferWithAuthorization`: gasless for the payer, single
/// signature, single transaction.
struct Eip3009Strategy;

#[async_trait]
impl SettlementStrategy for Eip3009Strategy {
    async fn submit(&self, ctx: &SettleContext<'_>) -> Result<StrategyOutcome, SettlementError> {
        let auth = ctx.auth;
        // The signature covers `value`; submitting anything but the signed
        // amount invalidates it. The fee is tracked off-chain on this path.
        let value = U256::from_str(&auth.value)
            .map_err(|_| SettlementError::InvalidValue(auth.value.clone()))?;
        let valid_after = U256::from(auth.valid_after.map(|ts| ts.0).unwrap_or(0));
        let valid_before = match auth.valid_before {
            Some(ts) => U256::from(ts.0),
            None => {
                let now = crate::timestamp::UnixTimestamp::try_now()
                    .map_err(|e| SettlementError::Clock(e.to_string()))?;
                U256::from(now.0 + DEFAULT_VALIDITY_SECS)
            }
        };
        let nonce = B256::from_str(&auth.nonce)
            .map_err(|_| SettlementError::InvalidNonce(auth.nonce.clone()))?;

        let outcome = ctx
            .wallet
            .transfer_with_authorization(
                ctx.token_address,
                AuthorizedTransfer {
                    from: auth.from.into(),
                    to: ctx.pay_to,
                    value,
                    valid_after,
                    valid_before,
                    nonce,
                    v: auth.v,
                    r: auth.r,
                    s: auth.s,
                },
                ctx.confirmations,
                ctx.deadline,
            )
            .await?;

        let (status, confirmations) = match outcome.status {
            TxStatus::Success => (SettlementStatus::Confirmed, ctx.confirmations),
            TxStatus::Reverted => (SettlementStatus::Failed, ctx.confirmations),
            TxStatus::TimedOut => (SettlementStatus::Pending, 0),
        };
        Ok(StrategyOutcome {
            tx_hash: outcome.hash,
            tx_hash_fee: None,
            status,
            confirmations,
        })
    }
}

/// Relayed `transferFrom` against a prior allowance: two concurrent legs,
/// merchant net and treasury fee. Not atomic; a split outcome settles as
/// `partial_settlement` with both hashes reported for reconciliation.
struct RelayerStrategy;

#[async_trait]
impl SettlementStrategy for RelayerStrategy {
    async fn submit(&self, ctx: &SettleContext<'_>) -> Result<StrategyOutcome, SettlementError> {
        let treasury = ctx.treasury.ok_or(SettlementError::MissingTreasury)?;
        let from: Address = ctx.auth.from.into();

        let (merchant_leg, fee_leg) = tokio::join!(
            ctx.wallet.transfer_from(
                ctx.token_address,
                from,
                ctx.pay_to,
                U256::from(ctx.net),
                ctx.confirmations,
                ctx.deadline,
            ),
            ctx.wallet.transfer_from(
                ctx.token_address,
                from,
                treasury,
                U256::from(ctx.fee),
                ctx.confirmations,
                ctx.deadline,
            ),
        );

        // Without a merchant-leg hash there is nothing to reconcile against.
        let merchant = merchant_leg?;
        let fee: Option<TxOutcome> = match fee_leg {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "fee transfer failed to broadcast");
                None
            }
        };

        let fee_success = fee.map(|leg| leg.status == TxStatus::Success).unwrap_or(false);
        let timed_out = merchant.status == TxStatus::TimedOut
            || fee.map(|leg| leg.status == TxStatus::TimedOut).unwrap_or(false);
        let reverted = merchant.status == TxStatus::Reverted
            || fee.map(|leg| leg.status == TxStatus::Reverted).unwrap_or(true);

        let (status, confirmations) = if merchant.status == TxStatus::Success && fee_success {
            (SettlementStatus::Confirmed, ctx.confirmations)
        } else if timed_out && !reverted {
            (SettlementStatus::Pending, 0)
        } else {
            (SettlementStatus::PartialSettlement, 0)
        };

        Ok(StrategyOutcome {
            tx_hash: merchant.hash,
            tx_hash_fee: fee.map(|leg| leg.hash),
            status,
            confirmations,
        })
    }
}

/// Settles verified payments and tracks the resulting transactions.
pub struct Settler {
    registry: Arc<Registry>,
    store: Option<Arc<dyn TransactionStore>>,
    treasury: Option<EvmAddress>,
    anchor: Option<Arc<dyn IdentityAnchor>>,
    /// Nonces this process has already relayed. Allowance decrement is the
    /// primary replay guard; this closes the window for tokens with
    /// non-standard allowance semantics.
    relayed_nonces: DashSet<String>,
}

impl Settler {
    pub fn new(
        registry: Arc<Registry>,
        store: Option<Arc<dyn TransactionStore>>,
        treasury: Option<EvmAddress>,
        anchor: Option<Arc<dyn IdentityAnchor>>,
    ) -> Self {
        Self {
            registry,
            store,
            treasury,
            anchor,
            relayed_nonces: DashSet::new(),
        }
    }

    /// Settle a verified request on-chain.
    ///
    /// `fee` and `net` are the base-unit split of `maxAmountRequired`,
    /// precomputed by the caller. The ERC-3009 path ignores them on-chain
    /// (the signed amount is immutable); the relayer path settles them as
    /// separate legs.
    #[instrument(skip_all, fields(network = %request.payment_requirements.network))]
    pub async fn settle(
        &self,
        request: &SettleRequest,
        fee: u128,
        net: u128,
    ) -> Result<SettleOutcome, SettlementError> {
        let requirements = &request.payment_requirements;
        let network = requirements.network;
        let confirmations = self.registry.confirmations_of(network)?;
        let auth = header::normalize(&request.payment_header)?;
        let (token, token_address) = self.registry.resolve_asset(network, &requirements.asset)?;
        let supports_eip3009 = token.supports_eip3009;
        let wallet = self.registry.wallet_client(network)?;

        let deadline = Duration::from_secs(
            requirements
                .max_timeout_seconds
                .clamp(MIN_DEADLINE_SECS, MAX_DEADLINE_SECS),
        );

        if !supports_eip3009 && !self.relayed_nonces.insert(auth.nonce.clone()) {
            return Err(SettlementError::NonceAlreadyRelayed(auth.nonce.clone()));
        }

        let ctx = SettleContext {
            wallet,
            token_address,
            auth: &auth,
            pay_to: requirements.pay_to.into(),
            treasury: self.treasury.map(Into::into),
            fee,
            net,
            confirmations,
            deadline,
        };
        let strategy: &dyn SettlementStrategy = if supports_eip3009 {
            &Eip3009Strategy
        } else {
            &RelayerStrategy
        };
        let outcome = match strategy.submit(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !supports_eip3009 {
                    // Nothing was broadcast; the nonce may be retried.
                    self.relayed_nonces.remove(&auth.nonce);
                }
                return Err(e);
            }
        };

        tracing::info!(
            tx = %outcome.tx_hash,
            status = %outcome.status,
            "settlement submitted"
        );

        if let Some(store) = &self.store {
            let record = TransactionRecord {
                id: new_record_id(),
                tx_hash: outcome.tx_hash.to_string(),
                tx_hash_fee: outcome.tx_hash_fee.map(|hash| hash.to_string()),
                chain: network,
                status: outcome.status,
                confirmations: outcome.confirmations,
                confirmed_at: (outcome.status == SettlementStatus::Confirmed).then(Utc::now),
            };
            if let Err(e) = store.insert(&record).await {
                tracing::error!(error = %e, tx = %outcome.tx_hash, "failed to persist transaction record");
            }
        }

        let anchor = self
            .maybe_anchor(
                request.agent_id.as_deref(),
                supports_eip3009,
                outcome.status,
                &outcome.tx_hash,
                network,
                fee + net,
                &auth,
            )
            .await;

        Ok(SettleOutcome {
            tx_hash: outcome.tx_hash,
            tx_hash_fee: outcome.tx_hash_fee,
            status: outcome.status,
            confirmations: outcome.confirmations,
            network,
            anchor,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn maybe_anchor(
        &self,
        agent_id: Option<&str>,
        supports_eip3009: bool,
        status: SettlementStatus,
        tx_hash: &TransactionHash,
        network: Network,
        amount: u128,
        auth: &Authorization,
    ) -> Option<AnchorEvidence> {
        let anchor = self.anchor.as_ref()?;
        let agent_id = agent_id?;
        if !supports_eip3009 || status != SettlementStatus::Confirmed {
            return None;
        }
        let payment_data = serde_json::to_value(auth).unwrap_or(serde_json::Value::Null);
        match anchor
            .anchor(agent_id, tx_hash, network, amount, &payment_data)
            .await
        {
            Ok(evidence) => Some(evidence),
            Err(e) => {
                tracing::warn!(error = %e, agent = agent_id, "identity anchoring failed");
                None
            }
        }
    }
}

fn new_record_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("txr_{}_{}", Utc::now().timestamp_millis(), suffix)
}

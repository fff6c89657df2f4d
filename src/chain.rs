//! Chain clients for Ethereum-compatible networks.
//!
//! [`EvmGateway`] is the only surface through which the rest of the crate
//! touches a chain: token reads (balance, allowance, authorization state),
//! receipt and block lookups, and the two settlement writes. The production
//! implementation [`AlloyGateway`] wraps an Alloy provider with retrying
//! transport and an optional signing wallet; tests substitute the in-memory
//! gateway from [`testing`].

use alloy::network::{Ethereum, EthereumWallet, NetworkWallet};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::client::ClientBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::transports::layers::RetryBackoffLayer;
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::registry::Network;
use crate::types::{EvmAddress, TransactionHash};

/// Write retries against flaky RPC endpoints.
const WRITE_RETRIES: u32 = 3;
/// Delay between write retries, in milliseconds.
const WRITE_RETRY_DELAY_MS: u64 = 1000;
/// Compute-unit budget for the retry layer's rate estimation.
const RETRY_COMPUTE_UNITS: u64 = 100;

sol! {
    /// Token interface used for settlement: the ERC-20 read surface plus the
    /// ERC-3009 authorization entry points.
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[sol(rpc)]
    interface IErc3009 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

/// Errors surfaced by chain interactions.
///
/// `Rpc` carries the upstream message verbatim: the verifier reports it as an
/// invalid-reason and the settler wraps it into a settlement error.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("{0}")]
    Rpc(String),
    #[error("wallet client has no signing key")]
    NoSigner,
}

/// Condensed transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block_number: u64,
    pub success: bool,
}

/// Terminal state of a submitted transaction as observed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
    /// Broadcast succeeded but the receipt wait exceeded the deadline.
    TimedOut,
}

/// Outcome of a settlement write: the broadcast hash and what the receipt
/// wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub hash: TransactionHash,
    pub status: TxStatus,
}

/// Parameters of an ERC-3009 `transferWithAuthorization` call, exactly as
/// signed by the payer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorizedTransfer {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: U256,
    pub valid_before: U256,
    pub nonce: B256,
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

/// Capability handle to one EVM network.
///
/// Read methods are served by the public client; write methods require the
/// facilitator's signing key and fail with [`ChainError::NoSigner`] on a
/// read-only handle.
#[async_trait]
pub trait EvmGateway: Send + Sync {
    /// Address of the configured signing key, if any.
    fn signer_address(&self) -> Option<EvmAddress>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, ChainError>;

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError>;

    /// Whether the ERC-3009 nonce has already been consumed by `authorizer`.
    async fn authorization_state(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, ChainError>;

    /// Receipt of a transaction, or `None` while it is unmined.
    async fn receipt(&self, tx_hash: TransactionHash) -> Result<Option<ReceiptInfo>, ChainError>;

    /// Submit `transferWithAuthorization` and await the receipt at the given
    /// confirmation depth, bounded by `deadline`.
    async fn transfer_with_authorization(
        &self,
        token: Address,
        transfer: AuthorizedTransfer,
        confirmations: u64,
        deadline: Duration,
    ) -> Result<TxOutcome, ChainError>;

    /// Submit `transferFrom` against a prior allowance and await the receipt
    /// at the given confirmation depth, bounded by `deadline`.
    async fn transfer_from(
        &self,
        token: Address,
        from: Address,
        to: Address,
        value: U256,
        confirmations: u64,
        deadline: Duration,
    ) -> Result<TxOutcome, ChainError>;
}

/// Alloy-backed [`EvmGateway`].
#[derive(Debug)]
pub struct AlloyGateway<P> {
    provider: P,
    network: Network,
    signer: Option<EvmAddress>,
}

impl AlloyGateway<()> {
    /// Build an [`EthereumWallet`] from a raw private key string.
    pub fn wallet_from_key(key: &str) -> Result<EthereumWallet, ChainError> {
        let signer =
            PrivateKeySigner::from_str(key.trim()).map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(EthereumWallet::from(signer))
    }

    /// Connect to an RPC endpoint, optionally binding the facilitator wallet.
    ///
    /// The transport retries writes against transient failures
    /// (3 attempts, 1s backoff).
    pub fn connect(
        network: Network,
        rpc_url: Url,
        wallet: Option<EthereumWallet>,
    ) -> Result<Arc<dyn EvmGateway>, ChainError> {
        let client = ClientBuilder::default()
            .layer(RetryBackoffLayer::new(
                WRITE_RETRIES,
                WRITE_RETRY_DELAY_MS,
                RETRY_COMPUTE_UNITS,
            ))
            .http(rpc_url);
        match wallet {
            Some(wallet) => {
                let signer = NetworkWallet::<Ethereum>::default_signer_address(&wallet);
                let provider = ProviderBuilder::new().wallet(wallet).connect_client(client);
                Ok(Arc::new(AlloyGateway {
                    provider,
                    network,
                    signer: Some(EvmAddress(signer)),
                }))
            }
            None => {
                let provider = ProviderBuilder::new().connect_client(client);
                Ok(Arc::new(AlloyGateway {
                    provider,
                    network,
                    signer: None,
                }))
            }
        }
    }
}

impl<P> AlloyGateway<P>
where
    P: Provider + Send + Sync,
{
    fn require_signer(&self) -> Result<(), ChainError> {
        if self.signer.is_none() {
            return Err(ChainError::NoSigner);
        }
        Ok(())
    }

    async fn await_receipt(
        &self,
        pending: alloy::providers::PendingTransactionBuilder<Ethereum>,
        confirmations: u64,
        deadline: Duration,
    ) -> Result<TxOutcome, ChainError> {
        let hash = TransactionHash((*pending.tx_hash()).0);
        let receipt_wait = pending
            .with_required_confirmations(confirmations)
            .get_receipt();
        match tokio::time::timeout(deadline, receipt_wait).await {
            Ok(Ok(receipt)) => {
                let status = if receipt.status() {
                    TxStatus::Success
                } else {
                    TxStatus::Reverted
                };
                Ok(TxOutcome { hash, status })
            }
            Ok(Err(e)) => Err(ChainError::Rpc(e.to_string())),
            Err(_) => {
                tracing::warn!(
                    network = %self.network,
                    tx = %hash,
                    "receipt wait exceeded deadline, leaving transaction pending"
                );
                Ok(TxOutcome {
                    hash,
                    status: TxStatus::TimedOut,
                })
            }
        }
    }
}

#[async_trait]
impl<P> EvmGateway for AlloyGateway<P>
where
    P: Provider + Send + Sync,
{
    fn signer_address(&self) -> Option<EvmAddress> {
        self.signer
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn balance_of(&self, token: Address, holder: Address) -> Result<U256, ChainError> {
        IErc3009::new(token, &self.provider)
            .balanceOf(holder)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<U256, ChainError> {
        IErc3009::new(token, &self.provider)
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    #[instrument(skip(self), fields(network = %self.network))]
    async fn authorization_state(
        &self,
        token: Address,
        authorizer: Address,
        nonce: B256,
    ) -> Result<bool, ChainError> {
        IErc3009::new(token, &self.provider)
            .authorizationState(authorizer, nonce)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn receipt(&self, tx_hash: TransactionHash) -> Result<Option<ReceiptInfo>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(B256::from(tx_hash.0))
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(receipt.and_then(|receipt| {
            receipt.block_number.map(|block_number| ReceiptInfo {
                block_number,
                success: receipt.status(),
            })
        }))
    }

    #[instrument(
        skip(self, transfer),
        fields(network = %self.network, from = %transfer.from, to = %transfer.to, value = %transfer.value)
    )]
    async fn transfer_with_authorization(
        &self,
        token: Address,
        transfer: AuthorizedTransfer,
        confirmations: u64,
        deadline: Duration,
    ) -> Result<TxOutcome, ChainError> {
        self.require_signer()?;
        let contract = IErc3009::new(token, &self.provider);
        let pending = contract
            .transferWithAuthorization(
                transfer.from,
                transfer.to,
                transfer.value,
                transfer.valid_after,
                transfer.valid_before,
                transfer.nonce,
                transfer.v,
                transfer.r,
                transfer.s,
            )
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        self.await_receipt(pending, confirmations, deadline).await
    }

    #[instrument(skip(self), fields(network = %self.network, %from, %to, %value))]
    async fn transfer_from(
        &self,
        token: Address,
        from: Address,
        to: Address,
        value: U256,
        confirmations: u64,
        deadline: Duration,
    ) -> Result<TxOutcome, ChainError> {
        self.require_signer()?;
        let contract = IErc3009::new(token, &self.provider);
        let pending = contract
            .transferFrom(from, to, value)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        self.await_receipt(pending, confirmations, deadline).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory gateway for exercising verification, settlement, and the
    //! finality sweep without a chain.

    use super::*;
    use alloy::primitives::keccak256;
    use dashmap::{DashMap, DashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SubmittedTx {
        Authorized(AuthorizedTransfer),
        TransferFrom {
            from: Address,
            to: Address,
            value: U256,
        },
    }

    pub struct MockGateway {
        pub signer: EvmAddress,
        pub balances: DashMap<Address, U256>,
        pub allowances: DashMap<(Address, Address), U256>,
        pub used_nonces: DashSet<B256>,
        pub receipts: DashMap<TransactionHash, ReceiptInfo>,
        pub block: AtomicU64,
        pub submitted: Mutex<Vec<SubmittedTx>>,
        /// Recipients whose `transferFrom` reverts on-chain.
        pub revert_transfers_to: DashSet<Address>,
        /// When set, every read fails with a simulated RPC outage.
        pub fail_reads: AtomicBool,
        /// When set, writes broadcast but the receipt wait times out.
        pub time_out_writes: AtomicBool,
        tx_counter: AtomicU64,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                signer: EvmAddress(Address::repeat_byte(0xfa)),
                balances: DashMap::new(),
                allowances: DashMap::new(),
                used_nonces: DashSet::new(),
                receipts: DashMap::new(),
                block: AtomicU64::new(100),
                submitted: Mutex::new(Vec::new()),
                revert_transfers_to: DashSet::new(),
                fail_reads: AtomicBool::new(false),
                time_out_writes: AtomicBool::new(false),
                tx_counter: AtomicU64::new(0),
            }
        }

        pub fn submitted_txs(&self) -> Vec<SubmittedTx> {
            self.submitted.lock().expect("mock lock").clone()
        }

        fn check_reads(&self) -> Result<(), ChainError> {
            if self.fail_reads.load(Ordering::Relaxed) {
                return Err(ChainError::Rpc("simulated RPC outage".to_string()));
            }
            Ok(())
        }

        fn next_hash(&self) -> TransactionHash {
            let n = self.tx_counter.fetch_add(1, Ordering::Relaxed);
            TransactionHash(keccak256(n.to_be_bytes()).0)
        }

        fn complete_write(&self, hash: TransactionHash, success: bool) -> TxOutcome {
            let status = if self.time_out_writes.load(Ordering::Relaxed) {
                TxStatus::TimedOut
            } else if success {
                TxStatus::Success
            } else {
                TxStatus::Reverted
            };
            self.receipts.insert(
                hash,
                ReceiptInfo {
                    block_number: self.block.load(Ordering::Relaxed),
                    success,
                },
            );
            TxOutcome { hash, status }
        }
    }

    #[async_trait]
    impl EvmGateway for MockGateway {
        fn signer_address(&self) -> Option<EvmAddress> {
            Some(self.signer)
        }

        async fn block_number(&self) -> Result<u64, ChainError> {
            self.check_reads()?;
            Ok(self.block.load(Ordering::Relaxed))
        }

        async fn balance_of(&self, _token: Address, holder: Address) -> Result<U256, ChainError> {
            self.check_reads()?;
            Ok(self
                .balances
                .get(&holder)
                .map(|entry| *entry)
                .unwrap_or(U256::ZERO))
        }

        async fn allowance(
            &self,
            _token: Address,
            owner: Address,
            spender: Address,
        ) -> Result<U256, ChainError> {
            self.check_reads()?;
            Ok(self
                .allowances
                .get(&(owner, spender))
                .map(|entry| *entry)
                .unwrap_or(U256::ZERO))
        }

        async fn authorization_state(
            &self,
            _token: Address,
            _authorizer: Address,
            nonce: B256,
        ) -> Result<bool, ChainError> {
            self.check_reads()?;
            Ok(self.used_nonces.contains(&nonce))
        }

        async fn receipt(
            &self,
            tx_hash: TransactionHash,
        ) -> Result<Option<ReceiptInfo>, ChainError> {
            self.check_reads()?;
            Ok(self.receipts.get(&tx_hash).map(|entry| *entry))
        }

        async fn transfer_with_authorization(
            &self,
            _token: Address,
            transfer: AuthorizedTransfer,
            _confirmations: u64,
            _deadline: Duration,
        ) -> Result<TxOutcome, ChainError> {
            self.used_nonces.insert(transfer.nonce);
            self.submitted
                .lock()
                .expect("mock lock")
                .push(SubmittedTx::Authorized(transfer));
            let hash = self.next_hash();
            Ok(self.complete_write(hash, true))
        }

        async fn transfer_from(
            &self,
            _token: Address,
            from: Address,
            to: Address,
            value: U256,
            _confirmations: u64,
            _deadline: Duration,
        ) -> Result<TxOutcome, ChainError> {
            self.submitted
                .lock()
                .expect("mock lock")
                .push(SubmittedTx::TransferFrom { from, to, value });
            let success = !self.revert_transfers_to.contains(&to);
            let hash = self.next_hash();
            Ok(self.complete_write(hash, success))
        }
    }
}

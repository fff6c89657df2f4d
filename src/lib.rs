//! x402 payment facilitator for EVM-compatible chains.
//!
//! The facilitator mediates between a paying client, a merchant server, and
//! one or more chains: it validates signed off-chain payment authorizations,
//! relays them on-chain while paying gas on the payer's behalf, tracks
//! confirmation depth until finality, and exposes a uniform REST surface
//! (`/verify`, `/settle`, `/supported`, `/health`).
//!
//! # Settlement paths
//!
//! - **ERC-3009** `transferWithAuthorization`: gasless for the payer; a
//!   single signature authorizes a single on-chain transfer of exactly the
//!   signed amount. The facilitator fee is tracked off-chain on this path.
//! - **Relayer** `transferFrom`: for tokens without ERC-3009; requires a
//!   prior allowance to the facilitator and settles in two legs, net to the
//!   merchant and fee to the treasury.
//!
//! # Modules
//!
//! - [`registry`] — supported networks, known token deployments, and the
//!   per-network chain clients.
//! - [`chain`] — the [`chain::EvmGateway`] capability trait and its Alloy
//!   implementation.
//! - [`header`] — normalization of the accepted payment-header shapes into
//!   one canonical authorization.
//! - [`fee`] — the gross/fee/net decomposition rendered on every response.
//! - [`verify`] — chain-backed verification, reporting instead of throwing.
//! - [`settle`] — the two settlement strategies and transaction tracking.
//! - [`confirmer`] — the background sweep driving pending transactions to
//!   finality.
//! - [`store`] — persistence of tracked transactions (Postgres or
//!   in-memory).
//! - [`handlers`] — the HTTP surface with its rate-limit and idempotency
//!   pre-checks.
//! - [`identity`] — optional anchoring of agent settlements on an external
//!   reputation registry.

pub mod chain;
pub mod config;
pub mod confirmer;
pub mod fee;
pub mod handlers;
pub mod header;
pub mod identity;
pub mod idempotency;
pub mod rate_limit;
pub mod registry;
pub mod settle;
pub mod store;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod verify;

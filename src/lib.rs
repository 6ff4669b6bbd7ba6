//! Chain-synchronization and relay engine for a P2P blockchain node
//!
//! This crate implements the peer-facing half of a node: headers-first
//! chain sync, windowed block download with stall detection, compact block
//! relay, transaction request scheduling and trickle relay, peer
//! misbehavior accounting, and outbound peer eviction. Consensus
//! validation, block storage, and the connection layer are consumed
//! through traits in [`interfaces`]; this crate decides *what* to request,
//! announce, and penalize, never whether a block or transaction is valid.
//!
//! ## Structure
//!
//! - [`network`] - the [`network::NetEngine`] composition root, message
//!   handlers, and the per-concern sub-modules (block download, header
//!   sync, compact blocks, relay, eviction, filters, voting)
//! - [`chain`] - the shared header tree with skip-pointer ancestor walks
//! - [`interfaces`] - trait seams toward validation, storage, and the wire
//! - [`mempool`] - the read view of the transaction pool the relay needs
//! - [`config`] - locally tunable knobs; protocol limits stay in
//!   [`network::protocol`]

pub mod chain;
pub mod config;
pub mod interfaces;
pub mod mempool;
pub mod network;
pub mod utils;

pub use config::NetConfig;
pub use network::peer::{ConnectionKind, NetPermissions};
pub use network::protocol::{Block, BlockHash, BlockHeader, Message, NodeId, Transaction, TxId};
pub use network::{NetEngine, NetEngineHandles};

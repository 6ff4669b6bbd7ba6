//! Trait seams toward the engine's collaborators
//!
//! The engine consumes validation, block storage, banning, filter-index,
//! and vote-verdict services through these traits, and drives the wire
//! through [`Transport`]. Production wiring provides real implementations;
//! tests substitute recording fakes.

use crate::chain::BlockKey;
use crate::network::protocol::{
    Block, BlockHash, BlockHeader, InvItem, Message, NodeId, OutPoint, Transaction,
};
use std::net::IpAddr;

/// Why a transaction was not accepted into the mempool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxRejection {
    /// Malformed or internally inconsistent announcement.
    ProtocolViolation,
    /// Valid but against local policy (fee, size, standardness).
    Policy,
    /// Consensus-invalid; carries the misbehavior penalty to apply.
    Consensus { penalty: u32 },
    /// Dropped for resource reasons, may be valid.
    Resource,
}

/// Outcome of submitting a transaction for validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxValidationResult {
    Accepted,
    /// Inputs not found; candidate for the orphan pool.
    MissingInputs(Vec<OutPoint>),
    Rejected(TxRejection),
}

/// Header validation failure, with the penalty the validator assigns.
#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid header: {reason}")]
pub struct HeaderError {
    pub reason: String,
    pub penalty: u32,
}

/// Validation engine the relay layer submits headers, blocks, and
/// transactions to. Implementations update the shared [`crate::chain::BlockIndex`].
pub trait Consensus: Send + Sync {
    /// Validate and index a connected batch of headers. Returns the key of
    /// the last accepted header.
    fn process_headers(&self, headers: &[BlockHeader]) -> Result<BlockKey, HeaderError>;

    /// Validate a full block and try to connect it. Returns whether the
    /// block was newly accepted (not a duplicate or invalid).
    fn process_block(&self, block: &Block, force_processing: bool) -> bool;

    /// Submit a transaction for mempool acceptance.
    fn accept_transaction(&self, tx: &Transaction) -> TxValidationResult;

    /// Whether the node is still in initial block download.
    fn is_initial_block_download(&self) -> bool;

    /// Minimum cumulative work a chain must have to be worth downloading.
    fn minimum_chain_work(&self) -> u128;
}

/// Access to stored block bodies, for serving getdata and getblocktxn.
pub trait BlockStore: Send + Sync {
    fn get_block(&self, hash: &BlockHash) -> Option<Block>;
}

/// Outbound side of the connection layer.
pub trait Transport: Send + Sync {
    fn send(&self, peer: NodeId, message: Message);
    fn disconnect(&self, peer: NodeId);
}

/// Address-level discouragement store.
pub trait BanStore: Send + Sync {
    fn discourage(&self, addr: IpAddr);
    fn is_discouraged(&self, addr: IpAddr) -> bool;
}

/// Compact filter index, one entry per active-chain block.
pub trait FilterIndex: Send + Sync {
    /// Encoded filter for the block at `height` with the given hash.
    fn filter(&self, height: u32, hash: &BlockHash) -> Option<Vec<u8>>;

    /// Chained filter header for the block at `height`.
    fn filter_header(&self, height: u32, hash: &BlockHash) -> Option<BlockHash>;
}

/// Produces verdicts for the pre-consensus polling sub-protocol.
pub trait VoteProcessor: Send + Sync {
    /// Verdict for an item. Zero means acceptable; nonzero encodes the
    /// rejection class.
    fn verdict(&self, item: &InvItem) -> i32;
}

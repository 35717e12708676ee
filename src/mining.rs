// Copyright (C) 2025, 2026 Sv2 Template Provider Developers (see AUTHORS)
//
// This file is part of sv2-template-provider
//
// sv2-template-provider is free software: you can redistribute it and/or
// modify it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// sv2-template-provider is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with sv2-template-provider. If not, see <https://www.gnu.org/licenses/>.

//! Contracts for the block assembly backend. The node embedding this crate
//! implements them; the engine never performs mempool selection or fee
//! calculation itself.

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{Amount, Block, BlockHash, Transaction, TxMerkleNode};
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use std::time::Duration;

/// A chain tip as reported by the assembly backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCreateOptions {
    pub use_mempool: bool,
    /// Weight units reserved for the coinbase transaction. The backend
    /// enforces a floor of 2000.
    pub block_reserved_weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWaitOptions {
    /// Fee improvement required to wake the wait without a tip change. Pass
    /// [`Amount::MAX_MONEY`] to wake on new tips only.
    pub fee_threshold: Amount,
    /// When unset the wait is unbounded apart from tip changes, fee
    /// improvements and shutdown.
    pub timeout: Option<Duration>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Mining: Send + Sync {
    /// Block until the tip differs from `known_hash`. Returns `None` when the
    /// backend shuts down.
    async fn wait_tip_changed(&self, known_hash: BlockHash) -> Option<BlockRef>;

    async fn is_initial_block_download(&self) -> bool;

    /// Assemble a fresh template. May take tens of milliseconds; callers must
    /// not hold any shared state across this call.
    async fn create_new_block(&self, options: BlockCreateOptions) -> Arc<dyn BlockTemplate>;
}

/// Handle to one assembled template. Accessors are cheap; [`wait_next`] is
/// the long blocking operation of the protocol loop.
///
/// [`wait_next`]: BlockTemplate::wait_next
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockTemplate: Send + Sync {
    fn header(&self) -> Header;

    fn coinbase_tx(&self) -> Transaction;

    fn coinbase_merkle_path(&self) -> Vec<TxMerkleNode>;

    /// Index of the witness commitment output in the coinbase transaction.
    fn witness_commitment_index(&self) -> u32;

    /// The full underlying block, coinbase included.
    fn block(&self) -> Block;

    /// Block until a new tip arrives, mempool fees improve by at least
    /// `options.fee_threshold`, the timeout elapses, or the backend shuts
    /// down. Returns `None` on timeout and shutdown. Implementations must
    /// resolve within about a second of shutdown being signalled.
    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>>;

    /// Attach a proof of work solution to this template and hand the block to
    /// the node for broadcast.
    async fn submit_solution(
        &self,
        version: i32,
        header_timestamp: u32,
        header_nonce: u32,
        coinbase_tx: Transaction,
    ) -> bool;
}

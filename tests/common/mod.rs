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

//! Shared helpers for the integration tests: an in-process block assembly
//! backend driven by the test, and a plaintext JSON-lines stand-in for the
//! Noise/Sv2 framing layer.

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sv2_template_provider::connman::{Sv2MessageReader, Sv2MessageWriter, Sv2Transport};
use sv2_template_provider::error::Error;
use sv2_template_provider::messages::{
    CoinbaseOutputConstraints, ReceivedMessage, RequestTransactionData, TemplateDistributionMessage,
};
use sv2_template_provider::mining::{
    BlockCreateOptions, BlockRef, BlockTemplate, BlockWaitOptions, Mining,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub fn hash(byte: u8) -> BlockHash {
    BlockHash::from_byte_array([byte; 32])
}

#[derive(Debug, Clone, Copy)]
struct ChainState {
    tip: BlockHash,
    height: u32,
    mempool_fees: Amount,
}

/// Block assembly backend under test control: the test moves the tip and the
/// mempool fees, the engine reacts.
pub struct FakeMining {
    state_tx: watch::Sender<ChainState>,
    ibd: AtomicBool,
    /// Every BlockCreateOptions the engine passed to create_new_block.
    pub create_calls: Mutex<Vec<BlockCreateOptions>>,
}

impl FakeMining {
    pub fn new(tip: BlockHash) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChainState {
            tip,
            height: 100,
            mempool_fees: Amount::ZERO,
        });
        Arc::new(Self {
            state_tx,
            ibd: AtomicBool::new(false),
            create_calls: Mutex::new(Vec::new()),
        })
    }

    /// Connect a new block, invalidating all templates built on the old tip.
    pub fn set_tip(&self, tip: BlockHash) {
        self.state_tx.send_modify(|state| {
            state.tip = tip;
            state.height += 1;
        });
    }

    /// Raise the fees available to a fresh template assembly.
    pub fn add_fees(&self, fees: Amount) {
        self.state_tx.send_modify(|state| {
            state.mempool_fees = state.mempool_fees + fees;
        });
    }

    pub fn set_initial_block_download(&self, ibd: bool) {
        self.ibd.store(ibd, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mining for FakeMining {
    async fn wait_tip_changed(&self, known_hash: BlockHash) -> Option<BlockRef> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow();
            if state.tip != known_hash {
                return Some(BlockRef {
                    hash: state.tip,
                    height: state.height,
                });
            }
            if state_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::SeqCst)
    }

    async fn create_new_block(&self, options: BlockCreateOptions) -> Arc<dyn BlockTemplate> {
        self.create_calls.lock().unwrap().push(options);
        let state_rx = self.state_tx.subscribe();
        let state = *state_rx.borrow();
        Arc::new(FakeTemplate::new(state_rx, state))
    }
}

/// One assembled template. Fee-bumped successors carry the fees they were
/// assembled at so repeated waits require further improvement.
pub struct FakeTemplate {
    state_rx: watch::Receiver<ChainState>,
    fees: Amount,
    header: Header,
    coinbase: Transaction,
}

impl FakeTemplate {
    fn new(state_rx: watch::Receiver<ChainState>, state: ChainState) -> Self {
        let coinbase = Transaction {
            version: TxVersion::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::from_slice(&[vec![0u8; 32]]),
            }],
            output: vec![
                TxOut {
                    value: Amount::from_sat(50_000_000) + state.mempool_fees,
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: ScriptBuf::new(),
                },
            ],
        };
        let header = Header {
            version: BlockVersion::TWO,
            prev_blockhash: state.tip,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000 + state.height,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        Self {
            state_rx,
            fees: state.mempool_fees,
            header,
            coinbase,
        }
    }
}

#[async_trait]
impl BlockTemplate for FakeTemplate {
    fn header(&self) -> Header {
        self.header
    }

    fn coinbase_tx(&self) -> Transaction {
        self.coinbase.clone()
    }

    fn coinbase_merkle_path(&self) -> Vec<TxMerkleNode> {
        Vec::new()
    }

    fn witness_commitment_index(&self) -> u32 {
        1
    }

    fn block(&self) -> Block {
        Block {
            header: self.header,
            txdata: vec![self.coinbase.clone()],
        }
    }

    async fn wait_next(&self, options: BlockWaitOptions) -> Option<Arc<dyn BlockTemplate>> {
        let mut state_rx = self.state_rx.clone();
        let prev_hash = self.header.prev_blockhash;
        let fees = self.fees;
        let wait = async move {
            loop {
                let state = *state_rx.borrow();
                let improved = fees
                    .checked_add(options.fee_threshold)
                    .map(|required| state.mempool_fees >= required)
                    .unwrap_or(false);
                if state.tip != prev_hash || improved {
                    return Some(state);
                }
                if state_rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        let state = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.ok().flatten()?,
            None => wait.await?,
        };
        Some(Arc::new(FakeTemplate::new(self.state_rx.clone(), state)))
    }

    async fn submit_solution(
        &self,
        _version: i32,
        _header_timestamp: u32,
        _header_nonce: u32,
        _coinbase_tx: Transaction,
    ) -> bool {
        true
    }
}

/// Plaintext framing: one JSON document per line in each direction. The
/// production transport runs Noise and the binary Sv2 codec instead; the
/// engine cannot tell the difference.
pub struct JsonLinesTransport;

#[async_trait]
impl Sv2Transport for JsonLinesTransport {
    async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(Box<dyn Sv2MessageReader>, Box<dyn Sv2MessageWriter>), Error> {
        let (read_half, write_half) = stream.into_split();
        Ok((
            Box::new(JsonLinesReader {
                lines: BufReader::new(read_half).lines(),
            }),
            Box::new(JsonLinesWriter { write_half }),
        ))
    }
}

struct JsonLinesReader {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

#[async_trait]
impl Sv2MessageReader for JsonLinesReader {
    async fn read_message(&mut self) -> Result<ReceivedMessage, Error> {
        match self.lines.next_line().await {
            Ok(Some(line)) => serde_json::from_str(&line).map_err(|e| Error::Codec(e.to_string())),
            Ok(None) => Err(Error::Codec("connection closed".to_string())),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

struct JsonLinesWriter {
    write_half: OwnedWriteHalf,
}

#[async_trait]
impl Sv2MessageWriter for JsonLinesWriter {
    async fn write_message(&mut self, message: &TemplateDistributionMessage) -> Result<(), Error> {
        let line = serde_json::to_string(message).map_err(|e| Error::Codec(e.to_string()))?;
        self.write_half.write_all(line.as_bytes()).await?;
        self.write_half.write_all(b"\n").await?;
        self.write_half.flush().await?;
        Ok(())
    }
}

/// A Stratum v2 client talking the JSON-lines framing.
pub struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write_half: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            write_half,
        }
    }

    pub async fn send(&mut self, message: ReceivedMessage) {
        let line = serde_json::to_string(&message).expect("serialize failed");
        self.write_half
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("write failed");
        self.write_half.flush().await.expect("flush failed");
    }

    pub async fn send_coinbase_output_constraints(&mut self, size: u32) {
        self.send(ReceivedMessage::CoinbaseOutputConstraints(
            CoinbaseOutputConstraints {
                coinbase_output_max_additional_size: size,
                coinbase_output_max_additional_sigops: 400,
            },
        ))
        .await;
    }

    pub async fn request_transaction_data(&mut self, template_id: u64) {
        self.send(ReceivedMessage::RequestTransactionData(
            RequestTransactionData { template_id },
        ))
        .await;
    }

    /// Read the next message, failing the test after five seconds.
    pub async fn recv(&mut self) -> TemplateDistributionMessage {
        self.try_recv(Duration::from_secs(5))
            .await
            .expect("no message within deadline")
    }

    /// Read the next message within `deadline`, or None on timeout or a
    /// closed connection.
    pub async fn try_recv(&mut self, deadline: Duration) -> Option<TemplateDistributionMessage> {
        let line = tokio::time::timeout(deadline, self.lines.next_line())
            .await
            .ok()?
            .ok()??;
        Some(serde_json::from_str(&line).expect("invalid message from provider"))
    }
}

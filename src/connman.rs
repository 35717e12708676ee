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

//! Connection manager: the client table, per-client outbound queues and the
//! accept loop. The Noise handshake and Sv2 framing live behind
//! [`Sv2Transport`]; connman only deals in typed messages.

use crate::error::Error;
use crate::messages::{ReceivedMessage, SubmitSolution, TemplateDistributionMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Outbound queue depth per client. We push at most two messages per
/// template, so the queue only fills when a client stops reading.
pub(crate) const MSG_CHANNEL_SIZE: usize = 32;

/// Upper bound for CoinbaseOutputConstraints; a reservation larger than a
/// whole block is impossible.
const MAX_BLOCK_WEIGHT: u32 = 4_000_000;

pub type ClientId = u64;

/// Snapshot of a connected client as seen by the dispatcher and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sv2Client {
    pub id: ClientId,
    /// Whether the client has sent CoinbaseOutputConstraints. Workers are
    /// only spawned for clients past that point.
    pub coinbase_output_constraints_recv: bool,
    /// Coinbase output size in bytes, used to pad the assembly weight
    /// reserve.
    pub coinbase_tx_outputs_size: u32,
}

/// Protocol requests connman forwards to the template provider.
#[derive(Debug)]
pub enum ClientEvent {
    RequestTransactionData {
        client_id: ClientId,
        template_id: u64,
    },
    SubmitSolution {
        client_id: ClientId,
        solution: SubmitSolution,
    },
}

/// Runs the Noise handshake and connection setup on a fresh socket and
/// returns framed reader and writer halves. Implemented by the embedding
/// node; integration tests supply a plaintext codec.
#[async_trait]
pub trait Sv2Transport: Send + Sync + 'static {
    async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(Box<dyn Sv2MessageReader>, Box<dyn Sv2MessageWriter>), Error>;
}

/// Decrypting/deframing half of a connection.
#[async_trait]
pub trait Sv2MessageReader: Send {
    /// Read one message. Must be cancel safe: the connection task races this
    /// against the outbound queue, so partial frames have to survive a
    /// dropped call.
    async fn read_message(&mut self) -> Result<ReceivedMessage, Error>;
}

/// Encrypting/framing half of a connection.
#[async_trait]
pub trait Sv2MessageWriter: Send {
    async fn write_message(&mut self, message: &TemplateDistributionMessage) -> Result<(), Error>;
}

struct ClientEntry {
    coinbase_output_constraints_recv: bool,
    coinbase_tx_outputs_size: u32,
    message_tx: mpsc::Sender<TemplateDistributionMessage>,
    shutdown_tx: oneshot::Sender<()>,
}

/// Commands that can be sent to the Connman actor
enum Command {
    Add {
        resp: oneshot::Sender<(
            ClientId,
            mpsc::Receiver<TemplateDistributionMessage>,
            oneshot::Receiver<()>,
        )>,
    },
    Remove {
        client_id: ClientId,
    },
    SetCoinbaseOutputConstraints {
        client_id: ClientId,
        coinbase_tx_outputs_size: u32,
        resp: oneshot::Sender<bool>,
    },
    GetClient {
        client_id: ClientId,
        resp: oneshot::Sender<Option<Sv2Client>>,
    },
    ListClients {
        resp: oneshot::Sender<Vec<Sv2Client>>,
    },
    SendMessages {
        client_id: ClientId,
        messages: Vec<TemplateDistributionMessage>,
        resp: oneshot::Sender<bool>,
    },
    Disconnect {
        client_id: ClientId,
    },
}

/// A handle to interact with the Connman actor
#[derive(Clone)]
pub struct ConnmanHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnmanHandle {
    /// Register a new client, returning its id, the outbound message queue
    /// and the per-client shutdown receiver.
    pub async fn add_client(
        &self,
    ) -> Option<(
        ClientId,
        mpsc::Receiver<TemplateDistributionMessage>,
        oneshot::Receiver<()>,
    )> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Add { resp: resp_tx }).await.ok()?;
        resp_rx.await.ok()
    }

    /// Drop a client from the table. Fire and forget.
    pub async fn remove_client(&self, client_id: ClientId) {
        let _ = self.cmd_tx.send(Command::Remove { client_id }).await;
    }

    /// Record the client's coinbase output constraints. Returns false when
    /// the client is unknown or the constraints are impossible, in which
    /// case the connection should be closed.
    pub async fn set_coinbase_output_constraints(
        &self,
        client_id: ClientId,
        coinbase_tx_outputs_size: u32,
    ) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(Command::SetCoinbaseOutputConstraints {
                client_id,
                coinbase_tx_outputs_size,
                resp: resp_tx,
            })
            .await
            .is_ok();
        if !sent {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }

    pub async fn get_client(&self, client_id: ClientId) -> Option<Sv2Client> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetClient {
                client_id,
                resp: resp_tx,
            })
            .await
            .ok()?;
        resp_rx.await.ok().flatten()
    }

    pub async fn list_clients(&self) -> Vec<Sv2Client> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ListClients { resp: resp_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        resp_rx.await.unwrap_or_default()
    }

    /// Enqueue a batch of messages for one client as a unit, preserving their
    /// order in the outbound stream. Returns false when the client is gone or
    /// its queue is full; a full queue drops the client.
    pub async fn send_messages(
        &self,
        client_id: ClientId,
        messages: Vec<TemplateDistributionMessage>,
    ) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(Command::SendMessages {
                client_id,
                messages,
                resp: resp_tx,
            })
            .await
            .is_ok();
        if !sent {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }

    /// Flag a client for disconnection: its entry is dropped and the
    /// connection task is signalled to close the socket.
    pub async fn disconnect(&self, client_id: ClientId) {
        let _ = self.cmd_tx.send(Command::Disconnect { client_id }).await;
    }
}

/// The client table. A single task owns it, so constraint updates from
/// connection tasks, snapshots taken by the dispatcher and sends from
/// workers never observe partial state.
#[derive(Default)]
struct Connman {
    clients: HashMap<ClientId, ClientEntry>,
    next_client_id: ClientId,
}

impl Connman {
    fn add(
        &mut self,
    ) -> (
        ClientId,
        mpsc::Receiver<TemplateDistributionMessage>,
        oneshot::Receiver<()>,
    ) {
        self.next_client_id += 1;
        let client_id = self.next_client_id;
        let (message_tx, message_rx) = mpsc::channel(MSG_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.clients.insert(
            client_id,
            ClientEntry {
                coinbase_output_constraints_recv: false,
                coinbase_tx_outputs_size: 0,
                message_tx,
                shutdown_tx,
            },
        );
        (client_id, message_rx, shutdown_rx)
    }

    fn remove(&mut self, client_id: ClientId) -> bool {
        if let Some(entry) = self.clients.remove(&client_id) {
            // Try to send the shutdown signal, the connection task may
            // already be gone.
            let _ = entry.shutdown_tx.send(());
            true
        } else {
            false
        }
    }

    fn set_coinbase_output_constraints(
        &mut self,
        client_id: ClientId,
        coinbase_tx_outputs_size: u32,
    ) -> bool {
        if coinbase_tx_outputs_size > MAX_BLOCK_WEIGHT {
            error!(
                "Received impossible CoinbaseOutputConstraints from client id={}: {}",
                client_id, coinbase_tx_outputs_size
            );
            self.remove(client_id);
            return false;
        }
        match self.clients.get_mut(&client_id) {
            Some(entry) => {
                entry.coinbase_tx_outputs_size = coinbase_tx_outputs_size;
                entry.coinbase_output_constraints_recv = true;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self, client_id: ClientId, entry: &ClientEntry) -> Sv2Client {
        Sv2Client {
            id: client_id,
            coinbase_output_constraints_recv: entry.coinbase_output_constraints_recv,
            coinbase_tx_outputs_size: entry.coinbase_tx_outputs_size,
        }
    }

    fn get(&self, client_id: ClientId) -> Option<Sv2Client> {
        self.clients
            .get(&client_id)
            .map(|entry| self.snapshot(client_id, entry))
    }

    fn list(&self) -> Vec<Sv2Client> {
        self.clients
            .iter()
            .map(|(client_id, entry)| self.snapshot(*client_id, entry))
            .collect()
    }

    /// Enqueue messages with try_send: we never flood clients, so a full
    /// queue means the client stopped reading and gets removed.
    fn send_messages(
        &mut self,
        client_id: ClientId,
        messages: Vec<TemplateDistributionMessage>,
    ) -> bool {
        let Some(entry) = self.clients.get(&client_id) else {
            return false;
        };
        let mut stuck = false;
        for message in messages {
            if entry.message_tx.try_send(message).is_err() {
                stuck = true;
                break;
            }
        }
        if stuck {
            self.remove(client_id);
            return false;
        }
        true
    }
}

/// Spawn the Connman actor and return a handle to it
pub async fn start_connman() -> ConnmanHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(32);
    let handle = ConnmanHandle { cmd_tx };

    let mut connman = Connman::default();

    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Add { resp } => {
                    let _ = resp.send(connman.add());
                }
                Command::Remove { client_id } => {
                    connman.remove(client_id);
                }
                Command::SetCoinbaseOutputConstraints {
                    client_id,
                    coinbase_tx_outputs_size,
                    resp,
                } => {
                    let _ = resp.send(
                        connman.set_coinbase_output_constraints(client_id, coinbase_tx_outputs_size),
                    );
                }
                Command::GetClient { client_id, resp } => {
                    let _ = resp.send(connman.get(client_id));
                }
                Command::ListClients { resp } => {
                    let _ = resp.send(connman.list());
                }
                Command::SendMessages {
                    client_id,
                    messages,
                    resp,
                } => {
                    let _ = resp.send(connman.send_messages(client_id, messages));
                }
                Command::Disconnect { client_id } => {
                    connman.remove(client_id);
                }
            }
        }
    });
    handle
}

/// Bind the listener and start accepting connections. Each accepted socket
/// is handed to the transport for handshake and then serviced by its own
/// task. Binding is the only fatal error; the bound address is returned so
/// callers can configure port 0.
pub async fn start_listener<T: Sv2Transport>(
    handle: ConnmanHandle,
    transport: std::sync::Arc<T>,
    host: &str,
    port: u16,
    event_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(JoinHandle<()>, std::net::SocketAddr), Error> {
    let bind_address = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&bind_address).await.map_err(Error::Bind)?;
    let local_addr = listener.local_addr().map_err(Error::Bind)?;
    info!("Listening for Stratum v2 clients on {}", local_addr);

    let task = tokio::spawn(async move {
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                // Resolves on shutdown, and on a dropped engine as well.
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let transport = std::sync::Arc::clone(&transport);
                            let handle = handle.clone();
                            let event_tx = event_tx.clone();
                            let shutdown_rx = shutdown_rx.clone();
                            tokio::spawn(async move {
                                match transport.accept(stream).await {
                                    Ok((reader, writer)) => {
                                        handle_client(handle, reader, writer, event_tx, shutdown_rx)
                                            .await;
                                    }
                                    Err(e) => {
                                        debug!("Handshake with {} failed: {}", addr, e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            info!("Connection failed: {}", e);
                        }
                    }
                }
            }
        }
    });
    Ok((task, local_addr))
}

/// Service one handshaken connection: drain the outbound queue into the
/// writer and dispatch inbound messages until either side closes or the
/// client is disconnected.
async fn handle_client(
    handle: ConnmanHandle,
    mut reader: Box<dyn Sv2MessageReader>,
    mut writer: Box<dyn Sv2MessageWriter>,
    event_tx: mpsc::Sender<ClientEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some((client_id, mut message_rx, mut client_shutdown_rx)) = handle.add_client().await
    else {
        return;
    };
    debug!("Client id={} connected", client_id);

    loop {
        if *shutdown_rx.borrow_and_update() {
            break;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = &mut client_shutdown_rx => {
                debug!("Closing connection for client id={}", client_id);
                break;
            }
            queued = message_rx.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = writer.write_message(&message).await {
                            debug!("Write to client id={} failed: {}", client_id, e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            received = reader.read_message() => {
                match received {
                    Ok(message) => {
                        if !dispatch_message(&handle, &event_tx, client_id, message).await {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Read from client id={} failed: {}", client_id, e);
                        break;
                    }
                }
            }
        }
    }

    handle.remove_client(client_id).await;
    debug!("Client id={} removed", client_id);
}

/// Handle one inbound message. Returns false when the connection should be
/// closed.
async fn dispatch_message(
    handle: &ConnmanHandle,
    event_tx: &mpsc::Sender<ClientEvent>,
    client_id: ClientId,
    message: ReceivedMessage,
) -> bool {
    match message {
        ReceivedMessage::CoinbaseOutputConstraints(constraints) => {
            debug!(
                "coinbase_output_max_additional_size={} bytes from client id={}",
                constraints.coinbase_output_max_additional_size, client_id
            );
            handle
                .set_coinbase_output_constraints(
                    client_id,
                    constraints.coinbase_output_max_additional_size,
                )
                .await
        }
        ReceivedMessage::RequestTransactionData(request) => event_tx
            .send(ClientEvent::RequestTransactionData {
                client_id,
                template_id: request.template_id,
            })
            .await
            .is_ok(),
        ReceivedMessage::SubmitSolution(solution) => event_tx
            .send(ClientEvent::SubmitSolution {
                client_id,
                solution,
            })
            .await
            .is_ok(),
    }
}

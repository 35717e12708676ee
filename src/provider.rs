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

//! The template provider engine: the dispatcher that spawns per-client
//! workers and prunes the cache, the message builder, and the handlers for
//! RequestTransactionData and SubmitSolution.

use crate::config::Sv2TemplateProviderConfig;
use crate::connman::{
    start_connman, start_listener, ClientEvent, ClientId, ConnmanHandle, Sv2Transport,
};
use crate::error::Error;
use crate::messages::{
    NewTemplate, RequestTransactionDataError, RequestTransactionDataSuccess, SetNewPrevHash,
    SubmitSolution, TemplateDistributionMessage, ERROR_STALE_TEMPLATE_ID,
    ERROR_TEMPLATE_ID_NOT_FOUND,
};
use crate::mining::{BlockTemplate, Mining};
use crate::template_store::{start_template_store, TemplateStoreHandle};
use crate::worker::run_client_worker;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Network, Transaction};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Handling new connections is not urgent.
const CLIENT_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// How often to re-check initial block download at startup.
const IBD_POLL_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_SIZE: usize = 32;

/// The engine. Owns the connman and template store actors and, once
/// [`start`] succeeds, the listener, dispatcher and event loop tasks.
///
/// [`start`]: TemplateProvider::start
pub struct TemplateProvider<M: Mining + ?Sized> {
    mining: Arc<M>,
    config: Sv2TemplateProviderConfig,
    connman: ConnmanHandle,
    store: TemplateStoreHandle,
    shutdown_tx: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl<M: Mining + ?Sized + 'static> TemplateProvider<M> {
    pub async fn new(mining: Arc<M>, config: Sv2TemplateProviderConfig) -> Self {
        let connman = start_connman().await;
        let store = start_template_store();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            mining,
            config,
            connman,
            store,
            shutdown_tx,
            local_addr: None,
            tasks: Vec::new(),
        }
    }

    /// Bind the listener and launch the dispatcher and event loop. A bind
    /// failure is fatal: the engine is unusable and the error is returned.
    pub async fn start<T: Sv2Transport>(&mut self, transport: Arc<T>) -> Result<(), Error> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let (listener, local_addr) = start_listener(
            self.connman.clone(),
            transport,
            &self.config.host,
            self.config.port,
            event_tx,
            self.shutdown_tx.subscribe(),
        )
        .await?;
        self.local_addr = Some(local_addr);
        self.tasks.push(listener);

        self.tasks.push(tokio::spawn(run_event_loop(
            event_rx,
            self.connman.clone(),
            self.store.clone(),
        )));

        self.tasks.push(tokio::spawn(run_dispatcher(
            Arc::clone(&self.mining),
            self.connman.clone(),
            self.store.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// The address the listener bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Signal shutdown. Outstanding template waits resolve within about a
    /// second; no further messages are enqueued afterwards.
    pub fn interrupt(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Interrupt and join every task the engine spawned.
    pub async fn stop(&mut self) {
        self.interrupt();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Wait for the node to be ready, then spawn a worker for every client that
/// has sent its coinbase output constraints, pruning the template cache as
/// tips change. Workers are spawned at most once per client id and joined on
/// shutdown.
pub(crate) async fn run_dispatcher<M: Mining + ?Sized + 'static>(
    mining: Arc<M>,
    connman: ConnmanHandle,
    store: TemplateStoreHandle,
    config: Sv2TemplateProviderConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Wait for the node chainstate to be ready.
    let tip = tokio::select! {
        _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
        tip = mining.wait_tip_changed(BlockHash::all_zeros()) => tip,
    };
    // Shutting down.
    let Some(_tip) = tip else {
        return;
    };

    // Make sure it's initialized, doesn't need to be accurate.
    if store.seed_last_block_time().await.is_err() {
        return;
    }

    // Wait to come out of IBD, except on signet, where we might be the only
    // miner.
    if config.network != Network::Signet {
        while !*shutdown_rx.borrow() {
            if !mining.is_initial_block_download().await {
                break;
            }
            trace!("Waiting to come out of IBD");
            tokio::select! {
                _ = shutdown_rx.wait_for(|stopped| *stopped) => return,
                _ = sleep(IBD_POLL_INTERVAL) => {}
            }
        }
    }

    let mut workers: HashMap<ClientId, JoinHandle<()>> = HashMap::new();

    while !*shutdown_rx.borrow() {
        // We start with one template per client, which has an interface
        // through which we monitor for better templates.
        for client in connman.list_clients().await {
            // The handshake and CoinbaseOutputConstraints exchange run on
            // the connection task; clients before that point get no worker.
            if !client.coinbase_output_constraints_recv {
                continue;
            }
            if workers.contains_key(&client.id) {
                continue;
            }
            workers.insert(
                client.id,
                tokio::spawn(run_client_worker(
                    client.id,
                    Arc::clone(&mining),
                    connman.clone(),
                    store.clone(),
                    config.clone(),
                    shutdown_rx.clone(),
                )),
            );
        }

        // Take a break (handling new connections is not urgent)
        tokio::select! {
            _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
            _ = sleep(CLIENT_SCAN_INTERVAL) => {}
        }

        if store.prune().await.is_err() {
            break;
        }
    }

    // All pending wait_next calls return in under a second once shutdown is
    // signalled.
    for (client_id, worker) in workers {
        if worker.await.is_err() {
            debug!("Worker for client id={} ended abnormally", client_id);
        }
    }
}

/// Consume protocol requests surfaced by connman until every connection task
/// is gone.
async fn run_event_loop(
    mut event_rx: mpsc::Receiver<ClientEvent>,
    connman: ConnmanHandle,
    store: TemplateStoreHandle,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            ClientEvent::RequestTransactionData {
                client_id,
                template_id,
            } => {
                handle_request_transaction_data(&connman, &store, client_id, template_id).await;
            }
            ClientEvent::SubmitSolution {
                client_id,
                solution,
            } => {
                handle_submit_solution(&store, client_id, solution).await;
            }
        }
    }
}

/// Enqueue a NewTemplate for the client, followed by a SetNewPrevHash when
/// the template builds on a prev hash the client has not activated yet. The
/// pair is enqueued as a unit so the order on the wire is fixed.
pub(crate) async fn send_work(
    connman: &ConnmanHandle,
    client_id: ClientId,
    template_id: u64,
    template: &dyn BlockTemplate,
    future_template: bool,
) -> bool {
    let header = template.header();

    let new_template = NewTemplate {
        header,
        coinbase_tx: template.coinbase_tx(),
        coinbase_merkle_path: template.coinbase_merkle_path(),
        witness_commitment_output_index: template.witness_commitment_index(),
        template_id,
        future_template,
    };

    debug!(
        "Send 0x71 NewTemplate id={} future={} to client id={}",
        template_id, future_template, client_id
    );
    let mut messages = vec![TemplateDistributionMessage::NewTemplate(new_template)];

    if future_template {
        debug!("Send 0x72 SetNewPrevHash to client id={}", client_id);
        messages.push(TemplateDistributionMessage::SetNewPrevHash(SetNewPrevHash {
            header,
            template_id,
        }));
    }

    connman.send_messages(client_id, messages).await
}

/// Respond to a RequestTransactionData message: the full transaction set of
/// the cached template, or one of the two protocol errors.
pub(crate) async fn handle_request_transaction_data(
    connman: &ConnmanHandle,
    store: &TemplateStoreHandle,
    client_id: ClientId,
    template_id: u64,
) {
    let Ok(cached) = store.lookup(template_id).await else {
        return;
    };
    let Some(template) = cached else {
        debug!(
            "Send 0x75 RequestTransactionData.Error (template-id-not-found: {}) to client id={}",
            template_id, client_id
        );
        send_request_transaction_data_error(
            connman,
            client_id,
            template_id,
            ERROR_TEMPLATE_ID_NOT_FOUND,
        )
        .await;
        return;
    };

    let block = template.block();
    let Ok(best_prev_hash) = store.best_prev_hash().await else {
        return;
    };
    if block.header.prev_blockhash != best_prev_hash {
        trace!(
            "Template id={} prevhash={}, tip={}",
            template_id,
            block.header.prev_blockhash,
            best_prev_hash
        );
        debug!(
            "Send 0x75 RequestTransactionData.Error (stale-template-id) to client id={}",
            client_id
        );
        send_request_transaction_data_error(connman, client_id, template_id, ERROR_STALE_TEMPLATE_ID)
            .await;
        return;
    }

    let witness_reserve_value = block
        .txdata
        .first()
        .and_then(|coinbase| coinbase.input.first())
        .and_then(|input| input.witness.nth(0))
        .map(|item| item.to_vec())
        .unwrap_or_default();
    let transactions: Vec<Transaction> = block.txdata.iter().skip(1).cloned().collect();

    debug!(
        "Send 0x74 RequestTransactionData.Success to client id={}",
        client_id
    );
    connman
        .send_messages(
            client_id,
            vec![TemplateDistributionMessage::RequestTransactionDataSuccess(
                RequestTransactionDataSuccess {
                    template_id,
                    witness_reserve_value,
                    transactions,
                },
            )],
        )
        .await;
}

async fn send_request_transaction_data_error(
    connman: &ConnmanHandle,
    client_id: ClientId,
    template_id: u64,
    error_code: &str,
) {
    connman
        .send_messages(
            client_id,
            vec![TemplateDistributionMessage::RequestTransactionDataError(
                RequestTransactionDataError {
                    template_id,
                    error_code: error_code.to_string(),
                },
            )],
        )
        .await;
}

/// Attach a client's proof of work to the cached template and hand the block
/// to the node. The template stays cached: another solution may be submitted
/// for the same template later, and the node or pool operator may wish to
/// inspect a competing block.
pub(crate) async fn handle_submit_solution(
    store: &TemplateStoreHandle,
    client_id: ClientId,
    solution: SubmitSolution,
) {
    debug!(
        "SubmitSolution id={} version={} timestamp={} nonce={} from client id={}",
        solution.template_id,
        solution.version,
        solution.header_timestamp,
        solution.header_nonce,
        client_id
    );

    let Ok(cached) = store.lookup(solution.template_id).await else {
        return;
    };
    let Some(template) = cached else {
        debug!(
            "Template with id={} is no longer in cache",
            solution.template_id
        );
        return;
    };

    template
        .submit_solution(
            solution.version,
            solution.header_timestamp,
            solution.header_nonce,
            solution.coinbase_tx,
        )
        .await;
}

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

use crate::mining::BlockTemplate;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

/// Allow a few seconds for clients to submit a block built on the previous
/// tip before their templates are pruned.
const PRUNE_GRACE: Duration = Duration::from_secs(10);

struct TemplateEntry {
    template: Arc<dyn BlockTemplate>,
    prev_hash: BlockHash,
}

/// Issued template ids mapped to their template handles, together with the
/// best prev hash seen by any worker and the template id counter.
///
/// A single task owns this state; workers, the dispatcher and the request
/// handlers go through [`TemplateStoreHandle`], so every reader observes a
/// consistent tip snapshot.
pub struct TemplateStore {
    templates: HashMap<u64, TemplateEntry>,
    next_template_id: u64,
    best_prev_hash: BlockHash,
    last_block_time: Instant,
}

impl TemplateStore {
    /// Reserve the next template id. Ids only ever increment, so every id in
    /// the map is at most the counter value.
    pub fn reserve_template_id(&mut self) -> u64 {
        self.next_template_id += 1;
        self.next_template_id
    }

    pub fn insert(&mut self, template_id: u64, template: Arc<dyn BlockTemplate>) {
        let prev_hash = template.header().prev_blockhash;
        self.templates
            .insert(template_id, TemplateEntry { template, prev_hash });
    }

    pub fn lookup(&self, template_id: u64) -> Option<Arc<dyn BlockTemplate>> {
        self.templates
            .get(&template_id)
            .map(|entry| Arc::clone(&entry.template))
    }

    /// Record the prev hash of the template a worker just observed. Returns
    /// true when this moved the tip.
    pub fn update_tip(&mut self, prev_hash: BlockHash) -> bool {
        if prev_hash == self.best_prev_hash {
            return false;
        }
        self.best_prev_hash = prev_hash;
        // Does not need to be accurate
        self.last_block_time = Instant::now();
        true
    }

    /// Mark the chain as ready without moving the tip, so the prune grace
    /// window starts counting from startup rather than from process launch.
    pub fn seed_last_block_time(&mut self) {
        self.last_block_time = Instant::now();
    }

    pub fn best_prev_hash(&self) -> BlockHash {
        self.best_prev_hash
    }

    /// Drop every template that no longer builds on the best prev hash,
    /// unless the tip changed within the grace window.
    pub fn prune(&mut self) {
        if self.last_block_time.elapsed() <= PRUNE_GRACE {
            return;
        }
        let prev_hash = self.best_prev_hash;
        let before = self.templates.len();
        self.templates.retain(|_, entry| entry.prev_hash == prev_hash);
        let pruned = before - self.templates.len();
        if pruned > 0 {
            debug!("Pruned {} stale templates from the cache", pruned);
        }
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self {
            templates: HashMap::new(),
            next_template_id: 0,
            best_prev_hash: BlockHash::all_zeros(),
            last_block_time: Instant::now(),
        }
    }
}

/// Commands that can be sent to the TemplateStoreActor
enum Command {
    ReserveTemplateId {
        resp: oneshot::Sender<u64>,
    },
    Insert {
        template_id: u64,
        template: Arc<dyn BlockTemplate>,
        resp: oneshot::Sender<()>,
    },
    Lookup {
        template_id: u64,
        resp: oneshot::Sender<Option<Arc<dyn BlockTemplate>>>,
    },
    UpdateTip {
        prev_hash: BlockHash,
        resp: oneshot::Sender<bool>,
    },
    SeedLastBlockTime {
        resp: oneshot::Sender<()>,
    },
    BestPrevHash {
        resp: oneshot::Sender<BlockHash>,
    },
    Prune {
        resp: oneshot::Sender<()>,
    },
}

/// A handle to the TemplateStoreActor
#[derive(Clone)]
pub struct TemplateStoreHandle {
    tx: mpsc::Sender<Command>,
}

impl TemplateStoreHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, String> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(build(resp_tx))
            .await
            .map_err(|_| "Failed to send template store command".to_string())?;
        resp_rx
            .await
            .map_err(|_| "Failed to receive template store response".to_string())
    }

    pub async fn reserve_template_id(&self) -> Result<u64, String> {
        self.request(|resp| Command::ReserveTemplateId { resp }).await
    }

    pub async fn insert(
        &self,
        template_id: u64,
        template: Arc<dyn BlockTemplate>,
    ) -> Result<(), String> {
        self.request(|resp| Command::Insert {
            template_id,
            template,
            resp,
        })
        .await
    }

    pub async fn lookup(
        &self,
        template_id: u64,
    ) -> Result<Option<Arc<dyn BlockTemplate>>, String> {
        self.request(|resp| Command::Lookup { template_id, resp }).await
    }

    pub async fn update_tip(&self, prev_hash: BlockHash) -> Result<bool, String> {
        self.request(|resp| Command::UpdateTip { prev_hash, resp }).await
    }

    pub async fn seed_last_block_time(&self) -> Result<(), String> {
        self.request(|resp| Command::SeedLastBlockTime { resp }).await
    }

    pub async fn best_prev_hash(&self) -> Result<BlockHash, String> {
        self.request(|resp| Command::BestPrevHash { resp }).await
    }

    pub async fn prune(&self) -> Result<(), String> {
        self.request(|resp| Command::Prune { resp }).await
    }
}

/// The actor that manages access to the TemplateStore
pub struct TemplateStoreActor {
    store: TemplateStore,
    rx: mpsc::Receiver<Command>,
}

impl TemplateStoreActor {
    /// Create a new TemplateStoreActor and return a handle to it
    fn new() -> (Self, TemplateStoreHandle) {
        let (tx, rx) = mpsc::channel(100);
        let actor = Self {
            store: TemplateStore::default(),
            rx,
        };
        (actor, TemplateStoreHandle { tx })
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::ReserveTemplateId { resp } => {
                    let _ = resp.send(self.store.reserve_template_id());
                }
                Command::Insert {
                    template_id,
                    template,
                    resp,
                } => {
                    self.store.insert(template_id, template);
                    let _ = resp.send(());
                }
                Command::Lookup { template_id, resp } => {
                    let _ = resp.send(self.store.lookup(template_id));
                }
                Command::UpdateTip { prev_hash, resp } => {
                    let _ = resp.send(self.store.update_tip(prev_hash));
                }
                Command::SeedLastBlockTime { resp } => {
                    self.store.seed_last_block_time();
                    let _ = resp.send(());
                }
                Command::BestPrevHash { resp } => {
                    let _ = resp.send(self.store.best_prev_hash());
                }
                Command::Prune { resp } => {
                    self.store.prune();
                    let _ = resp.send(());
                }
            }
        }
    }
}

/// Start a new TemplateStoreActor in a separate task and return a handle to it
pub fn start_template_store() -> TemplateStoreHandle {
    let (actor, handle) = TemplateStoreActor::new();
    tokio::spawn(async move {
        actor.run().await;
    });
    handle
}

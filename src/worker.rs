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

//! Per-client template lifecycle: assemble an initial template, wait for
//! better ones, and push NewTemplate/SetNewPrevHash pairs through connman.

use crate::config::Sv2TemplateProviderConfig;
use crate::connman::{ClientId, ConnmanHandle};
use crate::mining::{BlockCreateOptions, BlockTemplate, BlockWaitOptions, Mining};
use crate::provider::send_work;
use crate::template_store::TemplateStoreHandle;
use bitcoin::Amount;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// The assembler enforces a floor of 2000 weight units for the coinbase.
const MIN_COINBASE_RESERVED_WEIGHT: u32 = 2000;

/// Test pacing: bound the template wait so timeouts exercise the loop.
const TEST_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Test pacing: yield between iterations.
const TEST_YIELD: Duration = Duration::from_millis(50);

/// Rate limiter for fee-triggered template pushes.
pub(crate) struct FeeTimer {
    interval: Duration,
    last_triggered: Instant,
}

impl FeeTimer {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_triggered: Instant::now(),
        }
    }

    pub(crate) fn trigger(&mut self) -> bool {
        let now = Instant::now();
        if now - self.last_triggered >= self.interval {
            self.last_triggered = now;
            return true;
        }
        false
    }

    pub(crate) fn reset(&mut self) {
        self.last_triggered = Instant::now();
    }
}

/// Weight units reserved for the coinbase, padded by the client's declared
/// output size.
pub(crate) fn block_reserved_weight(coinbase_tx_outputs_size: u32) -> u32 {
    MIN_COINBASE_RESERVED_WEIGHT + coinbase_tx_outputs_size * 4
}

/// Drive the template lifecycle for one client until shutdown, the client
/// disconnects, or a send fails.
pub(crate) async fn run_client_worker<M: Mining + ?Sized>(
    client_id: ClientId,
    mining: Arc<M>,
    connman: ConnmanHandle,
    store: TemplateStoreHandle,
    config: Sv2TemplateProviderConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let fee_check_interval = Duration::from_secs(config.fee_check_interval);
    let mut timer = FeeTimer::new(fee_check_interval);
    let mut block_template: Option<Arc<dyn BlockTemplate>> = None;

    while !*shutdown_rx.borrow() {
        if block_template.is_none() {
            trace!("Generate initial block template for client id={}", client_id);

            let Ok(template_id) = store.reserve_template_id().await else {
                break;
            };

            let Some(client) = connman.get_client(client_id).await else {
                break;
            };
            let options = BlockCreateOptions {
                use_mempool: true,
                block_reserved_weight: block_reserved_weight(client.coinbase_tx_outputs_size),
            };

            let assembly_start = Instant::now();
            let template = mining.create_new_block(options).await;
            trace!(
                "Assemble template: {:.2}ms",
                assembly_start.elapsed().as_secs_f64() * 1000.0
            );

            let prev_hash = template.header().prev_blockhash;
            if store.update_tip(prev_hash).await.is_err() {
                break;
            }

            if connman.get_client(client_id).await.is_none() {
                break;
            }
            if !send_work(&connman, client_id, template_id, template.as_ref(), true).await {
                trace!("Disconnecting client id={}", client_id);
                connman.disconnect(client_id).await;
                break;
            }

            timer.reset();
            if store.insert(template_id, Arc::clone(&template)).await.is_err() {
                break;
            }
            block_template = Some(template);
        }

        let Some(current) = block_template.clone() else {
            continue;
        };

        // The future template flag is set when there's a new prevhash, not
        // when there's only a fee increase.
        let mut future_template = false;

        // Fee updates must not be pushed more often than once per
        // fee_check_interval, so we alternate: wait out the interval ignoring
        // fees, then wait with the fee threshold armed.
        let check_fees = config.is_test || timer.trigger();

        let fee_threshold = if check_fees {
            Amount::from_sat(config.fee_delta)
        } else {
            Amount::MAX_MONEY
        };
        let timeout = if check_fees {
            if config.is_test {
                Some(TEST_WAIT_TIMEOUT)
            } else {
                None
            }
        } else {
            Some(fee_check_interval)
        };
        if check_fees {
            trace!(
                "Wait for fees to rise by {} sat or a new tip, client id={}",
                fee_threshold.to_sat(),
                client_id
            );
        } else {
            trace!(
                "Ignore fee changes for {}s, wait for a new tip, client id={}",
                fee_check_interval.as_secs(),
                client_id
            );
        }

        let old_prev_hash = current.header().prev_blockhash;
        let options = BlockWaitOptions {
            fee_threshold,
            timeout,
        };
        let next = tokio::select! {
            _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
            next = current.wait_next(options) => next,
        };

        // The client may have disconnected during the wait, check now to
        // avoid a spurious assembly call and confusing log statements.
        if connman.get_client(client_id).await.is_none() {
            break;
        }

        if let Some(template) = next {
            let new_prev_hash = template.header().prev_blockhash;
            if new_prev_hash != old_prev_hash {
                trace!("Tip changed, client id={}", client_id);
                future_template = true;
                if store.update_tip(new_prev_hash).await.is_err() {
                    break;
                }
            }

            let Ok(template_id) = store.reserve_template_id().await else {
                break;
            };
            if !send_work(
                &connman,
                client_id,
                template_id,
                template.as_ref(),
                future_template,
            )
            .await
            {
                trace!("Disconnecting client id={}", client_id);
                connman.disconnect(client_id).await;
                break;
            }

            timer.reset();
            if store.insert(template_id, Arc::clone(&template)).await.is_err() {
                break;
            }
            block_template = Some(template);
        } else {
            // In production this only happens during shutdown, in tests
            // timeouts are expected.
            trace!("Timeout for client id={}", client_id);
        }

        if config.is_test {
            sleep(TEST_YIELD).await;
        }
    }
}

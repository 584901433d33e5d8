// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The head-tailing loop: walk levels from the persisted cursor to the chain
//! head, accrue rewards per block, trigger payment runs once per cycle.

use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result};
use tokio::time::Duration;

use crate::{
    chain::{Address, LEVELS_PER_CYCLE, SNAPSHOT_LAG_CYCLES},
    config::Config,
    db::DbObj,
    payment::PaymentProcessor,
    rewards::{RewardCalculator, RewardDelta},
    rpc::{BakerKeys, ChainReader},
};

/// How long to wait once caught up (or after a failed pass) before re-reading
/// the cursor and walking again.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Payment runs never trigger earlier than this many levels into a cycle, so
/// the previous cycle is final when it settles.
const MIN_TRIGGER_OFFSET: u64 = 5;

/// Where to resume indexing. The lag floor guarantees enough history exists
/// for every lagged snapshot lookup the walk will make.
fn resume_level(last_indexed: Option<u64>, configured_start: u64) -> u64 {
    let lag_floor = LEVELS_PER_CYCLE * SNAPSHOT_LAG_CYCLES;
    last_indexed.map_or(1, |level| level + 1).max(configured_start).max(lag_floor)
}

pub struct IndexerService {
    chain: Arc<ChainReader>,
    db: DbObj,
    calculator: RewardCalculator,
    payments: PaymentProcessor,
    config: Arc<Config>,
}

impl IndexerService {
    pub fn new(
        chain: Arc<ChainReader>,
        db: DbObj,
        calculator: RewardCalculator,
        payments: PaymentProcessor,
        config: Arc<Config>,
    ) -> Self {
        Self { chain, db, calculator, payments, config }
    }

    /// Run forever: one catch-up pass, then sleep. A pass that fails is
    /// logged and the failing level is retried on the next pass — the cursor
    /// only moves once a level's effects are durable, so nothing is skipped.
    pub async fn run(&self) -> Result<()> {
        loop {
            if let Err(err) = self.catch_up().await {
                tracing::error!("catch-up pass failed: {err:#}");
            }
            tracing::info!("waiting {POLL_INTERVAL:?} before next pass");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn catch_up(&self) -> Result<()> {
        let head = self.chain.head().await.context("fetching chain head")?;
        let mut level = resume_level(self.db.last_indexed_level().await?, self.config.start_level);
        tracing::info!(level, head = head.level(), "starting catch-up pass");

        while level < head.level() {
            let started = Instant::now();
            self.handle_level(level)
                .await
                .with_context(|| format!("processing level {level}"))?;
            self.db.set_last_indexed_level(level).await?;
            tracing::debug!(level, elapsed_ms = started.elapsed().as_millis() as u64, "indexed");

            self.maybe_run_payments(level)
                .await
                .with_context(|| format!("payment trigger at level {level}"))?;

            level += 1;
        }

        tracing::info!("caught up with the chain head");
        Ok(())
    }

    async fn handle_level(&self, level: u64) -> Result<()> {
        let block = self.chain.block(level).await?;
        // Endorsements of this level are committed in the next block.
        let next = self.chain.block(level + 1).await?;
        let endorsements = next.endorsements();

        let baker = block.baker().clone();
        if self.is_tracked(&baker) {
            let deltas = self.calculator.rewards_for_baker(&block, &baker, &endorsements).await?;
            tracing::info!(%baker, level, "found {} rewards for baking", deltas.len());
            self.credit(&baker, &deltas).await?;
        }

        for endorsement in &endorsements {
            if self.is_tracked(&endorsement.delegate) {
                let deltas = self
                    .calculator
                    .rewards_for_endorser(&block, &endorsement.delegate, endorsement.slots)
                    .await?;
                tracing::info!(
                    endorser = %endorsement.delegate,
                    level,
                    "found {} rewards for endorsing",
                    deltas.len()
                );
                self.credit(&endorsement.delegate, &deltas).await?;
            }
        }

        Ok(())
    }

    async fn credit(&self, baker: &Address, deltas: &[RewardDelta]) -> Result<()> {
        for delta in deltas {
            self.db
                .credit_reward(baker, &delta.address, delta.metadata.cycle, delta.amount)
                .await?;
        }
        Ok(())
    }

    /// Settle the previous cycle once per cycle, at the configured offset
    /// past its first level. Bakers are paid one at a time: payment batches
    /// share the node and the signing path, so nothing runs concurrently.
    async fn maybe_run_payments(&self, level: u64) -> Result<()> {
        if !self.config.autopay.enabled {
            return Ok(());
        }

        let block = self.chain.block(level).await?;
        let range = self.chain.cycle_range(block.cycle()).await?;
        if level != range.first + self.config.autopay.trigger_level.max(MIN_TRIGGER_OFFSET) {
            return Ok(());
        }
        let Some(payout_cycle) = block.cycle().checked_sub(1) else {
            return Ok(());
        };

        for (baker, secret_key) in &self.config.signers {
            let keys = BakerKeys::derive(secret_key)
                .with_context(|| format!("deriving signing keys for {baker}"))?;
            self.payments
                .run_payment(baker, &keys, payout_cycle)
                .await
                .with_context(|| format!("payment run for {baker}"))?;
        }

        Ok(())
    }

    fn is_tracked(&self, address: &Address) -> bool {
        self.config.bakers.contains(address)
    }
}

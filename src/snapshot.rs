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

//! Cycle snapshots: the stable minimum delegated balance of every address
//! that stayed delegated to a baker through a whole cycle.
//!
//! A delegator only qualifies for a cycle's rewards if it is present at every
//! sampled checkpoint of that cycle, and then only for the minimum balance it
//! held across those checkpoints. Balance or delegation churn inside a cycle
//! therefore can only reduce a stake, never inflate it.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use futures_util::{stream, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    chain::{to_coin, Address, SAMPLE_STRIDE},
    db::DbObj,
    rpc::{retry_with_policy, ChainReader, RetryPolicy, RpcError},
};

/// Per-level balance lookups fanned out while sampling. Reads of finalized
/// state are independent and idempotent, so a small fan-out is safe.
const BALANCE_FETCH_CONCURRENCY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatorStake {
    pub address: Address,
    pub min_delegated_balance: Decimal,
}

/// The durable result of scanning one (baker, cycle): running minimums of the
/// baker's own aggregate balances, and the set of delegators that stayed
/// delegated through every checkpoint. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSnapshot {
    pub baker: Address,
    pub cycle: u64,
    pub min_full_staking_balance: Decimal,
    pub min_own_balance: Decimal,
    pub min_delegated_balance: Decimal,
    pub delegators: Vec<DelegatorStake>,
}

/// Everything observed at one sampled level.
#[derive(Debug, Clone)]
pub(crate) struct LevelSample {
    pub full_staking_balance: Decimal,
    pub own_balance: Decimal,
    pub delegated_balance: Decimal,
    pub delegators: Vec<(Address, Decimal)>,
}

/// Fold state for the intersect-and-minimize scan: running baker-level
/// minimums plus the surviving delegator set with its tracked minimums.
#[derive(Debug)]
pub(crate) struct SampleAccumulator {
    min_full_staking_balance: Decimal,
    min_own_balance: Decimal,
    min_delegated_balance: Decimal,
    stable: BTreeMap<Address, Decimal>,
}

impl SampleAccumulator {
    pub fn seed(sample: LevelSample) -> Self {
        Self {
            min_full_staking_balance: sample.full_staking_balance,
            min_own_balance: sample.own_balance,
            min_delegated_balance: sample.delegated_balance,
            stable: sample.delegators.into_iter().collect(),
        }
    }

    /// Absorb a later sample. Baker-level minimums always update; the stable
    /// set intersects by address, keeping the smaller of the tracked and the
    /// newly observed balance. Returns `false` once the intersection is empty
    /// — the scan can stop, no delegator was stable for the whole cycle.
    pub fn absorb(&mut self, sample: &LevelSample) -> bool {
        self.min_full_staking_balance =
            self.min_full_staking_balance.min(sample.full_staking_balance);
        self.min_own_balance = self.min_own_balance.min(sample.own_balance);
        self.min_delegated_balance = self.min_delegated_balance.min(sample.delegated_balance);

        let mut survivors = BTreeMap::new();
        for (address, balance) in &sample.delegators {
            if let Some(tracked) = self.stable.get(address) {
                survivors.insert(address.clone(), (*tracked).min(*balance));
            }
        }
        self.stable = survivors;

        !self.stable.is_empty()
    }

    pub fn into_snapshot(self, baker: Address, cycle: u64) -> CycleSnapshot {
        CycleSnapshot {
            baker,
            cycle,
            min_full_staking_balance: self.min_full_staking_balance,
            min_own_balance: self.min_own_balance,
            min_delegated_balance: self.min_delegated_balance,
            delegators: self
                .stable
                .into_iter()
                .map(|(address, min_delegated_balance)| DelegatorStake {
                    address,
                    min_delegated_balance,
                })
                .collect(),
        }
    }
}

/// Builds (or loads) the snapshot for a (baker, cycle). Runs the scan at most
/// once per key: a persisted snapshot short-circuits, and the insert is
/// insert-if-absent so a concurrent or repeated computation cannot replace an
/// existing row.
pub struct SnapshotBuilder {
    chain: Arc<ChainReader>,
    db: DbObj,
}

impl SnapshotBuilder {
    pub fn new(chain: Arc<ChainReader>, db: DbObj) -> Self {
        Self { chain, db }
    }

    pub async fn compute_or_load(&self, baker: &Address, cycle: u64) -> Result<CycleSnapshot> {
        if let Some(snapshot) = self.db.cycle_snapshot(baker, cycle).await? {
            return Ok(snapshot);
        }

        let range = self
            .chain
            .cycle_range(cycle)
            .await
            .with_context(|| format!("resolving level range of cycle {cycle}"))?;

        tracing::info!(%baker, cycle, first = range.first, last = range.last, "scanning cycle");

        let mut accumulator: Option<SampleAccumulator> = None;
        let mut level = range.first;
        while level <= range.last {
            tracing::debug!(%baker, level, "sampling");
            let sample =
                retry_with_policy(&RetryPolicy::sampling(), "cycle sample", || {
                    self.fetch_sample(baker, level)
                })
                .await
                .with_context(|| format!("sampling {baker} at level {level}"))?;

            if let Some(acc) = accumulator.as_mut() {
                if !acc.absorb(&sample) {
                    tracing::info!(
                        %baker,
                        cycle,
                        level,
                        "no delegator stayed delegated through the cycle"
                    );
                    break;
                }
            } else {
                accumulator = Some(SampleAccumulator::seed(sample));
            }

            level += SAMPLE_STRIDE;
        }

        let snapshot = match accumulator {
            Some(acc) => acc.into_snapshot(baker.clone(), cycle),
            None => CycleSnapshot {
                baker: baker.clone(),
                cycle,
                min_full_staking_balance: Decimal::ZERO,
                min_own_balance: Decimal::ZERO,
                min_delegated_balance: Decimal::ZERO,
                delegators: Vec::new(),
            },
        };

        tracing::info!(
            %baker,
            cycle,
            delegators = snapshot.delegators.len(),
            "persisting cycle snapshot"
        );
        Ok(self.db.insert_cycle_snapshot(&snapshot).await?)
    }

    async fn fetch_sample(&self, baker: &Address, level: u64) -> Result<LevelSample, RpcError> {
        let node = self.chain.node();

        let addresses = node.delegated_addresses(baker, level).await?;
        let delegators = stream::iter(addresses.into_iter().filter(|addr| addr != baker).map(
            |address| {
                let node = node.clone();
                async move {
                    let balance = node.balance(&address, level).await?;
                    Ok::<_, RpcError>((address, to_coin(balance)))
                }
            },
        ))
        .buffer_unordered(BALANCE_FETCH_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;

        Ok(LevelSample {
            full_staking_balance: to_coin(node.full_staking_balance(baker, level).await?),
            own_balance: to_coin(node.own_staking_balance(baker, level).await?),
            delegated_balance: to_coin(node.delegated_balance(baker, level).await?),
            delegators,
        })
    }
}

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

//! Per-delegator reward computation for baking and endorsing events.

use anyhow::Result;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::{
    chain::{to_coin, Address, Block, Endorsement, SNAPSHOT_LAG_CYCLES},
    rpc::ChainReader,
    snapshot::SnapshotBuilder,
};
use std::sync::Arc;

/// Delegators whose stable balance is at or below this many display units are
/// not worth a payment and are dropped from every split.
const DUST_BALANCE_FLOOR: Decimal = Decimal::ONE_HUNDRED;

/// One delegator's share of a single block event, plus the inputs that
/// produced it for audit logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardDelta {
    pub address: Address,
    pub amount: Decimal,
    pub metadata: RewardMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardMetadata {
    pub priority: u32,
    pub cycle: u64,
    pub total_reward: Decimal,
    pub endorser_count: usize,
    pub slot_count: usize,
    pub baking_reward_per_endorsement: Vec<u64>,
    pub endorsement_reward: Vec<u64>,
    pub min_delegated_balance: Decimal,
}

enum RewardEvent {
    Baking { endorser_count: usize, slots: u64 },
    Endorsing { slots: usize },
}

/// Truncate to 7 fractional digits. Flooring every share guarantees the sum
/// of the split never exceeds the reward pool.
fn floor7(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(7, RoundingStrategy::ToZero)
}

pub struct RewardCalculator {
    chain: Arc<ChainReader>,
    snapshots: SnapshotBuilder,
}

impl RewardCalculator {
    pub fn new(chain: Arc<ChainReader>, snapshots: SnapshotBuilder) -> Self {
        Self { chain, snapshots }
    }

    /// Rewards owed by a block's proposer to its delegators, proportional to
    /// the endorsement slots the block collected.
    pub async fn rewards_for_baker(
        &self,
        block: &Block,
        baker: &Address,
        endorsers: &[Endorsement],
    ) -> Result<Vec<RewardDelta>> {
        let slots = endorsers.iter().map(|e| e.slots as u64).sum();
        self.rewards(block, baker, RewardEvent::Baking { endorser_count: endorsers.len(), slots })
            .await
    }

    /// Rewards owed by an endorser of this block's predecessor.
    pub async fn rewards_for_endorser(
        &self,
        block: &Block,
        endorser: &Address,
        slots: usize,
    ) -> Result<Vec<RewardDelta>> {
        self.rewards(block, endorser, RewardEvent::Endorsing { slots }).await
    }

    async fn rewards(
        &self,
        block: &Block,
        address: &Address,
        event: RewardEvent,
    ) -> Result<Vec<RewardDelta>> {
        let level = block.level();
        let cycle = block.cycle();
        let priority = block.priority();
        let constants = self.chain.constants(level).await?;

        // The split follows the delegation state of the lagged cycle. Too
        // early in the chain for that lag to resolve means no stable
        // delegation history, not an error.
        let Some(snapshot_cycle) = cycle.checked_sub(SNAPSHOT_LAG_CYCLES) else {
            return Ok(Vec::new());
        };
        let snapshot = self.snapshots.compute_or_load(address, snapshot_cycle).await?;
        if snapshot.delegators.is_empty() || snapshot.min_full_staking_balance <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        let (endorser_count, slot_count, total_mutez) = match event {
            RewardEvent::Baking { endorser_count, slots } => {
                (endorser_count, 0, constants.baking_reward(priority) * slots)
            }
            RewardEvent::Endorsing { slots } => {
                (0, slots, constants.endorsement_reward(priority) * slots as u64)
            }
        };
        let total_reward = to_coin(total_mutez);

        let deltas = snapshot
            .delegators
            .iter()
            .filter(|delegator| delegator.min_delegated_balance > DUST_BALANCE_FLOOR)
            .map(|delegator| RewardDelta {
                address: delegator.address.clone(),
                amount: floor7(
                    total_reward * delegator.min_delegated_balance
                        / snapshot.min_full_staking_balance,
                ),
                metadata: RewardMetadata {
                    priority,
                    cycle,
                    total_reward,
                    endorser_count,
                    slot_count,
                    baking_reward_per_endorsement: constants
                        .baking_reward_per_endorsement
                        .clone(),
                    endorsement_reward: constants.endorsement_reward.clone(),
                    min_delegated_balance: delegator.min_delegated_balance,
                },
            })
            .collect();

        Ok(deltas)
    }
}

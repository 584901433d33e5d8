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

//! Scripted in-memory node for tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    chain::{
        cycle_of_level, Address, Block, BlockHeader, BlockMetadata, CycleRange,
        EndorsementMetadata, LevelInfo, OperationContent, OperationGroup, ProtocolConstants,
    },
    rpc::{BakerKeys, BlockId, NodeClient, RpcError, TransferOp},
};

/// A [`NodeClient`] backed by hash maps. Missing entries answer with
/// [`RpcError::BadResponse`], which doubles as a scripted transient failure.
#[derive(Default)]
pub(crate) struct FakeNode {
    blocks: Mutex<HashMap<u64, Block>>,
    head: Mutex<Option<Block>>,
    constants: Mutex<Option<ProtocolConstants>>,
    cycle_ranges: Mutex<HashMap<u64, CycleRange>>,
    delegators: Mutex<HashMap<(Address, u64), Vec<Address>>>,
    balances: Mutex<HashMap<(Address, u64), u64>>,
    full_staking: Mutex<HashMap<(Address, u64), u64>>,
    own_staking: Mutex<HashMap<(Address, u64), u64>>,
    delegated: Mutex<HashMap<(Address, u64), u64>>,
    broadcasts: Mutex<Vec<(Address, Vec<TransferOp>)>>,
    balance_failures: AtomicU32,
    broadcast_failures: AtomicU32,
    block_calls: AtomicUsize,
    balance_calls: AtomicUsize,
}

impl FakeNode {
    pub fn insert_block(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.level(), block);
    }

    pub fn set_head(&self, block: Block) {
        *self.head.lock().unwrap() = Some(block);
    }

    pub fn set_constants(&self, baking: &[u64], endorsing: &[u64]) {
        *self.constants.lock().unwrap() = Some(ProtocolConstants {
            baking_reward_per_endorsement: baking.to_vec(),
            endorsement_reward: endorsing.to_vec(),
        });
    }

    pub fn insert_cycle_range(&self, cycle: u64, range: CycleRange) {
        self.cycle_ranges.lock().unwrap().insert(cycle, range);
    }

    /// Register the delegator set (with balances, in mutez) of a baker at a
    /// level.
    pub fn insert_delegators(&self, baker: &Address, level: u64, entries: &[(&str, u64)]) {
        let mut addresses = Vec::new();
        for (raw, balance) in entries {
            let address = Address::from(*raw);
            self.balances.lock().unwrap().insert((address.clone(), level), *balance);
            addresses.push(address);
        }
        self.delegators.lock().unwrap().insert((baker.clone(), level), addresses);
    }

    pub fn insert_baker_balances(
        &self,
        baker: &Address,
        level: u64,
        full_staking: u64,
        own: u64,
        delegated: u64,
    ) {
        self.full_staking.lock().unwrap().insert((baker.clone(), level), full_staking);
        self.own_staking.lock().unwrap().insert((baker.clone(), level), own);
        self.delegated.lock().unwrap().insert((baker.clone(), level), delegated);
    }

    pub fn fail_next_balance_fetches(&self, count: u32) {
        self.balance_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_broadcasts(&self, count: u32) {
        self.broadcast_failures.store(count, Ordering::SeqCst);
    }

    pub fn broadcasts(&self) -> Vec<(Address, Vec<TransferOp>)> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    /// Decrement-if-positive on a scripted failure budget.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn missing<T>(what: impl std::fmt::Display) -> Result<T, RpcError> {
    Err(RpcError::BadResponse(format!("no such {what}")))
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn block(&self, id: BlockId) -> Result<Block, RpcError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        match id {
            BlockId::Head => match self.head.lock().unwrap().clone() {
                Some(block) => Ok(block),
                None => missing("head"),
            },
            BlockId::Level(level) => match self.blocks.lock().unwrap().get(&level) {
                Some(block) => Ok(block.clone()),
                None => missing(format!("block {level}")),
            },
        }
    }

    async fn protocol_constants(&self, _level: u64) -> Result<ProtocolConstants, RpcError> {
        match self.constants.lock().unwrap().clone() {
            Some(constants) => Ok(constants),
            None => missing("constants"),
        }
    }

    async fn cycle_levels(&self, cycle: u64) -> Result<CycleRange, RpcError> {
        match self.cycle_ranges.lock().unwrap().get(&cycle) {
            Some(range) => Ok(*range),
            None => missing(format!("cycle {cycle}")),
        }
    }

    async fn delegated_addresses(
        &self,
        baker: &Address,
        level: u64,
    ) -> Result<Vec<Address>, RpcError> {
        match self.delegators.lock().unwrap().get(&(baker.clone(), level)) {
            Some(addresses) => Ok(addresses.clone()),
            None => missing(format!("delegators of {baker} at {level}")),
        }
    }

    async fn balance(&self, address: &Address, level: u64) -> Result<u64, RpcError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.balance_failures) {
            return Err(RpcError::BadResponse("scripted balance failure".to_string()));
        }
        match self.balances.lock().unwrap().get(&(address.clone(), level)) {
            Some(balance) => Ok(*balance),
            None => missing(format!("balance of {address} at {level}")),
        }
    }

    async fn full_staking_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError> {
        match self.full_staking.lock().unwrap().get(&(baker.clone(), level)) {
            Some(balance) => Ok(*balance),
            None => missing(format!("staking balance of {baker} at {level}")),
        }
    }

    async fn own_staking_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError> {
        match self.own_staking.lock().unwrap().get(&(baker.clone(), level)) {
            Some(balance) => Ok(*balance),
            None => missing(format!("own balance of {baker} at {level}")),
        }
    }

    async fn delegated_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError> {
        match self.delegated.lock().unwrap().get(&(baker.clone(), level)) {
            Some(balance) => Ok(*balance),
            None => missing(format!("delegated balance of {baker} at {level}")),
        }
    }

    async fn sign_and_broadcast(
        &self,
        source: &Address,
        ops: &[TransferOp],
        _keys: &BakerKeys,
    ) -> Result<String, RpcError> {
        if Self::take_failure(&self.broadcast_failures) {
            return Err(RpcError::BadResponse("scripted broadcast failure".to_string()));
        }
        let mut broadcasts = self.broadcasts.lock().unwrap();
        broadcasts.push((source.clone(), ops.to_vec()));
        Ok(format!("op-{}", broadcasts.len()))
    }

    async fn await_confirmation(
        &self,
        _op_hash: &str,
        _poll: Duration,
        _timeout: Duration,
    ) -> Result<String, RpcError> {
        Ok("BLconfirmed".to_string())
    }
}

/// A block with the given proposer and the given endorsements in its first
/// validation pass; each endorsement is (delegate, slot count, endorsed
/// level).
pub(crate) fn make_block(
    level: u64,
    baker: &Address,
    priority: u32,
    endorsements: &[(Address, usize, u64)],
) -> Block {
    let groups = endorsements
        .iter()
        .enumerate()
        .map(|(i, (delegate, slots, endorsed_level))| OperationGroup {
            hash: format!("op-endorse-{level}-{i}"),
            contents: vec![OperationContent::Endorsement {
                level: *endorsed_level,
                metadata: EndorsementMetadata {
                    delegate: delegate.clone(),
                    slots: (0..*slots as u16).collect(),
                },
            }],
        })
        .collect();

    Block {
        hash: format!("BL{level}"),
        header: BlockHeader { level, priority },
        metadata: BlockMetadata { baker: baker.clone(), level: LevelInfo { cycle: cycle_of_level(level) } },
        operations: vec![groups],
    }
}

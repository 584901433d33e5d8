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

//! Payout daemon for a delegated-proof-of-stake chain: tails the chain head,
//! accrues per-delegator staking rewards for a set of tracked bakers, and
//! settles them as batched on-chain transfers.

use std::{sync::Arc, time::Duration};

use thiserror::Error;

pub mod cache;
pub mod chain;
pub mod config;
pub mod db;
pub mod indexer;
pub mod payment;
pub mod rewards;
pub mod rpc;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod test_utils;

use chain::HISTORY_CACHE_TTL_SECS;
use config::Config;
use db::{DbError, DbObj, SqliteDb};
use indexer::IndexerService;
use payment::PaymentProcessor;
use rewards::RewardCalculator;
use rpc::{ChainReader, HttpNodeClient, NodeClient, RpcError};
use snapshot::SnapshotBuilder;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("node rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("error: {0}")]
    Error(#[from] anyhow::Error),
}

/// The wired-up daemon: one indexer walking the chain, crediting the reward
/// ledger and driving payment runs. A single logical worker; strictly
/// sequential across levels and across bakers.
pub struct PayoutService {
    indexer: IndexerService,
}

impl PayoutService {
    pub async fn new(config: Config) -> Result<Self, ServiceError> {
        let config = Arc::new(config);

        let node: Arc<dyn NodeClient> = Arc::new(HttpNodeClient::new(config.rpc_url.clone()));
        let db: DbObj = Arc::new(SqliteDb::new(&config.db_url).await?);
        let chain =
            Arc::new(ChainReader::new(node.clone(), Duration::from_secs(HISTORY_CACHE_TTL_SECS)));

        let snapshots = SnapshotBuilder::new(chain.clone(), db.clone());
        let calculator = RewardCalculator::new(chain.clone(), snapshots);
        let payments = PaymentProcessor::new(node, db.clone(), config.clone());

        Ok(Self { indexer: IndexerService::new(chain, db, calculator, payments, config) })
    }

    /// Run until killed. The indexer loop handles its own failures by
    /// sleeping and retrying from the persisted cursor.
    pub async fn run(self) -> Result<(), ServiceError> {
        self.indexer.run().await?;
        Ok(())
    }
}

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

//! Settlement: turn unpaid ledger accruals into broadcast transfer batches.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::{
    chain::{to_mutez, Address},
    config::Config,
    db::{DbObj, PaymentRecord},
    rpc::{retry_with_policy, BakerKeys, NodeClient, RetryPolicy, TransferOp},
};

/// Protocol hard cap on operations per block; the configured batch size is
/// clamped to it.
pub const MAX_OPERATIONS_PER_BLOCK: usize = 199;

// Fixed per-operation execution limits, in mutez-denominated gas/storage
// units.
const TRANSFER_GAS_LIMIT: u64 = 10_307;
const TRANSFER_STORAGE_LIMIT: u64 = 257;

const CONFIRMATION_POLL: Duration = Duration::from_secs(10);
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(61 * 60);

#[derive(Debug, Clone)]
struct Payable {
    to: Address,
    gross: Decimal,
    net: Decimal,
}

/// Aggregates a baker's unpaid accruals, nets commission, chunks to the
/// per-block operation cap, broadcasts each chunk and settles the matching
/// ledger rows once the broadcast succeeds. Chunks are strictly sequential;
/// so are payment runs across bakers (driven one at a time by the indexer).
pub struct PaymentProcessor {
    node: Arc<dyn NodeClient>,
    db: DbObj,
    config: Arc<Config>,
}

impl PaymentProcessor {
    pub fn new(node: Arc<dyn NodeClient>, db: DbObj, config: Arc<Config>) -> Self {
        Self { node, db, config }
    }

    pub async fn run_payment(&self, baker: &Address, keys: &BakerKeys, cycle: u64) -> Result<()> {
        let autopay = &self.config.autopay;
        let effective_cycle = cycle.saturating_sub(autopay.payment_cycle_lag);
        tracing::info!(%baker, cycle, effective_cycle, "starting payment run");

        let accrued = self.db.unpaid_rewards_by_recipient(baker, effective_cycle).await?;
        tracing::info!("loaded {} recipients with unpaid rewards", accrued.len());

        let payables: Vec<Payable> = accrued
            .into_iter()
            .filter_map(|(to, gross)| {
                let commission = autopay.commission_for(baker, &to);
                let net = gross * (Decimal::ONE - commission);
                (net >= autopay.min_payment).then_some(Payable { to, gross, net })
            })
            .collect();

        if payables.is_empty() {
            tracing::info!(%baker, "nothing payable");
            return Ok(());
        }

        let total: Decimal = payables.iter().map(|p| p.net).sum();
        tracing::info!("paying {} recipients, {total} total", payables.len());

        let chunk_size = autopay.max_batch_size.min(MAX_OPERATIONS_PER_BLOCK).max(1);
        for chunk in payables.chunks(chunk_size) {
            self.settle_chunk(baker, keys, effective_cycle, chunk).await?;
        }

        Ok(())
    }

    async fn settle_chunk(
        &self,
        baker: &Address,
        keys: &BakerKeys,
        effective_cycle: u64,
        chunk: &[Payable],
    ) -> Result<()> {
        let fee = to_mutez(self.config.autopay.fee).context("fee out of range")?;

        let ops = chunk
            .iter()
            .map(|payable| {
                Ok(TransferOp {
                    destination: payable.to.clone(),
                    amount: to_mutez(payable.net)
                        .with_context(|| format!("amount out of range for {}", payable.to))?,
                    fee,
                    gas_limit: TRANSFER_GAS_LIMIT,
                    storage_limit: TRANSFER_STORAGE_LIMIT,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let op_hash = retry_with_policy(&RetryPolicy::broadcast(), "broadcast transfer batch", || {
            self.node.sign_and_broadcast(baker, &ops, keys)
        })
        .await
        .context("broadcasting transfer batch")?;
        tracing::info!(%op_hash, "broadcast {} transfers", ops.len());

        // The settlement commit: from here on these accruals can never be
        // paid again.
        let recipients: Vec<Address> = chunk.iter().map(|p| p.to.clone()).collect();
        let settled = self
            .db
            .mark_rewards_paid(baker, &recipients, effective_cycle, &op_hash)
            .await?;
        tracing::info!(%op_hash, "settled {settled} ledger rows");

        let records: Vec<PaymentRecord> = chunk
            .iter()
            .map(|payable| PaymentRecord {
                from: baker.clone(),
                to: payable.to.clone(),
                operation_hash: op_hash.clone(),
                amount: payable.net,
                gross_amount: payable.gross,
                fee: self.config.autopay.fee,
            })
            .collect();
        self.db.record_payments(&records).await?;

        match self
            .node
            .await_confirmation(&op_hash, CONFIRMATION_POLL, CONFIRMATION_TIMEOUT)
            .await
        {
            Ok(block_hash) => tracing::info!(%op_hash, %block_hash, "transfer batch confirmed"),
            Err(err) => tracing::error!(%op_hash, "confirmation wait failed: {err}"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AutopayConfig, Config},
        db::SqliteDb,
        test_utils::FakeNode,
    };
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use url::Url;

    fn addr(raw: &str) -> Address {
        Address::from(raw)
    }

    fn config(autopay: AutopayConfig) -> Arc<Config> {
        Arc::new(Config {
            rpc_url: Url::parse("http://127.0.0.1:8732/").unwrap(),
            db_url: "sqlite::memory:".to_string(),
            start_level: 0,
            bakers: vec![addr("addr-baker")],
            autopay,
            signers: BTreeMap::new(),
        })
    }

    fn autopay() -> AutopayConfig {
        AutopayConfig { default_commission: dec!(0.07), ..AutopayConfig::default() }
    }

    async fn processor(
        node: Arc<FakeNode>,
        autopay: AutopayConfig,
    ) -> (PaymentProcessor, DbObj) {
        let db: DbObj = Arc::new(SqliteDb::new("sqlite::memory:").await.unwrap());
        (PaymentProcessor::new(node, db.clone(), config(autopay)), db)
    }

    fn keys() -> BakerKeys {
        BakerKeys::derive(&"33".repeat(32)).unwrap()
    }

    /// gross 10, commission 0.07 -> net 9.3, above the 0.01 threshold.
    #[tokio::test]
    async fn pays_net_of_commission() {
        let node = Arc::new(FakeNode::default());
        let (processor, db) = processor(node.clone(), autopay()).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 9, dec!(10)).await.unwrap();

        processor.run_payment(&baker, &keys(), 9).await.unwrap();

        let broadcasts = node.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        let (source, ops) = &broadcasts[0];
        assert_eq!(source, &baker);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].destination, addr("addr-d1"));
        assert_eq!(ops[0].amount, 9_300_000);
        assert_eq!(ops[0].fee, 100_000);

        // Rows are settled and the history row carries gross and net.
        assert!(db.unpaid_rewards_by_recipient(&baker, 9).await.unwrap().is_empty());
        let history = db.payments_from(&baker).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, dec!(9.3));
        assert_eq!(history[0].gross_amount, dec!(10));
    }

    #[tokio::test]
    async fn commission_overrides_take_precedence() {
        let node = Arc::new(FakeNode::default());
        let mut autopay = autopay();
        autopay.baker_commissions.insert(addr("addr-baker"), dec!(0.10));
        // A 100% address override keeps the whole reward; nothing is paid.
        autopay.address_commissions.insert(addr("addr-kept"), dec!(1));
        let (processor, db) = processor(node.clone(), autopay).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 9, dec!(10)).await.unwrap();
        db.credit_reward(&baker, &addr("addr-kept"), 9, dec!(10)).await.unwrap();

        processor.run_payment(&baker, &keys(), 9).await.unwrap();

        let broadcasts = node.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        let (_, ops) = &broadcasts[0];
        assert_eq!(ops.len(), 1);
        // Baker override, not the default: 10 * (1 - 0.10).
        assert_eq!(ops[0].amount, 9_000_000);
    }

    #[tokio::test]
    async fn below_threshold_recipients_are_skipped() {
        let node = Arc::new(FakeNode::default());
        let (processor, db) = processor(node.clone(), autopay()).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 9, dec!(0.005)).await.unwrap();

        processor.run_payment(&baker, &keys(), 9).await.unwrap();

        assert!(node.broadcasts().is_empty());
        // Skipped accruals stay unpaid for a later run.
        assert_eq!(db.unpaid_rewards_by_recipient(&baker, 9).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chunks_are_broadcast_sequentially() {
        let node = Arc::new(FakeNode::default());
        let mut autopay = autopay();
        autopay.max_batch_size = 2;
        let (processor, db) = processor(node.clone(), autopay).await;
        let baker = addr("addr-baker");

        for i in 0..5 {
            db.credit_reward(&baker, &addr(&format!("addr-d{i}")), 9, dec!(10)).await.unwrap();
        }

        processor.run_payment(&baker, &keys(), 9).await.unwrap();

        let broadcasts = node.broadcasts();
        assert_eq!(broadcasts.len(), 3);
        assert_eq!(broadcasts[0].1.len(), 2);
        assert_eq!(broadcasts[1].1.len(), 2);
        assert_eq!(broadcasts[2].1.len(), 1);

        // Each chunk settles under its own operation hash.
        let history = db.payments_from(&baker).await.unwrap();
        let hashes: std::collections::BTreeSet<_> =
            history.iter().map(|r| r.operation_hash.clone()).collect();
        assert_eq!(history.len(), 5);
        assert_eq!(hashes.len(), 3);
        assert!(db.unpaid_rewards_by_recipient(&baker, 9).await.unwrap().is_empty());
    }

    /// The payment cycle lag narrows the settled window; younger accruals
    /// wait for a later run.
    #[tokio::test]
    async fn payment_lag_bounds_the_cycle_window() {
        let node = Arc::new(FakeNode::default());
        let mut autopay = autopay();
        autopay.payment_cycle_lag = 5;
        let (processor, db) = processor(node.clone(), autopay).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 4, dec!(10)).await.unwrap();
        db.credit_reward(&baker, &addr("addr-d1"), 5, dec!(10)).await.unwrap();

        processor.run_payment(&baker, &keys(), 9).await.unwrap();

        // Only cycles <= 9 - 5 were settled.
        let unpaid = db.unpaid_rewards_by_recipient(&baker, 9).await.unwrap();
        assert_eq!(unpaid, vec![(addr("addr-d1"), dec!(10))]);
    }

    /// Re-running the processor after settlement selects no rows: payment is
    /// at-most-once.
    #[tokio::test]
    async fn rerun_is_a_noop() {
        let node = Arc::new(FakeNode::default());
        let (processor, db) = processor(node.clone(), autopay()).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 9, dec!(10)).await.unwrap();

        processor.run_payment(&baker, &keys(), 9).await.unwrap();
        processor.run_payment(&baker, &keys(), 9).await.unwrap();

        assert_eq!(node.broadcasts().len(), 1);
        assert_eq!(db.payments_from(&baker).await.unwrap().len(), 1);
    }

    /// A broadcast that keeps failing past the retry budget aborts the run
    /// with every row still unpaid.
    #[tokio::test]
    async fn broadcast_exhaustion_leaves_rows_unpaid() {
        let node = Arc::new(FakeNode::default());
        node.fail_next_broadcasts(u32::MAX);
        let (processor, db) = processor(node.clone(), autopay()).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 9, dec!(10)).await.unwrap();

        let err = processor.run_payment(&baker, &keys(), 9).await.unwrap_err();
        assert!(err.to_string().contains("broadcast"));

        assert_eq!(db.unpaid_rewards_by_recipient(&baker, 9).await.unwrap().len(), 1);
        assert!(db.payments_from(&baker).await.unwrap().is_empty());
    }

    /// A transient broadcast failure recovers within the retry budget.
    #[tokio::test]
    async fn broadcast_retries_through_transient_failures() {
        let node = Arc::new(FakeNode::default());
        node.fail_next_broadcasts(2);
        let (processor, db) = processor(node.clone(), autopay()).await;
        let baker = addr("addr-baker");

        db.credit_reward(&baker, &addr("addr-d1"), 9, dec!(10)).await.unwrap();

        processor.run_payment(&baker, &keys(), 9).await.unwrap();
        assert_eq!(node.broadcasts().len(), 1);
        assert!(db.unpaid_rewards_by_recipient(&baker, 9).await.unwrap().is_empty());
    }
}

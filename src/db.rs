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

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    QueryBuilder, Row, Sqlite,
};
use thiserror::Error;

use crate::{
    chain::Address,
    snapshot::{CycleSnapshot, DelegatorStake},
};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQL error: {0}")]
    SqlErr(#[from] sqlx::Error),

    #[error("SQL migration error: {0}")]
    MigrateErr(#[from] sqlx::migrate::MigrateError),

    #[error("amount not representable: {0}")]
    BadAmount(String),

    #[error("malformed row: {0}")]
    BadRow(String),
}

/// One settled transfer, appended for audit when a chunk is marked paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub from: Address,
    pub to: Address,
    pub operation_hash: String,
    /// Net amount actually transferred, display units.
    pub amount: Decimal,
    /// Accrued amount before commission, display units.
    pub gross_amount: Decimal,
    pub fee: Decimal,
}

/// The durable store behind the payout engine: the index cursor singleton,
/// the immutable cycle-snapshot collection, the reward ledger and the
/// payment-history append log.
#[async_trait]
pub trait PayoutDb {
    async fn last_indexed_level(&self) -> Result<Option<u64>, DbError>;

    /// Advance the cursor. Only called after a level's reward deltas are
    /// durable; a crash before this re-processes the level.
    async fn set_last_indexed_level(&self, level: u64) -> Result<(), DbError>;

    async fn cycle_snapshot(
        &self,
        baker: &Address,
        cycle: u64,
    ) -> Result<Option<CycleSnapshot>, DbError>;

    /// Insert if absent, else return the existing row unchanged. Snapshots
    /// are computed exactly once and never mutated afterwards.
    async fn insert_cycle_snapshot(
        &self,
        snapshot: &CycleSnapshot,
    ) -> Result<CycleSnapshot, DbError>;

    /// Insert or increment the `(from, to, cycle)` ledger row. Rows that have
    /// already been settled are left untouched, so replaying a block's reward
    /// computation after settlement is a no-op.
    async fn credit_reward(
        &self,
        from: &Address,
        to: &Address,
        cycle: u64,
        amount: Decimal,
    ) -> Result<(), DbError>;

    /// Unsettled accruals owed by `from` up to and including `max_cycle`,
    /// summed per recipient.
    async fn unpaid_rewards_by_recipient(
        &self,
        from: &Address,
        max_cycle: u64,
    ) -> Result<Vec<(Address, Decimal)>, DbError>;

    /// Stamp the operation hash onto every unsettled row matching the payer,
    /// recipients and cycle window. This is the settlement commit and the
    /// sole guard against double payment. Returns the number of rows settled.
    async fn mark_rewards_paid(
        &self,
        from: &Address,
        recipients: &[Address],
        max_cycle: u64,
        operation_hash: &str,
    ) -> Result<u64, DbError>;

    async fn record_payments(&self, records: &[PaymentRecord]) -> Result<(), DbError>;

    async fn payments_from(&self, from: &Address) -> Result<Vec<PaymentRecord>, DbError>;
}

pub type DbObj = Arc<dyn PayoutDb + Send + Sync>;

/// Ledger amounts are stored as integers in 1e-7 display units so SQL
/// accumulation is exact. Reward deltas are truncated to 7 fractional digits
/// before they reach the store, so the encoding is lossless.
fn to_e7(amount: Decimal) -> Result<i64, DbError> {
    let scaled = amount * Decimal::from(10_000_000i64);
    if scaled != scaled.trunc() {
        return Err(DbError::BadAmount(format!("{amount} has more than 7 fractional digits")));
    }
    scaled.to_i64().ok_or_else(|| DbError::BadAmount(format!("{amount} out of range")))
}

fn from_e7(raw: i64) -> Decimal {
    Decimal::from_i128_with_scale(raw as i128, 7).normalize()
}

fn decimal_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Decimal, DbError> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).map_err(|_| DbError::BadRow(format!("invalid {column}: {raw}")))
}

pub struct SqliteDb {
    pool: SqlitePool,
}

impl SqliteDb {
    /// Open (creating if missing) and migrate the store. In-memory databases
    /// are pinned to a single connection so every query sees the same data.
    pub async fn new(conn_str: &str) -> Result<Self, DbError> {
        let opts = SqliteConnectOptions::from_str(conn_str)?.create_if_missing(true);
        let max_connections = if conn_str.contains(":memory:") { 1 } else { 5 };
        let pool =
            SqlitePoolOptions::new().max_connections(max_connections).connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PayoutDb for SqliteDb {
    async fn last_indexed_level(&self) -> Result<Option<u64>, DbError> {
        let row = sqlx::query("SELECT last_indexed_level FROM settings WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get::<i64, _>("last_indexed_level") as u64))
    }

    async fn set_last_indexed_level(&self, level: u64) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO settings (id, last_indexed_level) VALUES (0, $1)
             ON CONFLICT (id) DO UPDATE SET last_indexed_level = $1",
        )
        .bind(level as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cycle_snapshot(
        &self,
        baker: &Address,
        cycle: u64,
    ) -> Result<Option<CycleSnapshot>, DbError> {
        let row = sqlx::query(
            "SELECT min_full_staking_balance, min_own_balance, min_delegated_balance, delegators
             FROM cycle_snapshots WHERE baker = $1 AND cycle = $2",
        )
        .bind(baker.as_str())
        .bind(cycle as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let delegators_json: String = row.try_get("delegators")?;
        let delegators: Vec<DelegatorStake> = serde_json::from_str(&delegators_json)
            .map_err(|err| DbError::BadRow(format!("invalid delegators: {err}")))?;

        Ok(Some(CycleSnapshot {
            baker: baker.clone(),
            cycle,
            min_full_staking_balance: decimal_column(&row, "min_full_staking_balance")?,
            min_own_balance: decimal_column(&row, "min_own_balance")?,
            min_delegated_balance: decimal_column(&row, "min_delegated_balance")?,
            delegators,
        }))
    }

    async fn insert_cycle_snapshot(
        &self,
        snapshot: &CycleSnapshot,
    ) -> Result<CycleSnapshot, DbError> {
        let delegators = serde_json::to_string(&snapshot.delegators)
            .map_err(|err| DbError::BadRow(format!("unencodable delegators: {err}")))?;

        sqlx::query(
            "INSERT INTO cycle_snapshots
                 (baker, cycle, min_full_staking_balance, min_own_balance,
                  min_delegated_balance, delegators)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (baker, cycle) DO NOTHING",
        )
        .bind(snapshot.baker.as_str())
        .bind(snapshot.cycle as i64)
        .bind(snapshot.min_full_staking_balance.to_string())
        .bind(snapshot.min_own_balance.to_string())
        .bind(snapshot.min_delegated_balance.to_string())
        .bind(delegators)
        .execute(&self.pool)
        .await?;

        self.cycle_snapshot(&snapshot.baker, snapshot.cycle).await?.ok_or_else(|| {
            DbError::BadRow(format!(
                "snapshot for {} cycle {} missing after insert",
                snapshot.baker, snapshot.cycle
            ))
        })
    }

    async fn credit_reward(
        &self,
        from: &Address,
        to: &Address,
        cycle: u64,
        amount: Decimal,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO rewards (from_addr, to_addr, cycle, amount_e7) VALUES ($1, $2, $3, $4)
             ON CONFLICT (from_addr, to_addr, cycle) DO UPDATE
                 SET amount_e7 = amount_e7 + excluded.amount_e7,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE payment_operation_hash IS NULL",
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(cycle as i64)
        .bind(to_e7(amount)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn unpaid_rewards_by_recipient(
        &self,
        from: &Address,
        max_cycle: u64,
    ) -> Result<Vec<(Address, Decimal)>, DbError> {
        let rows = sqlx::query(
            "SELECT to_addr, SUM(amount_e7) AS gross_e7 FROM rewards
             WHERE from_addr = $1 AND cycle <= $2 AND payment_operation_hash IS NULL
             GROUP BY to_addr ORDER BY to_addr",
        )
        .bind(from.as_str())
        .bind(max_cycle as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let to: String = row.get("to_addr");
                (Address::new(to), from_e7(row.get::<i64, _>("gross_e7")))
            })
            .collect())
    }

    async fn mark_rewards_paid(
        &self,
        from: &Address,
        recipients: &[Address],
        max_cycle: u64,
        operation_hash: &str,
    ) -> Result<u64, DbError> {
        if recipients.is_empty() {
            return Ok(0);
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE rewards SET payment_operation_hash = ");
        query.push_bind(operation_hash);
        query.push(" WHERE from_addr = ");
        query.push_bind(from.as_str());
        query.push(" AND cycle <= ");
        query.push_bind(max_cycle as i64);
        query.push(" AND payment_operation_hash IS NULL AND to_addr IN (");
        let mut recipient_list = query.separated(", ");
        for recipient in recipients {
            recipient_list.push_bind(recipient.as_str());
        }
        query.push(")");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn record_payments(&self, records: &[PaymentRecord]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                "INSERT INTO payments
                     (from_addr, to_addr, operation_hash, amount, gross_amount, fee)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(record.from.as_str())
            .bind(record.to.as_str())
            .bind(&record.operation_hash)
            .bind(record.amount.to_string())
            .bind(record.gross_amount.to_string())
            .bind(record.fee.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn payments_from(&self, from: &Address) -> Result<Vec<PaymentRecord>, DbError> {
        let rows = sqlx::query(
            "SELECT to_addr, operation_hash, amount, gross_amount, fee FROM payments
             WHERE from_addr = $1 ORDER BY created_at, to_addr",
        )
        .bind(from.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PaymentRecord {
                    from: from.clone(),
                    to: Address::new(row.get::<String, _>("to_addr")),
                    operation_hash: row.get("operation_hash"),
                    amount: decimal_column(&row, "amount")?,
                    gross_amount: decimal_column(&row, "gross_amount")?,
                    fee: decimal_column(&row, "fee")?,
                })
            })
            .collect()
    }
}

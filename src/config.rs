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

use std::{collections::BTreeMap, path::Path};

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::chain::Address;

/// Daemon configuration, read once at startup and immutable afterwards.
/// Amounts and commissions are TOML strings (`"0.07"`), parsed exactly.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node REST endpoint.
    pub rpc_url: Url,
    /// Store connection string, e.g. `sqlite:paymaster.db`.
    pub db_url: String,
    /// Lowest level worth indexing (a baker's registration level).
    #[serde(default)]
    pub start_level: u64,
    /// Bakers whose blocks and endorsements accrue rewards.
    pub bakers: Vec<Address>,
    #[serde(default)]
    pub autopay: AutopayConfig,
    /// Baker address -> hex-encoded secret key, for payment signing.
    #[serde(default)]
    pub signers: BTreeMap<Address, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutopayConfig {
    /// Payments must be run manually when disabled.
    #[serde(default)]
    pub enabled: bool,
    /// Offset into each cycle at which payment runs trigger. A floor of 5 is
    /// applied so the previous cycle's last blocks are final.
    #[serde(default = "default_trigger_level")]
    pub trigger_level: u64,
    /// How many cycles behind the triggering cycle to settle.
    #[serde(default)]
    pub payment_cycle_lag: u64,
    /// Smallest net amount worth a transfer, display units.
    #[serde(default = "default_min_payment")]
    pub min_payment: Decimal,
    /// Flat fee per transfer operation, display units.
    #[serde(default = "default_fee")]
    pub fee: Decimal,
    /// Upper bound on transfers per settlement batch (clamped to the
    /// protocol's per-block cap).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Commission retained by bakers without an explicit override.
    #[serde(default)]
    pub default_commission: Decimal,
    #[serde(default)]
    pub baker_commissions: BTreeMap<Address, Decimal>,
    #[serde(default)]
    pub address_commissions: BTreeMap<Address, Decimal>,
}

fn default_trigger_level() -> u64 {
    5
}

fn default_min_payment() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_fee() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_max_batch_size() -> usize {
    199
}

impl Default for AutopayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_level: default_trigger_level(),
            payment_cycle_lag: 0,
            min_payment: default_min_payment(),
            fee: default_fee(),
            max_batch_size: default_max_batch_size(),
            default_commission: Decimal::ZERO,
            baker_commissions: BTreeMap::new(),
            address_commissions: BTreeMap::new(),
        }
    }
}

impl AutopayConfig {
    /// Commission for one payout: per-address override, else per-baker
    /// override, else the default.
    pub fn commission_for(&self, baker: &Address, address: &Address) -> Decimal {
        self.address_commissions
            .get(address)
            .or_else(|| self.baker_commissions.get(baker))
            .copied()
            .unwrap_or(self.default_commission)
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.bakers.is_empty(), "at least one baker must be tracked");
        ensure!(self.autopay.max_batch_size >= 1, "autopay.max_batch_size must be at least 1");
        ensure!(self.autopay.min_payment >= Decimal::ZERO, "autopay.min_payment must not be negative");
        ensure!(self.autopay.fee >= Decimal::ZERO, "autopay.fee must not be negative");

        let commissions = std::iter::once(&self.autopay.default_commission)
            .chain(self.autopay.baker_commissions.values())
            .chain(self.autopay.address_commissions.values());
        for commission in commissions {
            ensure!(
                (Decimal::ZERO..=Decimal::ONE).contains(commission),
                "commission {commission} outside [0, 1]"
            );
        }

        for baker in self.signers.keys() {
            if !self.bakers.contains(baker) {
                tracing::warn!(%baker, "signer configured for an untracked baker");
            }
        }

        Ok(())
    }
}

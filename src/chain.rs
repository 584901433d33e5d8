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

//! Chain data model: addresses, amounts, blocks and the operations they carry.

use std::fmt;

use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{Deserialize, Deserializer, Serialize};

/// Number of levels in one cycle.
pub const LEVELS_PER_CYCLE: u64 = 1440;

/// Target seconds between consecutive levels.
pub const SECONDS_PER_LEVEL: u64 = 60;

/// Number of cycles between a reward-bearing block and the cycle whose
/// delegation snapshot determines the split (5 preserved + 2 pending).
pub const SNAPSHOT_LAG_CYCLES: u64 = 5 + 2;

/// Stride, in levels, between sampled checkpoints when scanning a cycle.
pub const SAMPLE_STRIDE: u64 = 500;

/// How long finalized chain reads stay valid in the lookup caches. Finalized
/// history never changes; the TTL only bounds memory over the lag window.
pub const HISTORY_CACHE_TTL_SECS: u64 = LEVELS_PER_CYCLE * SNAPSHOT_LAG_CYCLES * SECONDS_PER_LEVEL;

/// The cycle a level belongs to.
pub fn cycle_of_level(level: u64) -> u64 {
    level / LEVELS_PER_CYCLE
}

/// Convert an amount in the chain's smallest unit (mutez) to display units.
pub fn to_coin(mutez: u64) -> Decimal {
    Decimal::from_i128_with_scale(mutez as i128, 6).normalize()
}

/// Convert a display-unit amount to mutez, truncating sub-mutez precision.
/// Returns `None` for negative amounts or amounts out of range.
pub fn to_mutez(amount: Decimal) -> Option<u64> {
    (amount * Decimal::from(1_000_000u32)).trunc().to_u64()
}

/// An account address, as reported by the node. Treated as opaque text.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// First and last level of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRange {
    pub first: u64,
    pub last: u64,
}

/// Per-level protocol reward constants. Both tables hold two entries: index 0
/// applies to blocks proposed at priority 0, index 1 to fallback priorities.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolConstants {
    #[serde(deserialize_with = "mutez_list")]
    pub baking_reward_per_endorsement: Vec<u64>,
    #[serde(deserialize_with = "mutez_list")]
    pub endorsement_reward: Vec<u64>,
}

impl ProtocolConstants {
    /// Baking reward per endorsement slot, in mutez, for a block priority.
    pub fn baking_reward(&self, priority: u32) -> u64 {
        Self::pick(&self.baking_reward_per_endorsement, priority)
    }

    /// Endorsement reward per slot, in mutez, for a block priority.
    pub fn endorsement_reward(&self, priority: u32) -> u64 {
        Self::pick(&self.endorsement_reward, priority)
    }

    fn pick(table: &[u64], priority: u32) -> u64 {
        let bucket = usize::from(priority != 0);
        table.get(bucket).or_else(|| table.first()).copied().unwrap_or(0)
    }
}

/// The node serializes mutez amounts as decimal strings; accept raw numbers
/// too so fixtures stay readable.
fn mutez_list<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    Vec::<Raw>::deserialize(deserializer)?
        .into_iter()
        .map(|raw| match raw {
            Raw::Num(n) => Ok(n),
            Raw::Text(s) => s
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid mutez amount: {s}"))),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub level: u64,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub cycle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub baker: Address,
    pub level: LevelInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementMetadata {
    pub delegate: Address,
    pub slots: Vec<u16>,
}

/// A single operation inside an operation group. Only endorsements matter to
/// the payout engine; everything else deserializes to `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationContent {
    Endorsement { level: u64, metadata: EndorsementMetadata },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationGroup {
    pub hash: String,
    pub contents: Vec<OperationContent>,
}

/// A finalized block, as returned by the node. Operations are grouped into
/// validation passes, mirroring the wire layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    pub header: BlockHeader,
    pub metadata: BlockMetadata,
    #[serde(default)]
    pub operations: Vec<Vec<OperationGroup>>,
}

/// An endorsement flattened out of a block's operation groups. Endorsements
/// of level N are committed in block N + 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endorsement {
    pub delegate: Address,
    pub slots: usize,
    pub level: u64,
}

impl Block {
    pub fn level(&self) -> u64 {
        self.header.level
    }

    pub fn cycle(&self) -> u64 {
        self.metadata.level.cycle
    }

    pub fn priority(&self) -> u32 {
        self.header.priority
    }

    pub fn baker(&self) -> &Address {
        &self.metadata.baker
    }

    /// All endorsements carried by this block, across every validation pass.
    ///
    /// TODO: also require `level` to equal the endorsed block's level; the
    /// node has not been observed mixing levels within one block, but nothing
    /// here rules it out.
    pub fn endorsements(&self) -> Vec<Endorsement> {
        let mut out = Vec::new();
        for pass in &self.operations {
            for group in pass {
                for content in &group.contents {
                    if let OperationContent::Endorsement { level, metadata } = content {
                        out.push(Endorsement {
                            delegate: metadata.delegate.clone(),
                            slots: metadata.slots.len(),
                            level: *level,
                        });
                    }
                }
            }
        }
        out
    }

    /// Whether any operation group in this block carries the given hash.
    pub fn contains_operation(&self, op_hash: &str) -> bool {
        self.operations.iter().flatten().any(|group| group.hash == op_hash)
    }
}

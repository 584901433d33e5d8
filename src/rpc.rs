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

//! Node access: the [`NodeClient`] trait, its HTTP implementation, signing
//! keys and the retry policy applied to node calls.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::{
    cache::TtlCache,
    chain::{Address, Block, CycleRange, ProtocolConstants, LEVELS_PER_CYCLE},
};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected response from node: {0}")]
    BadResponse(String),

    #[error("invalid key material: {0}")]
    BadKey(String),

    #[error("operation {0} not confirmed before timeout")]
    ConfirmationTimeout(String),
}

/// Block selector: a specific level, or the symbolic chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Head,
    Level(u64),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => f.write_str("head"),
            BlockId::Level(level) => write!(f, "{level}"),
        }
    }
}

/// One transfer inside a settlement batch. All amounts are mutez.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOp {
    pub destination: Address,
    pub amount: u64,
    pub fee: u64,
    pub gas_limit: u64,
    pub storage_limit: u64,
}

/// The node collaborator boundary. Everything the payout engine needs from
/// the chain goes through this trait, so tests can substitute a scripted
/// in-memory node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn block(&self, id: BlockId) -> Result<Block, RpcError>;

    async fn protocol_constants(&self, level: u64) -> Result<ProtocolConstants, RpcError>;

    async fn cycle_levels(&self, cycle: u64) -> Result<CycleRange, RpcError>;

    /// Addresses delegating to `baker` at `level`, the baker itself included
    /// if it self-delegates.
    async fn delegated_addresses(
        &self,
        baker: &Address,
        level: u64,
    ) -> Result<Vec<Address>, RpcError>;

    /// Spendable balance of `address` at `level`, in mutez.
    async fn balance(&self, address: &Address, level: u64) -> Result<u64, RpcError>;

    async fn full_staking_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError>;

    async fn own_staking_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError>;

    async fn delegated_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError>;

    /// Sign a batch of transfers from `source` and inject it, returning the
    /// operation-group hash.
    async fn sign_and_broadcast(
        &self,
        source: &Address,
        ops: &[TransferOp],
        keys: &BakerKeys,
    ) -> Result<String, RpcError>;

    /// Block until the operation appears in a head block, returning that
    /// block's hash, or time out.
    async fn await_confirmation(
        &self,
        op_hash: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<String, RpcError>;
}

/// Signing keys for a baker. The public key hash is the hex encoding of the
/// trailing 20 bytes of `sha256(public_key)`.
#[derive(Clone)]
pub struct BakerKeys {
    public_key_hash: Address,
    signing_key: SigningKey,
}

impl BakerKeys {
    pub fn derive(secret_key_hex: &str) -> Result<Self, RpcError> {
        let raw = hex::decode(secret_key_hex.trim())
            .map_err(|err| RpcError::BadKey(format!("secret key is not hex: {err}")))?;
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| RpcError::BadKey("secret key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&raw);

        let digest = Sha256::digest(signing_key.verifying_key().as_bytes());
        let public_key_hash = Address::new(hex::encode(&digest[12..]));

        Ok(Self { public_key_hash, signing_key })
    }

    pub fn public_key_hash(&self) -> &Address {
        &self.public_key_hash
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl fmt::Debug for BakerKeys {
    // Never print the secret key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BakerKeys({})", self.public_key_hash)
    }
}

/// Retry behavior for node calls: exponential backoff with an attempt cap.
/// After exhaustion the last error is returned to the caller instead of
/// retrying forever.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Reads of finalized history during cycle sampling. These eventually
    /// succeed, so the policy is generous; exhaustion fails the level and the
    /// indexer comes back to it.
    pub const fn sampling() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Broadcasting a settlement chunk. Exhaustion aborts the payment run;
    /// the unpaid rows are re-selected at the next trigger.
    pub const fn broadcast() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(20),
        }
    }

    fn delay_for(&self, completed_attempts: u32) -> Duration {
        let backoff = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(completed_attempts.saturating_sub(1) as i32);
        Duration::from_millis(backoff.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted, backing
/// off between attempts. Returns the last error on exhaustion.
pub async fn retry_with_policy<T, E, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!("{label} failed after {attempt} attempts: {err}");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{label} failed (attempt {attempt}/{}): {err}; retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Read-side access to the chain: a [`NodeClient`] plus TTL caches for
/// finalized lookups. Only numbered levels are cached; the head moves, so
/// [`ChainReader::head`] always queries the node.
pub struct ChainReader {
    node: Arc<dyn NodeClient>,
    ttl: Duration,
    blocks: TtlCache<u64, Block>,
    constants: TtlCache<u64, ProtocolConstants>,
    cycles: TtlCache<u64, CycleRange>,
}

impl ChainReader {
    pub fn new(node: Arc<dyn NodeClient>, ttl: Duration) -> Self {
        Self {
            node,
            ttl,
            blocks: TtlCache::new(),
            constants: TtlCache::new(),
            cycles: TtlCache::new(),
        }
    }

    pub fn node(&self) -> Arc<dyn NodeClient> {
        self.node.clone()
    }

    pub async fn head(&self) -> Result<Block, RpcError> {
        self.node.block(BlockId::Head).await
    }

    pub async fn block(&self, level: u64) -> Result<Block, RpcError> {
        if let Some(block) = self.blocks.get(&level) {
            return Ok(block);
        }
        let block = self.node.block(BlockId::Level(level)).await?;
        self.blocks.put(level, block.clone(), self.ttl);
        Ok(block)
    }

    pub async fn constants(&self, level: u64) -> Result<ProtocolConstants, RpcError> {
        if let Some(constants) = self.constants.get(&level) {
            return Ok(constants);
        }
        let constants = self.node.protocol_constants(level).await?;
        self.constants.put(level, constants.clone(), self.ttl);
        Ok(constants)
    }

    pub async fn cycle_range(&self, cycle: u64) -> Result<CycleRange, RpcError> {
        if let Some(range) = self.cycles.get(&cycle) {
            return Ok(range);
        }
        let range = self.node.cycle_levels(cycle).await?;
        self.cycles.put(cycle, range, self.ttl);
        Ok(range)
    }
}

/// HTTP implementation of [`NodeClient`] against a node's REST interface.
pub struct HttpNodeClient {
    http: reqwest::Client,
    base: String,
}

#[derive(Serialize)]
struct ForgeRequest<'a> {
    branch: &'a str,
    contents: Vec<ForgedTransaction<'a>>,
}

#[derive(Serialize)]
struct ForgedTransaction<'a> {
    kind: &'static str,
    source: &'a str,
    destination: &'a str,
    // Mutez amounts travel as decimal strings.
    amount: String,
    fee: String,
    gas_limit: String,
    storage_limit: String,
}

impl HttpNodeClient {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.as_str().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, RpcError> {
        Ok(Url::parse(&format!("{}/{path}", self.base))?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RpcError> {
        let response = self.http.get(self.url(path)?).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RpcError> {
        let response =
            self.http.post(self.url(path)?).json(body).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// Balance endpoints return a mutez amount as a JSON string.
    async fn get_mutez(&self, path: &str) -> Result<u64, RpcError> {
        let raw: String = self.get_json(path).await?;
        raw.parse()
            .map_err(|_| RpcError::BadResponse(format!("invalid mutez amount: {raw}")))
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn block(&self, id: BlockId) -> Result<Block, RpcError> {
        self.get_json(&format!("chains/main/blocks/{id}")).await
    }

    async fn protocol_constants(&self, level: u64) -> Result<ProtocolConstants, RpcError> {
        self.get_json(&format!("chains/main/blocks/{level}/context/constants")).await
    }

    async fn cycle_levels(&self, cycle: u64) -> Result<CycleRange, RpcError> {
        // Probed at the cycle's first level; the node answers with the level
        // range of the cycle that level falls in.
        let probe = cycle * LEVELS_PER_CYCLE + 1;
        self.get_json(&format!("chains/main/blocks/{probe}/helpers/levels_in_current_cycle"))
            .await
    }

    async fn delegated_addresses(
        &self,
        baker: &Address,
        level: u64,
    ) -> Result<Vec<Address>, RpcError> {
        self.get_json(&format!(
            "chains/main/blocks/{level}/context/delegates/{baker}/delegated_contracts"
        ))
        .await
    }

    async fn balance(&self, address: &Address, level: u64) -> Result<u64, RpcError> {
        self.get_mutez(&format!("chains/main/blocks/{level}/context/contracts/{address}/balance"))
            .await
    }

    async fn full_staking_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError> {
        self.get_mutez(&format!(
            "chains/main/blocks/{level}/context/delegates/{baker}/staking_balance"
        ))
        .await
    }

    async fn own_staking_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError> {
        self.get_mutez(&format!(
            "chains/main/blocks/{level}/context/delegates/{baker}/own_staking_balance"
        ))
        .await
    }

    async fn delegated_balance(&self, baker: &Address, level: u64) -> Result<u64, RpcError> {
        self.get_mutez(&format!(
            "chains/main/blocks/{level}/context/delegates/{baker}/delegated_balance"
        ))
        .await
    }

    async fn sign_and_broadcast(
        &self,
        source: &Address,
        ops: &[TransferOp],
        keys: &BakerKeys,
    ) -> Result<String, RpcError> {
        let head = self.block(BlockId::Head).await?;

        let contents = ops
            .iter()
            .map(|op| ForgedTransaction {
                kind: "transaction",
                source: source.as_str(),
                destination: op.destination.as_str(),
                amount: op.amount.to_string(),
                fee: op.fee.to_string(),
                gas_limit: op.gas_limit.to_string(),
                storage_limit: op.storage_limit.to_string(),
            })
            .collect();

        let forged: String = self
            .post_json(
                "chains/main/blocks/head/helpers/forge/operations",
                &ForgeRequest { branch: &head.hash, contents },
            )
            .await?;
        let forged_bytes = hex::decode(&forged)
            .map_err(|err| RpcError::BadResponse(format!("forge returned invalid hex: {err}")))?;

        let signature = keys.sign(&forged_bytes);
        let signed = format!("{forged}{}", hex::encode(signature));

        self.post_json("injection/operation", &signed).await
    }

    async fn await_confirmation(
        &self,
        op_hash: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<String, RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.block(BlockId::Head).await {
                Ok(head) if head.contains_operation(op_hash) => return Ok(head.hash),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("head fetch failed while awaiting {op_hash}: {err}");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RpcError::ConfirmationTimeout(op_hash.to_string()));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

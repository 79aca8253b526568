//! Block replay on top of the `parallel-exec` speculative scheduler.
//!
//! This crate generates reproducible workloads of signed ETH transfers,
//! grouped into blocks, and replays them either sequentially through revm or
//! in parallel through [`parallel_exec::ParallelExecutor`].
//!
//! # Architecture
//!
//! The framework is organized around three main concepts:
//!
//! - **Workload**: Pre-generated accounts and blocks of signed transactions
//! - **Interpreter**: Executes one transfer against a versioned state view
//! - **Executor**: A replay strategy (sequential revm baseline, parallel)
//!
//! # Quick Start
//!
//! ```
//! use replay_node::{Executor, ParallelReplayExecutor, Workload, WorkloadConfig};
//!
//! let config = WorkloadConfig {
//!     num_accounts: 100,
//!     num_transactions: 50,
//!     transactions_per_block: 10,
//!     ..Default::default()
//! };
//!
//! let workload = Workload::generate(config);
//! let executor = ParallelReplayExecutor::new(4, true);
//! let (_db, result) = executor.execute(workload.create_db(), &workload).unwrap();
//!
//! println!("Successful: {}", result.successful);
//! ```

pub mod executor;
pub mod interpreter;

pub use executor::{ExecutionResult, Executor, ParallelReplayExecutor, SequentialExecutor};
pub use interpreter::TransferInterpreter;

use alloy_primitives::{address, keccak256, Address, Signature, B256, U256};
use k256::ecdsa::SigningKey;
use parallel_exec::{BlockContext, StateKey, Transaction};
use rand::{rngs::StdRng, Rng, SeedableRng};
use revm::{
    database::{CacheDB, EmptyDB},
    primitives::KECCAK_EMPTY,
    state::AccountInfo,
};
use std::sync::Arc;

/// Balance every workload account starts with (1000 ETH).
pub const INITIAL_BALANCE: u128 = 1_000_000_000_000_000_000_000;

/// Value moved by each generated transfer (0.001 ETH).
pub const TRANSFER_VALUE: u64 = 1_000_000_000_000_000;

/// Beneficiary of every generated block.
pub const COINBASE: Address = address!("c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0");

/// A funded externally owned account that can sign transfers.
#[derive(Clone)]
pub struct Account {
    pub signing_key: SigningKey,
    pub address: Address,
}

impl Account {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address::from_private_key(&signing_key);
        Self {
            signing_key,
            address,
        }
    }

    /// Derives a key deterministically from `seed`.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        loop {
            let scalar: [u8; 32] = rng.gen();
            // Zero or out-of-range scalars are rejected; draw again.
            if let Ok(signing_key) = SigningKey::from_bytes(&scalar.into()) {
                return Self::from_signing_key(signing_key);
            }
        }
    }

    /// Builds and signs a transfer of `value` wei to `to`.
    pub fn sign_transfer(
        &self,
        to: Address,
        value: U256,
        nonce: u64,
        chain_id: u64,
    ) -> Transaction {
        let tx_hash = transfer_hash(self.address, to, value, nonce, chain_id);
        let signature = self.sign_hash(tx_hash);
        Transaction {
            from: self.address,
            to,
            value,
            nonce,
            signature,
            tx_hash,
        }
    }

    fn sign_hash(&self, hash: B256) -> Signature {
        let (signature, parity) = self
            .signing_key
            .sign_prehash_recoverable(hash.as_slice())
            .expect("32-byte prehash with a valid key");
        Signature::from_signature_and_parity(signature, parity.is_y_odd())
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the key.
        write!(f, "Account({})", self.address)
    }
}

/// keccak256 over `from || to || value || nonce || chain_id`, big-endian.
///
/// A compact stand-in for an RLP transaction hash; it is what transfers
/// are signed over and what [`Transaction::recover_signer`] recovers from.
pub fn transfer_hash(from: Address, to: Address, value: U256, nonce: u64, chain_id: u64) -> B256 {
    let mut preimage = [0u8; 88];
    preimage[..20].copy_from_slice(from.as_slice());
    preimage[20..40].copy_from_slice(to.as_slice());
    preimage[40..72].copy_from_slice(&value.to_be_bytes::<32>());
    preimage[72..80].copy_from_slice(&nonce.to_be_bytes());
    preimage[80..].copy_from_slice(&chain_id.to_be_bytes());
    keccak256(preimage)
}

/// Parameters of a generated replay.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_accounts: usize,
    pub num_transactions: usize,
    /// The last block may be shorter.
    pub transactions_per_block: usize,
    /// Share of transfers drawn from the hot set. At 0.0 every transfer picks
    /// from all accounts; at 1.0 all of them pick from two accounts.
    pub conflict_factor: f64,
    pub seed: u64,
    pub chain_id: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            transactions_per_block: 100,
            conflict_factor: 0.0,
            seed: 42,
            chain_id: 1,
        }
    }
}

impl WorkloadConfig {
    /// Number of low-indexed accounts hot transfers are drawn from.
    ///
    /// Shrinks linearly from all accounts down to two as the conflict factor
    /// approaches 1.0.
    fn hot_set_size(&self) -> usize {
        if self.conflict_factor <= 0.0 || self.num_accounts <= 2 {
            return self.num_accounts;
        }
        let cold = 1.0 - self.conflict_factor.min(1.0);
        2 + (cold * (self.num_accounts - 2) as f64) as usize
    }
}

/// Two distinct account indices below `range`.
fn pick_pair(rng: &mut StdRng, range: usize) -> (usize, usize) {
    let from = rng.gen_range(0..range);
    // Shift past `from` so the pair is never a self-transfer.
    let to = (from + rng.gen_range(1..range)) % range;
    (from, to)
}

/// Pre-signed blocks of transfers plus the accounts that sent them.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    /// Numbered from 1.
    pub blocks: Vec<Arc<BlockContext>>,
    pub coinbase: Address,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates and signs every transfer up front, so replays measure
    /// execution only.
    ///
    /// # Panics
    /// If `num_accounts < 2` while transactions are requested.
    pub fn generate(config: WorkloadConfig) -> Self {
        let accounts: Vec<Account> = (0..config.num_accounts as u64)
            .map(|i| Account::from_seed(config.seed.wrapping_add(i)))
            .collect();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let hot = config.hot_set_size();
        let mut nonces = vec![0u64; accounts.len()];

        let mut transactions = Vec::with_capacity(config.num_transactions);
        for _ in 0..config.num_transactions {
            let range = if rng.gen::<f64>() < config.conflict_factor {
                hot
            } else {
                config.num_accounts
            };
            let (from, to) = pick_pair(&mut rng, range);
            let value = U256::from(TRANSFER_VALUE);
            transactions.push(accounts[from].sign_transfer(
                accounts[to].address,
                value,
                nonces[from],
                config.chain_id,
            ));
            nonces[from] += 1;
        }

        let blocks = transactions
            .chunks(config.transactions_per_block.max(1))
            .zip(1u64..)
            .map(|(txs, number)| {
                Arc::new(BlockContext {
                    number,
                    hash: keccak256(number.to_be_bytes()),
                    coinbase: COINBASE,
                    transactions: txs.to_vec(),
                })
            })
            .collect();

        Self {
            accounts,
            blocks,
            coinbase: COINBASE,
            config,
        }
    }

    pub fn num_transactions(&self) -> usize {
        self.blocks.iter().map(|b| b.transactions.len()).sum()
    }

    /// Every transaction in replay order.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.blocks.iter().flat_map(|b| b.transactions.iter())
    }

    /// Versioned pre-state: each account's balance. Nonces start at zero,
    /// which is what a missing key reads as.
    pub fn genesis(&self) -> Vec<(StateKey, U256)> {
        self.accounts
            .iter()
            .map(|account| (StateKey::balance(account.address), U256::from(INITIAL_BALANCE)))
            .collect()
    }

    /// The same pre-state as a revm database, for the sequential replay.
    pub fn create_db(&self) -> CacheDB<EmptyDB> {
        let mut db = CacheDB::new(EmptyDB::default());
        for account in &self.accounts {
            db.insert_account_info(
                account.address,
                AccountInfo {
                    balance: U256::from(INITIAL_BALANCE),
                    nonce: 0,
                    code_hash: KECCAK_EMPTY,
                    code: None,
                },
            );
        }
        db
    }
}

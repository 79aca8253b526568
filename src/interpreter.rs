//! ETH transfer interpreter for the parallel replay.

use alloy_primitives::{b256, Address, Bytes, B256, U256};
use parallel_exec::{
    BlockContext, ExecError, ExecOutput, Interpreter, Log, StateKey, Transaction, Version,
    VersionedView,
};

/// Gas charged for a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Fixed gas price of the replay.
pub const GAS_PRICE: u64 = 1;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

/// Executes value transfers against a versioned state view.
///
/// Invalid signatures are fatal: a replayed block containing one cannot be
/// valid. A nonce mismatch or an unaffordable transfer leaves the state
/// untouched and is reported as a failed transaction. Fees are burned.
#[derive(Debug, Clone, Default)]
pub struct TransferInterpreter {
    pub verify_signatures: bool,
    /// Credited to the coinbase at the end of every block.
    pub block_reward: U256,
}

impl TransferInterpreter {
    pub fn new(verify_signatures: bool) -> Self {
        Self {
            verify_signatures,
            block_reward: U256::ZERO,
        }
    }

    pub fn with_block_reward(mut self, block_reward: U256) -> Self {
        self.block_reward = block_reward;
        self
    }
}

fn address_topic(address: Address) -> B256 {
    address.into_word()
}

impl Interpreter for TransferInterpreter {
    fn execute_tx(
        &mut self,
        _block: &BlockContext,
        tx: &Transaction,
        version: Version,
        view: &mut VersionedView<'_>,
    ) -> Result<ExecOutput, ExecError> {
        // Signature recovery is the expensive part and needs no state, so it
        // runs before any read.
        if self.verify_signatures && !tx.verify_signature() {
            return Err(ExecError::Fatal(format!(
                "invalid signature for transaction from {} at {version}",
                tx.from
            )));
        }

        let failed = ExecOutput {
            failed: true,
            ..Default::default()
        };

        let nonce = view.read(StateKey::nonce(tx.from))?;
        if nonce != U256::from(tx.nonce) {
            return Ok(failed);
        }

        let fee = U256::from(TRANSFER_GAS * GAS_PRICE);
        let cost = tx.value + fee;
        let balance = view.read(StateKey::balance(tx.from))?;
        if balance < cost {
            return Ok(failed);
        }

        view.write(StateKey::nonce(tx.from), nonce + U256::from(1));
        view.write(StateKey::balance(tx.from), balance - cost);
        // Read after the debit so a self-transfer sees it.
        let recipient = view.read(StateKey::balance(tx.to))?;
        view.write(StateKey::balance(tx.to), recipient + tx.value);

        Ok(ExecOutput {
            gas_used: TRANSFER_GAS,
            failed: false,
            logs: vec![Log {
                address: tx.to,
                topics: vec![TRANSFER_TOPIC, address_topic(tx.from), address_topic(tx.to)],
                data: Bytes::from(tx.value.to_be_bytes::<32>().to_vec()),
            }],
            trace_froms: [tx.from].into(),
            trace_tos: [tx.to].into(),
        })
    }

    fn end_block(
        &mut self,
        block: &BlockContext,
        view: &mut VersionedView<'_>,
    ) -> Result<ExecOutput, ExecError> {
        if self.block_reward.is_zero() {
            return Ok(ExecOutput::default());
        }

        let key = StateKey::balance(block.coinbase);
        let balance = view.read(key)?;
        view.write(key, balance + self.block_reward);

        Ok(ExecOutput {
            trace_tos: [block.coinbase].into(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Account, INITIAL_BALANCE};
    use alloy_primitives::keccak256;
    use parallel_exec::{InMemoryStore, MVHashMap};

    fn block(coinbase: Address) -> BlockContext {
        BlockContext {
            number: 1,
            hash: B256::ZERO,
            coinbase,
            transactions: Vec::new(),
        }
    }

    fn funded(account: &Account) -> InMemoryStore {
        InMemoryStore::with_genesis([(
            StateKey::balance(account.address),
            U256::from(INITIAL_BALANCE),
        )])
    }

    #[test]
    fn test_transfer_topic() {
        assert_eq!(TRANSFER_TOPIC, keccak256("Transfer(address,address,uint256)"));
    }

    #[test]
    fn test_transfer_updates_state() {
        let sender = Account::from_seed(1);
        let to = Address::repeat_byte(9);
        let store = funded(&sender);
        let mv = MVHashMap::new();
        let tx = sender.sign_transfer(to, U256::from(500), 0, 1);

        let mut view = VersionedView::new(&store, &mv, Version::new(1, 1, 0));
        let output = TransferInterpreter::new(true)
            .execute_tx(&block(Address::ZERO), &tx, Version::new(1, 1, 0), &mut view)
            .unwrap();

        assert!(!output.failed);
        assert_eq!(output.gas_used, TRANSFER_GAS);
        assert_eq!(output.logs.len(), 1);
        assert!(output.trace_froms.contains(&sender.address));

        let (reads, writes) = view.into_sets();
        assert_eq!(reads.len(), 3);
        let value_of = |key: StateKey| writes.iter().find(|w| w.key == key).map(|w| w.value);
        assert_eq!(value_of(StateKey::nonce(sender.address)), Some(U256::from(1)));
        assert_eq!(value_of(StateKey::balance(to)), Some(U256::from(500)));
        assert_eq!(
            value_of(StateKey::balance(sender.address)),
            Some(U256::from(INITIAL_BALANCE) - U256::from(500 + TRANSFER_GAS))
        );
    }

    #[test]
    fn test_nonce_mismatch_fails_without_writes() {
        let sender = Account::from_seed(2);
        let store = funded(&sender);
        let mv = MVHashMap::new();
        let tx = sender.sign_transfer(Address::repeat_byte(1), U256::from(1), 3, 1);

        let mut view = VersionedView::new(&store, &mv, Version::new(1, 1, 0));
        let output = TransferInterpreter::new(false)
            .execute_tx(&block(Address::ZERO), &tx, Version::new(1, 1, 0), &mut view)
            .unwrap();

        assert!(output.failed);
        assert!(view.into_sets().1.is_empty());
    }

    #[test]
    fn test_insufficient_balance_fails() {
        let sender = Account::from_seed(3);
        let store = InMemoryStore::new();
        let mv = MVHashMap::new();
        let tx = sender.sign_transfer(Address::repeat_byte(1), U256::from(1), 0, 1);

        let mut view = VersionedView::new(&store, &mv, Version::new(1, 1, 0));
        let output = TransferInterpreter::new(false)
            .execute_tx(&block(Address::ZERO), &tx, Version::new(1, 1, 0), &mut view)
            .unwrap();
        assert!(output.failed);
    }

    #[test]
    fn test_invalid_signature_is_fatal() {
        let sender = Account::from_seed(4);
        let store = funded(&sender);
        let mv = MVHashMap::new();
        let mut tx = sender.sign_transfer(Address::repeat_byte(1), U256::from(1), 0, 1);
        tx.from = Address::repeat_byte(2);

        let mut view = VersionedView::new(&store, &mv, Version::new(1, 1, 0));
        let err = TransferInterpreter::new(true)
            .execute_tx(&block(Address::ZERO), &tx, Version::new(1, 1, 0), &mut view)
            .unwrap_err();
        assert!(matches!(err, ExecError::Fatal(_)));
    }

    #[test]
    fn test_block_reward_credits_coinbase() {
        let coinbase = Address::repeat_byte(0xc0);
        let store = InMemoryStore::new();
        let mv = MVHashMap::new();

        let mut interpreter = TransferInterpreter::new(false).with_block_reward(U256::from(2));
        let mut view = VersionedView::new(&store, &mv, Version::new(1, 2, 0));
        interpreter.end_block(&block(coinbase), &mut view).unwrap();

        let (_, writes) = view.into_sets();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, U256::from(2));

        let mut view = VersionedView::new(&store, &mv, Version::new(1, 2, 0));
        TransferInterpreter::new(false)
            .end_block(&block(coinbase), &mut view)
            .unwrap();
        assert!(view.into_sets().1.is_empty());
    }
}

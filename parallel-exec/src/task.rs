//! Tasks, their results and the interpreter seam.

use crate::error::ExecError;
use crate::types::{Incarnation, Log, TxIndex, TxNum, Version, VersionedRead, VersionedWrite};
use crate::view::VersionedView;
use alloy_primitives::{Address, Signature, B256, U256};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// A signed ETH transfer.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    /// The ECDSA signature for verification (done in parallel).
    pub signature: Signature,
    /// The hash that was signed.
    pub tx_hash: B256,
}

impl Transaction {
    /// Recovers the signer address from the signature.
    /// This is the expensive cryptographic operation that should be parallelized.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature
            .recover_address_from_prehash(&self.tx_hash)
            .ok()
    }

    /// Verifies the signature matches the claimed sender.
    pub fn verify_signature(&self) -> bool {
        self.recover_signer()
            .map(|addr| addr == self.from)
            .unwrap_or(false)
    }
}

/// Immutable block data shared by every task of the block.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub number: u64,
    pub hash: B256,
    pub coinbase: Address,
    pub transactions: Vec<Transaction>,
}

impl BlockContext {
    /// Number of TxNums the block occupies: its transactions plus the
    /// block-start and block-end pseudo-tasks.
    pub fn task_count(&self) -> u64 {
        self.transactions.len() as u64 + 2
    }
}

/// Which part of a block a task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    BlockStart,
    Tx,
    BlockEnd,
}

/// Unit of speculative work.
#[derive(Debug, Clone)]
pub struct Task {
    version: Version,
    kind: TaskKind,
    block: Arc<BlockContext>,
    /// Indices this task is believed to depend on; best effort.
    dependencies: Vec<TxIndex>,
}

impl Task {
    pub fn new(version: Version, kind: TaskKind, block: Arc<BlockContext>) -> Self {
        Self {
            version,
            kind,
            block,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TxIndex>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn tx_num(&self) -> TxNum {
        self.version.tx_num
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn block(&self) -> &Arc<BlockContext> {
        &self.block
    }

    pub fn dependencies(&self) -> &[TxIndex] {
        &self.dependencies
    }

    pub fn is_block_end(&self) -> bool {
        self.kind == TaskKind::BlockEnd
    }

    /// The transaction of a `Tx` task.
    pub fn transaction(&self) -> Option<&Transaction> {
        match self.kind {
            TaskKind::Tx => usize::try_from(self.version.tx_index)
                .ok()
                .and_then(|idx| self.block.transactions.get(idx)),
            TaskKind::BlockStart | TaskKind::BlockEnd => None,
        }
    }

    /// Runs one attempt of this task against `view`.
    pub fn execute<I: Interpreter>(
        self,
        interpreter: &mut I,
        mut view: VersionedView<'_>,
        incarnation: Incarnation,
    ) -> TaskResult {
        let outcome = match self.kind {
            TaskKind::BlockStart => interpreter.begin_block(&self.block, &mut view),
            TaskKind::BlockEnd => interpreter.end_block(&self.block, &mut view),
            TaskKind::Tx => match self.transaction() {
                Some(tx) => interpreter.execute_tx(&self.block, tx, self.version, &mut view),
                None => Err(ExecError::Fatal(format!(
                    "block {} has no transaction at index {}",
                    self.block.number, self.version.tx_index
                ))),
            },
        };

        let (reads, writes) = match outcome {
            Ok(_) => view.into_sets(),
            Err(_) => (Vec::new(), Vec::new()),
        };

        TaskResult {
            task: self,
            incarnation,
            outcome,
            reads,
            writes,
            worker: 0,
            started: Duration::ZERO,
            finished: Duration::ZERO,
        }
    }
}

/// Builds the tasks of one block, starting at `first_tx_num`.
pub fn block_tasks(block: Arc<BlockContext>, first_tx_num: TxNum) -> Vec<Task> {
    let len = block.transactions.len() as TxIndex;
    let number = block.number;

    (-1..=len)
        .map(|tx_index| {
            let version = Version::new(number, first_tx_num + (tx_index + 1) as TxNum, tx_index);
            let kind = match tx_index {
                -1 => TaskKind::BlockStart,
                i if i == len => TaskKind::BlockEnd,
                _ => TaskKind::Tx,
            };
            Task::new(version, kind, block.clone())
        })
        .collect()
}

/// Successful outcome of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub gas_used: u64,
    /// The transaction was included but had no effect (e.g. bad nonce).
    pub failed: bool,
    pub logs: Vec<Log>,
    pub trace_froms: BTreeSet<Address>,
    pub trace_tos: BTreeSet<Address>,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub incarnation: Incarnation,
    pub outcome: Result<ExecOutput, ExecError>,
    pub reads: Vec<VersionedRead>,
    pub writes: Vec<VersionedWrite>,
    /// Worker that ran the attempt.
    pub worker: usize,
    /// Offsets from the start of the batch.
    pub started: Duration,
    pub finished: Duration,
}

impl TaskResult {
    pub fn version(&self) -> Version {
        self.task.version()
    }

    pub fn tx_num(&self) -> TxNum {
        self.task.tx_num()
    }

    pub fn is_abort(&self) -> bool {
        matches!(&self.outcome, Err(e) if e.is_abort())
    }
}

/// Executes the three kinds of task against a state view.
///
/// Each worker owns its own clone; implementations must not share mutable
/// per-attempt state between clones.
pub trait Interpreter: Clone + Send {
    fn begin_block(
        &mut self,
        _block: &BlockContext,
        _view: &mut VersionedView<'_>,
    ) -> Result<ExecOutput, ExecError> {
        Ok(ExecOutput::default())
    }

    fn execute_tx(
        &mut self,
        block: &BlockContext,
        tx: &Transaction,
        version: Version,
        view: &mut VersionedView<'_>,
    ) -> Result<ExecOutput, ExecError>;

    fn end_block(
        &mut self,
        _block: &BlockContext,
        _view: &mut VersionedView<'_>,
    ) -> Result<ExecOutput, ExecError> {
        Ok(ExecOutput::default())
    }
}

/// Anything ordered by TxNum in the queues' heaps.
pub(crate) trait Sequenced {
    fn sequence(&self) -> TxNum;
}

impl Sequenced for Task {
    fn sequence(&self) -> TxNum {
        self.tx_num()
    }
}

impl Sequenced for TaskResult {
    fn sequence(&self) -> TxNum {
        self.tx_num()
    }
}

/// Min-heap adapter: `BinaryHeap<MinByTxNum<T>>` pops the lowest TxNum first.
pub(crate) struct MinByTxNum<T>(pub(crate) T);

impl<T: Sequenced> PartialEq for MinByTxNum<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence() == other.0.sequence()
    }
}

impl<T: Sequenced> Eq for MinByTxNum<T> {}

impl<T: Sequenced> PartialOrd for MinByTxNum<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Sequenced> Ord for MinByTxNum<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.sequence().cmp(&self.0.sequence())
    }
}

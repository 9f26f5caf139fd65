#![allow(clippy::arc_with_non_send_sync)]

pub mod codec;
pub mod collate;
mod error;
pub mod function;
pub mod numeric;
pub mod storage;
pub mod types;
pub mod vdbe;

#[cfg(not(target_family = "wasm"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub use codec::{KeyInfo, KeyPart, NullOrder};
pub use collate::{Collation, CollationDef, CollationRegistry};
pub use error::BasaltError;
pub use function::{AggKind, FuncDef, FuncKind, FunctionRegistry};
pub use numeric::Num;
use parking_lot::RwLock;
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    num::NonZero,
    rc::Rc,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};
pub use storage::{KvCursor, KvStore, MemStore, NamespaceId, SeekOp, SeekResult};
use tracing::{instrument, Level};
pub use types::{Affinity, Value};
pub use vdbe::builder::{Label, ProgramBuilder};
pub use vdbe::insn::{CmpFlags, Insn, Opcode, P4};
pub use vdbe::{FromValueRow, Program, ProgramState, Row, StepResult};

pub type Result<T, E = BasaltError> = std::result::Result<T, E>;

/// Tunables applied when a store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Maximum depth of nested sub-program frames within one statement.
    pub max_frame_depth: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_frame_depth: 1000,
        }
    }
}

/// Name to namespace mapping, plus a generation counter bumped by every
/// catalog change. Programs record the generation they were built against
/// and their `Transaction` instruction rejects a stale one.
struct Catalog {
    namespaces: HashMap<String, NamespaceId>,
    generation: u32,
}

/// A database: an ordered KV backend plus the catalog and the function and
/// collation registries shared by every session connected to it.
pub struct Store {
    backend: Arc<dyn KvStore>,
    functions: FunctionRegistry,
    collations: CollationRegistry,
    catalog: RwLock<Catalog>,
    options: StoreOptions,
}

impl Store {
    /// Open a store backed by the in-memory reference backend.
    pub fn open_memory() -> Arc<Store> {
        Self::open_memory_with(StoreOptions::default())
    }

    pub fn open_memory_with(options: StoreOptions) -> Arc<Store> {
        Self::with_backend(Arc::new(MemStore::new()), options)
    }

    /// Open a store over any ordered KV backend.
    pub fn with_backend(backend: Arc<dyn KvStore>, options: StoreOptions) -> Arc<Store> {
        Arc::new(Store {
            backend,
            functions: FunctionRegistry::with_builtins(),
            collations: CollationRegistry::new(),
            catalog: RwLock::new(Catalog {
                namespaces: HashMap::new(),
                generation: 1,
            }),
            options,
        })
    }

    /// Open a session. Sessions share the store's transaction level stack,
    /// so run one writing session at a time.
    pub fn connect(self: &Arc<Store>) -> Arc<Session> {
        Arc::new(Session {
            store: Arc::clone(self),
            auto_commit: Cell::new(true),
            savepoints: RefCell::new(Vec::new()),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn backend(&self) -> &Arc<dyn KvStore> {
        &self.backend
    }

    /// Register a scalar or aggregate function. Re-registering a name and
    /// arity replaces the previous definition.
    pub fn register_function(&self, def: FuncDef) {
        self.functions.register(def);
    }

    pub fn unregister_function(&self, name: &str, n_args: i32) -> bool {
        self.functions.unregister(name, n_args)
    }

    pub fn lookup_function(&self, name: &str, argc: i32) -> Option<Arc<FuncDef>> {
        self.functions.lookup(name, argc)
    }

    pub fn register_collation(&self, def: CollationDef) {
        self.collations.register(def);
    }

    pub fn lookup_collation(&self, name: &str) -> Option<Arc<CollationDef>> {
        self.collations.lookup(name)
    }

    /// Create a named namespace. Bumps the schema generation.
    pub fn create_namespace(&self, name: &str) -> Result<NamespaceId> {
        let mut catalog = self.catalog.write();
        if catalog.namespaces.contains_key(name) {
            return Err(BasaltError::Constraint(format!(
                "namespace {name} already exists"
            )));
        }
        let ns = self.backend.create_namespace()?;
        catalog.namespaces.insert(name.to_string(), ns);
        catalog.generation += 1;
        Ok(ns)
    }

    /// Drop a named namespace and everything in it. Bumps the schema
    /// generation.
    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write();
        let ns = match catalog.namespaces.get(name) {
            Some(ns) => *ns,
            None => {
                return Err(BasaltError::NotFound(format!("no such namespace: {name}")));
            }
        };
        self.backend.drop_namespace(ns)?;
        catalog.namespaces.remove(name);
        catalog.generation += 1;
        Ok(())
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceId> {
        self.catalog.read().namespaces.get(name).copied()
    }

    /// Current catalog generation. Starts at 1 so that 0 can mean
    /// "unchecked" in a `Transaction` instruction.
    pub fn schema_generation(&self) -> u32 {
        self.catalog.read().generation
    }
}

/// A named savepoint and the backend level it opened.
struct SavepointEntry {
    name: String,
    level: u32,
}

/// One connection to a store: transaction state, the savepoint stack and
/// the interrupt flag. Statements are prepared through a session and run
/// against it.
pub struct Session {
    store: Arc<Store>,
    /// False only inside an explicit `begin`..`commit`/`rollback` span.
    auto_commit: Cell<bool>,
    savepoints: RefCell<Vec<SavepointEntry>>,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    /// Turn a built program into a runnable statement.
    #[instrument(skip_all, level = Level::INFO)]
    pub fn prepare(self: &Arc<Session>, program: impl Into<Rc<Program>>) -> Statement {
        let program = program.into();
        let state = ProgramState::new(program.max_registers, program.max_cursors);
        Statement {
            program,
            state,
            session: Arc::clone(self),
            finished: false,
        }
    }

    /// True when no explicit transaction and no savepoint is open.
    /// Statements run in this state commit on completion.
    pub fn is_autocommit(&self) -> bool {
        self.auto_commit.get() && self.savepoints.borrow().is_empty()
    }

    pub fn begin(&self) -> Result<()> {
        if !self.is_autocommit() {
            return Err(BasaltError::TxError(
                "cannot start a transaction within a transaction".to_string(),
            ));
        }
        self.backend().begin(1)?;
        self.auto_commit.set(false);
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        if self.is_autocommit() {
            return Err(BasaltError::TxError(
                "cannot commit - no transaction is active".to_string(),
            ));
        }
        self.backend().commit(0)?;
        self.auto_commit.set(true);
        self.savepoints.borrow_mut().clear();
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        if self.is_autocommit() {
            return Err(BasaltError::TxError(
                "cannot rollback - no transaction is active".to_string(),
            ));
        }
        let backend = self.backend();
        backend.rollback(1)?;
        backend.commit(0)?;
        self.auto_commit.set(true);
        self.savepoints.borrow_mut().clear();
        Ok(())
    }

    /// Open a named savepoint. Outside a transaction this also starts one;
    /// releasing the last savepoint then commits it.
    pub fn savepoint(&self, name: impl Into<String>) -> Result<()> {
        let backend = self.backend();
        let level = backend.current_level() + 1;
        backend.begin(level)?;
        self.savepoints.borrow_mut().push(SavepointEntry {
            name: name.into(),
            level,
        });
        Ok(())
    }

    /// Commit the innermost savepoint into its parent and pop it. A
    /// savepoint with others still nested inside it cannot be released;
    /// the attempt fails and leaves the stack and the backend untouched.
    /// Matching is case-insensitive.
    pub fn release(&self, name: &str) -> Result<()> {
        let mut savepoints = self.savepoints.borrow_mut();
        let idx = Self::find_savepoint(&savepoints, name)
            .ok_or_else(|| BasaltError::NotFound(format!("no such savepoint: {name}")))?;
        if idx + 1 != savepoints.len() {
            return Err(BasaltError::TxError(format!(
                "cannot release savepoint {name} below an open savepoint"
            )));
        }
        let level = savepoints[idx].level;
        self.backend().commit(level - 1)?;
        savepoints.truncate(idx);
        Ok(())
    }

    /// Undo everything written since the named savepoint was opened. The
    /// savepoint itself stays open; savepoints nested inside it pop.
    pub fn rollback_to(&self, name: &str) -> Result<()> {
        let mut savepoints = self.savepoints.borrow_mut();
        let idx = Self::find_savepoint(&savepoints, name)
            .ok_or_else(|| BasaltError::NotFound(format!("no such savepoint: {name}")))?;
        self.backend().rollback(savepoints[idx].level)?;
        savepoints.truncate(idx + 1);
        Ok(())
    }

    fn find_savepoint(savepoints: &[SavepointEntry], name: &str) -> Option<usize> {
        let name = uncased::UncasedStr::new(name);
        savepoints
            .iter()
            .rposition(|entry| uncased::UncasedStr::new(&entry.name) == name)
    }

    /// Handle for cancelling work on this session from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.interrupt),
        }
    }

    pub(crate) fn backend(&self) -> &Arc<dyn KvStore> {
        &self.store.backend
    }

    pub(crate) fn schema_generation(&self) -> u32 {
        self.store.schema_generation()
    }

    pub(crate) fn max_frame_depth(&self) -> usize {
        self.store.options.max_frame_depth
    }

    pub(crate) fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
    }

    /// Make sure a write transaction is open. In autocommit mode this is
    /// the implicit transaction that the end of the statement closes.
    pub(crate) fn ensure_write_txn(&self) -> Result<()> {
        if self.backend().current_level() == 0 {
            self.backend().begin(1)?;
        }
        Ok(())
    }

    /// Open the statement's anonymous savepoint and return its level.
    pub(crate) fn open_statement_scope(&self) -> Result<u32> {
        let backend = self.backend();
        let level = backend.current_level() + 1;
        backend.begin(level)?;
        Ok(level)
    }

    /// Commit the statement's savepoint into its parent, then close the
    /// implicit transaction if the session is in autocommit mode.
    pub(crate) fn release_statement_scope(&self, boundary: Option<u32>) -> Result<()> {
        if let Some(level) = boundary {
            self.backend().commit(level.saturating_sub(1))?;
        }
        self.close_implicit_txn(true)
    }

    /// Drop the statement's writes while keeping the surrounding
    /// transaction intact.
    pub(crate) fn abort_statement_scope(&self, boundary: Option<u32>) -> Result<()> {
        if let Some(level) = boundary {
            let backend = self.backend();
            backend.rollback(level)?;
            backend.commit(level.saturating_sub(1))?;
        }
        self.close_implicit_txn(false)
    }

    /// Close the implicit transaction at the end of a statement. No-op
    /// inside an explicit transaction or under named savepoints.
    fn close_implicit_txn(&self, commit: bool) -> Result<()> {
        if !self.auto_commit.get() || !self.savepoints.borrow().is_empty() {
            return Ok(());
        }
        let backend = self.backend();
        if backend.current_level() == 0 {
            return Ok(());
        }
        if commit {
            backend.commit(0)
        } else {
            backend.rollback(1)?;
            backend.commit(0)
        }
    }

    /// Abandon the whole transaction stack. Used when an error leaves the
    /// transaction state untrustworthy.
    pub(crate) fn reset_transaction(&self) -> Result<()> {
        let backend = self.backend();
        if backend.current_level() > 0 {
            backend.rollback(1)?;
            backend.commit(0)?;
        }
        self.auto_commit.set(true);
        self.savepoints.borrow_mut().clear();
        Ok(())
    }
}

/// Sets a flag the interpreter checks between instructions. Clonable and
/// sendable, so any thread can cancel a running statement.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// A prepared program bound to a session, stepped row by row.
pub struct Statement {
    program: Rc<Program>,
    state: ProgramState,
    session: Arc<Session>,
    /// Set once `Done` or an error has surfaced; stepping again without a
    /// reset is a misuse.
    finished: bool,
}

impl Statement {
    /// Advance the program until it produces a row, finishes, or fails.
    ///
    /// `Busy` means the backend refused an operation and the same step may
    /// simply be retried. Any other error finishes the statement: its
    /// writes are rolled back to the statement boundary, while an error
    /// classified as transaction-fatal or fatal resets the whole
    /// transaction stack instead.
    pub fn step(&mut self) -> Result<StepResult> {
        if self.finished {
            return Err(BasaltError::Misuse(
                "statement needs reset before stepping again".to_string(),
            ));
        }
        match self.program.step(&mut self.state, &self.session) {
            Ok(StepResult::Row) => Ok(StepResult::Row),
            Ok(StepResult::Done) => {
                self.finished = true;
                let boundary = self.state.stmt_boundary.take();
                self.session.release_statement_scope(boundary)?;
                Ok(StepResult::Done)
            }
            Ok(StepResult::Interrupt) => {
                self.session.clear_interrupt();
                self.finished = true;
                let boundary = self.state.stmt_boundary.take();
                self.session.abort_statement_scope(boundary)?;
                Err(BasaltError::Interrupted)
            }
            Ok(other) => Ok(other),
            Err(err) if err.is_retryable() => Ok(StepResult::Busy),
            Err(err) => {
                self.finished = true;
                self.handle_failure(err)
            }
        }
    }

    /// Roll back to the statement boundary, or reset the transaction for
    /// transaction-fatal and fatal errors. The original error surfaces
    /// either way, unless the recovery itself fails.
    fn handle_failure(&mut self, err: BasaltError) -> Result<StepResult> {
        let boundary = self.state.stmt_boundary.take();
        let recovery = if err.is_txn_fatal() || err.is_fatal() {
            self.session.reset_transaction()
        } else {
            self.session.abort_statement_scope(boundary)
        };
        if let Err(rollback_err) = recovery {
            return Err(BasaltError::TxError(format!(
                "rollback failed during error recovery: {rollback_err}"
            )));
        }
        Err(err)
    }

    /// Bind a parameter by its one-based index.
    pub fn bind_at(&mut self, index: NonZero<usize>, value: Value) -> Result<()> {
        if index.get() > self.program.parameter_count {
            return Err(BasaltError::OutOfRange(format!(
                "parameter index {index} out of range"
            )));
        }
        self.state.bind_at(index, value);
        Ok(())
    }

    /// The result row made readable by the last `Row` step.
    pub fn row(&self) -> Option<Row<'_>> {
        let (start, count) = self.state.result_row?;
        Some(Row::new(&self.state.registers[start..start + count]))
    }

    /// Back to the start. Outstanding statement writes are rolled back and
    /// bindings are cleared.
    pub fn reset(&mut self) -> Result<()> {
        let boundary = self.state.stmt_boundary.take();
        self.session.abort_statement_scope(boundary)?;
        self.state.reset();
        self.finished = false;
        Ok(())
    }

    /// Human-readable listing of the program.
    pub fn explain(&self) -> String {
        self.program.explain()
    }

    pub fn parameters_count(&self) -> usize {
        self.program.parameter_count
    }
}

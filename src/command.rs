//! Command tree: the composable, fluent description of a transactional
//! pipeline (begin/savepoint/execute/prepare/execute-prepared/then/error).
//!
//! The tree is built eagerly through the fluent `Transaction` API before a
//! `Scheduler` ever touches a socket. It is arena-based (`Vec<Node>` indexed
//! by `NodeId`) and `Rc<RefCell<_>>`-backed rather than `&mut`-threaded,
//! since nested scopes (a savepoint built from within a `then` of its
//! parent) need shared mutable access that a borrowed arena can't give
//! without fighting the borrow checker. This keeps the tree `!Send`/`!Sync`,
//! which is fine: a pipeline belongs to one connection at a time.

use std::cell::RefCell;
use std::rc::Rc;

use crate::conversion::ToParams;
use crate::error::{Error, Result};
use crate::protocol::types::Oid;
use crate::resultset::ResultSet;

/// Identifies a node within a `CommandTree`'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeId(pub(crate) u32);

/// Transaction isolation level, as named in a `BEGIN` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// `ISOLATION LEVEL READ COMMITTED` (the server default; omitted from
    /// the emitted `BEGIN` text rather than spelled out).
    #[default]
    ReadCommitted,
    /// `ISOLATION LEVEL REPEATABLE READ`.
    RepeatableRead,
    /// `ISOLATION LEVEL SERIALIZABLE`.
    Serializable,
}

/// Access mode for a `BEGIN` node: isolation level, read-only, and
/// deferrable are independently combinable, matching PostgreSQL's own
/// `BEGIN` grammar (e.g. `BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY
/// DEFERRABLE` is one statement, not a choice between alternatives).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionMode {
    pub isolation: Isolation,
    pub read_only: bool,
    pub deferrable: bool,
}

impl TransactionMode {
    /// `BEGIN` with no modifiers.
    pub const fn default_mode() -> Self {
        Self {
            isolation: Isolation::ReadCommitted,
            read_only: false,
            deferrable: false,
        }
    }

    pub(crate) fn begin_sql(self) -> String {
        let mut sql = String::from("BEGIN");
        match self.isolation {
            Isolation::ReadCommitted => {}
            Isolation::RepeatableRead => sql.push_str(" ISOLATION LEVEL REPEATABLE READ"),
            Isolation::Serializable => sql.push_str(" ISOLATION LEVEL SERIALIZABLE"),
        }
        if self.read_only {
            sql.push_str(" READ ONLY");
        }
        if self.deferrable {
            sql.push_str(" DEFERRABLE");
        }
        sql
    }
}

pub(crate) type OnSuccess = Box<dyn FnOnce(&ResultSet) -> Result<()>>;
pub(crate) type OnError = Box<dyn FnOnce(&Error) -> Result<()>>;

pub(crate) enum NodeKind {
    /// Implicit top-level container; never dispatched on the wire itself.
    Root,
    Begin(TransactionMode),
    Savepoint(String),
    ExecuteSimple(String),
    Prepare {
        name: String,
        sql: String,
        param_oids: Vec<Oid>,
    },
    ExecutePrepared {
        name: String,
        params: Box<dyn ToParams>,
    },
    Then(Box<dyn FnOnce() -> Result<()>>),
    ErrorHandler(Box<dyn FnOnce() -> Result<()>>),
}

pub(crate) struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) kind: Option<NodeKind>,
    pub(crate) cumulative_success: bool,
    pub(crate) force_rollback: bool,
    pub(crate) on_success: Option<OnSuccess>,
    pub(crate) on_error: Option<OnError>,
    pub(crate) results: ResultSet,
}

/// The arena backing a pipeline. Not exposed directly; reached through
/// `Transaction` handles and consumed by `Scheduler`.
pub(crate) struct CommandTree {
    pub(crate) nodes: Vec<Node>,
}

impl CommandTree {
    fn alloc(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            kind: Some(kind),
            cumulative_success: true,
            force_rollback: false,
            on_success: None,
            on_error: None,
            results: ResultSet::new(),
        });
        if let Some(p) = parent {
            self.nodes[p.0 as usize].children.push(id);
        }
        id
    }
}

/// A handle into a command tree, pointing at one node.
///
/// Cloning a `Transaction` clones the handle, not the tree: all clones (and
/// all handles returned by its builder methods) share the same underlying
/// arena via `Rc<RefCell<_>>`.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) tree: Rc<RefCell<CommandTree>>,
    pub(crate) node: NodeId,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Create a new, empty pipeline. The returned handle points at the
    /// implicit root; everything scheduled through its builder methods runs
    /// at the top level.
    pub fn new() -> Self {
        let mut tree = CommandTree { nodes: Vec::new() };
        let root = tree.alloc(None, NodeKind::Root);
        Self {
            tree: Rc::new(RefCell::new(tree)),
            node: root,
        }
    }

    fn child(&self, kind: NodeKind, on_success: Option<OnSuccess>, on_error: Option<OnError>) -> Transaction {
        let mut tree = self.tree.borrow_mut();
        let id = tree.alloc(Some(self.node), kind);
        tree.nodes[id.0 as usize].on_success = on_success;
        tree.nodes[id.0 as usize].on_error = on_error;
        drop(tree);
        Transaction {
            tree: self.tree.clone(),
            node: id,
        }
    }

    /// Queue a `BEGIN` block. Children attached to the returned handle run
    /// inside it; the block commits if every one of them (and their own
    /// nested blocks) succeeds, and rolls back otherwise.
    pub fn begin(
        &self,
        mode: TransactionMode,
        on_success: impl FnOnce(&ResultSet) -> Result<()> + 'static,
        on_error: impl FnOnce(&Error) -> Result<()> + 'static,
    ) -> Transaction {
        self.child(NodeKind::Begin(mode), Some(Box::new(on_success)), Some(Box::new(on_error)))
    }

    /// Queue a `SAVEPOINT`. Released on success, rolled back to on failure
    /// (of itself or any of its children).
    pub fn savepoint(
        &self,
        name: impl Into<String>,
        on_success: impl FnOnce(&ResultSet) -> Result<()> + 'static,
        on_error: impl FnOnce(&Error) -> Result<()> + 'static,
    ) -> Transaction {
        self.child(
            NodeKind::Savepoint(name.into()),
            Some(Box::new(on_success)),
            Some(Box::new(on_error)),
        )
    }

    /// Queue a plain SQL statement dispatched via the simple query protocol.
    pub fn execute(
        &self,
        sql: impl Into<String>,
        on_success: impl FnOnce(&ResultSet) -> Result<()> + 'static,
        on_error: impl FnOnce(&Error) -> Result<()> + 'static,
    ) -> Transaction {
        self.child(
            NodeKind::ExecuteSimple(sql.into()),
            Some(Box::new(on_success)),
            Some(Box::new(on_error)),
        )
    }

    /// Queue a `Parse` + `Describe(statement)` that registers `name` in the
    /// pipeline's prepared-statement registry once it completes cleanly.
    pub fn prepare(
        &self,
        name: impl Into<String>,
        sql: impl Into<String>,
        param_oids: Vec<Oid>,
        on_success: impl FnOnce(&ResultSet) -> Result<()> + 'static,
        on_error: impl FnOnce(&Error) -> Result<()> + 'static,
    ) -> Transaction {
        self.child(
            NodeKind::Prepare {
                name: name.into(),
                sql: sql.into(),
                param_oids,
            },
            Some(Box::new(on_success)),
            Some(Box::new(on_error)),
        )
    }

    /// Queue a `Bind` + `Execute` against a statement already registered by
    /// an earlier `prepare` node in this (or a prior) pipeline run.
    pub fn execute_prepared<P: ToParams + 'static>(
        &self,
        name: impl Into<String>,
        params: P,
        on_success: impl FnOnce(&ResultSet) -> Result<()> + 'static,
        on_error: impl FnOnce(&Error) -> Result<()> + 'static,
    ) -> Transaction {
        self.child(
            NodeKind::ExecutePrepared {
                name: name.into(),
                params: Box::new(params),
            },
            Some(Box::new(on_success)),
            Some(Box::new(on_error)),
        )
    }

    /// Chain a callback that fires once the node this handle points at has
    /// finished successfully (its own outcome and all of its children's).
    pub fn then(&self, callback: impl FnOnce() -> Result<()> + 'static) -> Transaction {
        self.child(NodeKind::Then(Box::new(callback)), None, None)
    }

    /// Chain a callback that fires once the node this handle points at has
    /// failed (its own outcome, any child's, or an earlier `then`/`error`
    /// callback in the same scope).
    pub fn error(&self, callback: impl FnOnce() -> Result<()> + 'static) -> Transaction {
        self.child(NodeKind::ErrorHandler(Box::new(callback)), None, None)
    }
}

//! Pipeline scheduler: walks a `CommandTree` and drives it over the wire.
//!
//! The tree is flattened into a linear plan at schedule-start, in exactly
//! the depth-first pre-order the tree was built in. That trivially satisfies
//! the property that wire frames leave the client in depth-first pre-order:
//! there is no interactive cursor deciding what to dispatch next, just a
//! queue consumed strictly in order. What *is* resolved lazily, as each plan
//! entry is reached, is: whether a `then`/`error` callback should fire, and
//! whether a `BEGIN`/`SAVEPOINT` block's closing statement is a commit/
//! release or a rollback/rollback-to — both depend on accumulated
//! success/failure state that is only known once earlier responses have
//! been processed.
//!
//! `Execute-Prepared` deliberately does not reuse
//! `state::extended::ExtendedQueryStateMachine::execute`: that convenience
//! API re-describes the portal (Bind+DescribePortal+Execute+Sync) because it
//! doesn't otherwise know the result columns. Here the row description was
//! already captured when the statement was prepared, so the scheduler binds
//! straight to Bind+Execute+Sync.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::command::{CommandTree, NodeId, NodeKind, Transaction};
use crate::error::{Error, Result};
use crate::protocol::backend::{
    BindComplete, CommandComplete, EmptyQueryResponse, ErrorResponse, NoData, ParameterDescription,
    ParseComplete, PortalSuspended, RawMessage, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::{
    write_bind, write_describe_statement, write_execute, write_parse, write_query, write_sync,
};
use crate::protocol::types::{FormatCode, TransactionStatus};
use crate::registry::{Definition, Registry};
use crate::resultset::ResultSet;
use crate::state::action::{Action, AsyncMessage};
use crate::state::StateMachine;
use crate::BufferSet;

fn idx(id: NodeId) -> usize {
    id.0 as usize
}

fn handle_async(type_byte: u8, payload: &[u8]) -> Result<Action> {
    match type_byte {
        msg_type::NOTICE_RESPONSE => {
            let notice = crate::protocol::backend::NoticeResponse::parse(payload)?;
            Ok(Action::HandleAsyncMessageAndReadMessage(AsyncMessage::Notice(
                notice.into_server_error(),
            )))
        }
        msg_type::PARAMETER_STATUS => {
            let param = crate::protocol::backend::auth::ParameterStatus::parse(payload)?;
            Ok(Action::HandleAsyncMessageAndReadMessage(
                AsyncMessage::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                },
            ))
        }
        msg_type::NOTIFICATION_RESPONSE => {
            let notification = crate::protocol::backend::auth::NotificationResponse::parse(payload)?;
            Ok(Action::HandleAsyncMessageAndReadMessage(
                AsyncMessage::Notification {
                    pid: notification.pid,
                    channel: notification.channel.to_string(),
                    payload: notification.payload.to_string(),
                },
            ))
        }
        _ => Err(Error::Protocol(format!(
            "Unknown async message type: '{}'",
            type_byte as char
        ))),
    }
}

#[derive(Clone, Copy)]
enum PlanOp {
    Begin(NodeId),
    Savepoint(NodeId),
    ExecuteSimple(NodeId),
    Prepare(NodeId),
    ExecutePrepared(NodeId),
    Then(NodeId),
    ErrorHandler(NodeId),
    FinalizeBegin(NodeId),
    FinalizeSavepoint(NodeId),
}

fn flatten(tree: &CommandTree, id: NodeId, plan: &mut VecDeque<PlanOp>) {
    let node = &tree.nodes[idx(id)];
    match node.kind.as_ref().expect("node kind consumed before flatten") {
        NodeKind::Root => {}
        NodeKind::Begin(_) => plan.push_back(PlanOp::Begin(id)),
        NodeKind::Savepoint(_) => plan.push_back(PlanOp::Savepoint(id)),
        NodeKind::ExecuteSimple(_) => plan.push_back(PlanOp::ExecuteSimple(id)),
        NodeKind::Prepare { .. } => plan.push_back(PlanOp::Prepare(id)),
        NodeKind::ExecutePrepared { .. } => plan.push_back(PlanOp::ExecutePrepared(id)),
        NodeKind::Then(_) => plan.push_back(PlanOp::Then(id)),
        NodeKind::ErrorHandler(_) => plan.push_back(PlanOp::ErrorHandler(id)),
    }
    let children: Vec<NodeId> = node.children.clone();
    for child in children {
        flatten(tree, child, plan);
    }
    match tree.nodes[idx(id)].kind.as_ref().unwrap() {
        NodeKind::Begin(_) => plan.push_back(PlanOp::FinalizeBegin(id)),
        NodeKind::Savepoint(_) => plan.push_back(PlanOp::FinalizeSavepoint(id)),
        _ => {}
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SimplePhase {
    WaitingResponse,
    ProcessingRows,
    WaitingReady,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PreparePhase {
    Parse,
    ParamDesc,
    RowDesc,
    Ready,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ExecPhase {
    WaitingBind,
    ProcessingRows,
    WaitingReady,
}

enum ActiveOp {
    Idle,
    Simple {
        node: NodeId,
        terminal: bool,
        phase: SimplePhase,
        error: Option<Rc<Error>>,
    },
    Prepare {
        node: NodeId,
        name: String,
        sql: String,
        param_oids: Vec<crate::protocol::types::Oid>,
        row_desc: Option<Vec<u8>>,
        phase: PreparePhase,
        error: Option<Rc<Error>>,
    },
    Execute {
        node: NodeId,
        phase: ExecPhase,
        error: Option<Rc<Error>>,
    },
}

/// Drives a `CommandTree` to completion over an extended-query connection.
///
/// Implements `StateMachine`, so it is driven with the same
/// `Conn::drive_extended` seam used by every other protocol state machine,
/// on both the sync and tokio front-ends.
pub struct Scheduler {
    tree: std::rc::Rc<std::cell::RefCell<CommandTree>>,
    root: NodeId,
    plan: VecDeque<PlanOp>,
    registry: Registry,
    active: ActiveOp,
    transaction_status: TransactionStatus,
    pending_error: Option<Rc<Error>>,
}

impl Scheduler {
    /// Build a scheduler for the pipeline reachable from `root` (typically
    /// the handle returned by `Transaction::new()`, covering the whole
    /// tree).
    pub fn new(root: &Transaction) -> Self {
        let mut plan = VecDeque::new();
        flatten(&root.tree.borrow(), root.node, &mut plan);
        Self {
            tree: root.tree.clone(),
            root: root.node,
            plan,
            registry: Registry::new(),
            active: ActiveOp::Idle,
            transaction_status: TransactionStatus::Idle,
            pending_error: None,
        }
    }

    /// The error (if any) surfaced by the pipeline's own top-level node.
    /// Individual node failures are reported through their `on_error`
    /// callbacks; this reflects only the last unhandled failure recorded.
    pub fn pending_error(&self) -> Option<Rc<Error>> {
        self.pending_error.clone()
    }

    /// The result set left behind by the last node in the pipeline that
    /// actually collected rows, moved up through `complete_node`'s
    /// "last result" propagation as the tree unwound to its root.
    pub fn last_result(&self) -> ResultSet {
        self.tree.borrow().nodes[idx(self.root)].results.clone()
    }

    fn run_success_cb(&mut self, node_id: NodeId) -> bool {
        let cb = self.tree.borrow_mut().nodes[idx(node_id)].on_success.take();
        if let Some(cb) = cb {
            let results = self.tree.borrow().nodes[idx(node_id)].results.clone();
            match cb(&results) {
                Ok(()) => true,
                Err(e) => {
                    self.pending_error = Some(Rc::new(Error::Client(e.to_string())));
                    false
                }
            }
        } else {
            true
        }
    }

    fn run_error_cb(&mut self, node_id: NodeId, err: &Error) -> bool {
        let cb = self.tree.borrow_mut().nodes[idx(node_id)].on_error.take();
        if let Some(cb) = cb {
            match cb(err) {
                Ok(()) => true,
                Err(e) => {
                    self.pending_error = Some(Rc::new(Error::Client(e.to_string())));
                    false
                }
            }
        } else {
            true
        }
    }

    fn flip_failure(&mut self, node_id: NodeId) {
        {
            let mut tree = self.tree.borrow_mut();
            tree.nodes[idx(node_id)].cumulative_success = false;
            if matches!(tree.nodes[idx(node_id)].kind.as_ref(), Some(NodeKind::Savepoint(_))) {
                tree.nodes[idx(node_id)].force_rollback = true;
            }
        }
        self.propagate_status(node_id, false);
    }

    /// ANDs `status` into every ancestor up the chain from `node_id`, stopping
    /// as soon as a failure is absorbed by an enclosing `SAVEPOINT`: that
    /// savepoint will `ROLLBACK TO` and the transaction carries on, so the
    /// failure must not keep climbing into the scope that contains it.
    fn propagate_status(&mut self, node_id: NodeId, status: bool) {
        let mut tree = self.tree.borrow_mut();
        let mut cur = tree.nodes[idx(node_id)].parent;
        while let Some(pid) = cur {
            let pnode = &mut tree.nodes[idx(pid)];
            pnode.cumulative_success &= status;
            if !status && matches!(pnode.kind.as_ref(), Some(NodeKind::Savepoint(_))) {
                pnode.force_rollback = true;
                break;
            }
            cur = pnode.parent;
        }
    }

    fn complete_node(&mut self, node_id: NodeId, own_success: bool, err: Option<Rc<Error>>) {
        if !own_success {
            self.flip_failure(node_id);
            if let Some(e) = err {
                self.pending_error = Some(e);
            }
        }
        let status = self.tree.borrow().nodes[idx(node_id)].cumulative_success;
        let cb_ok = if status {
            self.run_success_cb(node_id)
        } else {
            let e = self
                .pending_error
                .clone()
                .unwrap_or_else(|| Rc::new(Error::Protocol("node failed".into())));
            self.run_error_cb(node_id, &e)
        };
        if !cb_ok {
            self.flip_failure(node_id);
        }
        let is_savepoint =
            matches!(self.tree.borrow().nodes[idx(node_id)].kind.as_ref(), Some(NodeKind::Savepoint(_)));
        if is_savepoint {
            // A savepoint's own cumulative_success reflects children it just
            // rolled back to recover from; that outcome is contained here and
            // must not reach the enclosing scope. Only a failure in the
            // savepoint's own finalize statement or callbacks escapes.
            self.propagate_status(node_id, own_success && cb_ok);
        } else {
            let final_status = self.tree.borrow().nodes[idx(node_id)].cumulative_success;
            self.propagate_status(node_id, final_status);
        }
        self.move_result_to_parent(node_id);
    }

    /// The result-set storage is owned by the node that collected it and is
    /// moved into the parent's "last result" slot at terminal time, so a
    /// caller of `Conn::run` can retrieve the pipeline's final result set
    /// through the root node even though only leaf nodes ever dispatch a
    /// query. Nodes that never collected rows themselves (Root, Begin,
    /// Savepoint, Then, ErrorHandler) leave their parent's slot untouched.
    fn move_result_to_parent(&mut self, node_id: NodeId) {
        let mut tree = self.tree.borrow_mut();
        let Some(parent) = tree.nodes[idx(node_id)].parent else {
            return;
        };
        if tree.nodes[idx(node_id)].results.has_description() {
            let results = tree.nodes[idx(node_id)].results.clone();
            tree.nodes[idx(parent)].results = results;
        }
    }

    fn fire_then(&mut self, id: NodeId) {
        let parent = self.tree.borrow().nodes[idx(id)].parent.expect("then has a parent");
        let parent_ok = self.tree.borrow().nodes[idx(parent)].cumulative_success;
        let cb = match self.tree.borrow_mut().nodes[idx(id)].kind.take() {
            Some(NodeKind::Then(cb)) => Some(cb),
            _ => None,
        };
        if parent_ok
            && let Some(cb) = cb
            && let Err(e) = cb()
        {
            self.pending_error = Some(Rc::new(Error::Client(e.to_string())));
            self.flip_failure(parent);
        }
    }

    fn fire_error_handler(&mut self, id: NodeId) {
        let parent = self.tree.borrow().nodes[idx(id)].parent.expect("error has a parent");
        let parent_ok = self.tree.borrow().nodes[idx(parent)].cumulative_success;
        let cb = match self.tree.borrow_mut().nodes[idx(id)].kind.take() {
            Some(NodeKind::ErrorHandler(cb)) => Some(cb),
            _ => None,
        };
        if !parent_ok
            && let Some(cb) = cb
            && let Err(e) = cb()
        {
            self.pending_error = Some(Rc::new(Error::Client(e.to_string())));
            self.flip_failure(parent);
        }
    }

    fn dispatch_simple(
        &mut self,
        id: NodeId,
        sql: &str,
        buffer_set: &mut BufferSet,
        terminal: bool,
    ) -> Option<Action> {
        buffer_set.write_buffer.clear();
        write_query(&mut buffer_set.write_buffer, sql);
        self.active = ActiveOp::Simple {
            node: id,
            terminal,
            phase: SimplePhase::WaitingResponse,
            error: None,
        };
        Some(Action::WriteAndReadMessage)
    }

    fn dispatch_prepare(&mut self, id: NodeId, buffer_set: &mut BufferSet) -> Option<Action> {
        let (name, sql, param_oids) = {
            let tree = self.tree.borrow();
            match tree.nodes[idx(id)].kind.as_ref().unwrap() {
                NodeKind::Prepare { name, sql, param_oids } => {
                    (name.clone(), sql.clone(), param_oids.clone())
                }
                _ => unreachable!(),
            }
        };
        buffer_set.write_buffer.clear();
        write_parse(&mut buffer_set.write_buffer, &name, &sql, &param_oids);
        write_describe_statement(&mut buffer_set.write_buffer, &name);
        write_sync(&mut buffer_set.write_buffer);
        self.active = ActiveOp::Prepare {
            node: id,
            name,
            sql,
            param_oids,
            row_desc: None,
            phase: PreparePhase::Parse,
            error: None,
        };
        Some(Action::WriteAndReadMessage)
    }

    fn dispatch_execute_prepared(&mut self, id: NodeId, buffer_set: &mut BufferSet) -> Option<Action> {
        let (name, params) = {
            let mut tree = self.tree.borrow_mut();
            match tree.nodes[idx(id)].kind.take() {
                Some(NodeKind::ExecutePrepared { name, params }) => (name, params),
                _ => unreachable!(),
            }
        };
        let definition: Definition = match self.registry.get(&name) {
            Ok(d) => d.clone(),
            Err(e) => {
                self.complete_node(id, false, Some(Rc::new(e)));
                return None;
            }
        };
        buffer_set.write_buffer.clear();
        let params_ref: &dyn crate::conversion::ToParams = &*params;
        if let Err(e) = write_bind(&mut buffer_set.write_buffer, "", &name, &params_ref, &definition.param_oids) {
            self.complete_node(id, false, Some(Rc::new(e)));
            return None;
        }
        write_execute(&mut buffer_set.write_buffer, "", 0);
        write_sync(&mut buffer_set.write_buffer);
        {
            let mut tree = self.tree.borrow_mut();
            let result = &mut tree.nodes[idx(id)].results;
            if let Some(row_desc) = &definition.row_desc {
                result.set_description(row_desc);
            }
            result.set_format(FormatCode::Binary);
        }
        self.active = ActiveOp::Execute {
            node: id,
            phase: ExecPhase::WaitingBind,
            error: None,
        };
        Some(Action::WriteAndReadMessage)
    }

    fn start_op(&mut self, op: PlanOp, buffer_set: &mut BufferSet) -> Result<Option<Action>> {
        match op {
            PlanOp::Then(id) => {
                self.fire_then(id);
                Ok(None)
            }
            PlanOp::ErrorHandler(id) => {
                self.fire_error_handler(id);
                Ok(None)
            }
            PlanOp::Begin(id) => {
                let sql = {
                    let tree = self.tree.borrow();
                    match tree.nodes[idx(id)].kind.as_ref().unwrap() {
                        NodeKind::Begin(mode) => mode.begin_sql().to_string(),
                        _ => unreachable!(),
                    }
                };
                Ok(self.dispatch_simple(id, &sql, buffer_set, false))
            }
            PlanOp::Savepoint(id) => {
                let sql = {
                    let tree = self.tree.borrow();
                    match tree.nodes[idx(id)].kind.as_ref().unwrap() {
                        NodeKind::Savepoint(name) => format!("SAVEPOINT {name}"),
                        _ => unreachable!(),
                    }
                };
                Ok(self.dispatch_simple(id, &sql, buffer_set, false))
            }
            PlanOp::ExecuteSimple(id) => {
                let sql = {
                    let tree = self.tree.borrow();
                    match tree.nodes[idx(id)].kind.as_ref().unwrap() {
                        NodeKind::ExecuteSimple(sql) => sql.clone(),
                        _ => unreachable!(),
                    }
                };
                Ok(self.dispatch_simple(id, &sql, buffer_set, true))
            }
            PlanOp::FinalizeBegin(id) => {
                let ok = self.tree.borrow().nodes[idx(id)].cumulative_success;
                let sql = if ok {
                    "COMMIT".to_string()
                } else {
                    self.pending_error
                        .get_or_insert_with(|| Rc::new(Error::Protocol("rollback processed due to a query failure".into())));
                    "ROLLBACK".to_string()
                };
                Ok(self.dispatch_simple(id, &sql, buffer_set, true))
            }
            PlanOp::FinalizeSavepoint(id) => {
                let (ok, name) = {
                    let tree = self.tree.borrow();
                    let n = &tree.nodes[idx(id)];
                    let name = match n.kind.as_ref().unwrap() {
                        NodeKind::Savepoint(name) => name.clone(),
                        _ => unreachable!(),
                    };
                    (n.cumulative_success && !n.force_rollback, name)
                };
                let sql = if ok {
                    format!("RELEASE SAVEPOINT {name}")
                } else {
                    self.pending_error
                        .get_or_insert_with(|| Rc::new(Error::Protocol("rollback processed due to a query failure".into())));
                    format!("ROLLBACK TO SAVEPOINT {name}")
                };
                Ok(self.dispatch_simple(id, &sql, buffer_set, true))
            }
            PlanOp::Prepare(id) => Ok(self.dispatch_prepare(id, buffer_set)),
            PlanOp::ExecutePrepared(id) => Ok(self.dispatch_execute_prepared(id, buffer_set)),
        }
    }

    fn process_simple(&mut self, buffer_set: &mut BufferSet) -> Result<Option<Action>> {
        let type_byte = buffer_set.type_byte;
        let (node, phase) = match &self.active {
            ActiveOp::Simple { node, phase, .. } => (*node, *phase),
            _ => unreachable!(),
        };

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?.into_error();
            if let ActiveOp::Simple { error: e, phase, .. } = &mut self.active {
                *e = Some(Rc::new(error));
                *phase = SimplePhase::WaitingReady;
            }
            return Ok(Some(Action::ReadMessage));
        }

        match phase {
            SimplePhase::WaitingResponse => match type_byte {
                msg_type::ROW_DESCRIPTION => {
                    self.tree.borrow_mut().nodes[idx(node)]
                        .results
                        .set_description(&buffer_set.read_buffer);
                    if let ActiveOp::Simple { phase, .. } = &mut self.active {
                        *phase = SimplePhase::ProcessingRows;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                msg_type::COMMAND_COMPLETE => {
                    CommandComplete::parse(&buffer_set.read_buffer)?;
                    if let ActiveOp::Simple { phase, .. } = &mut self.active {
                        *phase = SimplePhase::WaitingReady;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    EmptyQueryResponse::parse(&buffer_set.read_buffer)?;
                    if let ActiveOp::Simple { phase, .. } = &mut self.active {
                        *phase = SimplePhase::WaitingReady;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                _ => Err(Error::Protocol(format!(
                    "Unexpected message in simple op response: '{}'",
                    type_byte as char
                ))),
            },
            SimplePhase::ProcessingRows => match type_byte {
                msg_type::DATA_ROW => {
                    self.tree.borrow_mut().nodes[idx(node)].results.push_row(&buffer_set.read_buffer);
                    Ok(Some(Action::ReadMessage))
                }
                msg_type::COMMAND_COMPLETE => {
                    CommandComplete::parse(&buffer_set.read_buffer)?;
                    if let ActiveOp::Simple { phase, .. } = &mut self.active {
                        *phase = SimplePhase::WaitingReady;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                _ => Err(Error::Protocol(format!(
                    "Unexpected message in simple op rows: '{}'",
                    type_byte as char
                ))),
            },
            SimplePhase::WaitingReady => {
                if type_byte != msg_type::READY_FOR_QUERY {
                    return Err(Error::Protocol(format!(
                        "Expected ReadyForQuery, got '{}'",
                        type_byte as char
                    )));
                }
                let ready = ReadyForQuery::parse(&buffer_set.read_buffer)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                let (node, terminal, error) = match std::mem::replace(&mut self.active, ActiveOp::Idle) {
                    ActiveOp::Simple { node, terminal, error, .. } => (node, terminal, error),
                    _ => unreachable!(),
                };
                if terminal {
                    self.complete_node(node, error.is_none(), error);
                } else if let Some(e) = error {
                    self.flip_failure(node);
                    self.pending_error = Some(e);
                }
                Ok(None)
            }
        }
    }

    fn process_prepare(&mut self, buffer_set: &mut BufferSet) -> Result<Option<Action>> {
        let type_byte = buffer_set.type_byte;
        let phase = match &self.active {
            ActiveOp::Prepare { phase, .. } => *phase,
            _ => unreachable!(),
        };

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?.into_error();
            if let ActiveOp::Prepare { error: e, phase, .. } = &mut self.active {
                *e = Some(Rc::new(error));
                *phase = PreparePhase::Ready;
            }
            return Ok(Some(Action::ReadMessage));
        }

        match phase {
            PreparePhase::Parse => {
                ParseComplete::parse(&buffer_set.read_buffer)?;
                if let ActiveOp::Prepare { phase, .. } = &mut self.active {
                    *phase = PreparePhase::ParamDesc;
                }
                Ok(Some(Action::ReadMessage))
            }
            PreparePhase::ParamDesc => {
                // Caller-supplied param_oids are authoritative; the server's
                // echoed list is not consulted.
                ParameterDescription::parse(&buffer_set.read_buffer)?;
                if let ActiveOp::Prepare { phase, .. } = &mut self.active {
                    *phase = PreparePhase::RowDesc;
                }
                Ok(Some(Action::ReadMessage))
            }
            PreparePhase::RowDesc => {
                match type_byte {
                    msg_type::ROW_DESCRIPTION => {
                        if let ActiveOp::Prepare { row_desc, .. } = &mut self.active {
                            *row_desc = Some(buffer_set.read_buffer.clone());
                        }
                    }
                    msg_type::NO_DATA => {
                        NoData::parse(&buffer_set.read_buffer)?;
                    }
                    _ => {
                        return Err(Error::Protocol(format!(
                            "Expected RowDescription or NoData, got '{}'",
                            type_byte as char
                        )));
                    }
                }
                if let ActiveOp::Prepare { phase, .. } = &mut self.active {
                    *phase = PreparePhase::Ready;
                }
                Ok(Some(Action::ReadMessage))
            }
            PreparePhase::Ready => {
                if type_byte != msg_type::READY_FOR_QUERY {
                    return Err(Error::Protocol(format!(
                        "Expected ReadyForQuery, got '{}'",
                        type_byte as char
                    )));
                }
                let ready = ReadyForQuery::parse(&buffer_set.read_buffer)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                let (node, name, sql, param_oids, row_desc, error) =
                    match std::mem::replace(&mut self.active, ActiveOp::Idle) {
                        ActiveOp::Prepare { node, name, sql, param_oids, row_desc, error, .. } => {
                            (node, name, sql, param_oids, row_desc, error)
                        }
                        _ => unreachable!(),
                    };
                if error.is_none() {
                    self.registry.insert(Definition {
                        name,
                        sql,
                        param_oids,
                        row_desc,
                    });
                }
                self.complete_node(node, error.is_none(), error);
                Ok(None)
            }
        }
    }

    fn process_execute(&mut self, buffer_set: &mut BufferSet) -> Result<Option<Action>> {
        let type_byte = buffer_set.type_byte;
        let (node, phase) = match &self.active {
            ActiveOp::Execute { node, phase, .. } => (*node, *phase),
            _ => unreachable!(),
        };

        if type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(&buffer_set.read_buffer)?.into_error();
            if let ActiveOp::Execute { error: e, phase, .. } = &mut self.active {
                *e = Some(Rc::new(error));
                *phase = ExecPhase::WaitingReady;
            }
            return Ok(Some(Action::ReadMessage));
        }

        match phase {
            ExecPhase::WaitingBind => {
                BindComplete::parse(&buffer_set.read_buffer)?;
                if let ActiveOp::Execute { phase, .. } = &mut self.active {
                    *phase = ExecPhase::ProcessingRows;
                }
                Ok(Some(Action::ReadMessage))
            }
            ExecPhase::ProcessingRows => match type_byte {
                msg_type::DATA_ROW => {
                    self.tree.borrow_mut().nodes[idx(node)].results.push_row(&buffer_set.read_buffer);
                    Ok(Some(Action::ReadMessage))
                }
                msg_type::COMMAND_COMPLETE => {
                    CommandComplete::parse(&buffer_set.read_buffer)?;
                    if let ActiveOp::Execute { phase, .. } = &mut self.active {
                        *phase = ExecPhase::WaitingReady;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    EmptyQueryResponse::parse(&buffer_set.read_buffer)?;
                    if let ActiveOp::Execute { phase, .. } = &mut self.active {
                        *phase = ExecPhase::WaitingReady;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                msg_type::PORTAL_SUSPENDED => {
                    PortalSuspended::parse(&buffer_set.read_buffer)?;
                    if let ActiveOp::Execute { phase, .. } = &mut self.active {
                        *phase = ExecPhase::WaitingReady;
                    }
                    Ok(Some(Action::ReadMessage))
                }
                _ => Err(Error::Protocol(format!(
                    "Unexpected message in execute-prepared rows: '{}'",
                    type_byte as char
                ))),
            },
            ExecPhase::WaitingReady => {
                if type_byte != msg_type::READY_FOR_QUERY {
                    return Err(Error::Protocol(format!(
                        "Expected ReadyForQuery, got '{}'",
                        type_byte as char
                    )));
                }
                let ready = ReadyForQuery::parse(&buffer_set.read_buffer)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                let (node, error) = match std::mem::replace(&mut self.active, ActiveOp::Idle) {
                    ActiveOp::Execute { node, error, .. } => (node, error),
                    _ => unreachable!(),
                };
                self.complete_node(node, error.is_none(), error);
                Ok(None)
            }
        }
    }

    fn process_message(&mut self, buffer_set: &mut BufferSet) -> Result<Option<Action>> {
        let type_byte = buffer_set.type_byte;
        if RawMessage::is_async_type(type_byte) {
            return Ok(Some(handle_async(type_byte, &buffer_set.read_buffer)?));
        }
        match self.active {
            ActiveOp::Idle => unreachable!("process_message called while idle"),
            ActiveOp::Simple { .. } => self.process_simple(buffer_set),
            ActiveOp::Prepare { .. } => self.process_prepare(buffer_set),
            ActiveOp::Execute { .. } => self.process_execute(buffer_set),
        }
    }
}

impl StateMachine for Scheduler {
    fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        if !matches!(self.active, ActiveOp::Idle)
            && let Some(action) = self.process_message(buffer_set)?
        {
            return Ok(action);
        }
        loop {
            match self.plan.pop_front() {
                None => return Ok(Action::Finished),
                Some(op) => {
                    if let Some(action) = self.start_op(op, buffer_set)? {
                        return Ok(action);
                    }
                }
            }
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Transaction;

    /// Extracts the tag byte of every frontend message packed into `buf`
    /// (each is `tag, i32-be length (inclusive), payload`).
    fn frontend_tags(buf: &[u8]) -> Vec<u8> {
        let mut tags = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let tag = buf[pos];
            let len = i32::from_be_bytes(buf[pos + 1..pos + 5].try_into().unwrap()) as usize;
            tags.push(tag);
            pos += 1 + len;
        }
        tags
    }

    fn ready_for_query(buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[msg_type::READY_FOR_QUERY]);
        buf.extend_from_slice(&5i32.to_be_bytes());
        buf.push(b'I');
    }

    /// Drive a scheduler with no real socket, feeding canned backend replies
    /// keyed to each dispatched frontend message, and record every frontend
    /// tag written and every backend tag consumed.
    fn mock_drive(scheduler: &mut Scheduler, replies: &[(u8, Vec<u8>)]) -> (Vec<u8>, Vec<u8>) {
        let mut buffer_set = BufferSet::new();
        let mut written = Vec::new();
        let mut consumed = Vec::new();
        let mut next_reply = 0;

        loop {
            let action = scheduler.step(&mut buffer_set).expect("scheduler step");
            match action {
                Action::Finished => break,
                Action::WriteAndReadMessage => {
                    written.extend(frontend_tags(&buffer_set.write_buffer));
                    buffer_set.write_buffer.clear();
                    let (tag, payload) = &replies[next_reply];
                    next_reply += 1;
                    consumed.push(*tag);
                    buffer_set.type_byte = *tag;
                    buffer_set.read_buffer = payload.clone();
                }
                Action::ReadMessage => {
                    let (tag, payload) = &replies[next_reply];
                    next_reply += 1;
                    consumed.push(*tag);
                    buffer_set.type_byte = *tag;
                    buffer_set.read_buffer = payload.clone();
                }
                other => panic!("unexpected action from mock drive: {other:?}"),
            }
        }
        (written, consumed)
    }

    #[test]
    fn prepare_then_execute_prepared_emits_bind_execute_without_describe_portal() {
        let tx = Transaction::new();
        tx.prepare("s", "SELECT $1::int4", vec![23], |_| Ok(()), |e| panic!("{e}"));
        tx.execute_prepared("s", (1i32,), |_| Ok(()), |e| panic!("{e}"));

        let mut scheduler = Scheduler::new(&tx);

        let mut rfq = Vec::new();
        ready_for_query(&mut rfq);

        let replies = vec![
            (msg_type::PARSE_COMPLETE, Vec::new()),
            (msg_type::PARAMETER_DESCRIPTION, vec![0, 0]),
            (msg_type::NO_DATA, Vec::new()),
            (msg_type::READY_FOR_QUERY, vec![b'I']),
            (msg_type::BIND_COMPLETE, Vec::new()),
            (msg_type::COMMAND_COMPLETE, b"SELECT 1\0".to_vec()),
            (msg_type::READY_FOR_QUERY, vec![b'I']),
        ];

        let (written, consumed) = mock_drive(&mut scheduler, &replies);

        assert_eq!(
            written,
            vec![
                crate::protocol::frontend::msg_type::PARSE,
                crate::protocol::frontend::msg_type::DESCRIBE,
                crate::protocol::frontend::msg_type::SYNC,
                crate::protocol::frontend::msg_type::BIND,
                crate::protocol::frontend::msg_type::EXECUTE,
                crate::protocol::frontend::msg_type::SYNC,
            ]
        );
        assert_eq!(
            consumed,
            vec![
                msg_type::PARSE_COMPLETE,
                msg_type::PARAMETER_DESCRIPTION,
                msg_type::NO_DATA,
                msg_type::READY_FOR_QUERY,
                msg_type::BIND_COMPLETE,
                msg_type::COMMAND_COMPLETE,
                msg_type::READY_FOR_QUERY,
            ]
        );
        assert!(scheduler.pending_error().is_none());
    }
}

//! Event routing fabric.
//!
//! Nodes expose two surfaces, `input` and `output`, and are linked by
//! [`Pipe`]s: directed subscriptions from one node's emitted event to a
//! handler on another node. Pipes live in a shared [`Fabric`] registry rather
//! than in closures, so rewiring is a registry edit that updates both
//! endpoints under one lock.
//!
//! ```text
//!   Prompt ──input──▶ Terminal ──input──▶ Process
//!   Prompt ◀─output── Terminal ◀─output── Process
//! ```
//!
//! Calling [`Node::input`] or [`Node::output`] appends a hop to the
//! envelope's trace, emits the event to every subscribed pipe, and then runs
//! the node's own handler. Observers see traffic without taking part in it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use serde_json::Value;
use tracing::{debug, trace};

use crate::user::User;

/// Maximum number of pipe operations remembered per node.
pub const PIPE_LOG_LIMIT: usize = 256;

/// Registry-assigned node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events a node can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Input,
    Output,
    /// A host process changed its prompt string.
    PromptString,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Input => "input",
            Surface::Output => "output",
            Surface::PromptString => "promptString",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry point on the target node a pipe delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    Input,
    Output,
    /// Show another user's input line.
    EchoInput,
    /// Adopt a new prompt string.
    PromptString,
}

impl Handler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Handler::Input => "input",
            Handler::Output => "output",
            Handler::EchoInput => "echoInput",
            Handler::PromptString => "setPromptString",
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routed data.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Structured(Value),
}

impl Payload {
    /// Renders the payload as display text.
    pub fn to_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

/// One step of an envelope's route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub node: NodeId,
    pub surface: Surface,
}

/// A payload plus its provenance.
#[derive(Debug, Clone)]
pub struct DataEnvelope {
    pub payload: Payload,
    /// The user the data originated from.
    pub user: User,
    /// Free-form options bag.
    pub options: BTreeMap<String, String>,
    pub timestamp: SystemTime,
    trace: Vec<Hop>,
}

impl DataEnvelope {
    pub fn new(payload: impl Into<Payload>, user: User) -> Self {
        Self {
            payload: payload.into(),
            user,
            options: BTreeMap::new(),
            timestamp: SystemTime::now(),
            trace: Vec::new(),
        }
    }

    /// Payload rendered as text.
    pub fn text(&self) -> String {
        self.payload.to_text()
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Hops this envelope has passed through, oldest first.
    pub fn trace(&self) -> &[Hop] {
        &self.trace
    }

    fn record_hop(&mut self, node: NodeId, surface: Surface) {
        self.trace.push(Hop { node, surface });
    }
}

/// A participant in the fabric.
///
/// Implementors provide an id, their fabric and optionally the private
/// `on_*` handlers; routing is provided.
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;

    fn fabric(&self) -> &Arc<Fabric>;

    /// Private input handler, run after observers were notified.
    fn on_input(&self, _envelope: DataEnvelope) {}

    /// Private output handler, run after observers were notified.
    fn on_output(&self, _envelope: DataEnvelope) {}

    /// Delivery entry point for pipes targeting this node.
    fn on_event(&self, handler: Handler, envelope: DataEnvelope) {
        match handler {
            Handler::Input => self.input(envelope),
            Handler::Output => self.output(envelope),
            other => trace!(node = %self.id(), handler = %other, "no handler bound"),
        }
    }

    fn input(&self, mut envelope: DataEnvelope) {
        envelope.record_hop(self.id(), Surface::Input);
        self.fabric().emit(self.id(), Surface::Input, &envelope);
        self.on_input(envelope);
    }

    fn output(&self, mut envelope: DataEnvelope) {
        envelope.record_hop(self.id(), Surface::Output);
        self.fabric().emit(self.id(), Surface::Output, &envelope);
        self.on_output(envelope);
    }
}

/// A directed subscription: `source` emitting `event` calls `handler` on
/// `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pipe {
    pub source: NodeId,
    pub event: Surface,
    pub target: NodeId,
    pub handler: Handler,
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -{}-> {}.{}",
            self.source, self.event, self.target, self.handler
        )
    }
}

/// One logged pipe operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeRecord {
    pub pipe: Pipe,
    pub op: String,
    pub success: bool,
}

impl fmt::Display for PipeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]",
            self.op,
            self.pipe,
            if self.success { "ok" } else { "failed" }
        )
    }
}

struct NodeEntry {
    name: String,
    node: Weak<dyn Node>,
    /// Pipes consuming this node's events.
    outbound: Vec<Pipe>,
    /// Pipes feeding this node's handlers.
    inbound: Vec<Pipe>,
    log: VecDeque<PipeRecord>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    nodes: HashMap<NodeId, NodeEntry>,
}

impl Registry {
    fn record(&mut self, owner: NodeId, pipe: Pipe, op: impl Into<String>, success: bool) -> bool {
        if let Some(entry) = self.nodes.get_mut(&owner) {
            entry.log.push_back(PipeRecord {
                pipe,
                op: op.into(),
                success,
            });
            while entry.log.len() > PIPE_LOG_LIMIT {
                entry.log.pop_front();
            }
        }
        success
    }

    fn label(&self, id: NodeId) -> String {
        match self.nodes.get(&id) {
            Some(entry) => format!("{}{}", entry.name, id),
            None => id.to_string(),
        }
    }

    fn detach(&mut self, pipe: &Pipe) -> (bool, bool) {
        let out = self
            .nodes
            .get_mut(&pipe.source)
            .map(|entry| remove_pipe(&mut entry.outbound, pipe))
            .unwrap_or(false);
        let inb = self
            .nodes
            .get_mut(&pipe.target)
            .map(|entry| remove_pipe(&mut entry.inbound, pipe))
            .unwrap_or(false);
        (out, inb)
    }
}

fn remove_pipe(pipes: &mut Vec<Pipe>, pipe: &Pipe) -> bool {
    match pipes.iter().position(|p| p == pipe) {
        Some(index) => {
            pipes.remove(index);
            true
        }
        None => false,
    }
}

/// Shared registry of nodes and the pipes between them.
pub struct Fabric {
    registry: Mutex<Registry>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a node and assigns its id. Nodes call this from
    /// `Arc::new_cyclic`.
    pub fn register(&self, name: impl Into<String>, node: Weak<dyn Node>) -> NodeId {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = NodeId(registry.next_id);
        let name = name.into();
        trace!(node = %id, name = %name, "node registered");
        registry.nodes.insert(
            id,
            NodeEntry {
                name,
                node,
                outbound: Vec::new(),
                inbound: Vec::new(),
                log: VecDeque::new(),
            },
        );
        id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.lock().nodes.contains_key(&id)
    }

    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.lock().nodes.get(&id).map(|entry| entry.name.clone())
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Subscribes `this`'s `handler` to `source`'s `event`.
    pub fn pipe_from(&self, this: NodeId, source: NodeId, event: Surface, handler: Handler) -> bool {
        self.link(
            Pipe {
                source,
                event,
                target: this,
                handler,
            },
            this,
            "pipeFrom",
        )
    }

    /// Subscribes `target`'s `handler` to `this`'s `event`.
    pub fn pipe_to(&self, this: NodeId, target: NodeId, event: Surface, handler: Handler) -> bool {
        self.link(
            Pipe {
                source: this,
                event,
                target,
                handler,
            },
            this,
            "pipeTo",
        )
    }

    /// Removes a link created by [`Fabric::pipe_from`]. Returns false, and
    /// logs, if there is no such link.
    pub fn un_pipe_from(&self, this: NodeId, source: NodeId, event: Surface, handler: Handler) -> bool {
        self.unlink(
            Pipe {
                source,
                event,
                target: this,
                handler,
            },
            this,
            "unPipeFrom",
        )
    }

    /// Removes a link created by [`Fabric::pipe_to`]. Returns false, and
    /// logs, if there is no such link.
    pub fn un_pipe_to(&self, this: NodeId, target: NodeId, event: Surface, handler: Handler) -> bool {
        self.unlink(
            Pipe {
                source: this,
                event,
                target,
                handler,
            },
            this,
            "unPipeTo",
        )
    }

    fn link(&self, pipe: Pipe, owner: NodeId, op: &str) -> bool {
        let mut registry = self.lock();
        if !registry.nodes.contains_key(&pipe.source) || !registry.nodes.contains_key(&pipe.target) {
            debug!(%pipe, op, "pipe endpoint not registered");
            return registry.record(owner, pipe, format!("{}@find node", op), false);
        }
        let duplicate = registry
            .nodes
            .get(&pipe.source)
            .map(|entry| entry.outbound.contains(&pipe))
            .unwrap_or(false);
        if duplicate {
            debug!(%pipe, op, "already piped");
            return registry.record(owner, pipe, op, false);
        }
        if let Some(entry) = registry.nodes.get_mut(&pipe.source) {
            entry.outbound.push(pipe);
        }
        if let Some(entry) = registry.nodes.get_mut(&pipe.target) {
            entry.inbound.push(pipe);
        }
        trace!(%pipe, op, "piped");
        registry.record(owner, pipe, op, true)
    }

    fn unlink(&self, pipe: Pipe, owner: NodeId, op: &str) -> bool {
        let mut registry = self.lock();
        match registry.detach(&pipe) {
            (true, true) => {
                trace!(%pipe, op, "unpiped");
                registry.record(owner, pipe, op, true)
            }
            (false, false) => {
                debug!(%pipe, op, "no such pipe");
                registry.record(owner, pipe, format!("{}@find record", op), false)
            }
            _ => {
                debug!(%pipe, op, "pipe was recorded on one side only");
                registry.record(owner, pipe, format!("{}@remove target record", op), false)
            }
        }
    }

    pub fn has_pipe(&self, pipe: &Pipe) -> bool {
        self.lock()
            .nodes
            .get(&pipe.source)
            .map(|entry| entry.outbound.contains(pipe))
            .unwrap_or(false)
    }

    /// Pipes feeding `node`'s handlers.
    pub fn pipes_into(&self, node: NodeId) -> Vec<Pipe> {
        self.lock()
            .nodes
            .get(&node)
            .map(|entry| entry.inbound.clone())
            .unwrap_or_default()
    }

    /// Pipes consuming `node`'s events.
    pub fn pipes_out_of(&self, node: NodeId) -> Vec<Pipe> {
        self.lock()
            .nodes
            .get(&node)
            .map(|entry| entry.outbound.clone())
            .unwrap_or_default()
    }

    /// Removes every pipe attached to `node`, on both endpoints. Returns the
    /// number removed.
    pub fn un_pipe_all(&self, node: NodeId) -> usize {
        let mut registry = self.lock();
        let pipes: Vec<Pipe> = match registry.nodes.get(&node) {
            Some(entry) => entry.inbound.iter().chain(entry.outbound.iter()).copied().collect(),
            None => return 0,
        };
        let mut removed = 0;
        for pipe in pipes {
            let (out, inb) = registry.detach(&pipe);
            if out || inb {
                removed += 1;
            }
            registry.record(node, pipe, "unPipeAll", out && inb);
        }
        debug!(node = %node, removed, "unpiped all");
        removed
    }

    /// Unpipes and unregisters `node`, returning its operation log.
    pub fn destroy(&self, node: NodeId) -> Vec<PipeRecord> {
        self.un_pipe_all(node);
        match self.lock().nodes.remove(&node) {
            Some(entry) => {
                trace!(node = %node, name = %entry.name, "node destroyed");
                entry.log.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Human-readable dump of `node`'s pipe lists.
    pub fn pipe_debug(&self, node: NodeId) -> String {
        let registry = self.lock();
        let Some(entry) = registry.nodes.get(&node) else {
            return format!("{} is not registered", node);
        };
        let describe = |pipes: &[Pipe]| -> String {
            let items: Vec<String> = pipes
                .iter()
                .map(|p| {
                    format!(
                        "{} -{}-> {}.{}",
                        registry.label(p.source),
                        p.event,
                        registry.label(p.target),
                        p.handler
                    )
                })
                .collect();
            format!("[{}]", items.join(", "))
        };
        format!(
            "pipeFrom list: {}\npipeTo list: {}",
            describe(&entry.inbound),
            describe(&entry.outbound)
        )
    }

    /// Pipe operations performed by `node`, oldest first.
    pub fn pipe_log(&self, node: NodeId) -> Vec<PipeRecord> {
        self.lock()
            .nodes
            .get(&node)
            .map(|entry| entry.log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers `envelope` to every pipe subscribed to `source`'s `event`.
    ///
    /// The registry lock is released before handlers run, so handlers may
    /// rewire the fabric. Returns the number of deliveries.
    pub fn emit(&self, source: NodeId, event: Surface, envelope: &DataEnvelope) -> usize {
        let targets: Vec<(Handler, Weak<dyn Node>)> = {
            let registry = self.lock();
            let Some(entry) = registry.nodes.get(&source) else {
                return 0;
            };
            entry
                .outbound
                .iter()
                .filter(|pipe| pipe.event == event)
                .filter_map(|pipe| {
                    registry
                        .nodes
                        .get(&pipe.target)
                        .map(|target| (pipe.handler, target.node.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (handler, node) in targets {
            if let Some(node) = node.upgrade() {
                node.on_event(handler, envelope.clone());
                delivered += 1;
            }
        }
        delivered
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("nodes", &self.node_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::user::UserLevel;

    /// Node that records what it receives.
    pub(crate) struct Recorder {
        id: NodeId,
        fabric: Arc<Fabric>,
        pub(crate) received: Mutex<Vec<(Handler, DataEnvelope)>>,
    }

    impl Recorder {
        pub(crate) fn new(fabric: &Arc<Fabric>, name: &str) -> Arc<Self> {
            Arc::new_cyclic(|weak: &Weak<Self>| {
                let node: Weak<dyn Node> = weak.clone();
                Self {
                    id: fabric.register(name, node),
                    fabric: fabric.clone(),
                    received: Mutex::new(Vec::new()),
                }
            })
        }

        pub(crate) fn texts(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|(_, env)| env.text())
                .collect()
        }
    }

    impl Node for Recorder {
        fn id(&self) -> NodeId {
            self.id
        }

        fn fabric(&self) -> &Arc<Fabric> {
            &self.fabric
        }

        fn on_event(&self, handler: Handler, envelope: DataEnvelope) {
            self.received.lock().unwrap().push((handler, envelope));
        }
    }

    fn user() -> User {
        User::new("tester", UserLevel::Local)
    }

    #[test]
    fn test_pipe_to_delivers_output() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");

        assert!(fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output));
        a.output(DataEnvelope::new("hello", user()));

        assert_eq!(b.texts(), vec!["hello"]);
        assert!(a.texts().is_empty());
    }

    #[test]
    fn test_pipe_from_records_both_sides() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");

        assert!(fabric.pipe_from(b.id(), a.id(), Surface::Input, Handler::EchoInput));
        let pipe = Pipe {
            source: a.id(),
            event: Surface::Input,
            target: b.id(),
            handler: Handler::EchoInput,
        };
        assert!(fabric.has_pipe(&pipe));
        assert_eq!(fabric.pipes_out_of(a.id()), vec![pipe]);
        assert_eq!(fabric.pipes_into(b.id()), vec![pipe]);
    }

    #[test]
    fn test_repipe_is_noop() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");

        assert!(fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output));
        assert!(!fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output));
        assert!(!fabric.pipe_from(b.id(), a.id(), Surface::Output, Handler::Output));

        a.output(DataEnvelope::new("once", user()));
        assert_eq!(b.texts(), vec!["once"]);

        let log = fabric.pipe_log(a.id());
        assert_eq!(log.len(), 2);
        assert!(log[0].success);
        assert!(!log[1].success);
    }

    #[test]
    fn test_unpipe_twice_is_noop() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");

        fabric.pipe_from(b.id(), a.id(), Surface::Output, Handler::Input);
        assert!(fabric.un_pipe_from(b.id(), a.id(), Surface::Output, Handler::Input));
        assert!(!fabric.un_pipe_from(b.id(), a.id(), Surface::Output, Handler::Input));

        assert!(fabric.pipes_out_of(a.id()).is_empty());
        assert!(fabric.pipes_into(b.id()).is_empty());

        let log = fabric.pipe_log(b.id());
        assert_eq!(log.last().unwrap().op, "unPipeFrom@find record");
    }

    #[test]
    fn test_unpipe_unknown_node() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        assert!(!fabric.un_pipe_to(a.id(), NodeId(999), Surface::Output, Handler::Output));
        assert!(!fabric.pipe_to(a.id(), NodeId(999), Surface::Output, Handler::Output));
    }

    #[test]
    fn test_un_pipe_all_clears_both_endpoints() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");
        let c = Recorder::new(&fabric, "C");

        fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output);
        fabric.pipe_from(a.id(), c.id(), Surface::Input, Handler::Input);
        fabric.pipe_to(b.id(), c.id(), Surface::Output, Handler::Output);

        assert_eq!(fabric.un_pipe_all(a.id()), 2);
        assert!(fabric.pipes_into(b.id()).is_empty());
        assert!(fabric.pipes_out_of(c.id()).is_empty());
        assert_eq!(fabric.pipes_out_of(b.id()).len(), 1);
    }

    #[test]
    fn test_dropped_node_is_skipped() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");
        fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output);

        drop(b);
        assert_eq!(fabric.emit(a.id(), Surface::Output, &DataEnvelope::new("x", user())), 0);
    }

    #[test]
    fn test_destroy_unregisters() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");
        fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output);

        let log = fabric.destroy(a.id());
        assert!(!log.is_empty());
        assert!(!fabric.contains(a.id()));
        assert!(fabric.pipes_into(b.id()).is_empty());
        assert_eq!(fabric.node_count(), 1);
    }

    #[test]
    fn test_trace_grows_along_route() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "A");
        let b = Recorder::new(&fabric, "B");
        fabric.pipe_to(a.id(), b.id(), Surface::Input, Handler::Input);

        a.input(DataEnvelope::new("x", user()));
        let received = b.received.lock().unwrap();
        let hops = received[0].1.trace();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].node, a.id());
        assert_eq!(hops[0].surface, Surface::Input);
    }

    #[test]
    fn test_pipe_debug_lists_names() {
        let fabric = Fabric::new();
        let a = Recorder::new(&fabric, "Alpha");
        let b = Recorder::new(&fabric, "Beta");
        fabric.pipe_to(a.id(), b.id(), Surface::Output, Handler::Output);

        let dump = fabric.pipe_debug(a.id());
        assert!(dump.starts_with("pipeFrom list: []"));
        assert!(dump.contains("Alpha#"));
        assert!(dump.contains("Beta#"));
        assert!(dump.contains("-output->"));
    }

    #[test]
    fn test_envelope_options() {
        let env = DataEnvelope::new("", user()).with_option("token", "abc");
        assert_eq!(env.option("token"), Some("abc"));
        assert_eq!(env.option("missing"), None);
    }

    #[test]
    fn test_structured_payload_text() {
        let payload = Payload::from(serde_json::json!(["/help", "/version"]));
        assert!(payload.to_text().contains("/version"));
    }
}

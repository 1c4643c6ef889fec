//! Synchronization coordinator.
//!
//! One [`Coordinator`] actor owns one document. Every mutation, whether a
//! client edit, a remote operation, a snapshot, or a revert, is a message on
//! its channels and is applied one at a time, so the document needs no
//! locking. Network I/O never happens inside the actor. Two helper tasks
//! sit between it and the broker:
//!
//! - the publisher drains an ordered outbox, retrying each message with
//!   exponential backoff until the broker accepts it, so peers see
//!   operations in log order even across outages;
//! - the subscriber pulls from the topic, drops its own echoes and anything
//!   that fails signature verification, and feeds the rest to the actor.
//!   When the subscription ends it resubscribes with backoff.
//!
//! A replica that may have missed operations (buffer overflow, dependency
//! timeout, lost subscription, or a fresh start) publishes a sync request
//! carrying its version vector. Peers answer through the normal outbox with
//! every logged operation the requester lacks, each under the signature its
//! author gave it, so history outlives the replicas that wrote it. A
//! peer whose log no longer reaches back that far sends its whole state as
//! a checkpoint signed by itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::broker::Broker;
use crate::broker::Subscription;
use crate::config::Config;
use crate::crdt::clock::VersionVector;
use crate::crdt::id::Identifier;
use crate::crdt::op::Operation;
use crate::crdt::op::SignedOperation;
use crate::diff::diff;
use crate::document::Delivery;
use crate::document::Document;
use crate::error::Error;
use crate::error::Result;
use crate::key::ReplicaId;
use crate::key::ReplicaKey;
use crate::key::Signature;
use crate::log::Checkpoint;
use crate::snapshot::SnapshotId;
use crate::snapshot::SnapshotStore;

pub type ClientId = String;

/// Pushed to connected clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientUpdate {
    /// Replace the whole editor contents. Sent on connect, after a revert,
    /// and whenever the client's view may have diverged.
    FullState(String),
    /// The document changed.
    Text(String),
    /// Snapshot ids, most recent first.
    Snapshots(Vec<SnapshotId>),
    /// A request from this client failed.
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub replica: ReplicaId,
    pub clients: usize,
    pub len: usize,
    pub log_len: usize,
    pub pending: usize,
    pub snapshots: usize,
    pub version: VersionVector,
}

/// Messages on the broker topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Op(SignedOperation),
    Sync { replica: ReplicaId, version: VersionVector },
    /// Full state from `replica` for a peer its log cannot catch up.
    State {
        replica: ReplicaId,
        to: ReplicaId,
        checkpoint: Checkpoint,
        signature: Signature,
    },
}

enum Request {
    Connect {
        client: ClientId,
        reply: oneshot::Sender<mpsc::Receiver<ClientUpdate>>,
    },
    Disconnect {
        client: ClientId,
    },
    Edit {
        client: ClientId,
        text: String,
        cursor: Option<usize>,
        reply: oneshot::Sender<Result<()>>,
    },
    Text {
        reply: oneshot::Sender<String>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<SnapshotId>>,
    },
    CreateSnapshot {
        reply: oneshot::Sender<SnapshotId>,
    },
    Revert {
        client: Option<ClientId>,
        id: SnapshotId,
        reply: oneshot::Sender<Result<()>>,
    },
    CatchUp {
        from: VersionVector,
        reply: oneshot::Sender<Result<Vec<Operation>>>,
    },
    Deliver {
        op: Operation,
        reply: oneshot::Sender<Result<Delivery>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Shutdown,
}

/// Produced by the subscriber task.
enum Inbound {
    Remote(SignedOperation),
    Sync { replica: ReplicaId, version: VersionVector },
    State { replica: ReplicaId, checkpoint: Checkpoint },
    Resubscribed,
}

/// What a client last saw: its text and the id behind each character.
#[derive(Default)]
struct View {
    text: String,
    ids: Vec<Identifier>,
}

struct Client {
    updates: mpsc::Sender<ClientUpdate>,
    view: View,
}

#[derive(Clone, Copy, Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    fn next(&self, delay: Duration) -> Duration {
        return (delay * 2).min(self.max);
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap, cloneable access to a running coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorHandle {
    replica: ReplicaId,
    topic: String,
    requests: mpsc::Sender<Request>,
}

impl CoordinatorHandle {
    pub fn replica(&self) -> ReplicaId {
        return self.replica;
    }

    pub fn topic(&self) -> &str {
        return &self.topic;
    }

    pub fn is_closed(&self) -> bool {
        return self.requests.is_closed();
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| Error::CoordinatorClosed)?;
        return rx.await.map_err(|_| Error::CoordinatorClosed);
    }

    /// Attach a client. The first update on the returned channel is the
    /// current text as [`ClientUpdate::FullState`].
    pub async fn connect(&self, client: impl Into<ClientId>) -> Result<mpsc::Receiver<ClientUpdate>> {
        let client = client.into();
        return self.call(|reply| Request::Connect { client, reply }).await;
    }

    /// Stop forwarding to a client. The document is unaffected.
    pub async fn disconnect(&self, client: impl Into<ClientId>) -> Result<()> {
        let client = client.into();
        return self
            .requests
            .send(Request::Disconnect { client })
            .await
            .map_err(|_| Error::CoordinatorClosed);
    }

    /// Submit the client's full editor text after a change. `cursor` is the
    /// caret position in `text`, in characters.
    pub async fn edit(
        &self,
        client: impl Into<ClientId>,
        text: impl Into<String>,
        cursor: Option<usize>,
    ) -> Result<()> {
        let (client, text) = (client.into(), text.into());
        return self
            .call(|reply| Request::Edit { client, text, cursor, reply })
            .await?;
    }

    pub async fn current_text(&self) -> Result<String> {
        return self.call(|reply| Request::Text { reply }).await;
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        return self.call(|reply| Request::Snapshots { reply }).await;
    }

    pub async fn request_snapshot(&self) -> Result<SnapshotId> {
        return self.call(|reply| Request::CreateSnapshot { reply }).await;
    }

    /// Revert to a snapshot. On failure `client`, if given, is also told.
    pub async fn request_revert(&self, client: Option<ClientId>, id: SnapshotId) -> Result<()> {
        return self.call(|reply| Request::Revert { client, id, reply }).await?;
    }

    /// Logged operations a peer at `from` has not seen.
    pub async fn catch_up(&self, from: VersionVector) -> Result<Vec<Operation>> {
        return self.call(|reply| Request::CatchUp { from, reply }).await?;
    }

    /// Apply a remote operation obtained outside the broker.
    pub async fn deliver(&self, op: Operation) -> Result<Delivery> {
        return self.call(|reply| Request::Deliver { op, reply }).await?;
    }

    pub async fn status(&self) -> Result<Status> {
        return self.call(|reply| Request::Status { reply }).await;
    }

    pub async fn shutdown(&self) -> Result<()> {
        return self
            .requests
            .send(Request::Shutdown)
            .await
            .map_err(|_| Error::CoordinatorClosed);
    }
}

// =============================================================================
// Actor
// =============================================================================

pub struct Coordinator {
    topic: String,
    doc: Document,
    /// Author signatures of logged operations, for relaying them.
    signatures: FxHashMap<(ReplicaId, u64), Signature>,
    snapshots: SnapshotStore,
    clients: HashMap<ClientId, Client>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    request_rx: mpsc::Receiver<Request>,
    inbound_rx: mpsc::Receiver<Inbound>,
    subscriber: JoinHandle<()>,
    client_capacity: usize,
    dependency_timeout: Duration,
    sweep_interval: Duration,
    compact_log: bool,
}

impl Coordinator {
    /// Start a coordinator for `topic` and return its handle.
    ///
    /// The topic is subscribed before this returns (unless the broker is
    /// down, in which case the subscriber keeps retrying), so nothing
    /// published afterwards is missed.
    pub async fn spawn(
        topic: impl Into<String>,
        key: ReplicaKey,
        broker: Arc<dyn Broker>,
        config: &Config,
    ) -> CoordinatorHandle {
        let topic = topic.into();
        let replica = key.id();
        let backoff = Backoff {
            initial: config.broker.retry_initial(),
            max: config.broker.retry_max(),
        };

        let first = match broker.subscribe(&topic).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(%topic, %e, "initial subscribe failed, retrying in background");
                None
            }
        };

        let (request_tx, request_rx) = mpsc::channel(config.sync.request_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.sync.request_capacity.max(1));
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        tokio::spawn(publish_loop(broker.clone(), topic.clone(), outbox_rx, backoff));
        let subscriber = tokio::spawn(subscribe_loop(
            broker,
            topic.clone(),
            replica,
            first,
            inbound_tx,
            backoff,
        ));

        let actor = Coordinator {
            topic: topic.clone(),
            doc: Document::new(key, config.sync.pending_capacity),
            signatures: FxHashMap::default(),
            snapshots: SnapshotStore::new(),
            clients: HashMap::new(),
            outbox,
            request_rx,
            inbound_rx,
            subscriber,
            client_capacity: config.sync.client_capacity.max(1),
            dependency_timeout: config.sync.dependency_timeout(),
            sweep_interval: config.sync.sweep_interval(),
            compact_log: config.snapshot.compact_log,
        };
        tokio::spawn(actor.run());

        return CoordinatorHandle { replica, topic, requests: request_tx };
    }

    async fn run(mut self) {
        info!(topic = %self.topic, replica = ?self.doc.replica(), "coordinator started");
        self.request_sync();

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = self.request_rx.recv() => {
                    match req {
                        Some(Request::Shutdown) | None => break,
                        Some(req) => self.handle_request(req),
                    }
                }
                Some(msg) = self.inbound_rx.recv() => {
                    self.handle_inbound(msg);
                }
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }

        self.subscriber.abort();
        info!(topic = %self.topic, "coordinator stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { client, reply } => {
                let rx = self.connect(client);
                let _ = reply.send(rx);
            }
            Request::Disconnect { client } => {
                if self.clients.remove(&client).is_some() {
                    info!(topic = %self.topic, %client, "client disconnected");
                }
            }
            Request::Edit { client, text, cursor, reply } => {
                let result = self.on_local_edit(&client, &text, cursor);
                if let Err(e) = &result {
                    self.reply_error(&client, e);
                }
                let _ = reply.send(result);
            }
            Request::Text { reply } => {
                let _ = reply.send(self.doc.materialize());
            }
            Request::Snapshots { reply } => {
                let _ = reply.send(self.snapshots.list());
            }
            Request::CreateSnapshot { reply } => {
                let _ = reply.send(self.on_snapshot_request());
            }
            Request::Revert { client, id, reply } => {
                let result = self.on_revert_request(id);
                if let (Err(e), Some(client)) = (&result, &client) {
                    self.reply_error(client, e);
                }
                let _ = reply.send(result);
            }
            Request::CatchUp { from, reply } => {
                let _ = reply.send(self.doc.catch_up(&from));
            }
            Request::Deliver { op, reply } => {
                let _ = reply.send(self.on_remote_operation(op, None));
            }
            Request::Status { reply } => {
                let _ = reply.send(Status {
                    replica: self.doc.replica(),
                    clients: self.clients.len(),
                    len: self.doc.len(),
                    log_len: self.doc.log().len(),
                    pending: self.doc.pending_len(),
                    snapshots: self.snapshots.len(),
                    version: self.doc.version().clone(),
                });
            }
            Request::Shutdown => {}
        }
    }

    fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Remote(SignedOperation { op, signature }) => {
                if let Err(e) = self.on_remote_operation(op, Some(signature)) {
                    warn!(topic = %self.topic, %e, "remote operation rejected");
                }
            }
            Inbound::Sync { replica, version } => self.answer_sync(replica, &version),
            Inbound::State { replica, checkpoint } => self.on_state(replica, checkpoint),
            Inbound::Resubscribed => self.request_sync(),
        }
    }

    // =========================================================================
    // Clients
    // =========================================================================

    fn connect(&mut self, client: ClientId) -> mpsc::Receiver<ClientUpdate> {
        let (tx, rx) = mpsc::channel(self.client_capacity);
        let text = self.doc.materialize();
        let view = match tx.try_send(ClientUpdate::FullState(text.clone())) {
            Ok(()) => View { text, ids: self.doc.sequence().live_ids() },
            Err(_) => View::default(),
        };
        if !self.snapshots.is_empty() {
            let _ = tx.try_send(ClientUpdate::Snapshots(self.snapshots.list()));
        }
        info!(topic = %self.topic, %client, "client connected");
        self.clients.insert(client, Client { updates: tx, view });
        return rx;
    }

    /// Push the current text to every client whose view is out of date.
    /// Clients in `full` get it as [`ClientUpdate::FullState`] even if
    /// their view already matches.
    fn push_text(&mut self, full: &[&str]) {
        let text = self.doc.materialize();
        let ids = self.doc.sequence().live_ids();
        let mut closed = Vec::new();

        for (id, client) in self.clients.iter_mut() {
            let forced = full.contains(&id.as_str());
            if !forced && client.view.text == text {
                continue;
            }
            let update = if forced {
                ClientUpdate::FullState(text.clone())
            } else {
                ClientUpdate::Text(text.clone())
            };
            match client.updates.try_send(update) {
                Ok(()) => {
                    client.view = View { text: text.clone(), ids: ids.clone() };
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(client = %id, "client is behind, update skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id.clone()),
            }
        }

        for id in closed {
            self.clients.remove(&id);
            info!(topic = %self.topic, client = %id, "client channel closed");
        }
    }

    fn push_full_state_to_all(&mut self) {
        let all: Vec<String> = self.clients.keys().cloned().collect();
        let all: Vec<&str> = all.iter().map(String::as_str).collect();
        self.push_text(&all);
    }

    fn push_to_all(&mut self, update: ClientUpdate) {
        for client in self.clients.values() {
            let _ = client.updates.try_send(update.clone());
        }
    }

    fn reply_error(&self, client: &str, e: &Error) {
        if let Some(client) = self.clients.get(client) {
            let _ = client.updates.try_send(ClientUpdate::Error(e.to_string()));
        }
    }

    // =========================================================================
    // Edits
    // =========================================================================

    /// Apply a client's new text.
    ///
    /// The diff is taken against what the client last saw, and its ranges
    /// are mapped through element ids, so an edit made on a stale view
    /// lands in the right place even if remote operations arrived since.
    fn on_local_edit(&mut self, client: &str, text: &str, cursor: Option<usize>) -> Result<()> {
        let view = match self.clients.get(client) {
            Some(c) if c.view.ids.len() == c.view.text.chars().count() => {
                View { text: c.view.text.clone(), ids: c.view.ids.clone() }
            }
            _ => View { text: self.doc.materialize(), ids: self.doc.sequence().live_ids() },
        };

        let mut ops = Vec::new();
        let result = self.rebase(&view, text, cursor, &mut ops);
        for op in &ops {
            self.publish_op(op);
        }
        result?;
        if ops.is_empty() {
            return Ok(());
        }

        let materialized = self.doc.materialize();
        let ids = self.doc.sequence().live_ids();
        if let Some(c) = self.clients.get_mut(client) {
            c.view = View { text: materialized.clone(), ids };
        }
        if materialized == text {
            self.push_text(&[]);
        } else {
            debug!(%client, "client view diverged, sending full state");
            self.push_text(&[client]);
        }
        return Ok(());
    }

    /// Turn the change from `view` to `text` into local operations.
    fn rebase(
        &mut self,
        view: &View,
        text: &str,
        cursor: Option<usize>,
        ops: &mut Vec<Operation>,
    ) -> Result<()> {
        let edit = diff(&view.text, text, cursor);
        if edit.is_noop() {
            return Ok(());
        }

        let removed = view
            .ids
            .get(edit.start..edit.start + edit.delete)
            .ok_or_else(|| Error::Inconsistent("client view out of range".to_string()))?;
        for id in removed {
            if !self.doc.sequence().is_live(id) {
                continue;
            }
            let pos = self
                .doc
                .sequence()
                .position_after(id)
                .ok_or_else(|| Error::Inconsistent(format!("live element {id:?} has no position")))?;
            ops.push(self.doc.delete_local(pos - 1)?);
        }

        let at = match edit.start {
            0 => 0,
            start => self
                .doc
                .sequence()
                .position_after(&view.ids[start - 1])
                .ok_or_else(|| Error::Inconsistent("edit anchor vanished".to_string()))?,
        };
        for (i, value) in edit.insert.chars().enumerate() {
            ops.push(self.doc.insert_local(at + i, value)?);
        }

        debug!(
            topic = %self.topic,
            start = edit.start,
            deleted = edit.delete,
            inserted = edit.insert.chars().count(),
            "edit applied"
        );
        return Ok(());
    }

    /// Apply an operation from a peer. Without `signature` the operation
    /// can still be applied but this replica cannot relay it.
    fn on_remote_operation(&mut self, op: Operation, signature: Option<Signature>) -> Result<Delivery> {
        let key = op.key();
        let delivery = match self.doc.apply_remote(op, Instant::now()) {
            Ok(delivery) => delivery,
            Err(Error::Inconsistent(reason)) => {
                self.recover(&reason);
                return Err(Error::Inconsistent(reason));
            }
            Err(e) => return Err(e),
        };

        if delivery != Delivery::Duplicate {
            if let Some(signature) = signature {
                self.signatures.entry(key).or_insert(signature);
            }
        }
        match &delivery {
            Delivery::Applied(ops) => {
                debug!(replica = ?key.0, seq = key.1, applied = ops.len(), "remote operation applied");
                self.push_text(&[]);
            }
            Delivery::Buffered => {
                debug!(replica = ?key.0, seq = key.1, pending = self.doc.pending_len(), "operation buffered");
            }
            Delivery::Duplicate => {
                debug!(replica = ?key.0, seq = key.1, "duplicate dropped");
            }
        }
        if self.doc.needs_resync() {
            self.request_sync();
        }
        return Ok(delivery);
    }

    /// Rebuild the document from its log after an internal inconsistency.
    fn recover(&mut self, reason: &str) {
        error!(topic = %self.topic, reason, "document inconsistent, rebuilding from log");
        match self.doc.rebuild() {
            Ok(doc) => {
                self.doc = doc;
                self.push_full_state_to_all();
            }
            Err(e) => error!(topic = %self.topic, %e, "rebuild failed"),
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    fn on_snapshot_request(&mut self) -> SnapshotId {
        let snapshot = self.snapshots.create(&self.doc);
        let id = snapshot.id;
        let checkpoint = snapshot.checkpoint.clone();
        if self.compact_log {
            if let Some(checkpoint) = checkpoint {
                let dropped = self.doc.compact(checkpoint);
                self.prune_signatures();
                info!(topic = %self.topic, %id, dropped, "log compacted");
            }
        }
        self.push_to_all(ClientUpdate::Snapshots(self.snapshots.list()));
        return id;
    }

    fn on_revert_request(&mut self, id: SnapshotId) -> Result<()> {
        let text = self.snapshots.text_of(id)?.to_string();
        let op = self.doc.replace_local(&text)?;
        info!(topic = %self.topic, %id, seq = op.seq, "reverted to snapshot");
        self.publish_op(&op);
        self.push_full_state_to_all();
        return Ok(());
    }

    // =========================================================================
    // Broker traffic
    // =========================================================================

    fn publish(&self, envelope: &Envelope) {
        match serde_json::to_vec(envelope) {
            Ok(bytes) => {
                let _ = self.outbox.send(bytes);
            }
            Err(e) => error!(topic = %self.topic, %e, "failed to encode message"),
        }
    }

    fn publish_op(&mut self, op: &Operation) {
        match op.clone().sign(self.doc.key()) {
            Ok(signed) => {
                self.signatures.insert(op.key(), signed.signature.clone());
                self.publish(&Envelope::Op(signed));
            }
            Err(e) => error!(topic = %self.topic, %e, seq = op.seq, "failed to sign operation"),
        }
    }

    /// Forget signatures of operations folded into the log base.
    fn prune_signatures(&mut self) {
        if let Some(base) = self.doc.log().checkpoint() {
            let version = &base.version;
            self.signatures.retain(|(replica, seq), _| !version.contains(replica, *seq));
        }
    }

    fn request_sync(&mut self) {
        self.doc.clear_resync();
        debug!(topic = %self.topic, "requesting sync from peers");
        self.publish(&Envelope::Sync {
            replica: self.doc.replica(),
            version: self.doc.version().clone(),
        });
    }

    /// Send `replica` whatever it lacks, and ask for a sync in turn if it
    /// has seen something we have not.
    fn answer_sync(&mut self, replica: ReplicaId, version: &VersionVector) {
        if !version.dominates(self.doc.version()) {
            match self.signed_since(version) {
                Some(missing) => {
                    debug!(peer = ?replica, ops = missing.len(), "answering sync request");
                    for signed in missing {
                        self.publish(&Envelope::Op(signed));
                    }
                }
                None => self.send_state(replica),
            }
        }
        if !self.doc.version().dominates(version) {
            self.request_sync();
        }
    }

    /// Logged operations missing from `version`, each with its author's
    /// signature. `None` if the log is compacted past `version` or holds an
    /// operation from another replica whose signature is unknown.
    fn signed_since(&self, version: &VersionVector) -> Option<Vec<SignedOperation>> {
        let ops = match self.doc.catch_up(version) {
            Ok(ops) => ops,
            Err(e) => {
                debug!(topic = %self.topic, %e, "log cannot serve sync request");
                return None;
            }
        };
        let me = self.doc.replica();
        let mut signed = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(signature) = self.signatures.get(&op.key()) {
                signed.push(SignedOperation { op, signature: signature.clone() });
                continue;
            }
            if op.replica != me {
                debug!(replica = ?op.replica, seq = op.seq, "no signature to relay operation");
                return None;
            }
            match op.sign(self.doc.key()) {
                Ok(op) => signed.push(op),
                Err(e) => {
                    error!(topic = %self.topic, %e, "failed to sign operation");
                    return None;
                }
            }
        }
        return Some(signed);
    }

    /// Send the whole current state to `to`.
    fn send_state(&self, to: ReplicaId) {
        let checkpoint = self.doc.checkpoint();
        let signature = match checkpoint.digest(&to) {
            Ok(digest) => self.doc.key().sign(&digest),
            Err(e) => {
                error!(topic = %self.topic, %e, "failed to encode state");
                return;
            }
        };
        info!(topic = %self.topic, peer = ?to, elements = checkpoint.elements.len(), "sending full state");
        self.publish(&Envelope::State {
            replica: self.doc.replica(),
            to,
            checkpoint,
            signature,
        });
    }

    fn on_state(&mut self, replica: ReplicaId, checkpoint: Checkpoint) {
        match self.doc.install(checkpoint, Instant::now()) {
            Ok(true) => {
                info!(topic = %self.topic, peer = ?replica, "installed peer state");
                self.prune_signatures();
                self.push_full_state_to_all();
            }
            Ok(false) => debug!(peer = ?replica, "peer state already covered"),
            Err(Error::Inconsistent(reason)) => self.recover(&reason),
            Err(e) => warn!(topic = %self.topic, peer = ?replica, %e, "cannot install peer state"),
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    fn sweep(&mut self, now: Instant) {
        let expired = self.doc.expire_pending(now, self.dependency_timeout);
        for e in &expired {
            warn!(topic = %self.topic, %e, "dropping operation");
        }
        if self.doc.needs_resync() {
            self.request_sync();
            self.push_full_state_to_all();
        }
    }
}

async fn publish_loop(
    broker: Arc<dyn Broker>,
    topic: String,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    backoff: Backoff,
) {
    while let Some(payload) = outbox.recv().await {
        let mut delay = backoff.initial;
        loop {
            match broker.publish(&topic, payload.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(%topic, %e, retry_in = ?delay, "publish failed");
                    tokio::time::sleep(delay).await;
                    delay = backoff.next(delay);
                }
            }
        }
    }
}

async fn subscribe_loop(
    broker: Arc<dyn Broker>,
    topic: String,
    me: ReplicaId,
    mut subscription: Option<Subscription>,
    inbound: mpsc::Sender<Inbound>,
    backoff: Backoff,
) {
    let mut delay = backoff.initial;
    loop {
        let mut sub = match subscription.take() {
            Some(sub) => sub,
            None => match broker.subscribe(&topic).await {
                Ok(sub) => {
                    info!(%topic, "resubscribed");
                    delay = backoff.initial;
                    if inbound.send(Inbound::Resubscribed).await.is_err() {
                        return;
                    }
                    sub
                }
                Err(e) => {
                    warn!(%topic, %e, retry_in = ?delay, "subscribe failed");
                    tokio::time::sleep(delay).await;
                    delay = backoff.next(delay);
                    continue;
                }
            },
        };

        while let Some(bytes) = sub.recv().await {
            let Some(msg) = decode(&bytes, me) else {
                continue;
            };
            if inbound.send(msg).await.is_err() {
                return;
            }
        }
        warn!(%topic, "subscription ended");
    }
}

fn decode(bytes: &[u8], me: ReplicaId) -> Option<Inbound> {
    let envelope: Envelope = match serde_json::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(%e, "skipping undecodable message");
            return None;
        }
    };
    match envelope {
        Envelope::Op(signed) => {
            if signed.op.replica == me {
                return None;
            }
            if let Err(e) = signed.verify() {
                warn!(%e, "dropping operation");
                return None;
            }
            return Some(Inbound::Remote(signed));
        }
        Envelope::Sync { replica, version } => {
            if replica == me {
                return None;
            }
            return Some(Inbound::Sync { replica, version });
        }
        Envelope::State { replica, to, checkpoint, signature } => {
            if to != me || replica == me {
                return None;
            }
            let verified = checkpoint
                .digest(&me)
                .is_ok_and(|digest| replica.verify(&digest, &signature));
            if !verified {
                warn!(peer = ?replica, "dropping state with a bad signature");
                return None;
            }
            return Some(Inbound::State { replica, checkpoint });
        }
    }
}

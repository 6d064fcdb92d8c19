//! Batching writer.
//!
//! A writer owns a queue of nodes. `write_node` queues a node after its
//! unwritten dependencies (depth-first, post-order), so the queue is always
//! in dependency order. The front of the queue whose references are already
//! stored, or earlier in the same prefix, forms the *ready prefix*; once it
//! would exceed `max_blob_size` it is cut into a batch and written as one
//! bundle by a spawned task.
//!
//! Batches of one writer publish in the order they were cut: each batch task
//! waits for its predecessor before writing, and a failed batch fails every
//! batch chained behind it. Nodes of failed batches return to the queue in
//! their original order, so the next `flush` retries them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use cairn_bundle::BundleFormat;
use cairn_types::{BlobLocator, IoHash, RefName, RefTarget};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::batch::{encode_batch, BatchNode, BatchRef, EncodedBatch};
use crate::client::ClientInner;
use crate::config::{ResolvedOptions, WriterOptions};
use crate::error::{StorageError, StorageResult};
use crate::handle::BlobHandle;
use crate::node::{ExportLocation, NodeArena, NodeId, NodeState, WriterId};

type BatchFuture = Shared<BoxFuture<'static, Result<(), Arc<StorageError>>>>;

/// Notification sent from a child writer to its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriterEvent {
    Published {
        writer: WriterId,
        sequence: u64,
        nodes: usize,
    },
}

#[derive(Clone, Copy, Debug)]
struct QueuedNode {
    id: NodeId,
    /// Enqueue order, used to restore the queue after a failed batch.
    seq: u64,
    length: u64,
}

#[derive(Default)]
struct WriterState {
    queue: Vec<QueuedNode>,
    /// Length of the ready prefix of `queue`.
    ready: usize,
    ready_bytes: u64,
    ready_set: HashSet<NodeId>,
    /// Queued plus in-flight bytes.
    pending_bytes: u64,
    next_seq: u64,
    last_batch: Option<BatchFuture>,
    /// Highest bundle sequence published by this writer or its children.
    latest_sequence: u64,
}

struct PendingBatch {
    entries: Vec<QueuedNode>,
    nodes: Vec<BatchNode>,
    /// Re-export of an already stored node; nothing to re-queue on failure.
    rewrite: bool,
}

impl PendingBatch {
    fn bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.length).sum()
    }
}

enum Plan {
    Done,
    Queue(Vec<NodeId>),
    Flush(WriterId),
    Mount(BlobLocator),
}

enum Stop {
    /// The next node references something not yet stored.
    Blocked,
    /// The next node would overflow the batch.
    Full,
    End,
}

pub(crate) struct WriterShared {
    id: WriterId,
    client: Arc<ClientInner>,
    options: ResolvedOptions,
    state: Mutex<WriterState>,
    children: Mutex<Vec<Weak<WriterShared>>>,
    events_tx: mpsc::UnboundedSender<WriterEvent>,
    events: Mutex<mpsc::UnboundedReceiver<WriterEvent>>,
    parent: Option<mpsc::UnboundedSender<WriterEvent>>,
}

/// Queues nodes and writes them to the backend in bundles.
pub struct BundleWriter {
    shared: Arc<WriterShared>,
}

impl BundleWriter {
    pub(crate) fn create(client: &Arc<ClientInner>, options: &WriterOptions) -> StorageResult<Self> {
        let resolved = options.resolve(&client.config)?;
        Ok(Self::with_options(client, resolved, None))
    }

    fn with_options(
        client: &Arc<ClientInner>,
        options: ResolvedOptions,
        parent: Option<mpsc::UnboundedSender<WriterEvent>>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(WriterShared {
            id: client.next_writer_id(),
            client: Arc::clone(client),
            options,
            state: Mutex::new(WriterState::default()),
            children: Mutex::new(Vec::new()),
            events_tx,
            events: Mutex::new(events),
            parent,
        });
        client.register_writer(&shared);
        Self { shared }
    }

    pub fn id(&self) -> WriterId {
        self.shared.id
    }

    pub fn format(&self) -> BundleFormat {
        self.shared.options.format
    }

    /// Writer with the same options whose nodes are flushed before this
    /// writer's.
    pub fn create_child(&self) -> BundleWriter {
        let child = Self::with_options(
            &self.shared.client,
            self.shared.options.clone(),
            Some(self.shared.events_tx.clone()),
        );
        self.shared
            .children
            .lock()
            .push(Arc::downgrade(&child.shared));
        child
    }

    /// Create a node and queue it on this writer.
    pub async fn add_node(
        &self,
        data: impl Into<Bytes>,
        references: &[BlobHandle],
    ) -> StorageResult<BlobHandle> {
        let handle = self.shared.client.create_node(data.into(), references)?;
        self.write_node(&handle).await?;
        Ok(handle)
    }

    /// Queue a node and every unwritten node it depends on.
    pub async fn write_node(&self, handle: &BlobHandle) -> StorageResult<()> {
        self.shared.write_node(handle).await
    }

    /// Write every queued node, children first.
    pub async fn flush(&self) -> StorageResult<()> {
        self.shared.flush().await
    }

    /// Flush `root` and publish it under `name`. The root ends up in the last
    /// bundle written by this writer tree.
    pub async fn write_ref(&self, name: &RefName, root: &BlobHandle) -> StorageResult<()> {
        self.shared.write_ref(name, root).await
    }

    /// Nodes waiting in the queue, not counting batches in flight.
    pub fn queued_nodes(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Bytes queued or in flight.
    pub fn pending_bytes(&self) -> u64 {
        self.shared.state.lock().pending_bytes
    }
}

impl fmt::Debug for BundleWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleWriter")
            .field("id", &self.shared.id)
            .field("format", &self.shared.options.format)
            .finish()
    }
}

impl WriterShared {
    pub(crate) fn id(&self) -> WriterId {
        self.id
    }

    fn check_client(&self, handle: &BlobHandle) -> StorageResult<()> {
        if handle.belongs_to(&self.client) {
            Ok(())
        } else {
            Err(StorageError::InvalidLocator(
                "handle belongs to a different storage client".into(),
            ))
        }
    }

    async fn write_node(self: &Arc<Self>, handle: &BlobHandle) -> StorageResult<()> {
        self.check_client(handle)?;
        let Some(root) = handle.resolve()? else {
            // Raw blobs are stored already.
            return Ok(());
        };

        let mut flushed = HashSet::new();
        let mut mounted = HashSet::new();
        loop {
            let plan = {
                let nodes = self.client.nodes.lock();
                self.plan(&nodes, root)?
            };
            match plan {
                Plan::Done => break,
                Plan::Queue(order) => {
                    if self.enqueue(&order)? {
                        break;
                    }
                }
                Plan::Flush(writer) => {
                    if !flushed.insert(writer) {
                        return Err(StorageError::NotQueued { node: root, writer });
                    }
                    self.client.flush_writer(writer).await?;
                }
                Plan::Mount(bundle) => {
                    if !mounted.insert(bundle.clone()) {
                        return Err(StorageError::InvalidLocator(format!(
                            "{bundle} does not contain a referenced export"
                        )));
                    }
                    self.client.mount(&bundle).await?;
                }
            }
        }

        let pending = self.state.lock().pending_bytes;
        if pending > self.options.max_queue_bytes {
            debug!(writer = %self.id, bytes = pending, "queue over limit, flushing");
            self.flush().await?;
        }
        Ok(())
    }

    /// Find what has to happen before `root` can be queued: the unassigned
    /// nodes to queue in dependency order, or another writer to flush, or a
    /// bundle to mount.
    fn plan(&self, nodes: &NodeArena, root: NodeId) -> StorageResult<Plan> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(root, false)];

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            let record = nodes.get(id)?;
            match &record.state {
                NodeState::InMemory { owner: None, .. } => {
                    stack.push((id, true));
                    for reference in record.references.iter().rev() {
                        if !visited.contains(reference) {
                            stack.push((*reference, false));
                        }
                    }
                }
                NodeState::InMemory {
                    owner: Some(owner), ..
                }
                | NodeState::Writing { owner, .. }
                    if *owner != self.id =>
                {
                    return Ok(Plan::Flush(*owner));
                }
                NodeState::Imported { bundle, .. } if id != root => {
                    return Ok(Plan::Mount(bundle.clone()));
                }
                _ => {}
            }
        }

        Ok(if order.is_empty() {
            Plan::Done
        } else {
            Plan::Queue(order)
        })
    }

    /// Claim `order` for this writer. Returns false if another writer got to
    /// any of the nodes first.
    fn enqueue(self: &Arc<Self>, order: &[NodeId]) -> StorageResult<bool> {
        let mut state = self.state.lock();
        {
            let mut nodes = self.client.nodes.lock();
            for id in order {
                if !matches!(nodes.get(*id)?.state, NodeState::InMemory { owner: None, .. }) {
                    return Ok(false);
                }
            }
            for id in order {
                nodes.assign(*id, self.id)?;
                let length = nodes.get(*id)?.length();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(QueuedNode {
                    id: *id,
                    seq,
                    length,
                });
                state.pending_bytes += length;
            }
        }
        trace!(writer = %self.id, nodes = order.len(), "queued nodes");
        self.schedule(&mut state, false)?;
        Ok(true)
    }

    /// Extend the ready prefix and dispatch full batches. With `drain`, a
    /// non-empty prefix is dispatched even when it is not full.
    fn schedule(self: &Arc<Self>, state: &mut WriterState, drain: bool) -> StorageResult<usize> {
        self.drain_events(state);
        let mut dispatched = 0;
        loop {
            let batch = {
                let mut nodes = self.client.nodes.lock();
                match self.extend_ready(state, &nodes)? {
                    Stop::Full => Some(self.cut(state, &mut nodes)?),
                    Stop::Blocked | Stop::End if drain && state.ready > 0 => {
                        Some(self.cut(state, &mut nodes)?)
                    }
                    _ => None,
                }
            };
            match batch {
                Some(batch) => {
                    self.dispatch(state, batch);
                    dispatched += 1;
                }
                None => return Ok(dispatched),
            }
        }
    }

    fn extend_ready(&self, state: &mut WriterState, nodes: &NodeArena) -> StorageResult<Stop> {
        while state.ready < state.queue.len() {
            let entry = state.queue[state.ready];
            let record = nodes.get(entry.id)?;
            let ready = record.references.iter().all(|reference| {
                match nodes.get(*reference).map(|r| &r.state) {
                    Ok(NodeState::Exported(_)) => true,
                    Ok(NodeState::InMemory {
                        owner: Some(owner), ..
                    }) if *owner == self.id => state.ready_set.contains(reference),
                    _ => false,
                }
            });
            if !ready {
                return Ok(Stop::Blocked);
            }
            if state.ready > 0 && state.ready_bytes + entry.length > self.options.max_blob_size {
                return Ok(Stop::Full);
            }
            state.ready += 1;
            state.ready_bytes += entry.length;
            state.ready_set.insert(entry.id);
        }
        Ok(Stop::End)
    }

    /// Take the ready prefix off the queue as a batch.
    fn cut(&self, state: &mut WriterState, nodes: &mut NodeArena) -> StorageResult<PendingBatch> {
        let entries = state.queue[..state.ready].to_vec();
        let positions: HashMap<NodeId, usize> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.id, index))
            .collect();

        let mut batch = Vec::with_capacity(entries.len());
        for entry in &entries {
            let record = nodes.get(entry.id)?;
            let NodeState::InMemory { data, .. } = &record.state else {
                return Err(StorageError::NotQueued {
                    node: entry.id,
                    writer: self.id,
                });
            };
            let references = record
                .references
                .iter()
                .map(|reference| batch_ref(nodes, &positions, *reference))
                .collect::<StorageResult<Vec<_>>>()?;
            batch.push(BatchNode {
                hash: record.hash,
                data: data.clone(),
                references,
            });
        }

        for entry in &entries {
            nodes.start_writing(entry.id, self.id)?;
        }
        state.queue.drain(..state.ready);
        state.ready = 0;
        state.ready_bytes = 0;
        state.ready_set.clear();
        Ok(PendingBatch {
            entries,
            nodes: batch,
            rewrite: false,
        })
    }

    fn dispatch(self: &Arc<Self>, state: &mut WriterState, batch: PendingBatch) {
        // A predecessor whose failure was already reported does not hold up
        // new batches.
        let previous = state
            .last_batch
            .take()
            .filter(|b| !matches!(b.peek(), Some(Err(_))));
        debug!(
            writer = %self.id,
            nodes = batch.entries.len(),
            bytes = batch.bytes(),
            "dispatching batch"
        );
        let writer = Arc::clone(self);
        let task = tokio::spawn(async move { writer.run_batch(batch, previous).await });
        let done = async move {
            task.await.unwrap_or_else(|e| {
                Err(Arc::new(StorageError::Internal(format!(
                    "batch task failed: {e}"
                ))))
            })
        }
        .boxed()
        .shared();
        state.last_batch = Some(done);
    }

    async fn run_batch(
        self: Arc<Self>,
        batch: PendingBatch,
        previous: Option<BatchFuture>,
    ) -> Result<(), Arc<StorageError>> {
        match self.write_batch(&batch, previous).await {
            Ok(()) => {
                let mut state = self.state.lock();
                if let Err(err) = self.schedule(&mut state, false) {
                    warn!(writer = %self.id, error = %err, "failed to schedule after publish");
                }
                Ok(())
            }
            Err(err) => {
                warn!(
                    writer = %self.id,
                    nodes = batch.entries.len(),
                    error = %err,
                    "batch failed, nodes re-queued"
                );
                self.requeue(&batch);
                Err(err)
            }
        }
    }

    async fn write_batch(
        &self,
        batch: &PendingBatch,
        previous: Option<BatchFuture>,
    ) -> Result<(), Arc<StorageError>> {
        let nodes = batch.nodes.clone();
        let format = self.options.format;
        let compression = self.options.compression;
        let min_packet_size = self.options.min_packet_size;
        let encoded = tokio::task::spawn_blocking(move || {
            encode_batch(&nodes, format, compression, min_packet_size)
        })
        .await
        .map_err(|e| Arc::new(StorageError::Internal(format!("encode task failed: {e}"))))?
        .map_err(Arc::new)?;

        if let Some(previous) = previous {
            previous.await?;
        }

        let locator = self
            .client
            .backend
            .write_blob(
                encoded.blob.clone(),
                &encoded.imports,
                Some(self.options.blob_prefix.as_str()),
            )
            .await
            .map_err(|e| Arc::new(StorageError::from(e)))?;
        self.publish(batch, &locator, encoded)
            .await
            .map_err(Arc::new)
    }

    async fn publish(
        &self,
        batch: &PendingBatch,
        locator: &BlobLocator,
        encoded: EncodedBatch,
    ) -> StorageResult<()> {
        let sequence = self.client.next_sequence();
        let locations =
            ExportLocation::for_header(locator, &encoded.header, encoded.header_length, sequence)?;
        {
            let mut nodes = self.client.nodes.lock();
            for (entry, location) in batch.entries.iter().zip(locations) {
                nodes.mark_exported(entry.id, location)?;
            }
        }
        {
            let mut state = self.state.lock();
            if !batch.rewrite {
                state.pending_bytes = state.pending_bytes.saturating_sub(batch.bytes());
            }
            state.latest_sequence = state.latest_sequence.max(sequence);
        }
        if let Some(parent) = &self.parent {
            // A dropped parent has nobody left to notify.
            let _ = parent.send(WriterEvent::Published {
                writer: self.id,
                sequence,
                nodes: batch.entries.len(),
            });
        }
        debug!(
            bundle = %locator,
            writer = %self.id,
            nodes = batch.entries.len(),
            bytes = encoded.blob.len(),
            sequence,
            "published bundle"
        );
        self.client
            .prime_header(locator, encoded.header, encoded.header_length)
            .await;
        Ok(())
    }

    fn requeue(&self, batch: &PendingBatch) {
        if batch.rewrite {
            return;
        }
        let mut state = self.state.lock();
        let mut nodes = self.client.nodes.lock();
        for entry in &batch.entries {
            nodes.abort_writing(entry.id, self.id);
        }
        state.queue.extend(batch.entries.iter().copied());
        state.queue.sort_by_key(|entry| entry.seq);
        state.ready = 0;
        state.ready_bytes = 0;
        state.ready_set.clear();
    }

    fn drain_events(&self, state: &mut WriterState) {
        let mut events = self.events.lock();
        while let Ok(event) = events.try_recv() {
            let WriterEvent::Published { sequence, .. } = event;
            state.latest_sequence = state.latest_sequence.max(sequence);
            if let Some(parent) = &self.parent {
                let _ = parent.send(event);
            }
        }
    }

    fn children(&self) -> Vec<Arc<WriterShared>> {
        let mut children = self.children.lock();
        children.retain(|child| child.strong_count() > 0);
        children.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn flush(self: &Arc<Self>) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(self.flush_all())
    }

    async fn flush_all(self: &Arc<Self>) -> StorageResult<()> {
        for child in self.children() {
            child.flush().await?;
        }

        {
            let mut state = self.state.lock();
            if matches!(
                state.last_batch.as_ref().and_then(|b| b.peek()),
                Some(Err(_))
            ) {
                state.last_batch = None;
            }
        }

        loop {
            let (dispatched, queued, last) = {
                let mut state = self.state.lock();
                let dispatched = self.schedule(&mut state, true)?;
                (dispatched, state.queue.len(), state.last_batch.clone())
            };
            let in_flight = last.as_ref().is_some_and(|b| b.peek().is_none());
            if let Some(last) = last {
                last.await?;
            }
            if queued == 0 {
                return Ok(());
            }
            if dispatched == 0 && !in_flight {
                return Err(StorageError::Internal(format!(
                    "writer {} cannot make progress with {queued} queued nodes",
                    self.id
                )));
            }
        }
    }

    async fn write_ref(self: &Arc<Self>, name: &RefName, root: &BlobHandle) -> StorageResult<()> {
        self.check_client(root)?;
        self.write_node(root).await?;
        self.flush().await?;

        if let Some(id) = root.resolve()? {
            let latest = self.state.lock().latest_sequence;
            let stale = match &self.client.nodes.lock().get(id)?.state {
                NodeState::Exported(location) => location.sequence < latest,
                _ => false,
            };
            if stale {
                self.rewrite(id).await?;
                self.flush().await?;
            }
        }

        let locator = root.try_locator()?;
        let target = RefTarget::new(root.hash().unwrap_or(IoHash::ZERO), locator.clone());
        self.client.backend.write_ref(name, &target).await?;
        info!(name = %name, locator = %locator, writer = %self.id, "published ref");
        Ok(())
    }

    /// Write an already stored node again so it lands in the newest bundle.
    async fn rewrite(self: &Arc<Self>, id: NodeId) -> StorageResult<()> {
        let content = self.client.read_node(id).await?;
        for reference in &content.references {
            let bundle = match &self.client.nodes.lock().get(*reference)?.state {
                NodeState::Imported { bundle, .. } => Some(bundle.clone()),
                _ => None,
            };
            if let Some(bundle) = bundle {
                self.client.mount(&bundle).await?;
            }
        }

        let mut state = self.state.lock();
        let batch = {
            let nodes = self.client.nodes.lock();
            let references = content
                .references
                .iter()
                .map(|reference| batch_ref(&nodes, &HashMap::new(), *reference))
                .collect::<StorageResult<Vec<_>>>()?;
            PendingBatch {
                entries: vec![QueuedNode {
                    id,
                    seq: u64::MAX,
                    length: content.data.len() as u64,
                }],
                nodes: vec![BatchNode {
                    hash: content.hash,
                    data: content.data,
                    references,
                }],
                rewrite: true,
            }
        };
        debug!(writer = %self.id, node = %id, "rewriting root into a new bundle");
        self.dispatch(&mut state, batch);
        Ok(())
    }
}

impl Drop for WriterShared {
    fn drop(&mut self) {
        let queue = std::mem::take(&mut self.state.get_mut().queue);
        {
            let mut nodes = self.client.nodes.lock();
            for entry in queue {
                nodes.release(entry.id, self.id);
            }
        }
        self.client.unregister_writer(self.id);
    }
}

fn batch_ref(
    nodes: &NodeArena,
    positions: &HashMap<NodeId, usize>,
    id: NodeId,
) -> StorageResult<BatchRef> {
    if let Some(&index) = positions.get(&id) {
        return Ok(BatchRef::Local(index));
    }
    let record = nodes.get(id)?;
    match &record.state {
        NodeState::Exported(location) => Ok(BatchRef::External {
            bundle: location.bundle.clone(),
            export: location.export,
            export_count: location.export_count,
            hash: record.hash,
        }),
        _ => Err(StorageError::Internal(format!("{id} is not stored yet"))),
    }
}

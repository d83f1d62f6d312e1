//! Segment and subsegment model
//!
//! Every trace lives in a [`TraceArena`]. The root segment and all of its
//! subsegments are nodes in the arena, addressed by [`EntityHandle`]; a
//! subsegment refers to its parent by handle, never by owning pointer.
//! [`Entity`] pairs the arena with a handle and is what callers hold.
//!
//! # Reference counting
//!
//! A node starts with one reference held by itself. Opening a child adds one
//! reference to the parent. `release` drops one reference; when a
//! subsegment's count reaches zero it releases its parent, so the parent
//! learns that one of its dependents is done. A node is emittable once its
//! count is zero, it has ended and (for subsegments) its parent is emittable.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::{Result, TraceError};
use crate::exception::{Cause, ExceptionDescriptor};
use crate::header::{new_entity_id, SampleDecision, TraceHeader, TraceId};

/// Metadata namespace used when none is given
pub const DEFAULT_METADATA_NAMESPACE: &str = "default";

/// Current time as fractional epoch seconds
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Index of an entity inside its trace arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(usize);

impl EntityHandle {
    const ROOT: EntityHandle = EntityHandle(0);

    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Segment,
    Subsegment,
}

/// Scalar annotation value; annotations are indexed by the daemon backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for AnnotationValue {
    fn from(value: bool) -> Self {
        AnnotationValue::Bool(value)
    }
}

impl From<i64> for AnnotationValue {
    fn from(value: i64) -> Self {
        AnnotationValue::Int(value)
    }
}

impl From<i32> for AnnotationValue {
    fn from(value: i32) -> Self {
        AnnotationValue::Int(value.into())
    }
}

impl From<f64> for AnnotationValue {
    fn from(value: f64) -> Self {
        AnnotationValue::Float(value)
    }
}

impl From<&str> for AnnotationValue {
    fn from(value: &str) -> Self {
        AnnotationValue::String(value.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(value: String) -> Self {
        AnnotationValue::String(value)
    }
}

fn is_valid_annotation_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 500
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[derive(Debug, Default)]
struct EntityData {
    end_time: Option<f64>,
    namespace: Option<String>,
    origin: Option<String>,
    fault: bool,
    error: bool,
    throttle: bool,
    cause: Option<Cause>,
    annotations: BTreeMap<String, AnnotationValue>,
    metadata: BTreeMap<String, BTreeMap<String, Value>>,
    http: Map<String, Value>,
    aws: Map<String, Value>,
}

#[derive(Debug)]
struct EntityNode {
    id: String,
    name: String,
    kind: EntityKind,
    parent: Option<EntityHandle>,
    start_time: f64,
    reference_count: AtomicUsize,
    in_progress: AtomicBool,
    has_streamed: AtomicBool,
    children: RwLock<Vec<EntityHandle>>,
    data: Mutex<EntityData>,
}

impl EntityNode {
    fn new(name: String, kind: EntityKind, parent: Option<EntityHandle>) -> Self {
        Self {
            id: new_entity_id(),
            name,
            kind,
            parent,
            start_time: now_seconds(),
            reference_count: AtomicUsize::new(1),
            in_progress: AtomicBool::new(true),
            has_streamed: AtomicBool::new(false),
            children: RwLock::new(Vec::new()),
            data: Mutex::new(EntityData::default()),
        }
    }

    fn data(&self) -> MutexGuard<'_, EntityData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn children(&self) -> Vec<EntityHandle> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Storage for every entity of one trace
#[derive(Debug)]
pub struct TraceArena {
    trace_id: TraceId,
    /// Parent id supplied by the upstream trace header, if any
    upstream_parent: Option<String>,
    sampled: SampleDecision,
    facade: bool,
    nodes: RwLock<Vec<Arc<EntityNode>>>,
    /// Descendant subsegments not yet streamed
    size: AtomicUsize,
    /// Set once the root segment has been handed to an emitter
    root_sent: AtomicBool,
}

impl TraceArena {
    /// Create a trace and its root segment
    pub fn new_segment(
        name: impl Into<String>,
        trace_id: TraceId,
        upstream_parent: Option<String>,
        sampled: SampleDecision,
    ) -> Entity {
        Self::create(name.into(), trace_id, upstream_parent, sampled, false)
    }

    /// Create a root segment that stands in for one owned by the host.
    /// Facade segments are never emitted themselves.
    pub fn new_facade(name: impl Into<String>, header: &TraceHeader) -> Entity {
        Self::create(
            name.into(),
            header.root.clone(),
            header.parent.clone(),
            header.sampled,
            true,
        )
    }

    fn create(
        name: String,
        trace_id: TraceId,
        upstream_parent: Option<String>,
        sampled: SampleDecision,
        facade: bool,
    ) -> Entity {
        let root = EntityNode::new(name, EntityKind::Segment, None);
        let arena = Arc::new(TraceArena {
            trace_id,
            upstream_parent,
            sampled,
            facade,
            nodes: RwLock::new(vec![Arc::new(root)]),
            size: AtomicUsize::new(0),
            root_sent: AtomicBool::new(false),
        });
        Entity {
            arena,
            handle: EntityHandle::ROOT,
        }
    }

    fn node(&self, handle: EntityHandle) -> Arc<EntityNode> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&nodes[handle.0])
    }

    fn push(&self, node: EntityNode) -> EntityHandle {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.push(Arc::new(node));
        EntityHandle(nodes.len() - 1)
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn sampled(&self) -> SampleDecision {
        self.sampled
    }

    /// Number of subsegments created in this trace and not yet streamed
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn decrement_size(&self) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| size.checked_sub(1));
    }
}

/// A segment or subsegment of a trace
#[derive(Clone)]
pub struct Entity {
    arena: Arc<TraceArena>,
    handle: EntityHandle,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node();
        f.debug_struct("Entity")
            .field("id", &node.id)
            .field("name", &node.name)
            .field("kind", &node.kind)
            .field("trace_id", &self.arena.trace_id)
            .field("reference_count", &node.reference_count.load(Ordering::Acquire))
            .field("in_progress", &node.in_progress.load(Ordering::Acquire))
            .finish()
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.handle == other.handle
    }
}

impl Eq for Entity {}

impl Entity {
    fn node(&self) -> Arc<EntityNode> {
        self.arena.node(self.handle)
    }

    fn sibling(&self, handle: EntityHandle) -> Entity {
        Entity {
            arena: Arc::clone(&self.arena),
            handle,
        }
    }

    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    pub fn arena(&self) -> &Arc<TraceArena> {
        &self.arena
    }

    pub fn id(&self) -> String {
        self.node().id.clone()
    }

    pub fn name(&self) -> String {
        self.node().name.clone()
    }

    pub fn kind(&self) -> EntityKind {
        self.node().kind
    }

    pub fn is_segment(&self) -> bool {
        self.kind() == EntityKind::Segment
    }

    /// Whether this is a facade segment (or a subsegment of one)
    pub fn is_facade(&self) -> bool {
        self.arena.facade
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.arena.trace_id
    }

    pub fn sampled(&self) -> SampleDecision {
        self.arena.sampled
    }

    /// The segment at the root of this entity's tree
    pub fn root(&self) -> Entity {
        self.sibling(EntityHandle::ROOT)
    }

    pub fn parent(&self) -> Option<Entity> {
        self.node().parent.map(|handle| self.sibling(handle))
    }

    /// Id of the parent entity, or the upstream parent for a segment
    pub fn parent_id(&self) -> Option<String> {
        match self.parent() {
            Some(parent) => Some(parent.id()),
            None => self.arena.upstream_parent.clone(),
        }
    }

    pub fn start_time(&self) -> f64 {
        self.node().start_time
    }

    pub fn end_time(&self) -> Option<f64> {
        self.node().data().end_time
    }

    pub fn reference_count(&self) -> usize {
        self.node().reference_count.load(Ordering::Acquire)
    }

    pub fn is_in_progress(&self) -> bool {
        self.node().in_progress.load(Ordering::Acquire)
    }

    pub fn has_streamed(&self) -> bool {
        self.node().has_streamed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_streamed(&self) {
        self.node().has_streamed.store(true, Ordering::Release);
        self.arena.decrement_size();
    }

    /// Claim the single send of this trace's root segment.
    ///
    /// Returns true for exactly one caller, and only once the root is
    /// emittable.
    pub(crate) fn claim_root_send(&self) -> bool {
        let root = self.root();
        root.is_emittable() && !self.arena.root_sent.swap(true, Ordering::AcqRel)
    }

    /// Trace header to propagate on calls made while this entity is current
    pub fn outbound_header(&self) -> TraceHeader {
        TraceHeader::for_entity(self.trace_id(), &self.id(), self.sampled())
    }

    /// Open a child subsegment.
    ///
    /// Adds a reference to this entity and grows the root segment's size.
    pub fn begin_subsegment(&self, name: impl Into<String>) -> Entity {
        let child = self
            .arena
            .push(EntityNode::new(name.into(), EntityKind::Subsegment, Some(self.handle)));

        let node = self.node();
        node.reference_count.fetch_add(1, Ordering::AcqRel);
        node.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child);
        self.arena.size.fetch_add(1, Ordering::AcqRel);

        self.sibling(child)
    }

    /// Stamp the end time. Ending twice keeps the first end time.
    pub fn end(&self) {
        let node = self.node();
        if node.in_progress.swap(false, Ordering::AcqRel) {
            node.data().end_time = Some(now_seconds());
        }
    }

    /// Drop one reference and return the remaining count.
    ///
    /// When a subsegment's count reaches zero its parent is released once.
    /// Releasing an entity whose count is already zero does nothing.
    pub fn release(&self) -> usize {
        let node = self.node();
        let previous = node
            .reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));

        match previous {
            Ok(1) => {
                if let Some(parent) = self.parent() {
                    parent.release();
                }
                0
            }
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    /// Whether this entity may be sent to the daemon
    pub fn is_emittable(&self) -> bool {
        if self.reference_count() != 0 || self.is_in_progress() {
            return false;
        }
        match self.parent() {
            Some(parent) => parent.is_emittable(),
            None => true,
        }
    }

    /// Snapshot of child subsegments still attached to this entity
    pub fn children(&self) -> Vec<Entity> {
        self.node()
            .children()
            .into_iter()
            .map(|handle| self.sibling(handle))
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.node()
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Detach children that have already been streamed; returns how many
    pub(crate) fn remove_streamed_children(&self) -> usize {
        let node = self.node();
        let mut children = node.children.write().unwrap_or_else(PoisonError::into_inner);
        let before = children.len();
        children.retain(|handle| !self.arena.node(*handle).has_streamed.load(Ordering::Acquire));
        before - children.len()
    }

    /// Add an indexed annotation. Keys may contain ASCII alphanumerics and
    /// underscores only.
    pub fn add_annotation(&self, key: impl Into<String>, value: impl Into<AnnotationValue>) -> Result<()> {
        let key = key.into();
        if !is_valid_annotation_key(&key) {
            return Err(TraceError::invalid_entity(format!(
                "annotation key '{}' is not valid",
                key
            )));
        }
        self.node().data().annotations.insert(key, value.into());
        Ok(())
    }

    /// Add metadata under the default namespace
    pub fn add_metadata(&self, key: impl Into<String>, value: Value) {
        self.add_metadata_in(DEFAULT_METADATA_NAMESPACE, key, value);
    }

    pub fn add_metadata_in(&self, namespace: impl Into<String>, key: impl Into<String>, value: Value) {
        self.node()
            .data()
            .metadata
            .entry(namespace.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// Set the subsegment namespace (`remote` for downstream calls, `aws`
    /// for cloud service calls)
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.node().data().namespace = Some(namespace.into());
    }

    pub fn namespace(&self) -> Option<String> {
        self.node().data().namespace.clone()
    }

    /// Set the segment origin (e.g. `AWS::Lambda::Function`)
    pub fn set_origin(&self, origin: impl Into<String>) {
        self.node().data().origin = Some(origin.into());
    }

    pub fn add_http(&self, key: impl Into<String>, value: Value) {
        self.node().data().http.insert(key.into(), value);
    }

    pub fn add_aws(&self, key: impl Into<String>, value: Value) {
        self.node().data().aws.insert(key.into(), value);
    }

    pub fn mark_fault(&self) {
        self.node().data().fault = true;
    }

    pub fn mark_error(&self) {
        self.node().data().error = true;
    }

    pub fn mark_throttle(&self) {
        let node = self.node();
        let mut data = node.data();
        data.throttle = true;
        data.error = true;
    }

    pub fn is_fault(&self) -> bool {
        self.node().data().fault
    }

    /// Attach an exception chain as this entity's cause and flag a fault
    pub fn add_exception(&self, descriptors: Vec<ExceptionDescriptor>) {
        if descriptors.is_empty() {
            return;
        }
        let node = self.node();
        let mut data = node.data();
        data.fault = true;
        match data.cause.as_mut() {
            Some(cause) => cause.exceptions.extend(descriptors),
            None => data.cause = Some(Cause::new(descriptors)),
        }
    }

    pub fn cause(&self) -> Option<Cause> {
        self.node().data().cause.clone()
    }

    /// Encode this entity and its unstreamed subtree for the daemon
    pub fn to_document(&self) -> EntityDocument {
        let mut document = self.nested_document();
        document.trace_id = Some(self.trace_id().to_string());
        document.parent_id = self.parent_id();
        if !self.is_segment() {
            document.kind = Some("subsegment".to_string());
        }
        document
    }

    fn nested_document(&self) -> EntityDocument {
        let node = self.node();
        let subsegments = self
            .children()
            .into_iter()
            .filter(|child| !child.has_streamed())
            .map(|child| child.nested_document())
            .collect();

        let data = node.data();
        let in_progress = node.in_progress.load(Ordering::Acquire);

        EntityDocument {
            name: node.name.clone(),
            id: node.id.clone(),
            trace_id: None,
            parent_id: None,
            kind: None,
            start_time: node.start_time,
            end_time: if in_progress { None } else { data.end_time },
            in_progress: in_progress.then_some(true),
            namespace: data.namespace.clone(),
            origin: data.origin.clone(),
            fault: data.fault,
            error: data.error,
            throttle: data.throttle,
            cause: data.cause.clone(),
            annotations: data.annotations.clone(),
            metadata: data.metadata.clone(),
            http: data.http.clone(),
            aws: data.aws.clone(),
            subsegments,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Wire representation of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDocument {
    pub name: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub start_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub fault: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub throttle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Cause>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, AnnotationValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub http: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub aws: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsegments: Vec<EntityDocument>,
}

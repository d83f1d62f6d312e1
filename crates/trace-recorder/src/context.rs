//! Task-scoped trace context
//!
//! Each invocation runs inside [`TraceContext::scope`]. The context holds the
//! entity new subsegments attach to. It lives in a tokio task-local, so two
//! invocations (or unrelated tasks) never observe each other's entity.
//! Tasks spawned through [`spawn`] start from a fork of the spawning task's
//! context: they see its current entity, and what they `set` stays theirs.

use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio::task::JoinHandle;

use crate::entity::{Entity, TraceArena};
use crate::error::{Result, TraceError};
use crate::header::TraceHeader;
use crate::sampling::SamplingStrategy;

/// Environment variable selecting the context-missing strategy
pub const CONTEXT_MISSING_ENV: &str = "AWS_XRAY_CONTEXT_MISSING";

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// What to do when an operation needs an entity and none exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMissingStrategy {
    /// Log the problem and carry on without tracing
    #[default]
    LogError,
    /// Return [`TraceError::EntityNotAvailable`] to the caller
    RuntimeError,
}

impl ContextMissingStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOG_ERROR" => Some(ContextMissingStrategy::LogError),
            "RUNTIME_ERROR" => Some(ContextMissingStrategy::RuntimeError),
            _ => None,
        }
    }

    pub fn from_env() -> Self {
        std::env::var(CONTEXT_MISSING_ENV)
            .ok()
            .and_then(|value| Self::parse(&value))
            .unwrap_or_default()
    }

    /// Apply the strategy to a missing-entity error
    pub fn handle(&self, error: TraceError) -> Result<()> {
        match self {
            ContextMissingStrategy::LogError => {
                tracing::error!(error = %error, "Trace entity missing; continuing untraced");
                Ok(())
            }
            ContextMissingStrategy::RuntimeError => Err(error),
        }
    }
}

struct FacadeSource {
    name: String,
    sampler: Arc<dyn SamplingStrategy>,
    /// Header of the invocation this context belongs to
    header: Option<TraceHeader>,
    facade: OnceLock<Entity>,
}

/// The current-entity slot of one logical task
#[derive(Clone)]
pub struct TraceContext {
    source: Arc<FacadeSource>,
    slot: Arc<RwLock<Option<Entity>>>,
}

impl std::fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceContext")
            .field("facade_name", &self.source.name)
            .field("current", &self.try_get())
            .finish()
    }
}

impl TraceContext {
    /// Create an empty context. `facade_name` and `sampler` are used if a
    /// facade segment ever has to be created.
    pub fn new(facade_name: impl Into<String>, sampler: Arc<dyn SamplingStrategy>) -> Self {
        Self {
            source: Arc::new(FacadeSource {
                name: facade_name.into(),
                sampler,
                header: None,
                facade: OnceLock::new(),
            }),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Create facade segments from `header` instead of the process
    /// environment
    pub fn with_facade_header(self, header: TraceHeader) -> Self {
        Self {
            source: Arc::new(FacadeSource {
                name: self.source.name.clone(),
                sampler: Arc::clone(&self.source.sampler),
                header: Some(header),
                facade: OnceLock::new(),
            }),
            slot: self.slot,
        }
    }

    /// Start with `entity` as the current entity
    pub fn with_entity(self, entity: Entity) -> Self {
        self.set(entity);
        self
    }

    /// The context of the running task, if it runs inside a scope
    pub fn current() -> Option<TraceContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Run `future` with this context as the task's context
    pub fn scope<F>(self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        CURRENT.scope(self, future)
    }

    /// Copy of this context with its own slot, seeded with the current entity
    pub fn fork(&self) -> TraceContext {
        TraceContext {
            source: Arc::clone(&self.source),
            slot: Arc::new(RwLock::new(self.try_get())),
        }
    }

    /// The current entity, or the facade segment when none is set.
    ///
    /// The facade is created at most once per context family, from the
    /// context's own header or else the one in the process environment.
    pub fn get(&self) -> Entity {
        if let Some(entity) = self.try_get() {
            return entity;
        }
        self.source
            .facade
            .get_or_init(|| {
                let mut header = self
                    .source
                    .header
                    .clone()
                    .or_else(TraceHeader::from_env)
                    .unwrap_or_else(TraceHeader::new_trace);
                header.sampled = self.source.sampler.decide(header.sampled);
                tracing::debug!(trace_id = %header.root, "Created facade segment");
                TraceArena::new_facade(self.source.name.clone(), &header)
            })
            .clone()
    }

    /// The current entity without creating a facade
    pub fn try_get(&self) -> Option<Entity> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current entity, or `EntityNotAvailable`
    pub fn require(&self) -> Result<Entity> {
        self.try_get()
            .ok_or_else(|| TraceError::entity_not_available("no entity is set in the trace context"))
    }

    pub fn set(&self, entity: Entity) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(entity);
    }

    pub fn clear(&self) {
        self.slot.write().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// The running task's current entity.
///
/// Outside of any scope this is `EntityNotAvailable`.
pub fn current_entity() -> Result<Entity> {
    TraceContext::current()
        .map(|context| context.get())
        .ok_or_else(|| TraceError::entity_not_available("task is not running in a trace context"))
}

/// Spawn a task that inherits a fork of the current trace context
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match TraceContext::current() {
        Some(context) => tokio::spawn(context.fork().scope(future)),
        None => tokio::spawn(future),
    }
}

//! Exception description
//!
//! Turns an error and its chain of causes into a bounded list of
//! [`ExceptionDescriptor`]s. The same list is attached to a failed entity as
//! its `cause` and is rendered by the runtime into the error report sent to
//! the control plane.
//!
//! Rust errors do not carry stack traces, so frames come from [`TracedError`],
//! which records `#[track_caller]` call sites. Other `std::error::Error`
//! values in the chain contribute their message with an empty stack.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

use crate::header::new_entity_id;

/// Default maximum number of frames kept per descriptor
pub const DEFAULT_MAX_STACK_FRAMES: usize = 50;

/// Boxed error accepted as a cause
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Where an error originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    #[default]
    Local,
    /// A downstream remote service call failed
    Remote,
}

/// One frame of a captured stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub path: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StackFrame {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn from_location(location: &Location<'_>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "at {} ({}:{})", label, self.path, self.line),
            None => write!(f, "at {}:{}", self.path, self.line),
        }
    }
}

/// An error value that knows its kind, origin and the call sites it passed
/// through.
#[derive(Debug)]
pub struct TracedError {
    kind: String,
    message: String,
    origin: ErrorOrigin,
    frames: Vec<StackFrame>,
    source: Option<BoxError>,
}

impl TracedError {
    /// Create a local error, recording the caller as the first frame
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            origin: ErrorOrigin::Local,
            frames: vec![StackFrame::from_location(Location::caller())],
            source: None,
        }
    }

    /// Create an error describing a failed downstream call
    #[track_caller]
    pub fn remote(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(kind, message);
        err.origin = ErrorOrigin::Remote;
        err
    }

    /// Record the caller as an additional frame
    #[track_caller]
    pub fn traced_here(mut self) -> Self {
        self.frames.push(StackFrame::from_location(Location::caller()));
        self
    }

    /// Append an explicit frame
    pub fn with_frame(mut self, frame: StackFrame) -> Self {
        self.frames.push(frame);
        self
    }

    /// Replace all frames
    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.frames = frames;
        self
    }

    /// Wrap an inner error
    pub fn caused_by(mut self, cause: impl Into<BoxError>) -> Self {
        self.source = Some(cause.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn origin(&self) -> ErrorOrigin {
        self.origin
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn is_remote(&self) -> bool {
        self.origin == ErrorOrigin::Remote
    }
}

impl fmt::Display for TracedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for TracedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn StdError + 'static))
    }
}

/// Structured description of one error in a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDescriptor {
    pub id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub remote: bool,
    /// Frames dropped because the stack exceeded the maximum
    #[serde(default, skip_serializing_if = "is_zero")]
    pub truncated: usize,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    /// Id of the descriptor for the wrapped error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// `cause` object attached to a failed entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cause {
    pub working_directory: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    pub exceptions: Vec<ExceptionDescriptor>,
}

impl Cause {
    pub fn new(exceptions: Vec<ExceptionDescriptor>) -> Self {
        let working_directory = std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let mut paths: Vec<String> = exceptions
            .iter()
            .flat_map(|descriptor| descriptor.stack.iter().map(|frame| frame.path.clone()))
            .collect();
        paths.sort();
        paths.dedup();

        Self {
            working_directory,
            paths,
            exceptions,
        }
    }
}

/// Walks error chains into descriptor lists
#[derive(Debug, Clone, Copy)]
pub struct ExceptionDescriber {
    max_stack_frames: usize,
}

impl Default for ExceptionDescriber {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STACK_FRAMES)
    }
}

impl ExceptionDescriber {
    pub fn new(max_stack_frames: usize) -> Self {
        Self { max_stack_frames }
    }

    pub fn max_stack_frames(&self) -> usize {
        self.max_stack_frames
    }

    /// Describe an error whose static type is known; the type's short name
    /// is used for the outermost descriptor unless it is a [`TracedError`].
    pub fn describe_typed<E>(&self, error: &E) -> Vec<ExceptionDescriptor>
    where
        E: StdError + 'static,
    {
        self.describe_chain(error, short_type_name::<E>())
    }

    /// Describe an optional error; `None` yields an empty list
    pub fn describe_opt(&self, error: Option<&(dyn StdError + 'static)>) -> Vec<ExceptionDescriptor> {
        error.map(|err| self.describe(err)).unwrap_or_default()
    }

    /// Describe an error and every error it wraps, outermost first
    pub fn describe(&self, error: &(dyn StdError + 'static)) -> Vec<ExceptionDescriptor> {
        self.describe_chain(error, "Error")
    }

    fn describe_chain(
        &self,
        error: &(dyn StdError + 'static),
        outer_type: &str,
    ) -> Vec<ExceptionDescriptor> {
        let mut descriptors: Vec<ExceptionDescriptor> = Vec::new();
        let mut current = Some(error);

        while let Some(err) = current {
            let fallback = if descriptors.is_empty() { outer_type } else { "Error" };
            descriptors.push(self.describe_one(err, fallback));
            current = err.source();
        }

        for index in 1..descriptors.len() {
            let inner_id = descriptors[index].id.clone();
            descriptors[index - 1].cause = Some(inner_id);
        }

        descriptors
    }

    fn describe_one(&self, error: &(dyn StdError + 'static), fallback_type: &str) -> ExceptionDescriptor {
        let (kind, message, remote, frames) = match error.downcast_ref::<TracedError>() {
            Some(traced) => (
                traced.kind.clone(),
                traced.message.clone(),
                traced.is_remote(),
                traced.frames.as_slice(),
            ),
            None => (fallback_type.to_string(), error.to_string(), false, &[][..]),
        };

        let truncated = frames.len().saturating_sub(self.max_stack_frames);
        let stack = frames.iter().take(self.max_stack_frames).cloned().collect();

        ExceptionDescriptor {
            id: new_entity_id(),
            message,
            kind,
            remote,
            truncated,
            stack,
            cause: None,
        }
    }
}

fn short_type_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

//! Handler abstraction
//!
//! A [`Handler`] turns an event payload into a response payload. Most
//! functions are written as an async closure over typed JSON and wrapped
//! with [`handler_fn`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use trace_recorder::exception::BoxError;
use trace_recorder::TracedError;

use crate::context::InvocationContext;

/// Error kind reported when the event cannot be decoded
pub const UNMARSHAL_ERROR: &str = "Runtime.UnmarshalError";

/// Error kind reported when the response cannot be encoded
pub const MARSHAL_ERROR: &str = "Runtime.MarshalError";

/// User code invoked once per event
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one event. An error is reported to the control plane as a
    /// handler error and does not stop the runtime.
    async fn call(&self, event: Vec<u8>, context: InvocationContext) -> Result<Vec<u8>, BoxError>;
}

/// Handler built from an async function over JSON values
pub struct HandlerFn<F, In> {
    f: F,
    _input: PhantomData<fn(In)>,
}

/// Wrap `f` as a [`Handler`] that decodes the event as `In` and encodes the
/// returned value as JSON.
pub fn handler_fn<F, Fut, In, Out, E>(f: F) -> HandlerFn<F, In>
where
    F: Fn(In, InvocationContext) -> Fut,
    Fut: Future<Output = Result<Out, E>>,
{
    HandlerFn {
        f,
        _input: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, In, Out, E> Handler for HandlerFn<F, In>
where
    F: Fn(In, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, E>> + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    async fn call(&self, event: Vec<u8>, context: InvocationContext) -> Result<Vec<u8>, BoxError> {
        let input: In = serde_json::from_slice(&event).map_err(|e| {
            Box::new(TracedError::new(UNMARSHAL_ERROR, e.to_string())) as BoxError
        })?;

        let output = (self.f)(input, context).await.map_err(Into::<BoxError>::into)?;

        serde_json::to_vec(&output).map_err(|e| {
            Box::new(TracedError::new(MARSHAL_ERROR, e.to_string())) as BoxError
        })
    }
}

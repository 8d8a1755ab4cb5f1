//! Remote function registry
//!
//! A [`RemoteFn`] is the typed identity shared by caller and callee. The
//! callee registers a handler for it; the caller uses it to build requests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::error::{Error, Result};
use crate::scheduler::frame::{FrameBody, FrameOutput};
use crate::task::TaskContext;
use super::codec;

/// Typed identity of a remotely callable function
pub struct RemoteFn<A, R> {
    id: u16,
    name: &'static str,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> RemoteFn<A, R> {
    /// Declare a remote function
    pub const fn new(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            _marker: PhantomData,
        }
    }

    /// Numeric identity carried on the wire
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Human readable name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<A, R> Clone for RemoteFn<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for RemoteFn<A, R> {}

impl<A, R> fmt::Debug for RemoteFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFn")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Builds the body of a frame answering one request
pub(crate) type BodyFactory = Box<dyn FnOnce(TaskContext) -> FrameBody + Send>;

/// Decodes request arguments and prepares the answering frame's body
pub(crate) type Handler = Arc<dyn Fn(&[u8]) -> Result<BodyFactory> + Send + Sync>;

struct Registered {
    name: &'static str,
    handler: Handler,
}

/// Table of functions this process answers
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<u16, Registered>,
}

impl FunctionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as the implementation of `function`. The handler
    /// runs as a root task; its output is sent back to the caller.
    pub fn register<A, R, F, Fut>(&mut self, function: RemoteFn<A, R>, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(TaskContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |payload: &[u8]| {
            let args: A = codec::decode(payload)?;
            let handler = Arc::clone(&handler);
            let factory: BodyFactory = Box::new(move |cx: TaskContext| {
                async move {
                    let output = (*handler)(cx, args).await;
                    Box::new(codec::encode(&output)) as FrameOutput
                }
                .boxed()
            });
            Ok(factory)
        });

        let previous = self.handlers.insert(
            function.id(),
            Registered {
                name: function.name(),
                handler: erased,
            },
        );
        if let Some(previous) = previous {
            log::warn!(
                "Function {} ({}) replaces earlier registration {}",
                function.id(),
                function.name(),
                previous.name
            );
        }
        self
    }

    /// Whether a function id has a handler
    pub fn contains(&self, id: u16) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no function is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn resolve(&self, id: u16) -> Result<Handler> {
        self.handlers
            .get(&id)
            .map(|registered| Arc::clone(&registered.handler))
            .ok_or(Error::UnknownFunction { id })
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .handlers
            .iter()
            .map(|(id, registered)| (*id, registered.name))
            .collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

/// Extract the encoded result produced by a registered handler's frame
pub(crate) fn encoded_output(output: FrameOutput) -> Option<Result<Vec<u8>>> {
    output.downcast::<Result<Vec<u8>>>().ok().map(|boxed| *boxed)
}

//! RPC awaitables
//!
//! [`Call`] sends one request to one peer; [`Broadcast`] sends the same
//! request to several peers and finishes once its [`FinishCondition`] holds.
//! Both suspend the calling frame until the condition is met or the timeout
//! fires.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use crate::error::{Error, Result};
use crate::task::TaskContext;
use super::codec;
use super::pending::{ResponseSink, SharedSink};

/// Called for each decoded response with the responding endpoint, the value
/// (which may be rewritten) and a flag that finishes the request early.
pub type ResultCallback<R> = Box<dyn FnMut(SocketAddr, &mut R, &mut bool) + Send>;

/// When a multi-destination request is finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishCondition {
    /// First response
    Any,
    /// Every destination answered
    #[default]
    All,
    /// More than half of the destinations answered
    Majority,
}

impl FinishCondition {
    /// Responses needed out of `total` destinations
    pub fn required(&self, total: usize) -> usize {
        match self {
            FinishCondition::Any => total.min(1),
            FinishCondition::All => total,
            FinishCondition::Majority => total / 2 + 1,
        }
    }

    /// Whether `answered` responses satisfy the condition
    pub fn is_satisfied(&self, answered: usize, total: usize) -> bool {
        answered >= self.required(total)
    }
}

/// Everything needed to issue one request
pub struct RequestDescriptor<R> {
    function_id: u16,
    payload: Result<Vec<u8>>,
    endpoints: Vec<SocketAddr>,
    finish: FinishCondition,
    timeout: Duration,
    callback: Option<ResultCallback<R>>,
}

impl<R> RequestDescriptor<R> {
    fn new(function_id: u16, payload: Result<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            function_id,
            payload,
            endpoints: Vec::new(),
            finish: FinishCondition::All,
            timeout,
            callback: None,
        }
    }

    /// Remote function identity
    pub fn function_id(&self) -> u16 {
        self.function_id
    }

    /// Destinations in dispatch order
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    /// Finish condition
    pub fn finish(&self) -> FinishCondition {
        self.finish
    }

    /// Timeout for the whole request
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<R> std::fmt::Debug for RequestDescriptor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("function_id", &self.function_id)
            .field("endpoints", &self.endpoints)
            .field("finish", &self.finish)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Responses collected for one request
pub(crate) struct RequestState<R> {
    destinations: Vec<(SocketAddr, bool)>,
    finish: FinishCondition,
    results: Vec<(SocketAddr, Result<R>)>,
    callback: Option<ResultCallback<R>>,
}

impl<R> RequestState<R> {
    pub(crate) fn new(endpoints: &[SocketAddr], finish: FinishCondition, callback: Option<ResultCallback<R>>) -> Self {
        Self {
            destinations: endpoints.iter().map(|endpoint| (*endpoint, false)).collect(),
            finish,
            results: Vec::with_capacity(endpoints.len()),
            callback,
        }
    }

    pub(crate) fn take_results(&mut self) -> Vec<(SocketAddr, Result<R>)> {
        std::mem::take(&mut self.results)
    }
}

impl<R: DeserializeOwned + Send> ResponseSink for RequestState<R> {
    fn accept(&mut self, from: SocketAddr, payload: &[u8]) -> Option<bool> {
        let slot = self
            .destinations
            .iter_mut()
            .find(|(endpoint, answered)| *endpoint == from && !*answered)?;
        slot.1 = true;

        let mut finish_now = false;
        let result = codec::decode::<R>(payload).map(|mut value| {
            if let Some(callback) = self.callback.as_mut() {
                callback(from, &mut value, &mut finish_now);
            }
            value
        });
        self.results.push((from, result));

        let answered = self.destinations.iter().filter(|(_, answered)| *answered).count();
        Some(finish_now || self.finish.is_satisfied(answered, self.destinations.len()))
    }

    fn expire(&mut self) {
        for (endpoint, answered) in self.destinations.iter_mut() {
            if !*answered {
                *answered = true;
                self.results.push((*endpoint, Err(Error::DeliveryTimeout)));
            }
        }
    }
}

enum Phase<R> {
    Unsent(RequestDescriptor<R>),
    Waiting(Arc<Mutex<RequestState<R>>>),
    Finished,
}

/// Shared state machine behind [`Call`] and [`Broadcast`]
struct Dispatch<R> {
    cx: TaskContext,
    phase: Phase<R>,
}

impl<R: DeserializeOwned + Send + 'static> Dispatch<R> {
    fn new(cx: TaskContext, function_id: u16, payload: Result<Vec<u8>>) -> Self {
        let timeout = cx.default_rpc_timeout();
        Self {
            cx,
            phase: Phase::Unsent(RequestDescriptor::new(function_id, payload, timeout)),
        }
    }

    fn request_mut(&mut self) -> Option<&mut RequestDescriptor<R>> {
        match &mut self.phase {
            Phase::Unsent(request) => Some(request),
            _ => None,
        }
    }

    fn poll_results(&mut self) -> Poll<Vec<(SocketAddr, Result<R>)>> {
        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Unsent(request) => self.send(request),
            Phase::Waiting(state) => {
                let results = state.lock().take_results();
                Poll::Ready(results)
            }
            Phase::Finished => Poll::Ready(Vec::new()),
        }
    }

    fn send(&mut self, request: RequestDescriptor<R>) -> Poll<Vec<(SocketAddr, Result<R>)>> {
        if request.endpoints.is_empty() {
            return Poll::Ready(Vec::new());
        }
        let Some(frame) = self.cx.frame() else {
            let e = Error::RuntimeError {
                reason: "Calling frame no longer exists".to_string(),
            };
            return Poll::Ready(fail_all(&request.endpoints, e));
        };
        // Sent once whatever parked the frame has resumed it.
        if frame.is_parked() {
            self.phase = Phase::Unsent(request);
            return Poll::Pending;
        }
        let payload = match request.payload {
            Ok(payload) => payload,
            Err(e) => return Poll::Ready(fail_all(&request.endpoints, e)),
        };

        let state = Arc::new(Mutex::new(RequestState::new(
            &request.endpoints,
            request.finish,
            request.callback,
        )));
        let sink: SharedSink = state.clone();
        let dispatched = self.cx.rpc().dispatch(
            &frame,
            request.function_id,
            &payload,
            &request.endpoints,
            request.timeout,
            sink,
        );

        match dispatched {
            Ok(()) => {
                self.phase = Phase::Waiting(state);
                Poll::Pending
            }
            Err(e) => Poll::Ready(fail_all(&request.endpoints, e)),
        }
    }
}

fn fail_all<R>(endpoints: &[SocketAddr], error: Error) -> Vec<(SocketAddr, Result<R>)> {
    endpoints
        .iter()
        .map(|endpoint| (*endpoint, Err(error.clone())))
        .collect()
}

/// A request to a single peer. Resolves to the peer's decoded result.
pub struct Call<R> {
    inner: Dispatch<R>,
}

impl<R: DeserializeOwned + Send + 'static> Call<R> {
    pub(crate) fn new(cx: TaskContext, function_id: u16, payload: Result<Vec<u8>>) -> Self {
        Self {
            inner: Dispatch::new(cx, function_id, payload),
        }
    }

    /// Send the request to `endpoint`
    pub fn on(mut self, endpoint: SocketAddr) -> Self {
        if let Some(request) = self.inner.request_mut() {
            request.endpoints = vec![endpoint];
        }
        self
    }

    /// Give up after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(request) = self.inner.request_mut() {
            request.timeout = timeout;
        }
        self
    }

    /// Inspect or rewrite the result before the caller sees it
    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: FnMut(SocketAddr, &mut R, &mut bool) + Send + 'static,
    {
        if let Some(request) = self.inner.request_mut() {
            request.callback = Some(Box::new(callback));
        }
        self
    }
}

impl<R: DeserializeOwned + Send + 'static> Future for Call<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.poll_results() {
            Poll::Pending => Poll::Pending,
            Poll::Ready(results) => Poll::Ready(match results.into_iter().next() {
                Some((_, result)) => result,
                None => Err(Error::RuntimeError {
                    reason: "Call has no destination".to_string(),
                }),
            }),
        }
    }
}

/// A request to several peers. Resolves to `(endpoint, result)` pairs in
/// arrival order, followed by timeouts for peers that never answered.
pub struct Broadcast<R> {
    inner: Dispatch<R>,
}

impl<R: DeserializeOwned + Send + 'static> Broadcast<R> {
    pub(crate) fn new(cx: TaskContext, function_id: u16, payload: Result<Vec<u8>>) -> Self {
        Self {
            inner: Dispatch::new(cx, function_id, payload),
        }
    }

    /// Add destinations
    pub fn on<I>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        if let Some(request) = self.inner.request_mut() {
            request.endpoints.extend(endpoints);
        }
        self
    }

    /// Finish once every destination answered (the default)
    pub fn when_all(self) -> Self {
        self.finish_when(FinishCondition::All)
    }

    /// Finish on the first answer
    pub fn when_any(self) -> Self {
        self.finish_when(FinishCondition::Any)
    }

    /// Finish once more than half of the destinations answered
    pub fn when_majority(self) -> Self {
        self.finish_when(FinishCondition::Majority)
    }

    /// Set the finish condition
    pub fn finish_when(mut self, finish: FinishCondition) -> Self {
        if let Some(request) = self.inner.request_mut() {
            request.finish = finish;
        }
        self
    }

    /// Give up on missing answers after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(request) = self.inner.request_mut() {
            request.timeout = timeout;
        }
        self
    }

    /// Run `callback` on every decoded response as it arrives
    pub fn on_each_result<F>(mut self, callback: F) -> Self
    where
        F: FnMut(SocketAddr, &mut R, &mut bool) + Send + 'static,
    {
        if let Some(request) = self.inner.request_mut() {
            request.callback = Some(Box::new(callback));
        }
        self
    }
}

impl<R: DeserializeOwned + Send + 'static> Future for Broadcast<R> {
    type Output = Vec<(SocketAddr, Result<R>)>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.poll_results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn payload(value: u32) -> Vec<u8> {
        codec::encode(&value).unwrap()
    }

    #[test]
    fn test_finish_thresholds() {
        assert_eq!(FinishCondition::Any.required(3), 1);
        assert_eq!(FinishCondition::All.required(3), 3);
        assert_eq!(FinishCondition::Majority.required(3), 2);
        assert_eq!(FinishCondition::Majority.required(4), 3);
        assert_eq!(FinishCondition::Majority.required(1), 1);
        assert!(!FinishCondition::Majority.is_satisfied(2, 4));
        assert!(FinishCondition::Any.is_satisfied(0, 0));
    }

    #[test]
    fn test_majority_finishes_early() {
        let endpoints = [addr(1), addr(2), addr(3)];
        let mut state = RequestState::<u32>::new(&endpoints, FinishCondition::Majority, None);
        assert_eq!(state.accept(addr(2), &payload(20)), Some(false));
        assert_eq!(state.accept(addr(1), &payload(10)), Some(true));

        let results = state.take_results();
        assert_eq!(results, vec![(addr(2), Ok(20)), (addr(1), Ok(10))]);
    }

    #[test]
    fn test_only_unanswered_destinations_accepted() {
        let endpoints = [addr(1), addr(2)];
        let mut state = RequestState::<u32>::new(&endpoints, FinishCondition::All, None);
        assert_eq!(state.accept(addr(9), &payload(1)), None);
        assert_eq!(state.accept(addr(1), &payload(1)), Some(false));
        assert_eq!(state.accept(addr(1), &payload(1)), None);
    }

    #[test]
    fn test_timeouts_follow_destination_order() {
        let endpoints = [addr(1), addr(2), addr(3)];
        let mut state = RequestState::<u32>::new(&endpoints, FinishCondition::All, None);
        state.accept(addr(2), &payload(2));
        state.expire();

        let results = state.take_results();
        assert_eq!(
            results,
            vec![
                (addr(2), Ok(2)),
                (addr(1), Err(Error::DeliveryTimeout)),
                (addr(3), Err(Error::DeliveryTimeout)),
            ]
        );
    }

    #[test]
    fn test_callback_rewrites_and_finishes() {
        let endpoints = [addr(1), addr(2), addr(3)];
        let callback: ResultCallback<u32> = Box::new(|_, value, finish| {
            *value *= 10;
            *finish = *value >= 50;
        });
        let mut state = RequestState::new(&endpoints, FinishCondition::All, Some(callback));
        assert_eq!(state.accept(addr(1), &payload(1)), Some(false));
        assert_eq!(state.accept(addr(2), &payload(5)), Some(true));
        assert_eq!(state.take_results(), vec![(addr(1), Ok(10)), (addr(2), Ok(50))]);
    }

    #[test]
    fn test_undecodable_response_is_an_error_result() {
        let endpoints = [addr(1)];
        let mut state = RequestState::<String>::new(&endpoints, FinishCondition::All, None);
        assert_eq!(state.accept(addr(1), &[0xff]), Some(true));
        let results = state.take_results();
        assert!(matches!(results[0].1, Err(Error::Codec { .. })));
    }
}

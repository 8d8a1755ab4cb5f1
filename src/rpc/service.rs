//! RPC service
//!
//! Glues the pending table to the transport, the timer wheel and the
//! scheduler: dispatches requests, routes responses, expires requests whose
//! timeout fired and sends the results of frames that answered a request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use parking_lot::RwLock;
use crate::error::{Error, Result};
use crate::net::Transport;
use crate::scheduler::core::Responder;
use crate::scheduler::frame::{CallContext, Frame, FrameKind, FrameOutput, ResponseRoute};
use crate::scheduler::Scheduler;
use crate::timer::TimerWheel;
use super::codec;
use super::header::{MessageType, WireHeader};
use super::pending::{PendingTable, Receipt, RpcStats, SharedSink};
use super::registry::{encoded_output, FunctionRegistry, Handler};

pub(crate) struct RpcService {
    scheduler: Arc<Scheduler>,
    timer: Arc<TimerWheel>,
    transport: Arc<dyn Transport>,
    registry: RwLock<FunctionRegistry>,
    pending: PendingTable,
    restart_counter: u16,
    max_message_len: usize,
}

impl RpcService {
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        timer: Arc<TimerWheel>,
        transport: Arc<dyn Transport>,
        restart_counter: u16,
        max_message_len: usize,
    ) -> Self {
        Self {
            scheduler,
            timer,
            transport,
            registry: RwLock::new(FunctionRegistry::new()),
            pending: PendingTable::new(),
            restart_counter,
            max_message_len,
        }
    }

    pub(crate) fn registry(&self) -> &RwLock<FunctionRegistry> {
        &self.registry
    }

    pub(crate) fn resolve(&self, function_id: u16) -> Result<Handler> {
        self.registry.read().resolve(function_id)
    }

    pub(crate) fn stats(&self) -> RpcStats {
        self.pending.stats()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn header(&self, message_type: MessageType, correlation_id: u64, function_id: u16, restart_counter: u16) -> WireHeader {
        WireHeader::new(
            message_type,
            correlation_id,
            function_id,
            self.transport.local_addr().port(),
            restart_counter,
        )
    }

    /// Park `frame` on a request to `endpoints`. The message is fully encoded
    /// before anything is published, so an encoding failure leaves the frame
    /// running and nothing is sent.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        frame: &Frame,
        function_id: u16,
        payload: &[u8],
        endpoints: &[SocketAddr],
        timeout: Duration,
        sink: SharedSink,
    ) -> Result<()> {
        if frame.is_parked() {
            return Err(Error::RuntimeError {
                reason: format!("{:?} is already waiting on another event", frame.id()),
            });
        }
        let correlation_id = frame.context().correlation_id();
        let header = self.header(MessageType::Request, correlation_id, function_id, self.restart_counter);
        let message = codec::encode_message(header, payload, self.max_message_len)?;

        frame.park();
        frame.sync_release();
        let sequence = self.pending.insert(correlation_id, frame.id(), function_id, sink);

        let service = Arc::clone(self);
        let timeout_frame = self
            .scheduler
            .create_frame(CallContext::fresh(), FrameKind::Internal, move |_| {
                async move {
                    service.expire(correlation_id, sequence);
                    Box::new(()) as FrameOutput
                }
                .boxed()
            });
        timeout_frame.mark_scheduled();
        self.timer
            .schedule_at(&timeout_frame, self.timer.clock().deadline_after(timeout));

        for endpoint in endpoints {
            self.transport.send(*endpoint, message.clone());
        }
        log::debug!(
            "Dispatched request {} for function {} to {} peers",
            correlation_id,
            function_id,
            endpoints.len()
        );
        Ok(())
    }

    /// Receipt path, entered from the transport
    pub(crate) fn on_response(&self, header: &WireHeader, from: SocketAddr, payload: &[u8]) {
        if header.restart_counter != self.restart_counter {
            log::debug!(
                "Discarding response {} from {} with restart counter {} (local {})",
                header.correlation_id,
                from,
                header.restart_counter,
                self.restart_counter
            );
            self.pending.discard();
            return;
        }

        let receipt = self
            .pending
            .receive(header.correlation_id, header.function_id, from, payload);
        if let Receipt::Resume(id) = receipt {
            if let Some(frame) = self.scheduler.frame(id) {
                self.scheduler.resume(&frame);
            }
        }
    }

    fn expire(&self, correlation_id: u64, sequence: u64) {
        if let Some(id) = self.pending.expire(correlation_id, sequence) {
            log::debug!("Request {} timed out", correlation_id);
            if let Some(frame) = self.scheduler.frame(id) {
                self.scheduler.resume(&frame);
            }
        }
    }
}

impl Responder for RpcService {
    fn respond(&self, route: &ResponseRoute, output: FrameOutput) {
        let payload = match encoded_output(output) {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                log::warn!("Failed to encode response {}: {}", route.correlation_id, e);
                return;
            }
            None => {
                log::error!("Response {} has an unexpected result type", route.correlation_id);
                return;
            }
        };

        let header = self.header(
            MessageType::Response,
            route.correlation_id,
            route.function_id,
            route.restart_counter,
        );
        match codec::encode_message(header, &payload, self.max_message_len) {
            Ok(message) => self.transport.send(route.endpoint, message),
            Err(e) => log::warn!("Dropping response {} to {}: {}", route.correlation_id, route.endpoint, e),
        }
    }
}

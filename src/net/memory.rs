//! In-process transport
//!
//! Runtimes bound to the same [`MemoryNetwork`] exchange messages through
//! channels instead of sockets. Messages to an address nobody is bound to are
//! dropped, which is how a dead peer looks from the outside.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use crate::error::{Error, Result};
use crate::rpc::codec;
use super::{Inbound, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Shared address space for memory transports
#[derive(Default)]
pub struct MemoryNetwork {
    peers: RwLock<HashMap<SocketAddr, Arc<dyn Inbound>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport reachable at `addr` once started
    pub fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemoryTransport> {
        let (sender, receiver) = unbounded();
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            addr,
            sender,
            receiver,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Whether a started transport is reachable at `addr`
    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.peers.read().contains_key(&addr)
    }

    fn attach(&self, addr: SocketAddr, inbound: Arc<dyn Inbound>) -> Result<()> {
        let mut peers = self.peers.write();
        if peers.contains_key(&addr) {
            return Err(Error::Transport {
                reason: format!("Address {} already in use", addr),
            });
        }
        peers.insert(addr, inbound);
        Ok(())
    }

    fn detach(&self, addr: SocketAddr) {
        self.peers.write().remove(&addr);
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, message: &[u8]) {
        let (header, payload) = match codec::split_message(message) {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Dropping malformed message from {}: {}", from, e);
                return;
            }
        };
        let peer = self.peers.read().get(&to).cloned();
        match peer {
            Some(inbound) => inbound.on_message(header, from, payload.to_vec()),
            None => log::debug!("No peer at {}, dropping message from {}", to, from),
        }
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

/// Endpoint on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    addr: SocketAddr,
    sender: Sender<(SocketAddr, Vec<u8>)>,
    receiver: Receiver<(SocketAddr, Vec<u8>)>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Transport for MemoryTransport {
    fn start(&self, inbound: Arc<dyn Inbound>) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(Error::Transport {
                reason: "Transport already started".to_string(),
            });
        }
        self.network.attach(self.addr, inbound)?;

        let network = Arc::clone(&self.network);
        let receiver = self.receiver.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let from = self.addr;
        let handle = thread::Builder::new()
            .name(format!("memory-transport-{}", self.addr.port()))
            .spawn(move || loop {
                match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok((to, message)) => network.deliver(from, to, &message),
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::Transport {
                reason: format!("Failed to spawn transport thread: {}", e),
            })?;
        *thread_slot = Some(handle);

        log::debug!("Memory transport listening on {}", self.addr);
        Ok(())
    }

    fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.network.detach(self.addr);
        }
    }

    fn wait(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Memory transport thread panicked");
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn send(&self, to: SocketAddr, message: Vec<u8>) {
        if self.shutdown.load(Ordering::Acquire) {
            log::debug!("Transport {} stopped, dropping message to {}", self.addr, to);
            return;
        }
        if self.sender.send((to, message)).is_err() {
            log::warn!("Transport {} channel closed, dropping message to {}", self.addr, to);
        }
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("addr", &self.addr)
            .field("queued", &self.receiver.len())
            .finish()
    }
}

//! TCP transport
//!
//! One thread both accepts connections and drains the outbound queue. Every
//! message travels on its own short-lived connection: the sender connects,
//! writes header and payload, and shuts the connection down.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use crate::error::{Error, Result};
use crate::rpc::codec::DEFAULT_MAX_MESSAGE_LEN;
use crate::rpc::{WireHeader, HEADER_LEN};
use super::{Inbound, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Timeout for outbound connects
    pub connect_timeout: Duration,
    /// Timeout for reading one inbound message
    pub read_timeout: Duration,
    /// Largest accepted message, header included
    pub max_message_len: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Transport over plain TCP connections
pub struct TcpTransport {
    config: TcpConfig,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    sender: Sender<(SocketAddr, Vec<u8>)>,
    receiver: Receiver<(SocketAddr, Vec<u8>)>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind a listener on `addr` with the default configuration
    pub fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        Self::with_config(addr, TcpConfig::default())
    }

    /// Bind a listener on `addr`
    pub fn with_config(addr: SocketAddr, config: TcpConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).map_err(|e| transport_error("bind", addr, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| transport_error("configure", addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| transport_error("inspect", addr, e))?;

        let (sender, receiver) = unbounded();
        Ok(Arc::new(Self {
            config,
            listener: Mutex::new(Some(listener)),
            local_addr,
            sender,
            receiver,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }))
    }
}

impl Transport for TcpTransport {
    fn start(&self, inbound: Arc<dyn Inbound>) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Err(Error::Transport {
                reason: "Transport already started".to_string(),
            });
        };

        let io = Io {
            config: self.config.clone(),
            listener,
            outbound: self.receiver.clone(),
            inbound,
            shutdown: Arc::clone(&self.shutdown),
        };
        let handle = thread::Builder::new()
            .name(format!("tcp-transport-{}", self.local_addr.port()))
            .spawn(move || io.run())
            .map_err(|e| Error::Transport {
                reason: format!("Failed to spawn transport thread: {}", e),
            })?;
        *self.thread.lock() = Some(handle);

        log::info!("TCP transport listening on {}", self.local_addr);
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn wait(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("TCP transport thread panicked");
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&self, to: SocketAddr, message: Vec<u8>) {
        if self.shutdown.load(Ordering::Acquire) {
            log::debug!("Transport {} stopped, dropping message to {}", self.local_addr, to);
            return;
        }
        if self.sender.send((to, message)).is_err() {
            log::warn!("Transport {} channel closed, dropping message to {}", self.local_addr, to);
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.local_addr)
            .field("queued", &self.receiver.len())
            .finish()
    }
}

fn transport_error(action: &str, addr: SocketAddr, err: std::io::Error) -> Error {
    Error::Transport {
        reason: format!("Failed to {} {}: {}", action, addr, err),
    }
}

/// State owned by the transport thread
struct Io {
    config: TcpConfig,
    listener: TcpListener,
    outbound: Receiver<(SocketAddr, Vec<u8>)>,
    inbound: Arc<dyn Inbound>,
    shutdown: Arc<AtomicBool>,
}

impl Io {
    fn run(self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.accept_pending();

            match self.outbound.recv_timeout(POLL_INTERVAL) {
                Ok((to, message)) => self.deliver(to, &message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok((to, message)) = self.outbound.try_recv() {
                self.deliver(to, &message);
            }
        }
        log::debug!("TCP transport stopped");
    }

    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.read_message(stream, peer) {
                        log::warn!("Failed to read message from {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn read_message(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(Some(self.config.read_timeout)))
            .map_err(|e| transport_error("configure stream from", peer, e))?;

        let mut head = [0u8; HEADER_LEN];
        stream
            .read_exact(&mut head)
            .map_err(|e| transport_error("read header from", peer, e))?;
        let header = WireHeader::decode(&head)?;

        let needed = usize::try_from(header.payload_len)
            .ok()
            .and_then(|len| len.checked_add(HEADER_LEN))
            .ok_or_else(|| Error::BadHeader {
                reason: format!("payload length {} does not fit in memory", header.payload_len),
            })?;
        if needed > self.config.max_message_len {
            return Err(Error::EncodingRange {
                needed,
                available: self.config.max_message_len,
            });
        }
        let len = needed - HEADER_LEN;
        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .map_err(|e| transport_error("read payload from", peer, e))?;

        self.inbound.on_message(header, peer, payload);
        Ok(())
    }

    fn deliver(&self, to: SocketAddr, message: &[u8]) {
        let sent = TcpStream::connect_timeout(&to, self.config.connect_timeout)
            .and_then(|mut stream| {
                stream.write_all(message)?;
                stream.flush()?;
                let _ = stream.shutdown(Shutdown::Write);
                Ok(())
            });
        if let Err(e) = sent {
            log::warn!("Failed to send {} bytes to {}: {}", message.len(), to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{codec, MessageType};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(WireHeader, Vec<u8>)>>,
    }

    impl Inbound for Recorder {
        fn on_message(&self, header: WireHeader, _from: SocketAddr, payload: Vec<u8>) {
            self.seen.lock().push((header, payload));
        }
    }

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[test]
    fn test_loopback_delivery() {
        let a = TcpTransport::bind(loopback()).unwrap();
        let b = TcpTransport::bind(loopback()).unwrap();
        let recorder = Arc::new(Recorder::default());
        a.start(Arc::new(Recorder::default())).unwrap();
        b.start(recorder.clone()).unwrap();

        let header = WireHeader::new(MessageType::Request, 5, 2, a.local_addr().port(), 0);
        let message = codec::encode_message(header, b"ping", codec::DEFAULT_MAX_MESSAGE_LEN).unwrap();
        a.send(b.local_addr(), message);

        for _ in 0..400 {
            if !recorder.seen.lock().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        {
            let seen = recorder.seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0.correlation_id, 5);
            assert_eq!(seen[0].0.responder_port, a.local_addr().port());
            assert_eq!(seen[0].1, b"ping".to_vec());
        }

        a.stop();
        b.stop();
        a.wait();
        b.wait();
    }

    fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..400 {
            if recorder.seen.lock().len() >= count {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_bad_length_does_not_stop_receiving() {
        let a = TcpTransport::bind(loopback()).unwrap();
        let b = TcpTransport::bind(loopback()).unwrap();
        let recorder = Arc::new(Recorder::default());
        a.start(Arc::new(Recorder::default())).unwrap();
        b.start(recorder.clone()).unwrap();

        for payload_len in [u64::MAX - 10, 1 << 40] {
            let mut header = WireHeader::new(MessageType::Request, 1, 2, a.local_addr().port(), 0);
            header.payload_len = payload_len;
            let mut raw = TcpStream::connect(b.local_addr()).unwrap();
            raw.write_all(&header.to_bytes()).unwrap();
            raw.shutdown(Shutdown::Write).unwrap();
        }

        let header = WireHeader::new(MessageType::Request, 9, 2, a.local_addr().port(), 0);
        let message = codec::encode_message(header, b"after", codec::DEFAULT_MAX_MESSAGE_LEN).unwrap();
        a.send(b.local_addr(), message);

        wait_for(&recorder, 1);
        {
            let seen = recorder.seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0.correlation_id, 9);
            assert_eq!(seen[0].1, b"after".to_vec());
        }

        a.stop();
        b.stop();
        a.wait();
        b.wait();
    }

    #[test]
    fn test_start_twice() {
        let a = TcpTransport::bind(loopback()).unwrap();
        a.start(Arc::new(Recorder::default())).unwrap();
        assert!(a.start(Arc::new(Recorder::default())).is_err());
        a.stop();
        a.wait();
    }
}

//! SUB socket client for the capture agent's publisher.
//!
//! Speaks the scalability-protocols TCP mapping: an 8-byte header exchange
//! followed by frames of a 64-bit big-endian length and the payload. We
//! subscribe to every topic, so no filtering happens on this side.

use crate::collector::decode::decode_message;
use crate::collector::types::Event;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const PROTOCOL_SUB: u16 = 0x0021;
const PROTOCOL_PUB: u16 = 0x0020;

/// Capacity of the event channel between the socket thread and the consumer.
const CHANNEL_CAPACITY: usize = 10_000;

/// How often the reader wakes up to check for a stop request.
const READ_POLL: Duration = Duration::from_millis(250);

/// Upper bound on waiting for the publisher's protocol header.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriber configuration.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Publisher address, `tcp://host:port`
    pub url: String,
    /// Frames larger than this are rejected
    pub max_message_bytes: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:1234".to_string(),
            max_message_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("Subscriber has already been started")]
    AlreadyStarted,
    #[error("unsupported source url '{0}', expected tcp://host:port")]
    InvalidUrl(String),
    #[error("could not connect to {url}: {source}")]
    Connect { url: String, source: io::Error },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: u64, limit: usize },
    #[error("subscriber thread panicked")]
    WorkerPanicked,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Extract `host:port` from a `tcp://` url.
pub fn parse_tcp_url(url: &str) -> Result<&str, SubscriberError> {
    match url.strip_prefix("tcp://") {
        Some(addr) if !addr.is_empty() => Ok(addr),
        _ => Err(SubscriberError::InvalidUrl(url.to_string())),
    }
}

/// Build the 8-byte SP header for `protocol`.
fn header(protocol: u16) -> [u8; 8] {
    let id = protocol.to_be_bytes();
    [0x00, b'S', b'P', 0x00, id[0], id[1], 0x00, 0x00]
}

/// Exchange protocol headers with the publisher.
pub fn handshake<S: Read + Write>(stream: &mut S) -> Result<(), SubscriberError> {
    stream.write_all(&header(PROTOCOL_SUB))?;
    stream.flush()?;

    let mut peer = [0u8; 8];
    stream.read_exact(&mut peer)?;
    if peer[..4] != [0x00, b'S', b'P', 0x00] {
        return Err(SubscriberError::Handshake(format!(
            "bad protocol header {:02x?}",
            &peer[..4]
        )));
    }

    let protocol = u16::from_be_bytes([peer[4], peer[5]]);
    if protocol != PROTOCOL_PUB {
        return Err(SubscriberError::Handshake(format!(
            "peer speaks protocol {protocol:#06x}, expected PUB"
        )));
    }
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// frames. A close anywhere inside a frame, length prefix included, is an
/// `UnexpectedEof` error.
pub fn read_frame<R: Read>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, SubscriberError> {
    let mut len = [0u8; 8];
    let mut filled = 0;
    while filled < len.len() {
        match reader.read(&mut len[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {filled} bytes of frame length"),
                )
                .into())
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let size = u64::from_be_bytes(len);
    if size > limit as u64 {
        return Err(SubscriberError::FrameTooLarge { size, limit });
    }

    let mut payload = vec![0u8; size as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame. Used by publishers and tests.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u64).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Connects to the capture agent and forwards decoded events over a channel.
pub struct Subscriber {
    config: SubscriberConfig,
    /// Handed to the reader thread on start; the channel disconnects when
    /// that thread exits.
    sender: Option<Sender<Event>>,
    receiver: Receiver<Event>,
    running: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    worker: Option<JoinHandle<Result<(), SubscriberError>>>,
    undecodable: Arc<AtomicU64>,
}

impl Subscriber {
    /// Create a new subscriber. Nothing is connected until [`start`](Self::start).
    pub fn new(config: SubscriberConfig) -> Self {
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        Self {
            config,
            sender: Some(sender),
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            stream: Arc::new(Mutex::new(None)),
            worker: None,
            undecodable: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connect, handshake, and spawn the reader thread.
    pub fn start(&mut self) -> Result<(), SubscriberError> {
        if self.sender.is_none() {
            return Err(SubscriberError::AlreadyStarted);
        }

        let addr = parse_tcp_url(&self.config.url)?;
        let mut stream = TcpStream::connect(addr).map_err(|source| SubscriberError::Connect {
            url: self.config.url.clone(),
            source,
        })?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        handshake(&mut stream)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        tracing::info!(url = %self.config.url, "subscribed to capture agent");

        *self.stream.lock().unwrap_or_else(|p| p.into_inner()) = Some(stream.try_clone()?);
        self.running.store(true, Ordering::SeqCst);

        let sender = self.sender.take().ok_or(SubscriberError::AlreadyStarted)?;
        let running = self.running.clone();
        let undecodable = self.undecodable.clone();
        let limit = self.config.max_message_bytes;

        let worker = thread::Builder::new()
            .name("selftop-subscriber".into())
            .spawn(move || {
                let mut reader = PollingReader {
                    inner: stream,
                    running: running.clone(),
                };
                let outcome = loop {
                    match read_frame(&mut reader, limit) {
                        Ok(Some(payload)) => match decode_message(&payload) {
                            Ok(event) => {
                                if !forward(&sender, event, &running) {
                                    break Ok(());
                                }
                            }
                            Err(e) => {
                                undecodable.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!("skipping undecodable message: {e}");
                            }
                        },
                        Ok(None) => {
                            tracing::info!("publisher closed the connection");
                            break Ok(());
                        }
                        // Reads fail once stop() shuts the socket down.
                        Err(_) if !running.load(Ordering::SeqCst) => break Ok(()),
                        Err(e) => {
                            tracing::error!("subscriber read failed: {e}");
                            break Err(e);
                        }
                    }
                };
                running.store(false, Ordering::SeqCst);
                outcome
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    /// Stop reading and close the connection.
    ///
    /// Returns the error that ended the reader thread, if it died on its own
    /// rather than through a clean hang-up or this call.
    pub fn stop(&mut self) -> Result<(), SubscriberError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self
            .stream
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or(Err(SubscriberError::WorkerPanicked)),
            None => Ok(()),
        }
    }

    /// Check if the reader thread is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the receiver for decoded events.
    pub fn receiver(&self) -> &Receiver<Event> {
        &self.receiver
    }

    /// Number of messages dropped because they could not be decoded.
    pub fn undecodable_count(&self) -> u64 {
        self.undecodable.load(Ordering::Relaxed)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Push an event to the consumer, blocking while the channel is full.
///
/// Returns false once the consumer is gone or a stop was requested.
fn forward(sender: &Sender<Event>, event: Event, running: &AtomicBool) -> bool {
    let mut pending = event;
    loop {
        match sender.send_timeout(pending, READ_POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(event)) if running.load(Ordering::SeqCst) => {
                pending = event;
            }
            Err(_) => return false,
        }
    }
}

/// Retries read timeouts until a stop is requested, so the socket can use a
/// short timeout without splitting frames.
struct PollingReader {
    inner: TcpStream,
    running: Arc<AtomicBool>,
}

impl Read for PollingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    if !self.running.load(Ordering::SeqCst) {
                        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "stopped"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_tcp_url() {
        assert_eq!(parse_tcp_url("tcp://127.0.0.1:1234").unwrap(), "127.0.0.1:1234");
        assert!(matches!(
            parse_tcp_url("ipc:///tmp/selftop"),
            Err(SubscriberError::InvalidUrl(_))
        ));
        assert!(parse_tcp_url("tcp://").is_err());
    }

    #[test]
    fn test_frame_roundtrip_and_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, 16).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut cursor, 16).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut cursor, 16).unwrap(), None);
    }

    #[test]
    fn test_partial_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();

        let mut length_only = Cursor::new(buf[..3].to_vec());
        match read_frame(&mut length_only, 16) {
            Err(SubscriberError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected truncated length error, got {other:?}"),
        }

        let mut short_payload = Cursor::new(buf[..10].to_vec());
        assert!(matches!(
            read_frame(&mut short_payload, 16),
            Err(SubscriberError::Io(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[0u8; 32]).unwrap();

        let err = read_frame(&mut Cursor::new(buf), 16).unwrap_err();
        assert!(matches!(
            err,
            SubscriberError::FrameTooLarge { size: 32, limit: 16 }
        ));
    }

    /// In-memory duplex: reads come from `input`, writes go to `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_handshake_accepts_publisher() {
        let mut peer = Duplex {
            input: Cursor::new(header(PROTOCOL_PUB).to_vec()),
            output: Vec::new(),
        };
        handshake(&mut peer).unwrap();
        assert_eq!(peer.output, vec![0x00, b'S', b'P', 0x00, 0x00, 0x21, 0x00, 0x00]);
    }

    #[test]
    fn test_handshake_rejects_other_protocols() {
        let mut wrong_protocol = Duplex {
            input: Cursor::new(header(0x0010).to_vec()),
            output: Vec::new(),
        };
        assert!(matches!(
            handshake(&mut wrong_protocol),
            Err(SubscriberError::Handshake(_))
        ));

        let mut not_sp = Duplex {
            input: Cursor::new(b"HTTP/1.1".to_vec()),
            output: Vec::new(),
        };
        assert!(matches!(
            handshake(&mut not_sp),
            Err(SubscriberError::Handshake(_))
        ));
    }
}

//! TCP transport between the shim and the mock server.
//!
//! Every message travels on its own connection: connect, write the whole
//! payload, half-close the write side and (for requests) read until the peer
//! closes. Connection attempts are retried per [`RetryPolicy`].

use crate::error::{MockError, Result};
use capturemock_protocol::MAX_REQUEST_BYTES;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often and how patiently to retry a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no pause.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            pause: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    address: String,
    policy: RetryPolicy,
}

impl Transport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Delivers `payload` and closes without waiting for a reply.
    pub fn send(&self, payload: &str) -> Result<()> {
        self.with_retry(|stream| {
            stream.write_all(payload.as_bytes())?;
            stream.flush()?;
            Ok(())
        })
    }

    /// Delivers `payload`, half-closes and returns everything the peer sends
    /// back before closing.
    pub fn request(&self, payload: &str) -> Result<String> {
        let mut stream = self.submit(payload)?;
        read_reply(&mut stream).map_err(|source| MockError::Transport {
            address: self.address.clone(),
            attempts: 1,
            source,
        })
    }

    /// Delivers `payload` and half-closes, returning the open connection so
    /// the caller decides when to read the reply.
    pub fn submit(&self, payload: &str) -> Result<TcpStream> {
        let mut connected = None;
        self.with_retry(|stream| {
            stream.write_all(payload.as_bytes())?;
            stream.flush()?;
            stream.shutdown(Shutdown::Write)?;
            connected = Some(stream.try_clone()?);
            Ok(())
        })?;
        connected.ok_or_else(|| MockError::Transport {
            address: self.address.clone(),
            attempts: self.policy.attempts,
            source: std::io::Error::new(ErrorKind::NotConnected, "no connection established"),
        })
    }

    fn with_retry<F>(&self, mut write: F) -> Result<()>
    where
        F: FnMut(&mut TcpStream) -> std::io::Result<()>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let outcome = TcpStream::connect(&self.address).and_then(|mut stream| write(&mut stream));
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(
                        address = %self.address,
                        attempt,
                        error = %err,
                        "Connection to mock server failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        thread::sleep(self.policy.pause);
                    }
                }
            }
        }
        Err(MockError::Transport {
            address: self.address.clone(),
            attempts,
            source: last_error
                .unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "no attempts made")),
        })
    }
}

/// Reads until the peer closes. One interrupted or timed-out read is
/// tolerated by reading again; a second one is an error.
pub fn read_reply<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut interrupted = false;

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        "reply exceeded maximum size",
                    ));
                }
            }
            Err(err)
                if !interrupted
                    && matches!(
                        err.kind(),
                        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                    ) =>
            {
                tracing::debug!(error = %err, "Reply read interrupted; retrying once");
                interrupted = true;
            }
            Err(err) => return Err(err),
        }
    }

    String::from_utf8(buffer).map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))
}

/// Probes `address`: 0 when something accepts connections, otherwise the OS
/// error code (or -1 when there is none) within `timeout`.
pub fn connect_ex(address: &str, timeout: Duration) -> i32 {
    let addrs: Vec<SocketAddr> = match address.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(err) => return err.raw_os_error().unwrap_or(-1),
    };

    let mut code = -1;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return 0,
            Err(err) => code = err.raw_os_error().unwrap_or(-1),
        }
    }
    code
}

/// Whether `err` means the peer has gone away.
pub fn is_peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

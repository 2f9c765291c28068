//! UDP socket wrapper for the QRT transport.
//!
//! Receive timeouts are part of the protocol contract: the endpoint
//! sets a read timeout so idle receive attempts return a distinguished
//! would-block signal (`Ok(None)`) that triggers time-based loss
//! checks, while hard I/O errors still propagate.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use thiserror::Error;

/// Error type for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    /// Underlying I/O error
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Bound UDP socket owned exclusively by one endpoint.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
}

impl DatagramSocket {
    /// Bind to the provided address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket })
    }

    /// Bound receive waits; `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send bytes to a remote address.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, addr)?)
    }

    /// Receive bytes into the provided buffer.
    ///
    /// Returns `Ok(None)` when the read timeout elapses without data.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(SocketError::Io(err)),
        }
    }

    /// Local address of this binding.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }
}

//! Secure-channel collaborator.
//!
//! A [`SecureChannel`] turns a freshly connected [`Socket`] into a pair of
//! byte-stream halves. Encryption and certificate handling live entirely
//! behind this trait; the engine only ever sees plaintext frames.
//!
//! Readiness is still detected on the raw socket, so a wrapper must not keep
//! decrypted bytes buffered past the end of a frame it was asked to read.

use std::io::{Read, Write};

use crate::connection::Socket;
use crate::error::EngineResult;

/// Read and write halves of a wrapped socket.
pub struct SecureStream {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl SecureStream {
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Wraps raw sockets on both ends of a link.
pub trait SecureChannel: Send + Sync {
    /// Wraps an accepted socket.
    fn wrap_server(&self, socket: &Socket) -> EngineResult<SecureStream>;

    /// Wraps a socket we connected.
    fn wrap_client(&self, socket: &Socket) -> EngineResult<SecureStream>;
}

/// Passthrough channel: frames travel unencrypted.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainChannel;

impl PlainChannel {
    fn split(socket: &Socket) -> EngineResult<SecureStream> {
        Ok(SecureStream::new(socket.try_clone()?, socket.try_clone()?))
    }
}

impl SecureChannel for PlainChannel {
    fn wrap_server(&self, socket: &Socket) -> EngineResult<SecureStream> {
        Self::split(socket)
    }

    fn wrap_client(&self, socket: &Socket) -> EngineResult<SecureStream> {
        Self::split(socket)
    }
}

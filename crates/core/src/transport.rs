//! Byte transport seam used by the protocol client

use std::io::{self, Read, Write};

/// An established, ordered byte connection to the server
pub trait Transport {
    /// Send one message part
    ///
    /// # Errors
    /// Returns an error if the bytes could not be written
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive exactly `len` bytes
    ///
    /// # Errors
    /// Returns an error if the connection fails or ends first
    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).send(data)
    }

    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>> {
        (**self).recv(len)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).send(data)
    }

    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>> {
        (**self).recv(len)
    }
}

/// Adapts any blocking byte stream; every `send` is written and flushed
#[derive(Debug)]
pub struct StreamTransport<S> {
    inner: S,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.inner.flush()
    }

    fn recv(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }
}

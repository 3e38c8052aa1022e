//! Message encoding and response parsing.
//!
//! Sessions never look inside messages. A request is anything which can
//! [`Encode`] itself into a [`Buf`], and a response is read into anything which
//! can [`Parse`] bytes and tell when its message is complete.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::Error;
use crate::BoxError;

pub mod http1;

/// Bytes reserved in the receive buffer before each read.
const READ_CHUNK: usize = 4 * 1024;

/// A message which can be written to a session.
pub trait Encode: Send + 'static {
    /// The buffer holding the wire representation.
    type Buf: Buf + Send;

    /// Produce the wire representation of this message.
    ///
    /// Implementations should hand out reference-counted [`Bytes`] for large
    /// payloads rather than copying them.
    fn encode(&self) -> Result<Self::Buf, BoxError>;
}

/// A parser for one inbound message.
pub trait Parse: Send + 'static {
    /// Consume as much of `buf` as belongs to this message.
    ///
    /// Bytes past the end of the message must be left in `buf`.
    fn parse(&mut self, buf: &mut BytesMut) -> Result<(), BoxError>;

    /// Whether the message is complete.
    fn is_done(&self) -> bool;

    /// The peer closed the connection before [`Parse::is_done`].
    ///
    /// Parsers for messages delimited by connection close should finish here.
    fn eof(&mut self) -> Result<(), BoxError> {
        Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
    }
}

impl Encode for Bytes {
    type Buf = Bytes;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        Ok(self.clone())
    }
}

impl Encode for &'static [u8] {
    type Buf = Bytes;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        Ok(Bytes::from_static(self))
    }
}

impl Encode for &'static str {
    type Buf = Bytes;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        Ok(Bytes::from_static(self.as_bytes()))
    }
}

impl Encode for Vec<u8> {
    type Buf = Bytes;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Encode for String {
    type Buf = Bytes;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

/// Encode `message` and write all of it to `stream`.
///
/// Returns the number of bytes written.
pub async fn write_message<S, M>(stream: &mut S, message: M) -> Result<usize, Error>
where
    S: AsyncWrite + Unpin,
    M: Encode,
{
    let mut buf = message.encode().map_err(Error::Write)?;
    let len = buf.remaining();

    stream.write_all_buf(&mut buf).await.map_err(Error::write)?;
    stream.flush().await.map_err(Error::write)?;

    tracing::trace!(bytes = len, "message written");
    Ok(len)
}

/// Read from `stream` into `parser` until it reports completion.
///
/// `buffer` holds bytes received but not yet consumed. Bytes which arrive
/// after the end of the message stay there for the next read.
/// Returns the number of bytes read from the stream.
pub async fn read_message<S, P>(
    stream: &mut S,
    buffer: &mut BytesMut,
    parser: &mut P,
) -> Result<usize, Error>
where
    S: AsyncRead + Unpin,
    P: Parse + ?Sized,
{
    let mut received = 0;

    loop {
        parser.parse(buffer).map_err(Error::Read)?;
        if parser.is_done() {
            tracing::trace!(bytes = received, "message read");
            return Ok(received);
        }

        if buffer.capacity() - buffer.len() < READ_CHUNK {
            buffer.reserve(READ_CHUNK);
        }

        let n = stream.read_buf(buffer).await.map_err(Error::read)?;
        if n == 0 {
            tracing::trace!("peer closed before message was complete");
            parser.eof().map_err(Error::Read)?;
            if parser.is_done() {
                return Ok(received);
            }
            return Err(Error::read(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        received += n;
    }
}

//! A module for handling the connection to a stream, usually a remote peer via
//! a [`TcpStream`](tokio::net::TcpStream).
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Upper bound for a single header line during an HTTP-style handshake.
/// A longer line means the peer is not speaking the protocol we expect.
pub(crate) const MAX_LINE: usize = 4096;

const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// A buffered stream used to drive an upstream proxy handshake (and, for the
/// transparent HTTP mode, to read the client's request headers).
///
/// Reads go through an internal buffer so the handshake can consume exact
/// byte counts and CRLF-delimited lines; whatever was read past the end of
/// the handshake belongs to the relayed stream and is handed back through
/// [`Connection::into_parts`]. Writes are buffered by a [`BufWriter`] and
/// must be flushed explicitly.
#[derive(Debug)]
pub(crate) struct Connection<S> {
    /// Stream wrapped with a `BufWriter` for buffering writes.
    stream: BufWriter<S>,
    /// Buffer used for incoming bytes not yet consumed.
    buffer: BytesMut,
}

/// A trait for types that can be used as a connection stream.
pub(crate) trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnectionStream for T {}

impl<S: ConnectionStream> Connection<S> {
    pub fn new(socket: S) -> Self {
        Self {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        }
    }

    /// Read exactly `n` bytes, waiting for more input if necessary.
    ///
    /// Fails with [`Error::UnexpectedEof`] if the peer closes before `n`
    /// bytes arrived.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buffer.len() < n {
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(Error::UnexpectedEof);
            }
        }
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Consume and discard exactly `n` bytes.
    pub async fn skip(&mut self, n: usize) -> Result<()> {
        while self.buffer.len() < n {
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(Error::UnexpectedEof);
            }
        }
        self.buffer.advance(n);
        Ok(())
    }

    /// Read one CRLF-delimited line, without the terminator.
    ///
    /// A lone `\n` is accepted as terminator too; the trailing `\r`, if any,
    /// is stripped. A line longer than [`MAX_LINE`] is a protocol violation
    /// and fails with [`Error::LineTooLong`]; EOF before the terminator fails
    /// with [`Error::UnexpectedEof`].
    pub async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                if pos > MAX_LINE {
                    return Err(Error::LineTooLong(MAX_LINE));
                }
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            if self.buffer.len() > MAX_LINE {
                return Err(Error::LineTooLong(MAX_LINE));
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(Error::UnexpectedEof);
            }
        }
    }

    /// Read whatever input is available, waiting for at least one byte.
    ///
    /// Returns `None` on EOF. Buffered bytes are drained before the stream
    /// is polled again.
    pub async fn read_some(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.is_empty() && 0 == self.stream.read_buf(&mut self.buffer).await? {
            return Ok(None);
        }
        Ok(Some(self.buffer.split().freeze()))
    }

    /// Queue `buf` on the buffered writer.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    /// Flush the write buffer down to the socket.
    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the underlying socket, flushing first.
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Unwrap into the underlying stream and the residual input bytes that
    /// were read past the handshake. The write buffer must have been flushed.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream.into_inner(), self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_exact_and_leaves_residual() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\x05\x00extra")
            .build();
        let mut conn = Connection::new(stream);

        let reply = conn.read_exact(2).await.unwrap();
        assert_eq!(&reply[..], b"\x05\x00");

        let (_stream, residual) = conn.into_parts();
        assert_eq!(&residual[..], b"extra");
    }

    #[tokio::test]
    async fn read_exact_waits_for_more_input() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\x05")
            .read(b"\x00\x00\x01")
            .build();
        let mut conn = Connection::new(stream);

        let head = conn.read_exact(4).await.unwrap();
        assert_eq!(&head[..], b"\x05\x00\x00\x01");
    }

    #[tokio::test]
    async fn read_exact_reports_eof() {
        let stream = tokio_test::io::Builder::new().read(b"\x05").build();
        let mut conn = Connection::new(stream);

        assert!(matches!(
            conn.read_exact(2).await,
            Err(Error::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn reads_crlf_lines() {
        let stream = tokio_test::io::Builder::new()
            .read(b"HTTP/1.0 200 Connection established\r\nServer: x\r\n\r\n")
            .build();
        let mut conn = Connection::new(stream);

        assert_eq!(
            conn.read_line().await.unwrap(),
            "HTTP/1.0 200 Connection established"
        );
        assert_eq!(conn.read_line().await.unwrap(), "Server: x");
        assert_eq!(conn.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn accepts_bare_lf_terminator() {
        let stream = tokio_test::io::Builder::new().read(b"hello\nrest").build();
        let mut conn = Connection::new(stream);

        assert_eq!(conn.read_line().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn rejects_overlong_lines() {
        let long = vec![b'a'; MAX_LINE + 1];
        let stream = tokio_test::io::Builder::new().read(&long).build();
        let mut conn = Connection::new(stream);

        assert!(matches!(
            conn.read_line().await,
            Err(Error::LineTooLong(MAX_LINE))
        ));
    }

    #[tokio::test]
    async fn skips_reply_tails() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\x00\x01\x02\x03\x04\x05tail")
            .build();
        let mut conn = Connection::new(stream);

        conn.skip(6).await.unwrap();
        assert_eq!(&conn.read_exact(4).await.unwrap()[..], b"tail");
    }

    #[tokio::test]
    async fn read_some_drains_buffer_before_polling() {
        let stream = tokio_test::io::Builder::new().read(b"abcdef").build();
        let mut conn = Connection::new(stream);

        // over-read past the two handshake bytes
        conn.read_exact(2).await.unwrap();
        let chunk = conn.read_some().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"cdef");
        assert_eq!(conn.read_some().await.unwrap(), None);
    }

    #[tokio::test]
    async fn writes_are_buffered_until_flush() {
        let stream = tokio_test::io::Builder::new().write(b"onetwo").build();
        let mut conn = Connection::new(stream);

        conn.write_all(b"one").await.unwrap();
        conn.write_all(b"two").await.unwrap();
        conn.flush().await.unwrap();
    }
}

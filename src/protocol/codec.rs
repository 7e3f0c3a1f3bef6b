//! Length-prefixed frame reader and writer.
//!
//! The codec does not interpret IPv4 headers; it is a pure length-prefixed
//! streamer over the TLS connection. A frame whose length field falls outside
//! `1..=MTU` means the stream has lost framing sync and the connection must
//! be torn down.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{BufferPool, FrameBuf};
use crate::error::{Error, FramingError, Result};

/// Read one wire frame into a buffer drawn from `pool`.
///
/// Reads exactly four header bytes, validates the length, then reads exactly
/// that many payload bytes. On any failure the buffer is dropped, which
/// returns it to the pool.
pub async fn read_frame<R>(rdr: &mut R, pool: &Arc<BufferPool>) -> Result<FrameBuf>
where
    R: AsyncRead + Unpin,
{
    let mut buf = pool.get();

    rdr.read_exact(buf.header_mut()).await.map_err(read_err)?;

    let len = buf.header_len();
    if len == 0 || len > buf.payload_capacity() {
        return Err(FramingError::FramingLost {
            len,
            mtu: buf.payload_capacity(),
        }
        .into());
    }

    rdr.read_exact(&mut buf.payload_mut()[..len])
        .await
        .map_err(read_err)?;
    buf.set_len(len);

    Ok(buf)
}

/// Write one wire frame, header and payload, in full.
///
/// `write_all` loops until the whole region is accepted, so a frame is never
/// partially emitted; any error leaves the stream unusable and the session
/// must terminate.
pub async fn write_frame<W>(wr: &mut W, buf: &FrameBuf) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    wr.write_all(buf.wire()).await.map_err(write_err)?;
    wr.flush().await.map_err(write_err)?;
    Ok(())
}

fn read_err(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ShortRead.into()
    } else {
        Error::Io(err)
    }
}

fn write_err(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::WriteZero {
        FramingError::ShortWrite.into()
    } else {
        Error::Io(err)
    }
}

//! Control-channel framing: a u32 big-endian length prefix followed by a
//! JSON body. Reader and writer operate on split halves so the receive and
//! send paths of one connection can live in different tasks.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{Error, Result},
    message::CtlMsg,
};

/// Frames larger than this are a protocol violation and kill the control
/// connection.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

pub struct FramedReader<R> {
    io: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    /// Read one frame. `Ok(None)` means the peer closed the connection at a
    /// frame boundary; EOF inside a frame is an error.
    pub async fn next(&mut self) -> Result<Option<CtlMsg>> {
        let mut prefix = [0u8; LEN_PREFIX];
        match self.io.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                got: len,
                limit: MAX_FRAME_SIZE,
            });
        }
        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await?;
        let msg = serde_json::from_slice(&body)?;
        Ok(Some(msg))
    }

    pub fn into_inner(self) -> R {
        self.io
    }
}

pub struct FramedWriter<W> {
    io: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn send(&mut self, msg: &CtlMsg) -> Result<()> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                got: body.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        self.buf.clear();
        self.buf.reserve(LEN_PREFIX + body.len());
        self.buf.put_u32(body.len() as u32);
        self.buf.put_slice(&body);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.io
    }
}

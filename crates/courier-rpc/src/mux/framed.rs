//! Length-prefixed frames over any async byte stream.

use async_trait::async_trait;
use courier_core::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{FrameSink, FrameSource};
use crate::protocol::{read_frame, write_frame};

#[derive(Debug)]
pub struct FramedSource<R> {
    reader: R,
}

impl<R> FramedSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> FrameSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.reader).await
    }
}

#[derive(Debug)]
pub struct FramedSink<W> {
    writer: W,
}

impl<W> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> FrameSink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        write_frame(&mut self.writer, frame.as_bytes()).await
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

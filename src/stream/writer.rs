//! Stream input writers.
//!
//! [`StreamWriter`] batches typed items into pages and serializes each page
//! as one message body. [`ByteStreamWriter`] is the byte specialization:
//! pages are raw buffers, no per-item serialization. Both flush lazily: a
//! full page is shipped when the next write arrives, which is exactly where
//! backpressure suspends the caller once credit runs out.

use std::{mem, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CommError, CommResult, RetCode},
    serializer::{EncodeWith, Serializer},
    stream::flow::PageFlow,
};

/// Typed page-buffered stream writer.
pub struct StreamWriter<T, S> {
    flow: Arc<PageFlow>,
    serializer: S,
    page_size: usize,
    page: tokio::sync::Mutex<Vec<T>>,
}

impl<T, S> StreamWriter<T, S>
where
    T: Send + 'static,
    S: Serializer,
    Vec<T>: EncodeWith<S>,
{
    pub(crate) fn new(flow: Arc<PageFlow>, serializer: S, page_size: usize) -> Self {
        Self {
            flow,
            serializer,
            page_size,
            page: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Enqueue one item.
    ///
    /// Completes as soon as the item is buffered; suspends when the current
    /// page is full and no send credit remains.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::StreamCompleted`] after completion or failure of
    /// the stream.
    pub async fn write(&self, item: T) -> CommResult<()> { self.write_with(item, None).await }

    /// [`StreamWriter::write`] with a caller-supplied cancel token.
    ///
    /// Cancellation wakes the writer with [`RetCode::OperationCanceled`];
    /// buffered items stay queued, so the stream state is not corrupted.
    pub async fn write_with(
        &self,
        item: T,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<()> {
        let mut page = self.page.lock().await;
        if page.len() >= self.page_size {
            self.flush_locked(&mut page, cancel).await?;
        }
        page.push(item);
        Ok(())
    }

    /// Flush the trailing partial page and send the terminal completion.
    ///
    /// # Errors
    ///
    /// Propagates flush failures; completing twice fails with
    /// [`RetCode::StreamCompleted`].
    pub async fn complete(&self) -> CommResult<()> {
        let mut page = self.page.lock().await;
        self.flush_locked(&mut page, None).await?;
        self.flow.complete(None).await
    }

    async fn flush_locked(
        &self,
        page: &mut Vec<T>,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<()> {
        if page.is_empty() {
            return Ok(());
        }
        let items = mem::take(page);
        let body = Bytes::from(self.serializer.serialize(&items)?);
        match self.flow.send_page(body, cancel).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // Keep the page so a later write or complete can retry.
                *page = items;
                Err(error)
            }
        }
    }
}

/// Byte stream writer moving raw page buffers.
pub struct ByteStreamWriter {
    flow: Arc<PageFlow>,
    page_size: usize,
    page: tokio::sync::Mutex<BytesMut>,
}

impl ByteStreamWriter {
    pub(crate) fn new(flow: Arc<PageFlow>, page_size: usize) -> Self {
        Self {
            flow,
            page_size,
            page: tokio::sync::Mutex::new(BytesMut::new()),
        }
    }

    /// Enqueue a single byte.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::StreamCompleted`] after completion or failure.
    pub async fn write(&self, byte: u8) -> CommResult<()> { self.write_chunk(&[byte]).await }

    /// Enqueue a run of bytes, splitting across pages as needed.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::StreamCompleted`] after completion or failure.
    pub async fn write_chunk(&self, bytes: &[u8]) -> CommResult<()> {
        self.write_chunk_with(bytes, None).await
    }

    /// [`ByteStreamWriter::write_chunk`] with a caller-supplied cancel token.
    pub async fn write_chunk_with(
        &self,
        mut bytes: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> CommResult<()> {
        let mut page = self.page.lock().await;
        while !bytes.is_empty() {
            if page.len() >= self.page_size {
                self.flush_locked(&mut page, cancel).await?;
            }
            let take = bytes.len().min(self.page_size - page.len());
            page.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        Ok(())
    }

    /// Pump an async byte source into the stream until EOF.
    ///
    /// Returns the number of bytes shipped.
    ///
    /// # Errors
    ///
    /// Propagates read failures as [`RetCode::OtherError`] and stream
    /// failures unchanged.
    pub async fn write_all<R>(&self, mut source: R) -> CommResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut scratch = [0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = source
                .read(&mut scratch)
                .await
                .map_err(|error| CommError::new(RetCode::OtherError, error.to_string()))?;
            if n == 0 {
                return Ok(total);
            }
            self.write_chunk(&scratch[..n]).await?;
            total += n as u64;
        }
    }

    /// Flush the trailing partial page and send the terminal completion.
    ///
    /// # Errors
    ///
    /// Propagates flush failures; completing twice fails with
    /// [`RetCode::StreamCompleted`].
    pub async fn complete(&self) -> CommResult<()> {
        let mut page = self.page.lock().await;
        self.flush_locked(&mut page, None).await?;
        self.flow.complete(None).await
    }

    async fn flush_locked(
        &self,
        page: &mut BytesMut,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<()> {
        if page.is_empty() {
            return Ok(());
        }
        let body = page.split().freeze();
        match self.flow.send_page(body.clone(), cancel).await {
            Ok(()) => Ok(()),
            Err(error) => {
                // Keep the page so a later write or complete can retry.
                *page = BytesMut::from(&body[..]);
                Err(error)
            }
        }
    }
}

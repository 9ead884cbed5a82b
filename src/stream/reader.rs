//! Stream output readers.
//!
//! [`StreamReader`] pops typed items across page boundaries, decoding each
//! page through the channel's serializer. [`ByteStreamReader`] reads raw
//! byte pages and additionally exposes whole pages through
//! [`BulkEnumerator`] for zero-copy bridging into an external sink. A page
//! is acknowledged (restoring one send credit) only once every item in it
//! has been consumed.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CommError, CommResult, RetCode},
    serializer::{DecodeWith, Serializer},
    stream::queue::{PageLease, PageQueue},
};

struct Cursor<T> {
    items: VecDeque<T>,
    lease: Option<PageLease>,
}

/// Typed stream reader.
pub struct StreamReader<T, S> {
    queue: Arc<PageQueue>,
    serializer: S,
    cursor: tokio::sync::Mutex<Cursor<T>>,
}

impl<T, S> StreamReader<T, S>
where
    T: Send + 'static,
    S: Serializer,
    Vec<T>: DecodeWith<S>,
{
    pub(crate) fn new(queue: Arc<PageQueue>, serializer: S) -> Self {
        Self {
            queue,
            serializer,
            cursor: tokio::sync::Mutex::new(Cursor {
                items: VecDeque::new(),
                lease: None,
            }),
        }
    }

    /// Pop the next item; `None` signals end of stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's fault, or [`RetCode::DeserializationError`] when
    /// a page body does not decode.
    pub async fn read_one(&self) -> CommResult<Option<T>> { self.read_one_with(None).await }

    /// [`StreamReader::read_one`] with a caller-supplied cancel token.
    pub async fn read_one_with(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> CommResult<Option<T>> {
        let mut cursor = self.cursor.lock().await;
        loop {
            if let Some(item) = cursor.items.pop_front() {
                if cursor.items.is_empty()
                    && let Some(lease) = cursor.lease.take()
                {
                    lease.release().await;
                }
                return Ok(Some(item));
            }
            match self.queue.next_page(cancel).await? {
                None => return Ok(None),
                Some(lease) => {
                    let items: Vec<T> = self.serializer.deserialize(lease.data())?;
                    if items.is_empty() {
                        lease.release().await;
                        continue;
                    }
                    cursor.items = items.into();
                    cursor.lease = Some(lease);
                }
            }
        }
    }

    /// Drain the stream into a vector.
    ///
    /// # Errors
    ///
    /// Propagates any [`StreamReader::read_one`] failure.
    pub async fn collect(&self) -> CommResult<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.read_one().await? {
            out.push(item);
        }
        Ok(out)
    }
}

struct ByteCursor {
    chunk: Bytes,
    lease: Option<PageLease>,
}

/// Byte stream reader over raw pages.
pub struct ByteStreamReader {
    queue: Arc<PageQueue>,
    cursor: tokio::sync::Mutex<ByteCursor>,
}

impl ByteStreamReader {
    pub(crate) fn new(queue: Arc<PageQueue>) -> Self {
        Self {
            queue,
            cursor: tokio::sync::Mutex::new(ByteCursor {
                chunk: Bytes::new(),
                lease: None,
            }),
        }
    }

    /// Pop one byte; `None` signals end of stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's fault.
    pub async fn read_one(&self) -> CommResult<Option<u8>> {
        let mut byte = [0u8; 1];
        Ok(match self.read_chunk(&mut byte).await? {
            0 => None,
            _ => Some(byte[0]),
        })
    }

    /// Fill `buf` with available bytes; returns the count, `0` at end of
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's fault.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> CommResult<usize> {
        self.read_chunk_with(buf, None).await
    }

    /// [`ByteStreamReader::read_chunk`] with a caller-supplied cancel token.
    pub async fn read_chunk_with(
        &self,
        buf: &mut [u8],
        cancel: Option<&CancellationToken>,
    ) -> CommResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut cursor = self.cursor.lock().await;
        loop {
            if !cursor.chunk.is_empty() {
                let take = buf.len().min(cursor.chunk.len());
                buf[..take].copy_from_slice(&cursor.chunk.split_to(take));
                if cursor.chunk.is_empty()
                    && let Some(lease) = cursor.lease.take()
                {
                    lease.release().await;
                }
                return Ok(take);
            }
            match self.queue.next_page(cancel).await? {
                None => return Ok(0),
                Some(lease) => {
                    cursor.chunk = lease.data().clone();
                    cursor.lease = Some(lease);
                }
            }
        }
    }

    /// Pump the stream into an async byte sink until end of stream.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Propagates sink failures as [`RetCode::OtherError`] and stream
    /// failures unchanged.
    pub async fn read_all<W>(&self, mut sink: W) -> CommResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut scratch = [0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = self.read_chunk(&mut scratch).await?;
            if n == 0 {
                return Ok(total);
            }
            sink.write_all(&scratch[..n])
                .await
                .map_err(|error| CommError::new(RetCode::OtherError, error.to_string()))?;
            total += n as u64;
        }
    }

    /// Whole-page access for zero-copy bridging.
    ///
    /// Pages already partially consumed through `read_*` are not replayed;
    /// the enumerator starts at the next undelivered page.
    #[must_use]
    pub fn bulk_enumerator(&self) -> BulkEnumerator {
        BulkEnumerator {
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Iterator-style access to whole received pages.
pub struct BulkEnumerator {
    queue: Arc<PageQueue>,
}

impl BulkEnumerator {
    /// Next whole page; `None` signals end of stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's fault.
    pub async fn next_page(&mut self) -> CommResult<Option<PageLease>> {
        self.queue.next_page(None).await
    }
}

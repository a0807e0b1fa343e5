use std::{
  pin::Pin,
  task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;

/// Reshapes a stream of byte chunks: splits chunks larger than `chunk_size`
/// and stops after `limit_bytes` bytes in total.
pub struct ByteStream<T> {
  stream: T,
  // leftover of a chunk that was larger than chunk_size
  pending: Bytes,
  chunk_size: Option<usize>,
  limit_bytes: Option<usize>,
}

impl<T> ByteStream<T> {
  pub fn new(stream: T) -> Self {
    ByteStream {
      stream,
      pending: Bytes::new(),
      chunk_size: None,
      limit_bytes: None,
    }
  }

  pub fn chunk_size(self, bytes: usize) -> Self {
    ByteStream {
      chunk_size: Some(bytes.max(1)),
      ..self
    }
  }

  pub fn limit_bytes(self, bytes: usize) -> Self {
    ByteStream {
      limit_bytes: Some(bytes),
      ..self
    }
  }

  fn emit(&mut self, mut bytes: Bytes) -> Bytes {
    if let Some(chunk_size) = self.chunk_size {
      if bytes.len() > chunk_size {
        self.pending = bytes.split_off(chunk_size);
      }
    }

    if let Some(limit) = self.limit_bytes {
      if bytes.len() > limit {
        bytes.truncate(limit);
      }
      self.limit_bytes = Some(limit - bytes.len());
    }

    bytes
  }
}

impl<T, E> Stream for ByteStream<T>
where
  T: Stream<Item = Result<Bytes, E>> + Unpin,
{
  type Item = Result<Bytes, E>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = &mut *self;

    if this.limit_bytes == Some(0) {
      return Poll::Ready(None);
    }

    if !this.pending.is_empty() {
      let pending = std::mem::take(&mut this.pending);
      return Poll::Ready(Some(Ok(this.emit(pending))));
    }

    loop {
      match Pin::new(&mut this.stream).poll_next(cx) {
        // empty chunks carry nothing worth forwarding
        Poll::Ready(Some(Ok(bytes))) if bytes.is_empty() => continue,
        Poll::Ready(Some(Ok(bytes))) => {
          return Poll::Ready(Some(Ok(this.emit(bytes))))
        }
        other => return other,
      }
    }
  }
}

//! Streaming JSON array framing
//!
//! The topology export is one JSON array, written element by element and read
//! the same way. [`JsonArrayCodec`] yields each element as soon as its bytes
//! have arrived and insists on the `[` and `]` delimiters: a document that is
//! not strictly bracketed is a protocol error, not an empty result.
//!
//! Elements are expected to be JSON objects or arrays. A bare number split
//! across two reads could otherwise be decoded early.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum size of a single array element (16 MB)
pub const MAX_ITEM_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected '[' at start of document, found {0:?}")]
    MissingOpen(char),
    #[error("unexpected {0:?} between array elements")]
    UnexpectedDelimiter(char),
    #[error("data after closing ']'")]
    TrailingData,
    #[error("document ended before closing ']'")]
    Truncated,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("element too large: {0} bytes buffered (max {MAX_ITEM_SIZE})")]
    TooLarge(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Nothing consumed yet, waiting for `[`
    Open,
    /// After `[`: an element or `]`
    First,
    /// After `,`: an element is required
    Item,
    /// After an element: `,` or `]`
    Next,
    /// After `]`: only whitespace may follow
    Closed,
}

/// Codec for one JSON array streamed element by element
pub struct JsonArrayCodec<T> {
    state: State,
    max_item_size: usize,
    written: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T> JsonArrayCodec<T> {
    /// Create a new codec
    pub fn new() -> Self {
        Self::with_max_item_size(MAX_ITEM_SIZE)
    }

    /// Create a codec with a custom element size cap
    pub fn with_max_item_size(max_item_size: usize) -> Self {
        Self {
            state: State::Open,
            max_item_size,
            written: false,
            _item: PhantomData,
        }
    }

    /// Whether the closing `]` has been decoded
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Write the closing delimiter after the last encoded element.
    ///
    /// An encoder that never saw an element still produces `[]`.
    pub fn finish(&mut self, dst: &mut BytesMut) {
        if !self.written {
            dst.put_u8(b'[');
            self.written = true;
        }
        dst.put_u8(b']');
    }
}

impl<T> Default for JsonArrayCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonArrayCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonArrayCodec")
            .field("state", &self.state)
            .field("max_item_size", &self.max_item_size)
            .finish()
    }
}

fn skip_whitespace(src: &mut BytesMut) {
    let ws = src
        .iter()
        .take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
        .count();
    src.advance(ws);
}

impl<T: DeserializeOwned> JsonArrayCodec<T> {
    fn decode_item(&mut self, src: &mut BytesMut) -> Result<Option<T>, FrameError> {
        let mut items = serde_json::Deserializer::from_slice(&src[..]).into_iter::<T>();
        match items.next() {
            Some(Ok(item)) => {
                let consumed = items.byte_offset();
                src.advance(consumed);
                self.state = State::Next;
                Ok(Some(item))
            }
            Some(Err(err)) if err.is_eof() => {
                if src.len() > self.max_item_size {
                    return Err(FrameError::TooLarge(src.len()));
                }
                Ok(None)
            }
            Some(Err(err)) => Err(FrameError::Json(err)),
            None => Ok(None),
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonArrayCodec<T> {
    type Item = T;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            skip_whitespace(src);
            let Some(&next) = src.first() else {
                return Ok(None);
            };

            match self.state {
                State::Open => {
                    if next != b'[' {
                        return Err(FrameError::MissingOpen(next as char));
                    }
                    src.advance(1);
                    self.state = State::First;
                }
                State::First | State::Item => {
                    if next == b']' {
                        if self.state == State::Item {
                            return Err(FrameError::UnexpectedDelimiter(']'));
                        }
                        src.advance(1);
                        self.state = State::Closed;
                        continue;
                    }
                    return self.decode_item(src);
                }
                State::Next => {
                    match next {
                        b',' => self.state = State::Item,
                        b']' => self.state = State::Closed,
                        other => return Err(FrameError::UnexpectedDelimiter(other as char)),
                    }
                    src.advance(1);
                }
                State::Closed => return Err(FrameError::TrailingData),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.state == State::Closed {
            Ok(None)
        } else {
            Err(FrameError::Truncated)
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonArrayCodec<T> {
    type Error = FrameError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(if self.written { b',' } else { b'[' });
        self.written = true;
        serde_json::to_writer(dst.writer(), &item)?;
        Ok(())
    }
}

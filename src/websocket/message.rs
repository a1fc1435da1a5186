use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use super::WsError;

#[derive(Debug)]
enum Chunk {
    Data(Bytes),
    End,
}

/// One incoming text or binary message.
///
/// The payload arrives in pieces while the peer is still sending it. A
/// message can be read once, chunk by chunk with [`next_chunk`](Self::next_chunk)
/// or all at once with [`buffer`](Self::buffer).
#[derive(Debug)]
pub struct Message {
    binary: bool,
    rx: mpsc::UnboundedReceiver<Chunk>,
    finished: bool,
}

/// Producer half owned by the connection task.
#[derive(Debug)]
pub(crate) struct MessageSender {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl MessageSender {
    pub(crate) fn push(&self, data: Bytes) {
        if !data.is_empty() {
            // The application may drop a message without reading it.
            let _ = self.tx.send(Chunk::Data(data));
        }
    }

    pub(crate) fn finish(self) {
        let _ = self.tx.send(Chunk::End);
    }
}

impl Message {
    pub(crate) fn channel(binary: bool) -> (MessageSender, Message) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MessageSender { tx },
            Message {
                binary,
                rx,
                finished: false,
            },
        )
    }

    /// `true` for binary messages, `false` for text.
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Waits for the next piece of payload; `Ok(None)` after the last one.
    ///
    /// # Errors
    ///
    /// [`WsError::MessageAborted`] if the connection closed before the final frame.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, WsError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Chunk::Data(data)) => Ok(Some(data)),
            Some(Chunk::End) => {
                self.finished = true;
                Ok(None)
            }
            None => {
                self.finished = true;
                Err(WsError::MessageAborted)
            }
        }
    }

    /// Collects the whole payload.
    ///
    /// # Errors
    ///
    /// [`WsError::MessageAborted`] if the connection closed before the final frame.
    pub async fn buffer(mut self) -> Result<Bytes, WsError> {
        let first = match self.next_chunk().await? {
            Some(chunk) => chunk,
            None => return Ok(Bytes::new()),
        };
        let Some(second) = self.next_chunk().await? else {
            return Ok(first);
        };

        let mut buf = BytesMut::with_capacity(first.len() + second.len());
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Collects the whole payload as a string.
    ///
    /// # Errors
    ///
    /// [`WsError::InvalidUtf8`] for a payload that is not UTF-8, otherwise as
    /// [`buffer`](Self::buffer).
    pub async fn text(self) -> Result<String, WsError> {
        let bytes = self.buffer().await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WsError::InvalidUtf8)
    }
}

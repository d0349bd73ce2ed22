//! Fixed-width wire protocol between producers and the consumer.
//!
//! Every message is exactly four bytes:
//! ```text
//! ┌──────────────────────┬───────────────────────────────────────┐
//! │ registration / step  │ i32, native endian                    │
//! │ acknowledgement      │ ASCII "done"                          │
//! │ termination          │ ASCII "exit" (either direction)       │
//! └──────────────────────┴───────────────────────────────────────┘
//! ```
//!
//! Handshake: the producer dials, sends its client index, and waits for the
//! consumer's ready `done`. After that each step number it sends is answered
//! by exactly one `done` (or `exit`).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SyncError, SyncResult};

pub const MESSAGE_LEN: usize = 4;
pub const DONE: [u8; MESSAGE_LEN] = *b"done";
pub const EXIT: [u8; MESSAGE_LEN] = *b"exit";

/// One protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Step number the producer finished writing
    Step(i32),
    /// Acknowledgement (also the consumer's ready signal)
    Done,
    /// Termination
    Exit,
}

impl Message {
    /// Wire form. A step whose bytes spell a token cannot be sent.
    pub fn encode(self) -> SyncResult<[u8; MESSAGE_LEN]> {
        match self {
            Message::Done => Ok(DONE),
            Message::Exit => Ok(EXIT),
            Message::Step(step) => {
                let bytes = step.to_ne_bytes();
                if bytes == DONE || bytes == EXIT {
                    return Err(SyncError::StepOverflow(step as i64));
                }
                Ok(bytes)
            }
        }
    }

    pub fn decode(bytes: [u8; MESSAGE_LEN]) -> Self {
        match bytes {
            DONE => Message::Done,
            EXIT => Message::Exit,
            other => Message::Step(i32::from_ne_bytes(other)),
        }
    }
}

/// Registration bytes of a client index.
pub fn encode_registration(client: i32) -> SyncResult<[u8; MESSAGE_LEN]> {
    match Message::Step(client).encode() {
        Ok(bytes) => Ok(bytes),
        Err(_) => Err(SyncError::Protocol(format!(
            "client index {client} collides with a protocol token"
        ))),
    }
}

pub fn decode_registration(bytes: [u8; MESSAGE_LEN]) -> SyncResult<i32> {
    match Message::decode(bytes) {
        Message::Step(client) => Ok(client),
        other => Err(SyncError::Protocol(format!(
            "expected a client index, got {other:?}"
        ))),
    }
}

/// Read one message. `Ok(None)` when the peer closed the connection.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> SyncResult<Option<Message>> {
    let mut buf = [0u8; MESSAGE_LEN];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(Message::decode(buf))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: Message) -> SyncResult<()> {
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_ascii() {
        assert_eq!(Message::Done.encode().unwrap(), *b"done");
        assert_eq!(Message::Exit.encode().unwrap(), *b"exit");
        assert_eq!(Message::decode(*b"exit"), Message::Exit);
    }

    #[test]
    fn test_step_is_native_endian() {
        let bytes = Message::Step(7).encode().unwrap();
        assert_eq!(bytes, 7i32.to_ne_bytes());
        assert_eq!(Message::decode(bytes), Message::Step(7));
    }

    #[test]
    fn test_step_colliding_with_token_is_rejected() {
        let done_as_step = i32::from_ne_bytes(DONE);
        let err = Message::Step(done_as_step).encode().unwrap_err();
        assert!(matches!(err, SyncError::StepOverflow(_)));
        assert!(encode_registration(i32::from_ne_bytes(EXIT)).is_err());
    }

    #[test]
    fn test_registration_rejects_tokens() {
        assert_eq!(decode_registration(3i32.to_ne_bytes()).unwrap(), 3);
        assert!(matches!(decode_registration(DONE), Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_message(&mut a, Message::Step(1)).await.unwrap();
        write_message(&mut a, Message::Done).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), Some(Message::Step(1)));
        assert_eq!(read_message(&mut b).await.unwrap(), Some(Message::Done));
        drop(a);
        assert_eq!(read_message(&mut b).await.unwrap(), None);
    }
}

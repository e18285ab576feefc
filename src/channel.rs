//! A communication channel used to send/receive messages to/from another party.

use std::{fmt, future::Future, time::Duration};

use bincode::Options;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::mpsc::{Receiver, Sender, channel},
    time::timeout,
};
use tracing::debug;

/// Messages larger than this are split into several chunks by [`SimpleChannel`].
///
/// Chunk headers count chunks as `u32`, so a single message is limited to `u32::MAX` chunks.
const CHUNK_SIZE: usize = 100 * 1024 * 1024;

/// How long [`SimpleChannel`] waits for a message before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug)]
pub struct Error {
    /// The protocol phase during which the error occurred.
    pub phase: String,
    /// The specific error that was raised.
    pub reason: ErrorKind,
}

/// The specific error that occurred when trying to send / receive a message.
#[derive(Debug)]
pub enum ErrorKind {
    /// The (serialized) message could not be received over the channel.
    RecvError(String),
    /// The (serialized) message could not be sent over the channel.
    SendError(String),
    /// The message could not be serialized (before sending it out) or deserialized.
    SerdeError(String),
    /// The received message is larger than the receiver is willing to accept.
    MessageTooLarge {
        /// Size of the received message in bytes.
        size: usize,
        /// The configured limit in bytes.
        limit: usize,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            ErrorKind::RecvError(e) => write!(f, "could not receive {}: {e}", self.phase),
            ErrorKind::SendError(e) => write!(f, "could not send {}: {e}", self.phase),
            ErrorKind::SerdeError(e) => write!(f, "could not (de-)serialize {}: {e}", self.phase),
            ErrorKind::MessageTooLarge { size, limit } => write!(
                f,
                "received {} of {size} bytes, but at most {limit} bytes are accepted",
                self.phase
            ),
        }
    }
}

/// A communication channel used to send/receive messages to/from another party.
///
/// Parties are addressed by their index in `0..participants`.
pub trait Channel {
    /// The error that can occur sending messages over the channel.
    type SendError: fmt::Debug;
    /// The error that can occur receiving messages over the channel.
    type RecvError: fmt::Debug;

    /// Sends a message to the party with the given index (must be between `0..participants`).
    fn send_bytes_to(
        &mut self,
        party: usize,
        msg: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits a response from the party with the given index (must be between `0..participants`).
    fn recv_bytes_from(
        &mut self,
        party: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;
}

/// The bincode configuration used for everything that goes over the wire.
pub(crate) fn wire_options() -> impl Options + Copy {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Returns the number of bytes `msg` occupies once serialized for the wire.
pub(crate) fn serialized_size(phase: &str, msg: &impl Serialize) -> Result<usize, Error> {
    wire_options()
        .serialized_size(msg)
        .map(|size| size as usize)
        .map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })
}

/// A wrapper around [`Channel`] that takes care of (de-)serializing messages.
#[derive(Debug)]
pub(crate) struct MsgChannel<C: Channel>(pub C);

impl<C: Channel> MsgChannel<C> {
    /// Serializes and sends a message to the other party.
    pub(crate) async fn send_to(
        &mut self,
        party: usize,
        phase: &str,
        msg: &(impl Serialize + Sync),
    ) -> Result<(), Error> {
        let msg = wire_options().serialize(msg).map_err(|e| Error {
            phase: format!("sending {phase}"),
            reason: ErrorKind::SerdeError(format!("{e:?}")),
        })?;
        self.0.send_bytes_to(party, msg).await.map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::SendError(format!("{e:?}")),
        })
    }

    /// Receives and deserializes a message of at most `limit` bytes from the other party.
    pub(crate) async fn recv_from<T: DeserializeOwned>(
        &mut self,
        party: usize,
        phase: &str,
        limit: usize,
    ) -> Result<T, Error> {
        let msg = self.0.recv_bytes_from(party).await.map_err(|e| Error {
            phase: phase.to_string(),
            reason: ErrorKind::RecvError(format!("{e:?}")),
        })?;
        if msg.len() > limit {
            return Err(Error {
                phase: phase.to_string(),
                reason: ErrorKind::MessageTooLarge {
                    size: msg.len(),
                    limit,
                },
            });
        }
        wire_options()
            .with_limit(limit as u64)
            .deserialize(&msg)
            .map_err(|e| Error {
                phase: format!("receiving {phase}"),
                reason: ErrorKind::SerdeError(format!("{e:?}")),
            })
    }
}

/// A simple asynchronous in-memory channel using [`Sender`] and [`Receiver`].
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Receiver<Vec<u8>>>>,
    bytes_sent: usize,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels = vec![];
        for _ in 0..parties {
            let mut s = vec![];
            let mut r = vec![];
            for _ in 0..parties {
                s.push(None);
                r.push(None);
            }
            channels.push(SimpleChannel {
                s,
                r,
                bytes_sent: 0,
            });
        }
        for a in 0..parties {
            for b in (a + 1)..parties {
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                let (send_b_to_a, recv_b_to_a) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].s[a] = Some(send_b_to_a);
                channels[a].r[b] = Some(recv_b_to_a);
                channels[b].r[a] = Some(recv_a_to_b);
            }
        }
        channels
    }

    /// Returns the number of bytes sent on this channel, including chunk headers.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }
}

#[derive(Debug)]
/// The error raised by `send` calls of a [`SimpleChannel`].
pub enum AsyncSendError {
    /// The channel has been closed.
    Closed,
    /// The message needs more chunks than a chunk header can count.
    TooManyChunks(usize),
}

#[derive(Debug)]
/// The error raised by `recv` calls of a [`SimpleChannel`].
pub enum AsyncRecvError {
    /// The channel has been closed.
    Closed,
    /// No message was received before the timeout.
    TimeoutElapsed,
    /// A chunk arrived without a valid header.
    MalformedChunk,
}

impl Channel for SimpleChannel {
    type SendError = AsyncSendError;
    type RecvError = AsyncRecvError;

    async fn send_bytes_to(&mut self, p: usize, msg: Vec<u8>) -> Result<(), AsyncSendError> {
        debug!(party = p, bytes = msg.len(), "sending msg");
        let mut chunks: Vec<_> = msg.chunks(CHUNK_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let length = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if length > 1 {
                debug!("  (sending chunk {}/{} to party {})", i + 1, length, p);
            }
            let mut msg = Vec::with_capacity(2 * 4 + chunk.len());
            msg.extend(chunk_header(i, length)?);
            msg.extend(chunk);
            self.bytes_sent += msg.len();
            self.s[p]
                .as_ref()
                .unwrap_or_else(|| panic!("No sender for party {p}"))
                .send(msg)
                .await
                .map_err(|_| AsyncSendError::Closed)?;
        }
        Ok(())
    }

    async fn recv_bytes_from(&mut self, p: usize) -> Result<Vec<u8>, AsyncRecvError> {
        let mut msg: Vec<u8> = vec![];
        loop {
            let chunk = self.r[p]
                .as_mut()
                .unwrap_or_else(|| panic!("No receiver for party {p}"))
                .recv();
            let chunk = match timeout(RECV_TIMEOUT, chunk).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Err(AsyncRecvError::Closed),
                Err(_) => return Err(AsyncRecvError::TimeoutElapsed),
            };
            let (Some(i), Some(length)) = (header_field(&chunk, 0), header_field(&chunk, 4)) else {
                return Err(AsyncRecvError::MalformedChunk);
            };
            msg.extend(&chunk[8..]);
            if i + 1 >= length {
                break Ok(msg);
            }
        }
    }
}

fn chunk_header(index: usize, chunks: usize) -> Result<[u8; 8], AsyncSendError> {
    let (Ok(index), Ok(count)) = (u32::try_from(index), u32::try_from(chunks)) else {
        return Err(AsyncSendError::TooManyChunks(chunks));
    };
    let mut header = [0; 8];
    header[..4].copy_from_slice(&index.to_be_bytes());
    header[4..].copy_from_slice(&count.to_be_bytes());
    Ok(header)
}

fn header_field(chunk: &[u8], offset: usize) -> Option<u32> {
    let bytes = chunk.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::{AsyncSendError, Channel, MsgChannel, SimpleChannel, chunk_header, header_field};
    use crate::channel::ErrorKind;

    #[test]
    fn chunk_headers_hold_index_and_count() {
        let header = chunk_header(2, 5).unwrap();
        assert_eq!(header_field(&header, 0), Some(2));
        assert_eq!(header_field(&header, 4), Some(5));
    }

    #[test]
    fn chunk_counts_beyond_u32_are_rejected() {
        let too_many = u32::MAX as usize + 1;
        assert!(matches!(
            chunk_header(0, too_many),
            Err(AsyncSendError::TooManyChunks(n)) if n == too_many
        ));
        assert!(matches!(
            chunk_header(too_many, too_many),
            Err(AsyncSendError::TooManyChunks(_))
        ));
    }

    #[tokio::test]
    async fn simple_channel_delivers_in_order() {
        let [mut a, mut b]: [SimpleChannel; 2] = SimpleChannel::channels(2)
            .try_into()
            .expect("parties is 2");
        a.send_bytes_to(1, vec![1, 2, 3]).await.unwrap();
        a.send_bytes_to(1, vec![]).await.unwrap();
        assert_eq!(b.recv_bytes_from(0).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(b.recv_bytes_from(0).await.unwrap(), Vec::<u8>::new());
        assert_eq!(a.bytes_sent(), 3 + 8 + 8);
    }

    #[tokio::test]
    async fn closed_channel_is_reported() {
        let mut channels = SimpleChannel::channels(2);
        let mut b = channels.pop().unwrap();
        drop(channels);
        assert!(b.recv_bytes_from(0).await.is_err());
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let [a, b]: [SimpleChannel; 2] = SimpleChannel::channels(2)
            .try_into()
            .expect("parties is 2");
        let (mut a, mut b) = (MsgChannel(a), MsgChannel(b));
        a.send_to(1, "payload", &vec![7u8; 64]).await.unwrap();
        let err = b.recv_from::<Vec<u8>>(0, "payload", 16).await.unwrap_err();
        assert!(matches!(
            err.reason,
            ErrorKind::MessageTooLarge { size: 72, limit: 16 }
        ));
    }
}

//! The network as seen by atomic operations, and the batching layer that maps it onto a
//! [`Channel`].
//!
//! Atomic operations never talk to a transport directly. During a round they [`Network::send`]
//! into per-party buffers and [`Network::receive`] from the messages that arrived at the end of
//! the previous round. Between two rounds the evaluator calls [`BatchedNetwork::exchange`], which
//! writes exactly one frame to every other party (possibly empty) and reads exactly one frame
//! back from each of them. All messages a party sends to another party within one round thus
//! travel as a single transport write.

use std::{collections::VecDeque, mem};

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::channel::{self, Channel, MsgChannel, serialized_size};

/// Identifies a party. Party ids are 1-based, i.e. they range over `1..=party_count`.
pub type PartyId = usize;

/// Frames larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors raised by the network layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The party id is not in `1..=parties`.
    #[error("party {party} does not exist, valid party ids are 1..={parties}")]
    InvalidParty {
        /// The offending party id.
        party: PartyId,
        /// The number of parties in the computation.
        parties: usize,
    },
    /// An operation tried to receive a message that was never sent.
    #[error("no message from party {party} left to receive in round {round}")]
    NoMessage {
        /// The party the message was expected from.
        party: PartyId,
        /// The network round in which the receive happened.
        round: u64,
    },
    /// The messages for one party in one round exceed the frame limit.
    #[error("frame of {size} bytes for party {party} exceeds the limit of {limit} bytes")]
    FrameTooLarge {
        /// The destination of the frame.
        party: PartyId,
        /// The size of the encoded frame.
        size: usize,
        /// The configured limit.
        limit: usize,
    },
    /// A frame arrived that belongs to a different round than the local one.
    #[error("frame from party {party} belongs to round {actual}, but round {expected} is running")]
    RoundMismatch {
        /// The sender of the frame.
        party: PartyId,
        /// The local round.
        expected: u64,
        /// The round announced by the frame.
        actual: u64,
    },
    /// Messages of the previous round were never received by any operation.
    #[error("{count} message(s) from party {party} were never received")]
    UnreadMessages {
        /// The sender of the unread messages.
        party: PartyId,
        /// How many messages were left.
        count: usize,
    },
    /// Messages were sent in a round that is not followed by an exchange.
    #[error("{count} message(s) were sent after the last round and can never be received")]
    UnflushedMessages {
        /// How many messages were left.
        count: usize,
    },
    /// The underlying channel failed.
    #[error("channel error: {0}")]
    Channel(#[from] channel::Error),
}

/// The synchronous network capability handed to atomic operations.
pub trait Network {
    /// Queues `data` for `party`, delivered at the end of the current round.
    fn send(&mut self, party: PartyId, data: Vec<u8>) -> Result<(), Error>;

    /// Returns the next message `party` sent in the previous round.
    fn receive(&mut self, party: PartyId) -> Result<Vec<u8>, Error>;

    /// The number of parties taking part in the computation.
    fn party_count(&self) -> usize;

    /// The id of the local party.
    fn my_id(&self) -> PartyId;

    /// Queues `data` for every party, including the local one.
    fn send_to_all(&mut self, data: &[u8]) -> Result<(), Error> {
        for party in 1..=self.party_count() {
            self.send(party, data.to_vec())?;
        }
        Ok(())
    }

    /// Receives the next message from every party (including the local one), ordered by id.
    fn receive_from_all(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        (1..=self.party_count())
            .map(|party| self.receive(party))
            .collect()
    }
}

/// All messages one party sends to another party during one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub(crate) round: u64,
    pub(crate) messages: Vec<Vec<u8>>,
}

/// Buffers the messages of a round per party and exchanges them as framed batches.
#[derive(Debug)]
pub struct BatchedNetwork<C: Channel> {
    channel: MsgChannel<C>,
    my_id: PartyId,
    parties: usize,
    max_frame_size: usize,
    round: u64,
    outbound: Vec<Vec<Vec<u8>>>,
    inbound: Vec<VecDeque<Vec<u8>>>,
    loopback: Vec<Vec<u8>>,
}

impl<C: Channel> BatchedNetwork<C> {
    /// Wraps `channel` for the party `my_id` out of `parties` parties.
    ///
    /// The channel addresses party `p` by index `p - 1`.
    pub fn new(channel: C, my_id: PartyId, parties: usize) -> Result<Self, Error> {
        if my_id == 0 || my_id > parties {
            return Err(Error::InvalidParty {
                party: my_id,
                parties,
            });
        }
        Ok(Self {
            channel: MsgChannel(channel),
            my_id,
            parties,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            round: 0,
            outbound: vec![vec![]; parties],
            inbound: vec![VecDeque::new(); parties],
            loopback: vec![],
        })
    }

    /// Sets the maximum size of a single encoded frame.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// The number of exchanges completed so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel.0
    }

    /// Consumes the network and returns the underlying channel.
    pub fn into_inner(self) -> C {
        self.channel.0
    }

    /// The number of messages queued but not yet flushed.
    pub fn pending_sends(&self) -> usize {
        self.outbound.iter().map(Vec::len).sum()
    }

    /// Fails if messages are queued that no exchange will ever deliver.
    pub fn ensure_flushed(&self) -> Result<(), Error> {
        match self.pending_sends() {
            0 => Ok(()),
            count => Err(Error::UnflushedMessages { count }),
        }
    }

    /// The number of messages received in the last exchange that no operation has read yet.
    pub fn pending_receives(&self) -> usize {
        self.inbound.iter().map(VecDeque::len).sum()
    }

    /// Fails if messages of the last exchange were left unread.
    pub fn ensure_drained(&self) -> Result<(), Error> {
        match self.inbound.iter().position(|queue| !queue.is_empty()) {
            None => Ok(()),
            Some(i) => Err(Error::UnreadMessages {
                party: i + 1,
                count: self.inbound[i].len(),
            }),
        }
    }

    fn index(&self, party: PartyId) -> Result<usize, Error> {
        if party == 0 || party > self.parties {
            Err(Error::InvalidParty {
                party,
                parties: self.parties,
            })
        } else {
            Ok(party - 1)
        }
    }

    /// Writes the frame of the current round to every other party.
    ///
    /// Must be called exactly once per round, followed by [`Self::receive_frames`].
    pub async fn flush(&mut self) -> Result<(), Error> {
        for party in 1..=self.parties {
            let messages = mem::take(&mut self.outbound[party - 1]);
            if party == self.my_id {
                self.loopback = messages;
                continue;
            }
            let frame = Frame {
                round: self.round,
                messages,
            };
            let size = serialized_size("frame", &frame)?;
            if size > self.max_frame_size {
                return Err(Error::FrameTooLarge {
                    party,
                    size,
                    limit: self.max_frame_size,
                });
            }
            debug!(party, size, messages = frame.messages.len(), "flushing frame");
            self.channel.send_to(party - 1, "frame", &frame).await?;
        }
        Ok(())
    }

    /// Reads the frame of the current round from every other party.
    pub async fn receive_frames(&mut self) -> Result<(), Error> {
        self.ensure_drained()?;
        for party in 1..=self.parties {
            let messages = if party == self.my_id {
                mem::take(&mut self.loopback)
            } else {
                let frame: Frame = self
                    .channel
                    .recv_from(party - 1, "frame", self.max_frame_size)
                    .await?;
                if frame.round != self.round {
                    return Err(Error::RoundMismatch {
                        party,
                        expected: self.round,
                        actual: frame.round,
                    });
                }
                frame.messages
            };
            self.inbound[party - 1] = messages.into();
        }
        Ok(())
    }

    /// Ends the current round: flushes all buffered messages and receives those of all other
    /// parties.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub async fn exchange(&mut self) -> Result<(), Error> {
        debug!(round = self.round, "exchanging frames");
        self.flush().await?;
        self.receive_frames().await?;
        self.round += 1;
        Ok(())
    }
}

impl<C: Channel> Network for BatchedNetwork<C> {
    fn send(&mut self, party: PartyId, data: Vec<u8>) -> Result<(), Error> {
        let i = self.index(party)?;
        self.outbound[i].push(data);
        Ok(())
    }

    fn receive(&mut self, party: PartyId) -> Result<Vec<u8>, Error> {
        let i = self.index(party)?;
        self.inbound[i].pop_front().ok_or(Error::NoMessage {
            party,
            round: self.round,
        })
    }

    fn party_count(&self) -> usize {
        self.parties
    }

    fn my_id(&self) -> PartyId {
        self.my_id
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bincode::Options;

    use super::{BatchedNetwork, Error, Frame, Network};
    use crate::channel::{Channel, SimpleChannel, wire_options};

    /// Records every write and replays pre-recorded reads.
    #[derive(Debug, Default)]
    struct RecordingChannel {
        writes: Vec<(usize, Vec<u8>)>,
        reads: VecDeque<Vec<u8>>,
    }

    impl Channel for RecordingChannel {
        type SendError = ();
        type RecvError = ();

        async fn send_bytes_to(&mut self, party: usize, msg: Vec<u8>) -> Result<(), ()> {
            self.writes.push((party, msg));
            Ok(())
        }

        async fn recv_bytes_from(&mut self, _party: usize) -> Result<Vec<u8>, ()> {
            self.reads.pop_front().ok_or(())
        }
    }

    #[tokio::test]
    async fn messages_of_one_round_share_a_single_write() -> Result<(), Error> {
        let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 10]).collect();

        let mut alice = BatchedNetwork::new(RecordingChannel::default(), 1, 2)?;
        for payload in &payloads {
            alice.send(2, payload.clone())?;
        }
        alice.flush().await?;

        let writes = alice.into_inner().writes;
        assert_eq!(writes.len(), 1);
        let (to, bytes) = &writes[0];
        assert_eq!(*to, 1);
        // round + vec length + 3 * (length prefix + payload)
        assert_eq!(bytes.len(), 8 + 8 + 3 * (8 + 10));
        let frame: Frame = wire_options().deserialize(bytes).unwrap();
        assert_eq!(frame.messages, payloads);

        let bob_channel = RecordingChannel {
            reads: VecDeque::from([bytes.clone()]),
            ..Default::default()
        };
        let mut bob = BatchedNetwork::new(bob_channel, 2, 2)?;
        bob.receive_frames().await?;
        for payload in &payloads {
            assert_eq!(&bob.receive(1)?, payload);
        }
        assert!(matches!(
            bob.receive(1),
            Err(Error::NoMessage { party: 1, round: 0 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn exchange_delivers_loopback_and_remote_messages() -> Result<(), Error> {
        let [a, b]: [SimpleChannel; 2] = SimpleChannel::channels(2)
            .try_into()
            .expect("parties is 2");
        let mut a = BatchedNetwork::new(a, 1, 2)?;
        let mut b = BatchedNetwork::new(b, 2, 2)?;
        a.send_to_all(b"from a")?;
        b.send_to_all(b"from b")?;
        let (ra, rb) = tokio::join!(a.exchange(), b.exchange());
        ra?;
        rb?;
        assert_eq!(a.receive_from_all()?, vec![b"from a".to_vec(), b"from b".to_vec()]);
        assert_eq!(b.receive_from_all()?, vec![b"from a".to_vec(), b"from b".to_vec()]);
        assert_eq!((a.round(), b.round()), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_party_ids_are_rejected() {
        let channel = SimpleChannel::channels(1).pop().unwrap();
        assert!(matches!(
            BatchedNetwork::new(channel, 2, 1),
            Err(Error::InvalidParty {
                party: 2,
                parties: 1
            })
        ));
        let channel = SimpleChannel::channels(1).pop().unwrap();
        let mut network = BatchedNetwork::new(channel, 1, 1).unwrap();
        assert!(matches!(
            network.send(0, vec![]),
            Err(Error::InvalidParty { party: 0, .. })
        ));
        assert!(matches!(
            network.receive(3),
            Err(Error::InvalidParty { party: 3, .. })
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut network = BatchedNetwork::new(RecordingChannel::default(), 1, 2)
            .unwrap()
            .with_max_frame_size(32);
        network.send(2, vec![0; 32]).unwrap();
        assert!(matches!(
            network.flush().await,
            Err(Error::FrameTooLarge {
                party: 2,
                limit: 32,
                ..
            })
        ));
        assert!(network.into_inner().writes.is_empty());
    }

    #[tokio::test]
    async fn frames_from_another_round_are_rejected() {
        let frame = Frame {
            round: 5,
            messages: vec![],
        };
        let channel = RecordingChannel {
            reads: VecDeque::from([wire_options().serialize(&frame).unwrap()]),
            ..Default::default()
        };
        let mut network = BatchedNetwork::new(channel, 2, 2).unwrap();
        assert!(matches!(
            network.receive_frames().await,
            Err(Error::RoundMismatch {
                party: 1,
                expected: 0,
                actual: 5
            })
        ));
    }

    #[tokio::test]
    async fn unread_messages_are_detected() -> Result<(), Error> {
        let channel = SimpleChannel::channels(1).pop().unwrap();
        let mut network = BatchedNetwork::new(channel, 1, 1)?;
        network.send(1, vec![1])?;
        network.exchange().await?;
        assert!(matches!(
            network.exchange().await,
            Err(Error::UnreadMessages { party: 1, count: 1 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn drained_networks_have_nothing_left_to_read() -> Result<(), Error> {
        let channel = SimpleChannel::channels(1).pop().unwrap();
        let mut network = BatchedNetwork::new(channel, 1, 1)?;
        network.ensure_drained()?;
        network.send(1, vec![1])?;
        network.send(1, vec![2])?;
        network.exchange().await?;
        assert_eq!(network.pending_receives(), 2);
        assert!(matches!(
            network.ensure_drained(),
            Err(Error::UnreadMessages { party: 1, count: 2 })
        ));
        network.receive(1)?;
        network.receive(1)?;
        network.ensure_drained()
    }
}

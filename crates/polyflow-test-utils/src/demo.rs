//! Additive secret sharing over `u64` (wrapping arithmetic), in plaintext.
//!
//! Every value is split into one share per party so that the shares sum up to the value. Inputs
//! and openings take one round each, multiplications use Beaver triples that every party derives
//! from a shared dealer seed and take one round as well.
//!
//! All operations resolve their inputs in their first round. A step may therefore only use
//! shares computed by earlier steps, e.g. by appending them to a sequential builder.

use std::{
    collections::VecDeque,
    ops::{Add, Mul, Sub},
};

use polyflow::{
    Error,
    builder::StepBuilder,
    deferred::Deferred,
    network::{Network, PartyId},
    operation::{EvaluationStatus, NativeOperation},
    pool::ResourcePool,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

/// Errors raised by the demo operations.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    /// A share did not have the expected length.
    #[error("party {party} sent a share of {len} bytes, expected 8")]
    MalformedShare {
        /// The sender of the share.
        party: PartyId,
        /// The length of the received message.
        len: usize,
    },
    /// The input owner has no private input left.
    #[error("party {party} has no private input left")]
    MissingInput {
        /// The input owner.
        party: PartyId,
    },
}

/// One party's share of a secret value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Share(pub u64);

impl Add for Share {
    type Output = Share;

    fn add(self, rhs: Share) -> Share {
        Share(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Share {
    type Output = Share;

    fn sub(self, rhs: Share) -> Share {
        Share(self.0.wrapping_sub(rhs.0))
    }
}

impl Mul<u64> for Share {
    type Output = Share;

    fn mul(self, rhs: u64) -> Share {
        Share(self.0.wrapping_mul(rhs))
    }
}

/// The resources of one party: its private inputs, its own randomness and the dealer stream
/// shared by all parties.
#[derive(Debug, Clone)]
pub struct DemoPool {
    my_id: PartyId,
    parties: usize,
    inputs: VecDeque<u64>,
    rng: ChaCha20Rng,
    dealer: ChaCha20Rng,
}

impl DemoPool {
    /// The pool of party `my_id` out of `parties` parties, using seed 0.
    pub fn new(my_id: PartyId, parties: usize) -> Self {
        Self::with_seed(my_id, parties, 0)
    }

    /// The pool of party `my_id`, all parties must use the same `seed`.
    pub fn with_seed(my_id: PartyId, parties: usize, seed: u64) -> Self {
        let dealer = ChaCha20Rng::seed_from_u64(seed);
        let mut rng = dealer.clone();
        rng.set_stream(my_id as u64);
        Self {
            my_id,
            parties,
            inputs: VecDeque::new(),
            rng,
            dealer,
        }
    }

    /// Queues private inputs, consumed in order by [`DemoArithmetic::input`].
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = u64>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    fn next_input(&mut self) -> Result<u64, DemoError> {
        self.inputs
            .pop_front()
            .ok_or(DemoError::MissingInput { party: self.my_id })
    }

    /// Draws the local shares of a multiplication triple `(a, b, a * b)`.
    fn deal(&mut self) -> (Share, Share, Share) {
        let a: u64 = self.dealer.random();
        let b: u64 = self.dealer.random();
        let i = self.my_id - 1;
        let a_shares = split(&mut self.dealer, a, self.parties);
        let b_shares = split(&mut self.dealer, b, self.parties);
        let c_shares = split(&mut self.dealer, a.wrapping_mul(b), self.parties);
        (a_shares[i], b_shares[i], c_shares[i])
    }
}

impl ResourcePool for DemoPool {
    fn my_id(&self) -> PartyId {
        self.my_id
    }

    fn party_count(&self) -> usize {
        self.parties
    }
}

/// Splits `value` into `parties` random shares.
fn split(rng: &mut impl Rng, value: u64, parties: usize) -> Vec<Share> {
    let mut shares: Vec<Share> = (1..parties).map(|_| Share(rng.random())).collect();
    let sum = shares.iter().fold(Share(0), |acc, s| acc + *s);
    shares.push(Share(value) - sum);
    shares
}

fn decode(party: PartyId, msg: &[u8]) -> Result<Share, Error> {
    let bytes: [u8; 8] = msg.try_into().map_err(|_| {
        Error::operation(DemoError::MalformedShare {
            party,
            len: msg.len(),
        })
    })?;
    Ok(Share(u64::from_le_bytes(bytes)))
}

fn encode(share: Share) -> Vec<u8> {
    share.0.to_le_bytes().to_vec()
}

/// The owner shares its next private input with everybody.
pub struct InputOp {
    owner: PartyId,
    share: Option<Share>,
}

impl NativeOperation<DemoPool> for InputOp {
    type Output = Share;

    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut DemoPool,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        if round == 0 {
            if pool.my_id == self.owner {
                let value = pool.next_input().map_err(Error::operation)?;
                let shares = split(&mut pool.rng, value, pool.parties);
                for (i, share) in shares.into_iter().enumerate() {
                    network.send(i + 1, encode(share))?;
                }
            }
            return Ok(EvaluationStatus::HasMoreRounds);
        }
        let msg = network.receive(self.owner)?;
        self.share = Some(decode(self.owner, &msg)?);
        Ok(EvaluationStatus::Done)
    }

    fn into_output(self) -> Share {
        match self.share {
            Some(share) => share,
            None => panic!("input finished without receiving a share"),
        }
    }
}

/// A public constant, held entirely by party 1.
pub struct KnownOp {
    value: u64,
    share: Share,
}

impl NativeOperation<DemoPool> for KnownOp {
    type Output = Share;

    fn evaluate(
        &mut self,
        _round: usize,
        pool: &mut DemoPool,
        _network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        if pool.my_id == 1 {
            self.share = Share(self.value);
        }
        Ok(EvaluationStatus::Done)
    }

    fn into_output(self) -> Share {
        self.share
    }
}

/// Reveals a shared value to everybody.
pub struct OpenOp {
    share: Deferred<Share>,
    value: u64,
}

impl NativeOperation<DemoPool> for OpenOp {
    type Output = u64;

    fn evaluate(
        &mut self,
        round: usize,
        _pool: &mut DemoPool,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        if round == 0 {
            network.send_to_all(&encode(self.share.resolve()))?;
            return Ok(EvaluationStatus::HasMoreRounds);
        }
        let mut sum = Share(0);
        for (i, msg) in network.receive_from_all()?.iter().enumerate() {
            sum = sum + decode(i + 1, msg)?;
        }
        self.value = sum.0;
        Ok(EvaluationStatus::Done)
    }

    fn into_output(self) -> u64 {
        self.value
    }
}

/// Multiplies two shared values using a Beaver triple.
pub struct MulOp {
    x: Deferred<Share>,
    y: Deferred<Share>,
    triple: (Share, Share, Share),
    product: Share,
}

impl NativeOperation<DemoPool> for MulOp {
    type Output = Share;

    fn evaluate(
        &mut self,
        round: usize,
        pool: &mut DemoPool,
        network: &mut dyn Network,
    ) -> Result<EvaluationStatus, Error> {
        if round == 0 {
            self.triple = pool.deal();
            let (a, b, _) = self.triple;
            network.send_to_all(&encode(self.x.resolve() - a))?;
            network.send_to_all(&encode(self.y.resolve() - b))?;
            return Ok(EvaluationStatus::HasMoreRounds);
        }
        let (mut d, mut e) = (Share(0), Share(0));
        for party in 1..=network.party_count() {
            d = d + decode(party, &network.receive(party)?)?;
            e = e + decode(party, &network.receive(party)?)?;
        }
        let (a, b, c) = self.triple;
        self.product = c + b * d.0 + a * e.0;
        if pool.my_id == 1 {
            self.product = self.product + Share(d.0.wrapping_mul(e.0));
        }
        debug!(party = pool.my_id, "multiplied shares");
        Ok(EvaluationStatus::Done)
    }

    fn into_output(self) -> Share {
        self.product
    }
}

/// Arithmetic on shared values, appended to a [`StepBuilder`].
pub trait DemoArithmetic {
    /// Shares the next private input of `owner`.
    fn input(&mut self, owner: PartyId) -> Deferred<Share>;

    /// Shares a public constant.
    fn known(&mut self, value: u64) -> Deferred<Share>;

    /// `x + y`, computed locally.
    fn add(&mut self, x: &Deferred<Share>, y: &Deferred<Share>) -> Deferred<Share>;

    /// `x - y`, computed locally.
    fn sub(&mut self, x: &Deferred<Share>, y: &Deferred<Share>) -> Deferred<Share>;

    /// `x * c` for a public `c`, computed locally.
    fn mul_const(&mut self, x: &Deferred<Share>, c: u64) -> Deferred<Share>;

    /// `x * y`, one round.
    fn mul(&mut self, x: &Deferred<Share>, y: &Deferred<Share>) -> Deferred<Share>;

    /// Reveals `x`, one round.
    fn open(&mut self, x: &Deferred<Share>) -> Deferred<u64>;
}

impl DemoArithmetic for StepBuilder<DemoPool> {
    fn input(&mut self, owner: PartyId) -> Deferred<Share> {
        self.append(InputOp { owner, share: None })
    }

    fn known(&mut self, value: u64) -> Deferred<Share> {
        self.append(KnownOp {
            value,
            share: Share(0),
        })
    }

    fn add(&mut self, x: &Deferred<Share>, y: &Deferred<Share>) -> Deferred<Share> {
        x.pair(y).map(|(x, y)| x + y)
    }

    fn sub(&mut self, x: &Deferred<Share>, y: &Deferred<Share>) -> Deferred<Share> {
        x.pair(y).map(|(x, y)| x - y)
    }

    fn mul_const(&mut self, x: &Deferred<Share>, c: u64) -> Deferred<Share> {
        x.map(move |x| x * c)
    }

    fn mul(&mut self, x: &Deferred<Share>, y: &Deferred<Share>) -> Deferred<Share> {
        self.append(MulOp {
            x: x.clone(),
            y: y.clone(),
            triple: Default::default(),
            product: Share(0),
        })
    }

    fn open(&mut self, x: &Deferred<Share>) -> Deferred<u64> {
        self.append(OpenOp {
            share: x.clone(),
            value: 0,
        })
    }
}

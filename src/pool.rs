//! Per-party resources handed to every atomic operation.

use crate::network::PartyId;

/// The resources of one party, e.g. its randomness or preprocessed material.
///
/// Protocol suites define their own pools. The evaluator only passes them on to the operations.
pub trait ResourcePool: Send {
    /// The id of the local party.
    fn my_id(&self) -> PartyId;

    /// The number of parties taking part in the computation.
    fn party_count(&self) -> usize;
}

/// A pool that knows nothing but the party ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicResourcePool {
    my_id: PartyId,
    parties: usize,
}

impl BasicResourcePool {
    /// The pool of party `my_id` out of `parties` parties.
    ///
    /// # Panics
    ///
    /// Panics if `my_id` is not in `1..=parties`.
    pub fn new(my_id: PartyId, parties: usize) -> Self {
        assert!(
            (1..=parties).contains(&my_id),
            "party {my_id} does not exist, valid party ids are 1..={parties}"
        );
        Self { my_id, parties }
    }
}

impl ResourcePool for BasicResourcePool {
    fn my_id(&self) -> PartyId {
        self.my_id
    }

    fn party_count(&self) -> usize {
        self.parties
    }
}

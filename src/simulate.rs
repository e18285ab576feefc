//! Runs all parties of a computation within a single process.

use std::panic::resume_unwind;

use futures::future::join_all;
use tokio::task;
use tracing::{Instrument, debug_span};

use crate::{
    Error,
    channel::SimpleChannel,
    config::EvaluatorConfig,
    evaluator::{Application, Evaluator},
    network::{BatchedNetwork, PartyId},
};

/// Runs `app` for `parties` parties, each on its own task and connected by [`SimpleChannel`]s,
/// and returns the outputs ordered by party id.
///
/// `make_pool` is called with the id of every party and the number of parties. If any party
/// fails, the first error (by party id) is returned; a panic in any party is propagated.
pub async fn simulate<P, A, F>(
    parties: usize,
    config: &EvaluatorConfig,
    make_pool: F,
    app: A,
) -> Result<Vec<A::Output>, Error>
where
    P: Send + 'static,
    A: Application<P> + Clone + Send + 'static,
    F: Fn(PartyId, usize) -> P,
{
    let evaluator = Evaluator::new(config)?;
    let mut tasks = Vec::with_capacity(parties);
    for (i, channel) in SimpleChannel::channels(parties).into_iter().enumerate() {
        let my_id = i + 1;
        let mut pool = make_pool(my_id, parties);
        let mut network =
            BatchedNetwork::new(channel, my_id, parties)?.with_max_frame_size(config.max_frame_size);
        let evaluator = evaluator.clone();
        let app = app.clone();
        let party = async move { evaluator.run(app, &mut pool, &mut network).await };
        tasks.push(task::spawn(party.instrument(debug_span!("party", id = my_id))));
    }
    let mut outputs = Vec::with_capacity(parties);
    for result in join_all(tasks).await {
        match result {
            Ok(output) => outputs.push(output?),
            Err(e) => match e.try_into_panic() {
                Ok(panic) => resume_unwind(panic),
                Err(e) => return Err(Error::operation(e)),
            },
        }
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::simulate;
    use crate::{
        Error,
        builder::StepBuilder,
        config::EvaluatorConfig,
        deferred::Deferred,
        network::Network,
        operation::{EvaluationStatus, NativeOperation},
        pool::{BasicResourcePool, ResourcePool},
    };

    /// Every party contributes its id, everybody learns the sum.
    struct SumOfIds {
        sum: usize,
    }

    impl NativeOperation<BasicResourcePool> for SumOfIds {
        type Output = usize;

        fn evaluate(
            &mut self,
            round: usize,
            pool: &mut BasicResourcePool,
            network: &mut dyn Network,
        ) -> Result<EvaluationStatus, Error> {
            if round == 0 {
                let id = u8::try_from(pool.my_id()).map_err(Error::operation)?;
                network.send_to_all(&[id])?;
                return Ok(EvaluationStatus::HasMoreRounds);
            }
            self.sum = network
                .receive_from_all()?
                .iter()
                .map(|msg| usize::from(msg[0]))
                .sum();
            Ok(EvaluationStatus::Done)
        }

        fn into_output(self) -> usize {
            self.sum
        }
    }

    fn sum_of_ids(b: &mut StepBuilder<BasicResourcePool>) -> Deferred<usize> {
        b.append(SumOfIds { sum: 0 })
    }

    #[tokio::test]
    async fn every_party_gets_its_output() -> Result<(), Error> {
        let outputs = simulate(
            4,
            &EvaluatorConfig::default(),
            BasicResourcePool::new,
            sum_of_ids,
        )
        .await?;
        assert_eq!(outputs, vec![10; 4]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected() {
        let config = EvaluatorConfig::default().with_max_frame_size(0);
        let result = simulate(2, &config, BasicResourcePool::new, sum_of_ids).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn oversized_frames_fail_every_party() {
        let config = EvaluatorConfig::default().with_max_frame_size(8);
        let result = simulate(
            2,
            &config,
            BasicResourcePool::new,
            |b: &mut StepBuilder<BasicResourcePool>| {
                b.append(SumOfIds { sum: 0 });
                b.compute(|| ())
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}

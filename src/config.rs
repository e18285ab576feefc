//! Configuration of the evaluator and the network batching layer.

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    evaluator::{BatchPolicy, EvaluationStrategy},
    network::DEFAULT_MAX_FRAME_SIZE,
};

/// Configures how an [`Evaluator`](crate::evaluator::Evaluator) batches operations and how large
/// the frames exchanged between parties may get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// How the operations of a batch are run.
    pub strategy: EvaluationStrategy,
    /// The maximum number of operations per batch, `None` for no limit.
    pub max_batch_size: Option<usize>,
    /// The maximum size of a frame in bytes, in both directions.
    pub max_frame_size: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            strategy: EvaluationStrategy::default(),
            max_batch_size: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl EvaluatorConfig {
    /// Sets the batch strategy.
    pub fn with_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Caps batches at `max_batch_size` operations.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    /// Sets the maximum frame size.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Checks that batches and frames can hold anything at all.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_batch_size == Some(0) {
            return Err(Error::InvalidConfig("max_batch_size must be at least 1"));
        }
        if self.max_frame_size == 0 {
            return Err(Error::InvalidConfig("max_frame_size must be at least 1"));
        }
        Ok(())
    }

    /// The batch policy corresponding to `max_batch_size`.
    pub fn batch_policy(&self) -> BatchPolicy {
        match self.max_batch_size {
            Some(n) => BatchPolicy::Capped(n),
            None => BatchPolicy::OnePass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EvaluatorConfig;
    use crate::{
        Error,
        evaluator::{BatchPolicy, EvaluationStrategy},
    };

    #[test]
    fn defaults_batch_everything() {
        let config = EvaluatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.strategy, EvaluationStrategy::Batched);
        assert_eq!(config.batch_policy(), BatchPolicy::OnePass);
    }

    #[test]
    fn setters_chain() {
        let config = EvaluatorConfig::default()
            .with_strategy(EvaluationStrategy::Sequential)
            .with_max_batch_size(8)
            .with_max_frame_size(1024);
        assert_eq!(config.batch_policy(), BatchPolicy::Capped(8));
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.strategy, EvaluationStrategy::Sequential);
    }

    #[test]
    fn zero_sizes_are_invalid() {
        let config = EvaluatorConfig::default().with_max_batch_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        let config = EvaluatorConfig::default().with_max_frame_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn config_survives_the_wire_format() {
        let config = EvaluatorConfig::default().with_max_batch_size(3);
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: EvaluatorConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}

/// One training iteration: forward the sequence, backward through time, RMSProp update.

use tracing::trace;

use crate::error::Result;
use crate::model::Ntm;
use crate::rmsprop::{RmsProp, RmsPropConfig};
use crate::sequence::Sequence;

/// Result of one `Trainer::train` call.
#[derive(Clone, Debug)]
pub struct TrainStep {
    /// Per-timestep predictions, computed with the pre-update weights.
    pub outputs: Vec<Vec<f64>>,
    /// Summed binary log-loss in nats.
    pub loss: f64,
}

/// Owns the machine and its optimizer state.
pub struct Trainer {
    ntm: Ntm,
    optimizer: RmsProp,
}

impl Trainer {
    pub fn new(ntm: Ntm) -> Self {
        let optimizer = RmsProp::new(ntm.params());
        Trainer { ntm, optimizer }
    }

    pub fn ntm(&self) -> &Ntm {
        &self.ntm
    }

    pub fn into_ntm(self) -> Ntm {
        self.ntm
    }

    /// Number of weight updates applied.
    pub fn iterations(&self) -> u64 {
        self.optimizer.steps()
    }

    /// Full forward + backward sweep over one sequence, then one weight update.
    /// On error the weights are left untouched.
    pub fn train(&mut self, inputs: &[Vec<f64>], targets: &[Vec<f64>], config: &RmsPropConfig) -> Result<TrainStep> {
        config.validate()?;
        let (outputs, loss, grads) = {
            let mut seq = Sequence::new(&self.ntm);
            for input in inputs {
                seq.step(input)?;
            }
            let loss = seq.end_forward(targets)?;
            seq.backward()?;
            (seq.outputs(), loss, seq.gradients()?)
        };
        self.optimizer.step(self.ntm.params_mut(), &grads, config);
        trace!(iteration = self.optimizer.steps(), loss, steps = inputs.len(), "weights updated");
        Ok(TrainStep { outputs, loss })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NtmError;
    use crate::model::NtmConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn trainer() -> Trainer {
        let mut ntm = Ntm::new(NtmConfig::test_config()).unwrap();
        ntm.randomize(&mut StdRng::seed_from_u64(4), 0.5);
        Trainer::new(ntm)
    }

    #[test]
    fn test_repeated_training_lowers_loss() {
        let mut t = trainer();
        let inputs = vec![vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]];
        let targets = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let cfg = RmsPropConfig { learning_rate: 0.01, ..Default::default() };
        let first = t.train(&inputs, &targets, &cfg).unwrap().loss;
        let mut last = first;
        for _ in 0..60 {
            last = t.train(&inputs, &targets, &cfg).unwrap().loss;
        }
        assert!(last < first, "first={first} last={last}");
        assert_eq!(t.iterations(), 61);
    }

    #[test]
    fn test_failed_train_leaves_weights() {
        let mut t = trainer();
        let before = t.ntm().clone();
        let err = t.train(&[vec![1.0, 0.0, 0.0]], &[], &RmsPropConfig::default()).unwrap_err();
        assert!(matches!(err, NtmError::DimensionMismatch { .. }));
        assert_eq!(t.ntm(), &before);
        assert_eq!(t.iterations(), 0);
    }
}

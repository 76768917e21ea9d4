/// RMSProp with momentum, in the variant from Graves (2013), eq. 38-41.
///
///   n     = decay · n + (1 - decay) · g²
///   gbar  = decay · gbar + (1 - decay) · g
///   delta = momentum · delta - lr · g / sqrt(n - gbar² + regularization)
///   w    += delta
///
/// `n - gbar²` is a running variance estimate, so the step is normalised by
/// the gradient's spread rather than its magnitude.

use serde::{Deserialize, Serialize};

use crate::error::{NtmError, Result};
use crate::model::NtmParams;

/// RMSProp hyperparameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RmsPropConfig {
    pub decay: f64,
    pub momentum: f64,
    pub learning_rate: f64,
    pub regularization: f64,
}

impl Default for RmsPropConfig {
    fn default() -> Self {
        RmsPropConfig { decay: 0.95, momentum: 0.5, learning_rate: 0.001, regularization: 0.001 }
    }
}

impl RmsPropConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.decay) {
            return Err(NtmError::InvalidConfig(format!("decay must be in [0, 1), got {}", self.decay)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(NtmError::InvalidConfig(format!("momentum must be in [0, 1), got {}", self.momentum)));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(NtmError::InvalidConfig(format!("learning_rate must be > 0, got {}", self.learning_rate)));
        }
        if !(self.regularization > 0.0 && self.regularization.is_finite()) {
            return Err(NtmError::InvalidConfig(format!("regularization must be > 0, got {}", self.regularization)));
        }
        Ok(())
    }
}

/// Running statistics for one parameter buffer.
#[derive(Clone, Debug)]
struct MomentBuf {
    n: Vec<f64>,
    gbar: Vec<f64>,
    delta: Vec<f64>,
}

impl MomentBuf {
    fn zeros(len: usize) -> Self {
        MomentBuf { n: vec![0.0; len], gbar: vec![0.0; len], delta: vec![0.0; len] }
    }
}

#[inline]
fn rmsprop_step_buf(weights: &mut [f64], grads: &[f64], state: &mut MomentBuf, cfg: &RmsPropConfig) {
    debug_assert_eq!(weights.len(), grads.len());
    let d = cfg.decay;
    for i in 0..weights.len() {
        let g = grads[i];
        state.n[i] = d * state.n[i] + (1.0 - d) * g * g;
        state.gbar[i] = d * state.gbar[i] + (1.0 - d) * g;
        let variance = state.n[i] - state.gbar[i] * state.gbar[i];
        state.delta[i] = cfg.momentum * state.delta[i] - cfg.learning_rate * g / (variance + cfg.regularization).sqrt();
        weights[i] += state.delta[i];
    }
}

/// Optimizer state: one moment buffer per parameter buffer, in parameter order.
#[derive(Clone, Debug, Default)]
pub struct RmsProp {
    bufs: Vec<MomentBuf>,
    steps: u64,
}

impl RmsProp {
    pub fn new(params: &NtmParams) -> Self {
        RmsProp { bufs: params.buffers().iter().map(|b| MomentBuf::zeros(b.len())).collect(), steps: 0 }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn step(&mut self, params: &mut NtmParams, grads: &NtmParams, cfg: &RmsPropConfig) {
        if self.bufs.is_empty() {
            *self = RmsProp::new(params);
        }
        for ((weights, grad), state) in params.buffers_mut().into_iter().zip(grads.buffers()).zip(self.bufs.iter_mut()) {
            rmsprop_step_buf(weights, grad, state, cfg);
        }
        self.steps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NtmConfig;

    #[test]
    fn test_default_matches_graves() {
        let cfg = RmsPropConfig::default();
        assert_eq!((cfg.decay, cfg.momentum, cfg.learning_rate, cfg.regularization), (0.95, 0.5, 0.001, 0.001));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            RmsPropConfig { decay: 1.0, ..Default::default() },
            RmsPropConfig { momentum: -0.1, ..Default::default() },
            RmsPropConfig { learning_rate: 0.0, ..Default::default() },
            RmsPropConfig { regularization: f64::NAN, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(NtmError::InvalidConfig(_))), "{cfg:?}");
        }
    }

    #[test]
    fn test_single_step_by_hand() {
        let cfg = RmsPropConfig::default();
        let mut state = MomentBuf::zeros(1);
        let mut w = [1.0];
        rmsprop_step_buf(&mut w, &[2.0], &mut state, &cfg);
        // n = 0.05 * 4 = 0.2, gbar = 0.1, var = 0.19
        let expected_delta = -0.001 * 2.0 / (0.19f64 + 0.001).sqrt();
        assert!((state.delta[0] - expected_delta).abs() < 1e-15);
        assert!((w[0] - (1.0 + expected_delta)).abs() < 1e-15);

        // second step carries half the previous delta
        rmsprop_step_buf(&mut w, &[0.0], &mut state, &cfg);
        assert!((state.delta[0] - 0.5 * expected_delta).abs() < 1e-15);
    }

    #[test]
    fn test_step_moves_against_gradient() {
        let cfg = NtmConfig::test_config();
        let mut params = NtmParams::zeros_like(&cfg);
        let mut grads = NtmParams::zeros_like(&cfg);
        grads.b_output = vec![1.0, -1.0];
        let mut opt = RmsProp::new(&params);
        opt.step(&mut params, &grads, &RmsPropConfig::default());
        assert!(params.b_output[0] < 0.0);
        assert!(params.b_output[1] > 0.0);
        assert!(params.w_input.iter().all(|&w| w == 0.0));
        assert_eq!(opt.steps(), 1);
    }
}

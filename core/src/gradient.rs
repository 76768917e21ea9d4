/// Gradient orchestration and verification.
///
/// - `compute_gradients`: loss and every parameter gradient for one sequence
/// - `sequence_loss`: forward-only summed log-loss
/// - `check_param_gradient`: central finite differences against the tape

use tracing::debug;

use crate::error::Result;
use crate::model::{Ntm, NtmParams, PARAM_NAMES};
use crate::sequence::Sequence;

/// Summed log-loss (nats) and accumulated gradients for one sequence.
pub fn compute_gradients(ntm: &Ntm, inputs: &[Vec<f64>], targets: &[Vec<f64>]) -> Result<(f64, NtmParams)> {
    let mut seq = Sequence::new(ntm);
    for input in inputs {
        seq.step(input)?;
    }
    let loss = seq.end_forward(targets)?;
    seq.backward()?;
    Ok((loss, seq.gradients()?))
}

/// Forward pass only; the same loss `compute_gradients` differentiates.
pub fn sequence_loss(ntm: &Ntm, inputs: &[Vec<f64>], targets: &[Vec<f64>]) -> Result<f64> {
    let mut seq = Sequence::new(ntm);
    for input in inputs {
        seq.step(input)?;
    }
    seq.end_forward(targets)
}

/// (f(x + eps) - f(x - eps)) / 2eps for one weight, addressed by buffer index
/// in parameter order and element index.
pub fn fd_single(
    ntm: &Ntm,
    inputs: &[Vec<f64>],
    targets: &[Vec<f64>],
    buffer: usize,
    idx: usize,
    eps: f64,
) -> Result<f64> {
    let mut plus = ntm.clone();
    plus.params_mut().buffers_mut()[buffer][idx] += eps;
    let mut minus = ntm.clone();
    minus.params_mut().buffers_mut()[buffer][idx] -= eps;
    Ok((sequence_loss(&plus, inputs, targets)? - sequence_loss(&minus, inputs, targets)?) / (2.0 * eps))
}

/// Outcome of checking one parameter buffer.
#[derive(Clone, Debug, Default)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f64,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.checked == self.passed
    }
}

/// Compare `grads` for one buffer against finite differences on up to
/// `num_samples` evenly spaced entries.
///
/// Relative error uses max(|analytical|, |numerical|) as denominator. Pairs
/// where both are below `abs_threshold` pass: they sit under FD resolution.
#[allow(clippy::too_many_arguments)]
pub fn check_param_gradient(
    ntm: &Ntm,
    inputs: &[Vec<f64>],
    targets: &[Vec<f64>],
    grads: &NtmParams,
    buffer: usize,
    num_samples: usize,
    eps: f64,
    tol: f64,
) -> Result<GradCheck> {
    let abs_threshold = 1e-5;
    let grad_vec = grads.buffers()[buffer];
    let n = grad_vec.len();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut report = GradCheck::default();

    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grad_vec[idx];
        let numerical = fd_single(ntm, inputs, targets, buffer, idx, eps)?;
        report.checked += 1;

        let denom = analytical.abs().max(numerical.abs());
        if denom < abs_threshold {
            report.passed += 1;
            continue;
        }
        let rel_err = (analytical - numerical).abs() / denom;
        report.max_rel_err = report.max_rel_err.max(rel_err);
        if rel_err < tol {
            report.passed += 1;
        } else {
            debug!(
                param = PARAM_NAMES[buffer],
                idx,
                analytical,
                numerical,
                rel_err,
                "gradient mismatch"
            );
        }
    }
    Ok(report)
}

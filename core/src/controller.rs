/// Feed-forward controller: one sigmoid hidden layer over (input, previous reads).
///
///   hidden  = sigmoid(W_input · x + W_reads · concat(r) + b_hidden)
///   logits  = W_output · hidden + b_output
///   output  = sigmoid(logits)
///   signals = W_heads · hidden + b_heads
///
/// Weights are borrowed per call; the same buffers serve every timestep.

use crate::error::{expect_len, Result};
use crate::tensor::{matvec_acc, matvec_t_acc, outer_acc, sigmoid};

/// Layer sizes of the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerDims {
    pub input: usize,
    pub output: usize,
    pub hidden: usize,
    pub heads: usize,
    /// Width of one read vector (memory columns).
    pub read_width: usize,
    /// Raw signal entries per head.
    pub head_unit: usize,
}

impl ControllerDims {
    pub fn reads_len(&self) -> usize {
        self.heads * self.read_width
    }

    pub fn signals_len(&self) -> usize {
        self.heads * self.head_unit
    }
}

/// Borrowed controller weights.
#[derive(Clone, Copy, Debug)]
pub struct ControllerWeights<'a> {
    /// [hidden, input]
    pub w_input: &'a [f64],
    /// [hidden, heads · read_width]
    pub w_reads: &'a [f64],
    pub b_hidden: &'a [f64],
    /// [output, hidden]
    pub w_output: &'a [f64],
    pub b_output: &'a [f64],
    /// [heads · head_unit, hidden]
    pub w_heads: &'a [f64],
    pub b_heads: &'a [f64],
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerOutput {
    pub hidden: Vec<f64>,
    pub logits: Vec<f64>,
    pub signals: Vec<f64>,
}

impl ControllerOutput {
    pub fn output(&self) -> Vec<f64> {
        self.logits.iter().map(|&l| sigmoid(l)).collect()
    }
}

/// `reads` is the concatenation of every head's previous read vector.
pub fn controller_forward(
    dims: &ControllerDims,
    weights: &ControllerWeights<'_>,
    input: &[f64],
    reads: &[f64],
) -> Result<ControllerOutput> {
    expect_len("controller input", dims.input, input.len())?;
    expect_len("previous reads", dims.reads_len(), reads.len())?;

    let mut hidden = weights.b_hidden.to_vec();
    matvec_acc(weights.w_input, input, &mut hidden, dims.hidden, dims.input);
    matvec_acc(weights.w_reads, reads, &mut hidden, dims.hidden, dims.reads_len());
    for h in hidden.iter_mut() {
        *h = sigmoid(*h);
    }

    let mut logits = weights.b_output.to_vec();
    matvec_acc(weights.w_output, &hidden, &mut logits, dims.output, dims.hidden);

    let mut signals = weights.b_heads.to_vec();
    matvec_acc(weights.w_heads, &hidden, &mut signals, dims.signals_len(), dims.hidden);

    Ok(ControllerOutput { hidden, logits, signals })
}

/// Gradients of one controller evaluation.
#[derive(Clone, Debug)]
pub struct ControllerGrads {
    pub w_input: Vec<f64>,
    pub w_reads: Vec<f64>,
    pub b_hidden: Vec<f64>,
    pub w_output: Vec<f64>,
    pub b_output: Vec<f64>,
    pub w_heads: Vec<f64>,
    pub b_heads: Vec<f64>,
    /// Gradient on the concatenated previous reads.
    pub reads: Vec<f64>,
}

/// Backward from output-logit and head-signal gradients. The external input
/// gets no gradient.
pub fn controller_backward(
    dims: &ControllerDims,
    weights: &ControllerWeights<'_>,
    input: &[f64],
    reads: &[f64],
    hidden: &[f64],
    d_logits: &[f64],
    d_signals: &[f64],
) -> ControllerGrads {
    let (n_in, n_out, n_hid) = (dims.input, dims.output, dims.hidden);
    let (n_reads, n_sig) = (dims.reads_len(), dims.signals_len());

    // ── Output and head projections ──
    let mut w_output = vec![0.0; n_out * n_hid];
    outer_acc(d_logits, hidden, &mut w_output);
    let mut w_heads = vec![0.0; n_sig * n_hid];
    outer_acc(d_signals, hidden, &mut w_heads);

    let mut d_hidden = vec![0.0; n_hid];
    matvec_t_acc(weights.w_output, d_logits, &mut d_hidden, n_out, n_hid);
    matvec_t_acc(weights.w_heads, d_signals, &mut d_hidden, n_sig, n_hid);

    // ── Hidden sigmoid ──
    let d_pre: Vec<f64> = d_hidden.iter().zip(hidden.iter()).map(|(d, h)| d * h * (1.0 - h)).collect();

    let mut w_input = vec![0.0; n_hid * n_in];
    outer_acc(&d_pre, input, &mut w_input);
    let mut w_reads = vec![0.0; n_hid * n_reads];
    outer_acc(&d_pre, reads, &mut w_reads);
    let mut d_reads = vec![0.0; n_reads];
    matvec_t_acc(weights.w_reads, &d_pre, &mut d_reads, n_hid, n_reads);

    ControllerGrads {
        w_input,
        w_reads,
        b_hidden: d_pre,
        w_output,
        b_output: d_logits.to_vec(),
        w_heads,
        b_heads: d_signals.to_vec(),
        reads: d_reads,
    }
}

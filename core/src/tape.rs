// Wengert tape: reverse-mode AD for one BPTT sequence.
//
// The forward pass computes each stage eagerly and records one op per stage
// into a linear tape. Backward replays the tape in reverse, which is a valid
// reverse topological order because every op only reads buffers allocated
// before its output.
//
// Buffers are immutable after allocation. Gradients accumulate, never
// overwrite: a weighting feeds several consumers and every parameter is
// shared by all timesteps.

use crate::addressing::{self, HeadLayout};
use crate::controller::{controller_backward, ControllerDims, ControllerWeights};
use crate::memory::{self, WriteHead};
use crate::tensor::{self, sigmoid};

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f64>,
    /// Shape metadata, e.g. [rows, cols] for a memory snapshot.
    pub shape: Vec<usize>,
    /// True for learnable parameters shared by every timestep.
    pub is_param: bool,
}

impl TapeBuf {
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, is_param: false }
    }

    pub fn param(data: Vec<f64>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, is_param: true }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// The seven controller parameter buffers, in parameter order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerBufs {
    pub w_input: BufId,
    pub w_reads: BufId,
    pub b_hidden: BufId,
    pub w_output: BufId,
    pub b_output: BufId,
    pub w_heads: BufId,
    pub b_heads: BufId,
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    /// Controller evaluation. `reads` holds one buffer per head (previous reads).
    /// Outputs: `hidden`, `logits`, `signals`. Only logits and signals carry gradient.
    Controller {
        input: BufId,
        reads: Vec<BufId>,
        weights: ControllerBufs,
        hidden: BufId,
        logits: BufId,
        signals: BufId,
        dims: ControllerDims,
    },
    /// out = input[offset..offset + out.len()]
    Slice { input: BufId, out: BufId, offset: usize },
    /// out = softmax(input)
    Softmax { input: BufId, out: BufId },

    // ── Addressing (per head) ───────────────────────────────────
    // `signals` is one head's raw unit; each op reads its own fields from it.
    ContentAddressing { signals: BufId, memory: BufId, out: BufId, layout: HeadLayout, rows: usize },
    Gate { signals: BufId, content: BufId, prev: BufId, out: BufId, layout: HeadLayout },
    Shift { signals: BufId, gated: BufId, out: BufId, layout: HeadLayout },
    Sharpen { signals: BufId, shifted: BufId, out: BufId, layout: HeadLayout },

    // ── Memory ──────────────────────────────────────────────────
    /// out = write(memory, every head's weighting and erase/add signals)
    MemoryWrite {
        memory: BufId,
        weightings: Vec<BufId>,
        signals: Vec<BufId>,
        out: BufId,
        layout: HeadLayout,
        rows: usize,
    },
    /// out[j] = Σ_i weighting[i] · memory[i, j]
    MemoryRead { memory: BufId, weighting: BufId, out: BufId, rows: usize, cols: usize },

    // ── Loss ────────────────────────────────────────────────────
    /// out = Σ_t Σ_j bce(sigmoid(logits[t][j]), targets[t][j])   (scalar)
    LogLoss { logits: Vec<BufId>, targets: Vec<Vec<f64>>, out: BufId },
}

// ── Tape ─────────────────────────────────────────────────────────────

pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators, indexed by BufId. None until something flows in.
    grad_accum: Vec<Option<Vec<f64>>>,
    /// True between creation and the first backward.
    recording: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape { ops: Vec::new(), bufs: Vec::new(), grad_accum: Vec::new(), recording: true }
    }

    // ── Buffer management ────────────────────────────────────────

    /// Allocate a new buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f64>, shape: Vec<usize>) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::new(data, shape));
        self.grad_accum.push(None);
        id
    }

    /// Register a learnable parameter. The tape keeps its own copy.
    pub fn register_param(&mut self, data: &[f64], shape: Vec<usize>) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::param(data.to_vec(), shape));
        self.grad_accum.push(None);
        id
    }

    /// Register an external input (non-parameter) buffer.
    pub fn register_input(&mut self, data: &[f64]) -> BufId {
        self.alloc(data.to_vec(), vec![data.len()])
    }

    pub fn buf_data(&self, id: BufId) -> &[f64] {
        &self.bufs[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.bufs[id].is_param
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn record(&mut self, op: TapeOp) {
        debug_assert!(self.recording, "Tape::record called after backward");
        self.ops.push(op);
    }

    /// Allocate the output buffer and record the op that produced it.
    pub fn record_with_output(&mut self, data: Vec<f64>, shape: Vec<usize>, op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    // ── Gradient seeding and access ──────────────────────────────

    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f64>) {
        debug_assert_eq!(grad.len(), self.bufs[id].numel());
        self.grad_accum[id] = Some(grad);
    }

    /// Accumulate gradient into a buffer's accumulator.
    fn accumulate_grad(&mut self, id: BufId, grad: &[f64]) {
        self.accumulate_grad_at(id, 0, grad);
    }

    /// Accumulate into `buf[offset..offset + grad.len()]`.
    fn accumulate_grad_at(&mut self, id: BufId, offset: usize, grad: &[f64]) {
        let n = self.bufs[id].numel();
        debug_assert!(offset + grad.len() <= n, "gradient overruns buffer {id}");
        let acc = self.grad_accum[id].get_or_insert_with(|| vec![0.0; n]);
        tensor::add_assign(&mut acc[offset..offset + grad.len()], grad);
    }

    /// Accumulated gradient, or None if nothing flowed into the buffer.
    pub fn get_grad(&self, id: BufId) -> Option<&[f64]> {
        self.grad_accum[id].as_deref()
    }

    /// Parameter gradient, zeros if nothing flowed.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f64> {
        debug_assert!(self.bufs[id].is_param, "get_param_grad called on non-param buffer {id}");
        match &self.grad_accum[id] {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    /// Drop every accumulated gradient. The recorded ops stay.
    pub fn zero_grad(&mut self) {
        for g in self.grad_accum.iter_mut() {
            *g = None;
        }
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Replay ops in reverse. A scalar loss with no seed is seeded with 1.0.
    pub fn backward(&mut self, loss_id: BufId) {
        self.recording = false;
        if self.grad_accum[loss_id].is_none() && self.bufs[loss_id].numel() == 1 {
            self.grad_accum[loss_id] = Some(vec![1.0]);
        }
        for op_idx in (0..self.ops.len()).rev() {
            let op = self.ops[op_idx].clone();
            self.backward_op(&op);
        }
    }

    fn backward_op(&mut self, op: &TapeOp) {
        match op {
            TapeOp::Controller { input, reads, weights, hidden, logits, signals, dims } => {
                self.backward_controller(*input, reads, weights, *hidden, *logits, *signals, dims);
            }

            TapeOp::Slice { input, out, offset } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    self.accumulate_grad_at(*input, *offset, &d_out);
                }
            }

            TapeOp::Softmax { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let mut d_in = vec![0.0; d_out.len()];
                    tensor::softmax_backward(&self.bufs[*out].data, &d_out, &mut d_in);
                    self.accumulate_grad(*input, &d_in);
                }
            }

            TapeOp::ContentAddressing { signals, memory, out, layout, rows } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let sig = &self.bufs[*signals].data;
                    let grads = addressing::content_backward(
                        &sig[layout.key()],
                        sig[layout.beta()],
                        &self.bufs[*memory].data,
                        &self.bufs[*out].data,
                        &d_out,
                        *rows,
                        layout.m,
                    );
                    self.accumulate_grad_at(*signals, layout.key().start, &grads.d_key);
                    self.accumulate_grad_at(*signals, layout.beta(), &[grads.d_beta]);
                    self.accumulate_grad(*memory, &grads.d_memory);
                }
            }

            TapeOp::Gate { signals, content, prev, out, layout } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let gate_raw = self.bufs[*signals].data[layout.gate()];
                    let (d_content, d_prev, d_gate) =
                        addressing::gate_backward(&self.bufs[*content].data, &self.bufs[*prev].data, gate_raw, &d_out);
                    self.accumulate_grad(*content, &d_content);
                    self.accumulate_grad(*prev, &d_prev);
                    self.accumulate_grad_at(*signals, layout.gate(), &[d_gate]);
                }
            }

            TapeOp::Shift { signals, gated, out, layout } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let shift_raw = self.bufs[*signals].data[layout.shift()];
                    let (d_gated, d_shift) = addressing::shift_backward(&self.bufs[*gated].data, shift_raw, &d_out);
                    self.accumulate_grad(*gated, &d_gated);
                    self.accumulate_grad_at(*signals, layout.shift(), &[d_shift]);
                }
            }

            TapeOp::Sharpen { signals, shifted, out, layout } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let gamma_raw = self.bufs[*signals].data[layout.gamma()];
                    let (d_shifted, d_gamma) =
                        addressing::sharpen_backward(&self.bufs[*shifted].data, gamma_raw, &self.bufs[*out].data, &d_out);
                    self.accumulate_grad(*shifted, &d_shifted);
                    self.accumulate_grad_at(*signals, layout.gamma(), &[d_gamma]);
                }
            }

            TapeOp::MemoryWrite { memory, weightings, signals, out, layout, rows } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let grads = {
                        let heads: Vec<WriteHead<'_>> = weightings
                            .iter()
                            .zip(signals.iter())
                            .map(|(&w, &s)| WriteHead {
                                weighting: &self.bufs[w].data,
                                erase: &self.bufs[s].data[layout.erase()],
                                add: &self.bufs[s].data[layout.add()],
                            })
                            .collect();
                        memory::write_backward(&self.bufs[*memory].data, &heads, &d_out, *rows, layout.m)
                    };
                    self.accumulate_grad(*memory, &grads.d_prev);
                    for h in 0..weightings.len() {
                        self.accumulate_grad(weightings[h], &grads.d_weightings[h]);
                        self.accumulate_grad_at(signals[h], layout.erase().start, &grads.d_erase[h]);
                        self.accumulate_grad_at(signals[h], layout.add().start, &grads.d_add[h]);
                    }
                }
            }

            TapeOp::MemoryRead { memory, weighting, out, rows, cols } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let (d_memory, d_weighting) =
                        memory::read_backward(&self.bufs[*memory].data, &self.bufs[*weighting].data, &d_out, *rows, *cols);
                    self.accumulate_grad(*memory, &d_memory);
                    self.accumulate_grad(*weighting, &d_weighting);
                }
            }

            TapeOp::LogLoss { logits, targets, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let scale = d_out[0];
                    for (&id, target) in logits.iter().zip(targets.iter()) {
                        // d bce / d logit = sigmoid(logit) - target
                        let d_logits: Vec<f64> = self.bufs[id]
                            .data
                            .iter()
                            .zip(target.iter())
                            .map(|(&l, &y)| (sigmoid(l) - y) * scale)
                            .collect();
                        self.accumulate_grad(id, &d_logits);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn backward_controller(
        &mut self,
        input: BufId,
        reads: &[BufId],
        w: &ControllerBufs,
        hidden: BufId,
        logits: BufId,
        signals: BufId,
        dims: &ControllerDims,
    ) {
        let d_logits = self.grad_accum[logits].clone();
        let d_signals = self.grad_accum[signals].clone();
        if d_logits.is_none() && d_signals.is_none() {
            return;
        }
        let d_logits = d_logits.unwrap_or_else(|| vec![0.0; dims.output]);
        let d_signals = d_signals.unwrap_or_else(|| vec![0.0; dims.signals_len()]);

        let read_concat: Vec<f64> = reads.iter().flat_map(|&r| self.bufs[r].data.iter().copied()).collect();
        let weights = ControllerWeights {
            w_input: &self.bufs[w.w_input].data,
            w_reads: &self.bufs[w.w_reads].data,
            b_hidden: &self.bufs[w.b_hidden].data,
            w_output: &self.bufs[w.w_output].data,
            b_output: &self.bufs[w.b_output].data,
            w_heads: &self.bufs[w.w_heads].data,
            b_heads: &self.bufs[w.b_heads].data,
        };
        let grads = controller_backward(
            dims,
            &weights,
            &self.bufs[input].data,
            &read_concat,
            &self.bufs[hidden].data,
            &d_logits,
            &d_signals,
        );

        self.accumulate_grad(w.w_input, &grads.w_input);
        self.accumulate_grad(w.w_reads, &grads.w_reads);
        self.accumulate_grad(w.b_hidden, &grads.b_hidden);
        self.accumulate_grad(w.w_output, &grads.w_output);
        self.accumulate_grad(w.b_output, &grads.b_output);
        self.accumulate_grad(w.w_heads, &grads.w_heads);
        self.accumulate_grad(w.b_heads, &grads.b_heads);
        for (h, &r) in reads.iter().enumerate() {
            let width = dims.read_width;
            self.accumulate_grad(r, &grads.reads[h * width..(h + 1) * width]);
        }
    }
}

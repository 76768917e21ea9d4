/// BPTT sequence: the forward chain of timesteps recorded on one tape.
///
/// Lifecycle:
///   Uninitialized --step--> Forward --end_forward--> BackwardReady
///   BackwardReady --backward--> Complete --zero_grad--> BackwardReady
/// Any forward failure moves the sequence to Abandoned, after which every
/// call is a sequencing error. `backward` runs to completion in one call, so
/// there is no observable in-between state.
///
/// Timesteps are an append-only arena of tape ids. Each one names its
/// predecessor by index; the initial state plays predecessor for t = 0.

use tracing::{debug, trace};

use crate::addressing::{self, HeadLayout};
use crate::controller::{controller_forward, ControllerOutput, ControllerWeights};
use crate::error::{expect_len, NtmError, Result};
use crate::memory::{self, WriteHead};
use crate::model::{Ntm, NtmParams};
use crate::tape::{BufId, ControllerBufs, Tape, TapeOp};
use crate::tensor::{bce_with_logits, softmax};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Forward,
    BackwardReady,
    Complete,
    Abandoned,
}

/// Tape ids of one head's work at one timestep.
#[derive(Clone, Debug)]
pub struct HeadTrace {
    /// This head's slice of the controller signals.
    pub signals: BufId,
    pub content: BufId,
    pub gated: BufId,
    pub shifted: BufId,
    pub weighting: BufId,
    pub read: BufId,
}

/// One recorded step of the chain.
#[derive(Clone, Debug)]
pub struct Timestep {
    pub index: usize,
    /// Predecessor timestep; None means the initial state.
    pub prev: Option<usize>,
    pub input: BufId,
    pub hidden: BufId,
    pub logits: BufId,
    pub signals: BufId,
    pub heads: Vec<HeadTrace>,
    pub memory: BufId,
    /// sigmoid(logits)
    pub output: Vec<f64>,
}

/// Tape ids of the state before the first timestep.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub memory: BufId,
    pub weightings: Vec<BufId>,
    pub reads: Vec<BufId>,
}

/// Parameter buffers, registered once per sequence.
#[derive(Clone, Copy, Debug)]
struct ParamBufs {
    controller: ControllerBufs,
    memory_bias: BufId,
    weighting_bias: BufId,
}

impl ParamBufs {
    fn register(tape: &mut Tape, params: &NtmParams, shapes: [Vec<usize>; 9]) -> Self {
        let [s_wi, s_wr, s_bh, s_wo, s_bo, s_wh, s_bhd, s_mb, s_wb] = shapes;
        let controller = ControllerBufs {
            w_input: tape.register_param(&params.w_input, s_wi),
            w_reads: tape.register_param(&params.w_reads, s_wr),
            b_hidden: tape.register_param(&params.b_hidden, s_bh),
            w_output: tape.register_param(&params.w_output, s_wo),
            b_output: tape.register_param(&params.b_output, s_bo),
            w_heads: tape.register_param(&params.w_heads, s_wh),
            b_heads: tape.register_param(&params.b_heads, s_bhd),
        };
        ParamBufs {
            controller,
            memory_bias: tape.register_param(&params.memory_bias, s_mb),
            weighting_bias: tape.register_param(&params.weighting_bias, s_wb),
        }
    }

    fn ids(&self) -> [BufId; 9] {
        let c = &self.controller;
        [c.w_input, c.w_reads, c.b_hidden, c.w_output, c.b_output, c.w_heads, c.b_heads, self.memory_bias, self.weighting_bias]
    }
}

pub struct Sequence<'a> {
    ntm: &'a Ntm,
    tape: Tape,
    phase: Phase,
    params: Option<ParamBufs>,
    initial: Option<InitialState>,
    steps: Vec<Timestep>,
    loss: Option<(BufId, f64)>,
}

impl<'a> Sequence<'a> {
    pub fn new(ntm: &'a Ntm) -> Self {
        Sequence {
            ntm,
            tape: Tape::new(),
            phase: Phase::Uninitialized,
            params: None,
            initial: None,
            steps: Vec::new(),
            loss: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn timesteps(&self) -> &[Timestep] {
        &self.steps
    }

    pub fn initial_state(&self) -> Option<&InitialState> {
        self.initial.as_ref()
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Summed log-loss, once the forward pass is closed.
    pub fn loss(&self) -> Option<f64> {
        self.loss.map(|(_, v)| v)
    }

    pub fn outputs(&self) -> Vec<Vec<f64>> {
        self.steps.iter().map(|t| t.output.clone()).collect()
    }

    // ── Forward ──────────────────────────────────────────────────

    /// Append one timestep. Returns its external output.
    pub fn step(&mut self, input: &[f64]) -> Result<&[f64]> {
        match self.phase {
            Phase::Uninitialized | Phase::Forward => {}
            Phase::Abandoned => return Err(NtmError::sequencing("sequence was abandoned after a forward error")),
            _ => return Err(NtmError::sequencing("step after the forward pass was closed")),
        }
        let result = self.record_step(input);
        match result {
            Ok(t) => {
                self.phase = Phase::Forward;
                self.steps.push(t);
                let last = self.steps.len() - 1;
                Ok(&self.steps[last].output)
            }
            Err(e) => {
                debug!(step = self.steps.len(), error = %e, "forward failed, abandoning sequence");
                self.phase = Phase::Abandoned;
                Err(e)
            }
        }
    }

    /// Close the forward pass and record the log-loss against `targets`.
    pub fn end_forward(&mut self, targets: &[Vec<f64>]) -> Result<f64> {
        match self.phase {
            Phase::Forward => {}
            Phase::Uninitialized => return Err(NtmError::sequencing("end_forward before any timestep")),
            Phase::Abandoned => return Err(NtmError::sequencing("sequence was abandoned after a forward error")),
            _ => return Err(NtmError::sequencing("forward pass already closed")),
        }
        if let Err(e) = self.check_targets(targets) {
            self.phase = Phase::Abandoned;
            return Err(e);
        }

        let logits: Vec<BufId> = self.steps.iter().map(|t| t.logits).collect();
        let value: f64 = logits
            .iter()
            .zip(targets.iter())
            .flat_map(|(&id, target)| self.tape.buf_data(id).iter().zip(target.iter()))
            .map(|(&l, &y)| bce_with_logits(l, y))
            .sum();
        let out = self.tape.record_with_output(vec![value], vec![1], |out| TapeOp::LogLoss {
            logits,
            targets: targets.to_vec(),
            out,
        });
        self.loss = Some((out, value));
        self.phase = Phase::BackwardReady;
        debug!(steps = self.steps.len(), ops = self.tape.num_ops(), loss = value, "forward pass closed");
        Ok(value)
    }

    fn check_targets(&self, targets: &[Vec<f64>]) -> Result<()> {
        expect_len("target sequence", self.steps.len(), targets.len())?;
        for target in targets {
            expect_len("target vector", self.ntm.config().output_size, target.len())?;
        }
        Ok(())
    }

    // ── Backward ─────────────────────────────────────────────────

    /// Walk the tape in reverse, accumulating every parameter gradient.
    pub fn backward(&mut self) -> Result<()> {
        let loss_id = match (self.phase, self.loss) {
            (Phase::BackwardReady, Some((id, _))) => id,
            (Phase::Complete, _) => return Err(NtmError::sequencing("backward already ran; call zero_grad first")),
            (Phase::Abandoned, _) => return Err(NtmError::sequencing("sequence was abandoned after a forward error")),
            _ => return Err(NtmError::sequencing("backward before the forward pass was closed")),
        };
        self.tape.backward(loss_id);
        self.phase = Phase::Complete;
        debug!(steps = self.steps.len(), "backward pass complete");
        Ok(())
    }

    /// Accumulated parameter gradients, in parameter order.
    pub fn gradients(&self) -> Result<NtmParams> {
        let params = match (self.phase, self.params) {
            (Phase::Complete, Some(p)) => p,
            _ => return Err(NtmError::sequencing("gradients read before the backward pass completed")),
        };
        let [w_input, w_reads, b_hidden, w_output, b_output, w_heads, b_heads, memory_bias, weighting_bias] =
            params.ids().map(|id| self.tape.get_param_grad(id));
        Ok(NtmParams { w_input, w_reads, b_hidden, w_output, b_output, w_heads, b_heads, memory_bias, weighting_bias })
    }

    /// Clear accumulated gradients so backward can run again.
    pub fn zero_grad(&mut self) -> Result<()> {
        match self.phase {
            Phase::BackwardReady | Phase::Complete => {
                self.tape.zero_grad();
                self.phase = Phase::BackwardReady;
                Ok(())
            }
            _ => Err(NtmError::sequencing("zero_grad before the forward pass was closed")),
        }
    }

    // ── Recording ────────────────────────────────────────────────

    /// Register parameters and derive the initial state on first use.
    fn begin(&mut self) -> Result<(ParamBufs, InitialState)> {
        if let (Some(p), Some(init)) = (self.params, self.initial.as_ref()) {
            return Ok((p, init.clone()));
        }
        let ntm = self.ntm;
        let cfg = ntm.config();
        let (n, m) = (cfg.memory_rows, cfg.memory_columns);
        let params = ParamBufs::register(&mut self.tape, ntm.params(), NtmParams::shapes(cfg));

        let mut weightings = Vec::with_capacity(cfg.head_count);
        let mut reads = Vec::with_capacity(cfg.head_count);
        for h in 0..cfg.head_count {
            let bias = self.tape.buf_data(params.weighting_bias)[h * n..(h + 1) * n].to_vec();
            let bias_id = self.tape.record_with_output(bias.clone(), vec![n], |out| TapeOp::Slice {
                input: params.weighting_bias,
                out,
                offset: h * n,
            });
            let mut w = vec![0.0; n];
            softmax(&bias, &mut w);
            addressing::check_distribution("initial weighting", &w)?;
            let w_id = self.tape.record_with_output(w, vec![n], |out| TapeOp::Softmax { input: bias_id, out });
            let r_id = self.record_read(params.memory_bias, w_id, n, m)?;
            weightings.push(w_id);
            reads.push(r_id);
        }

        let initial = InitialState { memory: params.memory_bias, weightings, reads };
        self.params = Some(params);
        self.initial = Some(initial.clone());
        debug!(params = ntm.weights_count(), heads = cfg.head_count, "sequence initialised");
        Ok((params, initial))
    }

    fn record_step(&mut self, input: &[f64]) -> Result<Timestep> {
        let (params, initial) = self.begin()?;
        let ntm = self.ntm;
        let cfg = ntm.config();
        let (n, m) = (cfg.memory_rows, cfg.memory_columns);
        let dims = cfg.controller_dims();
        let layout = cfg.head_layout();

        let index = self.steps.len();
        let prev = index.checked_sub(1);
        let (prev_memory, prev_weightings, prev_reads) = match self.steps.last() {
            Some(t) => (
                t.memory,
                t.heads.iter().map(|h| h.weighting).collect::<Vec<_>>(),
                t.heads.iter().map(|h| h.read).collect::<Vec<_>>(),
            ),
            None => (initial.memory, initial.weightings, initial.reads),
        };

        // ── Controller ──
        let input_id = self.tape.register_input(input);
        let ctrl = self.eval_controller(&params.controller, input, &prev_reads)?;
        let output = ctrl.output();
        let ControllerOutput { hidden, logits, signals } = ctrl;
        let hidden = self.tape.alloc(hidden, vec![dims.hidden]);
        let logits = self.tape.alloc(logits, vec![dims.output]);
        let signals = self.tape.alloc(signals, vec![dims.signals_len()]);
        self.tape.record(TapeOp::Controller {
            input: input_id,
            reads: prev_reads,
            weights: params.controller,
            hidden,
            logits,
            signals,
            dims,
        });

        // ── Addressing, per head ──
        let unit = layout.unit_size();
        let mut heads = Vec::with_capacity(cfg.head_count);
        for (h, &prev_w) in prev_weightings.iter().enumerate() {
            let raw = self.tape.buf_data(signals)[h * unit..(h + 1) * unit].to_vec();
            let sig_id =
                self.tape.record_with_output(raw, vec![unit], |out| TapeOp::Slice { input: signals, out, offset: h * unit });
            heads.push(self.record_addressing(sig_id, prev_memory, prev_w, layout, n)?);
        }

        // ── Memory write, then reads from the new snapshot ──
        let memory = self.record_write(prev_memory, &heads, layout, n)?;
        for head in heads.iter_mut() {
            head.read = self.record_read(memory, head.weighting, n, m)?;
        }

        trace!(step = index, "timestep recorded");
        Ok(Timestep { index, prev, input: input_id, hidden, logits, signals, heads, memory, output })
    }

    fn eval_controller(&self, w: &ControllerBufs, input: &[f64], reads: &[BufId]) -> Result<ControllerOutput> {
        let tape = &self.tape;
        let weights = ControllerWeights {
            w_input: tape.buf_data(w.w_input),
            w_reads: tape.buf_data(w.w_reads),
            b_hidden: tape.buf_data(w.b_hidden),
            w_output: tape.buf_data(w.w_output),
            b_output: tape.buf_data(w.b_output),
            w_heads: tape.buf_data(w.w_heads),
            b_heads: tape.buf_data(w.b_heads),
        };
        let read_concat: Vec<f64> = reads.iter().flat_map(|&r| tape.buf_data(r).iter().copied()).collect();
        controller_forward(&self.ntm.config().controller_dims(), &weights, input, &read_concat)
    }

    /// content → gate → shift → sharpen for one head. `read` is filled in after the write.
    fn record_addressing(
        &mut self,
        sig: BufId,
        memory: BufId,
        prev_w: BufId,
        layout: HeadLayout,
        rows: usize,
    ) -> Result<HeadTrace> {
        let raw = self.tape.buf_data(sig).to_vec();
        let shape = vec![rows];

        let content = addressing::content_forward(&raw[layout.key()], raw[layout.beta()], self.tape.buf_data(memory), rows, layout.m)?;
        let content = self.tape.record_with_output(content, shape.clone(), |out| TapeOp::ContentAddressing {
            signals: sig,
            memory,
            out,
            layout,
            rows,
        });

        let gated = addressing::gate_forward(self.tape.buf_data(content), self.tape.buf_data(prev_w), raw[layout.gate()]);
        let gated = self.tape.record_with_output(gated, shape.clone(), |out| TapeOp::Gate {
            signals: sig,
            content,
            prev: prev_w,
            out,
            layout,
        });

        let shifted = addressing::shift_forward(self.tape.buf_data(gated), raw[layout.shift()])?;
        let shifted =
            self.tape.record_with_output(shifted, shape.clone(), |out| TapeOp::Shift { signals: sig, gated, out, layout });

        let weighting = addressing::sharpen_forward(self.tape.buf_data(shifted), raw[layout.gamma()])?;
        let weighting =
            self.tape.record_with_output(weighting, shape, |out| TapeOp::Sharpen { signals: sig, shifted, out, layout });

        Ok(HeadTrace { signals: sig, content, gated, shifted, weighting, read: weighting })
    }

    fn record_write(&mut self, prev: BufId, heads: &[HeadTrace], layout: HeadLayout, rows: usize) -> Result<BufId> {
        let next = {
            let tape = &self.tape;
            let write_heads: Vec<WriteHead<'_>> = heads
                .iter()
                .map(|h| WriteHead {
                    weighting: tape.buf_data(h.weighting),
                    erase: &tape.buf_data(h.signals)[layout.erase()],
                    add: &tape.buf_data(h.signals)[layout.add()],
                })
                .collect();
            memory::write_forward(tape.buf_data(prev), &write_heads, rows, layout.m)?
        };
        Ok(self.tape.record_with_output(next, vec![rows, layout.m], |out| TapeOp::MemoryWrite {
            memory: prev,
            weightings: heads.iter().map(|h| h.weighting).collect(),
            signals: heads.iter().map(|h| h.signals).collect(),
            out,
            layout,
            rows,
        }))
    }

    fn record_read(&mut self, memory: BufId, weighting: BufId, rows: usize, cols: usize) -> Result<BufId> {
        let r = memory::read_forward(self.tape.buf_data(memory), self.tape.buf_data(weighting), rows, cols)?;
        Ok(self.tape.record_with_output(r, vec![cols], |out| TapeOp::MemoryRead { memory, weighting, out, rows, cols }))
    }
}

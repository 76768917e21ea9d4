/// NTM configuration, parameters, inference and checkpoints.
///
/// Parameters live in nine flat buffers in a fixed order (`PARAM_NAMES`). The
/// same order is used by the tape, the optimizer state and the checkpoint.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::addressing::{address, HeadLayout, HeadSignals};
use crate::controller::{controller_forward, ControllerDims, ControllerWeights};
use crate::error::{expect_len, NtmError, Result};
use crate::memory::{read_forward, write_forward, WriteHead};
use crate::tensor::{fill_uniform, softmax};

/// Network shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtmConfig {
    pub input_size: usize,
    pub output_size: usize,
    pub hidden_size: usize,
    pub head_count: usize,
    /// N: number of memory rows (addressable cells).
    pub memory_rows: usize,
    /// M: width of each memory row.
    pub memory_columns: usize,
}

impl NtmConfig {
    /// Copy-task machine for `width`-bit vectors: two extra input flags,
    /// 100 hidden units, one head, 128 x 20 memory.
    pub fn copy_task(width: usize) -> Self {
        NtmConfig {
            input_size: width + 2,
            output_size: width,
            hidden_size: 100,
            head_count: 1,
            memory_rows: 128,
            memory_columns: 20,
        }
    }

    /// Tiny two-head machine for gradient checks.
    pub fn test_config() -> Self {
        NtmConfig {
            input_size: 3,
            output_size: 2,
            hidden_size: 4,
            head_count: 2,
            memory_rows: 5,
            memory_columns: 3,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("input_size", self.input_size),
            ("output_size", self.output_size),
            ("hidden_size", self.hidden_size),
            ("head_count", self.head_count),
            ("memory_rows", self.memory_rows),
            ("memory_columns", self.memory_columns),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(NtmError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub fn head_layout(&self) -> HeadLayout {
        HeadLayout::new(self.memory_columns)
    }

    pub fn controller_dims(&self) -> ControllerDims {
        ControllerDims {
            input: self.input_size,
            output: self.output_size,
            hidden: self.hidden_size,
            heads: self.head_count,
            read_width: self.memory_columns,
            head_unit: self.head_layout().unit_size(),
        }
    }
}

/// Buffer names in parameter order.
pub const PARAM_NAMES: [&str; 9] = [
    "w_input",
    "w_reads",
    "b_hidden",
    "w_output",
    "b_output",
    "w_heads",
    "b_heads",
    "memory_bias",
    "weighting_bias",
];

/// Every learnable weight of the machine. Also used to carry gradients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NtmParams {
    /// [hidden, input]
    pub w_input: Vec<f64>,
    /// [hidden, heads · M]
    pub w_reads: Vec<f64>,
    pub b_hidden: Vec<f64>,
    /// [output, hidden]
    pub w_output: Vec<f64>,
    pub b_output: Vec<f64>,
    /// [heads · (3M + 4), hidden]
    pub w_heads: Vec<f64>,
    pub b_heads: Vec<f64>,
    /// Initial memory [N, M].
    pub memory_bias: Vec<f64>,
    /// Initial weighting logits [heads, N].
    pub weighting_bias: Vec<f64>,
}

impl NtmParams {
    /// Shape of each buffer, in parameter order.
    pub fn shapes(cfg: &NtmConfig) -> [Vec<usize>; 9] {
        let dims = cfg.controller_dims();
        [
            vec![dims.hidden, dims.input],
            vec![dims.hidden, dims.reads_len()],
            vec![dims.hidden],
            vec![dims.output, dims.hidden],
            vec![dims.output],
            vec![dims.signals_len(), dims.hidden],
            vec![dims.signals_len()],
            vec![cfg.memory_rows, cfg.memory_columns],
            vec![cfg.head_count, cfg.memory_rows],
        ]
    }

    pub fn zeros_like(cfg: &NtmConfig) -> Self {
        let [w_input, w_reads, b_hidden, w_output, b_output, w_heads, b_heads, memory_bias, weighting_bias] =
            Self::shapes(cfg).map(|s| vec![0.0; s.iter().product()]);
        NtmParams { w_input, w_reads, b_hidden, w_output, b_output, w_heads, b_heads, memory_bias, weighting_bias }
    }

    pub fn buffers(&self) -> [&[f64]; 9] {
        [
            &self.w_input,
            &self.w_reads,
            &self.b_hidden,
            &self.w_output,
            &self.b_output,
            &self.w_heads,
            &self.b_heads,
            &self.memory_bias,
            &self.weighting_bias,
        ]
    }

    pub fn buffers_mut(&mut self) -> [&mut Vec<f64>; 9] {
        [
            &mut self.w_input,
            &mut self.w_reads,
            &mut self.b_hidden,
            &mut self.w_output,
            &mut self.b_output,
            &mut self.w_heads,
            &mut self.b_heads,
            &mut self.memory_bias,
            &mut self.weighting_bias,
        ]
    }

    pub fn num_params(&self) -> usize {
        self.buffers().iter().map(|b| b.len()).sum()
    }

    /// Check every buffer against the sizes `cfg` implies.
    pub fn validate(&self, cfg: &NtmConfig) -> Result<()> {
        for ((buf, shape), name) in self.buffers().iter().zip(Self::shapes(cfg).iter()).zip(PARAM_NAMES) {
            let expected: usize = shape.iter().product();
            if buf.len() != expected {
                return Err(NtmError::DimensionMismatch { what: name, expected, got: buf.len() });
            }
        }
        Ok(())
    }

    pub fn controller_weights(&self) -> ControllerWeights<'_> {
        ControllerWeights {
            w_input: &self.w_input,
            w_reads: &self.w_reads,
            b_hidden: &self.b_hidden,
            w_output: &self.w_output,
            b_output: &self.b_output,
            w_heads: &self.w_heads,
            b_heads: &self.b_heads,
        }
    }

    /// Largest absolute entry across all buffers.
    pub fn max_abs(&self) -> f64 {
        self.buffers().iter().flat_map(|b| b.iter()).fold(0.0, |m, v| m.max(v.abs()))
    }
}

/// Memory, per-head weightings and per-head reads after a timestep.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineState {
    pub memory: Vec<f64>,
    pub weightings: Vec<Vec<f64>>,
    pub reads: Vec<Vec<f64>>,
}

/// A Neural Turing Machine: configuration plus weights.
#[derive(Clone, Debug, PartialEq)]
pub struct Ntm {
    config: NtmConfig,
    params: NtmParams,
}

impl Ntm {
    /// Zero-weight machine. Weights must be initialised before it can run:
    /// an all-zero memory has no defined cosine similarity.
    pub fn new(config: NtmConfig) -> Result<Self> {
        config.validate()?;
        let params = NtmParams::zeros_like(&config);
        Ok(Ntm { config, params })
    }

    pub fn from_parts(config: NtmConfig, params: NtmParams) -> Result<Self> {
        config.validate()?;
        params.validate(&config)?;
        Ok(Ntm { config, params })
    }

    pub fn config(&self) -> &NtmConfig {
        &self.config
    }

    pub fn params(&self) -> &NtmParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut NtmParams {
        &mut self.params
    }

    /// Visit every weight in parameter order.
    pub fn for_each_weight(&mut self, mut f: impl FnMut(&mut f64)) {
        for buf in self.params.buffers_mut() {
            buf.iter_mut().for_each(&mut f);
        }
    }

    /// Uniform init in [-scale, scale).
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R, scale: f64) {
        for buf in self.params.buffers_mut() {
            fill_uniform(rng, buf, scale);
        }
    }

    pub fn weights_count(&self) -> usize {
        self.params.num_params()
    }

    /// State before the first timestep, derived from the bias parameters.
    pub fn initial_state(&self) -> Result<MachineState> {
        let (n, m) = (self.config.memory_rows, self.config.memory_columns);
        let memory = self.params.memory_bias.clone();
        let mut weightings = Vec::with_capacity(self.config.head_count);
        let mut reads = Vec::with_capacity(self.config.head_count);
        for bias in self.params.weighting_bias.chunks(n) {
            let mut w = vec![0.0; n];
            softmax(bias, &mut w);
            reads.push(read_forward(&memory, &w, n, m)?);
            weightings.push(w);
        }
        Ok(MachineState { memory, weightings, reads })
    }

    /// One forward step without recording. Returns the sigmoid output and the next state.
    pub fn process_timestep(&self, state: &MachineState, input: &[f64]) -> Result<(Vec<f64>, MachineState)> {
        let cfg = &self.config;
        let (n, m) = (cfg.memory_rows, cfg.memory_columns);
        expect_len("head weightings", cfg.head_count, state.weightings.len())?;
        expect_len("head reads", cfg.head_count, state.reads.len())?;

        let reads: Vec<f64> = state.reads.concat();
        let ctrl = controller_forward(&cfg.controller_dims(), &self.params.controller_weights(), input, &reads)?;

        let layout = cfg.head_layout();
        let mut signals = Vec::with_capacity(cfg.head_count);
        let mut weightings = Vec::with_capacity(cfg.head_count);
        for (h, unit) in ctrl.signals.chunks(layout.unit_size()).enumerate() {
            let sig = HeadSignals::split(unit, layout)?;
            let addressed = address(&sig, &state.memory, &state.weightings[h], n, m)?;
            weightings.push(addressed.weighting);
            signals.push(sig);
        }

        let heads: Vec<WriteHead<'_>> = signals
            .iter()
            .zip(weightings.iter())
            .map(|(s, w)| WriteHead { weighting: w, erase: s.erase, add: s.add })
            .collect();
        let memory = write_forward(&state.memory, &heads, n, m)?;
        let reads = weightings.iter().map(|w| read_forward(&memory, w, n, m)).collect::<Result<Vec<_>>>()?;

        Ok((ctrl.output(), MachineState { memory, weightings, reads }))
    }

    /// Forward a whole sequence from the initial state.
    pub fn run(&self, inputs: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let mut state = self.initial_state()?;
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (output, next) = self.process_timestep(&state, input)?;
            outputs.push(output);
            state = next;
        }
        Ok(outputs)
    }
}

// ── Checkpoint ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    config: NtmConfig,
    params: NtmParams,
}

/// Write config and weights as JSON.
pub fn save_checkpoint(path: &Path, ntm: &Ntm) -> Result<()> {
    let checkpoint = Checkpoint { config: ntm.config.clone(), params: ntm.params.clone() };
    let json = serde_json::to_string(&checkpoint)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read a checkpoint; the config and every buffer size are revalidated.
pub fn load_checkpoint(path: &Path) -> Result<Ntm> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: Checkpoint = serde_json::from_str(&json)?;
    Ntm::from_parts(checkpoint.config, checkpoint.params)
}

//! Neural Turing Machine with a hand-written reverse-mode core.
//!
//! A sigmoid controller drives read/write heads over an N x M memory. Every
//! timestep is recorded on a Wengert tape and trained with backpropagation
//! through time and RMSProp.

pub mod error;
pub mod tensor;
pub mod tape;
pub mod controller;
pub mod addressing;
pub mod memory;
pub mod model;
pub mod sequence;
pub mod gradient;
pub mod rmsprop;
pub mod trainer;
pub mod copy_task;
pub mod report;

pub use error::{NtmError, Result};
pub use model::{load_checkpoint, save_checkpoint, MachineState, Ntm, NtmConfig, NtmParams};
pub use rmsprop::RmsPropConfig;
pub use sequence::{Phase, Sequence};
pub use trainer::{TrainStep, Trainer};

/// Copy task: present a random bit sequence, then reproduce it from memory.
///
/// For `size` vectors of `width` bits the episode lasts 2·size + 2 steps:
///
///   step         input (width + 2)            target (width)
///   0            start flag at `width`        0
///   1..=size     data bits                    0
///   size + 1     end flag at `width + 1`      0
///   size + 2..   0                            data bits, replayed

use rand::Rng;

/// One generated episode.
#[derive(Clone, Debug, PartialEq)]
pub struct CopySequence {
    pub inputs: Vec<Vec<f64>>,
    pub targets: Vec<Vec<f64>>,
}

impl CopySequence {
    /// Number of data vectors in the episode.
    pub fn size(&self) -> usize {
        (self.inputs.len() - 2) / 2
    }

    /// First timestep whose target carries data.
    pub fn replay_start(&self) -> usize {
        self.size() + 2
    }
}

pub fn generate_sequence<R: Rng + ?Sized>(rng: &mut R, size: usize, width: usize) -> CopySequence {
    let len = 2 * size + 2;
    let mut inputs = vec![vec![0.0; width + 2]; len];
    let mut targets = vec![vec![0.0; width]; len];

    inputs[0][width] = 1.0;
    for t in 0..size {
        for j in 0..width {
            let bit = if rng.gen_bool(0.5) { 1.0 } else { 0.0 };
            inputs[t + 1][j] = bit;
            targets[t + size + 2][j] = bit;
        }
    }
    inputs[size + 1][width + 1] = 1.0;

    CopySequence { inputs, targets }
}

/// Mean per-bit log-loss in bits over the replay steps.
pub fn replay_bit_loss(sequence: &CopySequence, outputs: &[Vec<f64>]) -> f64 {
    let start = sequence.replay_start();
    let mut total = 0.0;
    let mut count = 0usize;
    for (target, output) in sequence.targets.iter().zip(outputs.iter()).skip(start) {
        for (&y, &p) in target.iter().zip(output.iter()) {
            total -= y * p.log2() + (1.0 - y) * (1.0 - p).log2();
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_layout() {
        let seq = generate_sequence(&mut StdRng::seed_from_u64(1), 3, 4);
        assert_eq!(seq.inputs.len(), 8);
        assert_eq!(seq.targets.len(), 8);
        assert!(seq.inputs.iter().all(|v| v.len() == 6));
        assert!(seq.targets.iter().all(|v| v.len() == 4));
        assert_eq!(seq.inputs[0], vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(seq.inputs[4], vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        for t in 0..3 {
            assert_eq!(&seq.inputs[t + 1][..4], &seq.targets[t + 5][..]);
            assert_eq!(&seq.inputs[t + 1][4..], &[0.0, 0.0]);
        }
        assert!(seq.targets[..5].iter().flatten().all(|&b| b == 0.0));
        assert!(seq.inputs[5..].iter().flatten().all(|&b| b == 0.0));
        assert_eq!(seq.size(), 3);
        assert_eq!(seq.replay_start(), 5);
    }

    #[test]
    fn test_deterministic_per_seed() {
        let a = generate_sequence(&mut StdRng::seed_from_u64(32702), 5, 8);
        let b = generate_sequence(&mut StdRng::seed_from_u64(32702), 5, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bit_loss_of_coin_flip_is_one() {
        let seq = generate_sequence(&mut StdRng::seed_from_u64(2), 4, 8);
        let outputs = vec![vec![0.5; 8]; seq.inputs.len()];
        assert!((replay_bit_loss(&seq, &outputs) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bit_loss_ignores_presentation_phase() {
        let seq = generate_sequence(&mut StdRng::seed_from_u64(2), 2, 3);
        let mut outputs: Vec<Vec<f64>> = seq.targets.iter().map(|t| t.iter().map(|&b| if b == 1.0 { 0.99 } else { 0.01 }).collect()).collect();
        // garbage before the replay window must not count
        for o in outputs.iter_mut().take(seq.replay_start()) {
            *o = vec![0.999; 3];
        }
        let loss = replay_bit_loss(&seq, &outputs);
        assert!((loss - (-(0.99f64).log2())).abs() < 1e-12);
    }
}

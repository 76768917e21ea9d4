/// Memory engine: erase/add write across all heads, weighted read.
///
/// Memory is a row-major [rows, cols] buffer. A write never mutates its input
/// snapshot; it returns the successor.
///
///   e[h][j]   = sigmoid(erase_raw[h][j])
///   a[h][j]   = sigmoid(add_raw[h][j])
///   new[i][j] = prev[i][j] · Π_h (1 - w[h][i] e[h][j]) + Σ_h w[h][i] a[h][j]
///   r[j]      = Σ_i w[i] M[i][j]

use crate::error::{expect_len, NtmError, Result};
use crate::tensor::{matvec_t_acc, outer_acc, sigmoid};

/// One head's contribution to a write: its final weighting and raw erase/add signals.
#[derive(Clone, Copy, Debug)]
pub struct WriteHead<'a> {
    pub weighting: &'a [f64],
    pub erase: &'a [f64],
    pub add: &'a [f64],
}

impl<'a> WriteHead<'a> {
    fn check(&self, rows: usize, cols: usize) -> Result<()> {
        expect_len("write weighting", rows, self.weighting.len())?;
        expect_len("erase vector", cols, self.erase.len())?;
        expect_len("add vector", cols, self.add.len())
    }
}

pub fn write_forward(prev: &[f64], heads: &[WriteHead<'_>], rows: usize, cols: usize) -> Result<Vec<f64>> {
    expect_len("memory", rows * cols, prev.len())?;
    for head in heads {
        head.check(rows, cols)?;
    }
    let erase: Vec<Vec<f64>> = heads.iter().map(|h| h.erase.iter().map(|&x| sigmoid(x)).collect()).collect();
    let add: Vec<Vec<f64>> = heads.iter().map(|h| h.add.iter().map(|&x| sigmoid(x)).collect()).collect();

    let mut next = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            let mut keep = 1.0;
            let mut added = 0.0;
            for (h, head) in heads.iter().enumerate() {
                let w = head.weighting[i];
                keep *= 1.0 - w * erase[h][j];
                added += w * add[h][j];
            }
            next[i * cols + j] = prev[i * cols + j] * keep + added;
        }
    }
    if let Some(pos) = next.iter().position(|v| !v.is_finite()) {
        return Err(NtmError::numeric("memory write", format!("cell ({}, {}) is {}", pos / cols, pos % cols, next[pos])));
    }
    Ok(next)
}

/// Gradients of a write w.r.t. the previous snapshot and every head's inputs.
#[derive(Debug)]
pub struct WriteGrads {
    pub d_prev: Vec<f64>,
    pub d_weightings: Vec<Vec<f64>>,
    /// w.r.t. the raw (pre-sigmoid) erase signals
    pub d_erase: Vec<Vec<f64>>,
    /// w.r.t. the raw (pre-sigmoid) add signals
    pub d_add: Vec<Vec<f64>>,
}

pub fn write_backward(
    prev: &[f64],
    heads: &[WriteHead<'_>],
    d_next: &[f64],
    rows: usize,
    cols: usize,
) -> WriteGrads {
    let k = heads.len();
    let erase: Vec<Vec<f64>> = heads.iter().map(|h| h.erase.iter().map(|&x| sigmoid(x)).collect()).collect();
    let add: Vec<Vec<f64>> = heads.iter().map(|h| h.add.iter().map(|&x| sigmoid(x)).collect()).collect();

    let mut d_prev = vec![0.0; rows * cols];
    let mut d_weightings = vec![vec![0.0; rows]; k];
    // Accumulated before the sigmoid derivative is applied.
    let mut d_e = vec![vec![0.0; cols]; k];
    let mut d_a = vec![vec![0.0; cols]; k];

    let mut factors = vec![0.0; k];
    for i in 0..rows {
        for j in 0..cols {
            let idx = i * cols + j;
            let d = d_next[idx];
            if d == 0.0 {
                continue;
            }
            for h in 0..k {
                factors[h] = 1.0 - heads[h].weighting[i] * erase[h][j];
            }
            d_prev[idx] = d * factors.iter().product::<f64>();

            for h in 0..k {
                // Π over the other heads, by skipping h
                let others: f64 = factors.iter().enumerate().filter(|&(q, _)| q != h).map(|(_, f)| f).product();
                let w = heads[h].weighting[i];
                let p = prev[idx];
                d_weightings[h][i] += d * (add[h][j] - p * erase[h][j] * others);
                d_e[h][j] += d * (-p * w * others);
                d_a[h][j] += d * w;
            }
        }
    }

    let d_erase = d_e
        .iter()
        .zip(erase.iter())
        .map(|(de, e)| de.iter().zip(e.iter()).map(|(g, e)| g * e * (1.0 - e)).collect())
        .collect();
    let d_add = d_a
        .iter()
        .zip(add.iter())
        .map(|(da, a)| da.iter().zip(a.iter()).map(|(g, a)| g * a * (1.0 - a)).collect())
        .collect();

    WriteGrads { d_prev, d_weightings, d_erase, d_add }
}

pub fn read_forward(memory: &[f64], weighting: &[f64], rows: usize, cols: usize) -> Result<Vec<f64>> {
    expect_len("memory", rows * cols, memory.len())?;
    expect_len("read weighting", rows, weighting.len())?;
    let mut r = vec![0.0; cols];
    matvec_t_acc(memory, weighting, &mut r, rows, cols);
    Ok(r)
}

/// Returns (d_memory, d_weighting).
pub fn read_backward(memory: &[f64], weighting: &[f64], d_read: &[f64], rows: usize, cols: usize) -> (Vec<f64>, Vec<f64>) {
    let mut d_weighting = vec![0.0; rows];
    crate::tensor::matvec_acc(memory, d_read, &mut d_weighting, rows, cols);
    let mut d_memory = vec![0.0; rows * cols];
    outer_acc(weighting, d_read, &mut d_memory);
    (d_memory, d_weighting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_weighting_is_identity() {
        let prev = vec![0.3, -1.2, 0.0, 4.5, 2.0, -0.7];
        let w = [0.0, 0.0, 0.0];
        let e = [3.0, -1.0];
        let a = [0.5, 2.0];
        let heads = [WriteHead { weighting: &w, erase: &e, add: &a }, WriteHead { weighting: &w, erase: &a, add: &e }];
        let next = write_forward(&prev, &heads, 3, 2).unwrap();
        assert_eq!(next, prev);
    }

    #[test]
    fn test_full_erase_replaces_cell() {
        // sigmoid(60) rounds to 1.0 in f64
        let prev = vec![0.9, 0.4, -0.3, 0.8];
        let w = [0.0, 1.0];
        let e = [60.0, -60.0];
        let a = [0.25, 1.5];
        let next = write_forward(&prev, &[WriteHead { weighting: &w, erase: &e, add: &a }], 2, 2).unwrap();
        assert_eq!(next[2], sigmoid(0.25));
        // row 0 untouched
        assert_eq!(&next[..2], &prev[..2]);
    }

    #[test]
    fn test_write_rejects_short_erase() {
        let prev = vec![0.0; 4];
        let w = [0.5, 0.5];
        let err = write_forward(&prev, &[WriteHead { weighting: &w, erase: &[0.0], add: &[0.0, 0.0] }], 2, 2);
        assert!(matches!(err, Err(NtmError::DimensionMismatch { what: "erase vector", .. })));
    }

    #[test]
    fn test_read_is_weighted_row_sum() {
        let m = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let r = read_forward(&m, &[0.5, 0.25, 0.25], 3, 2).unwrap();
        assert_eq!(r, vec![0.5 + 0.75 + 1.25, 1.0 + 1.0 + 1.5]);
    }

    #[test]
    fn test_read_backward_shapes() {
        let m = [1.0, 2.0, 3.0, 4.0];
        let (d_m, d_w) = read_backward(&m, &[0.25, 0.75], &[1.0, -1.0], 2, 2);
        assert_eq!(d_w, vec![-1.0, -1.0]);
        assert_eq!(d_m, vec![0.25, -0.25, 0.75, -0.75]);
    }
}

//! Sinusoidal position encodings with a position rate.

use burn::tensor::{backend::Backend, Tensor, TensorData};

/// Raw angles `pos / 10000^(2⌊i/2⌋/dim)` for one position, before the rate
/// and the sin/cos are applied.
pub fn angle_row(position: usize, dim: usize) -> Vec<f32> {
    (0..dim)
        .map(|i| {
            let exponent = 2.0 * (i / 2) as f64 / dim as f64;
            (position as f64 / 10000f64.powf(exponent)) as f32
        })
        .collect()
}

/// Encoding row for one position.
///
/// Position 0 is reserved for padding and maps to all zeros. Even channels carry
/// `sin`, odd channels `cos`, of `rate · pos / 10000^(2⌊i/2⌋/dim)`.
pub fn sinusoid_row(position: usize, dim: usize, rate: f32) -> Vec<f32> {
    if position == 0 {
        return vec![0.0; dim];
    }
    (0..dim)
        .map(|i| {
            let exponent = 2.0 * (i / 2) as f64 / dim as f64;
            let angle = rate as f64 * position as f64 / 10000f64.powf(exponent);
            if i % 2 == 0 {
                angle.sin() as f32
            } else {
                angle.cos() as f32
            }
        })
        .collect()
}

/// `[rows, dim]` table of [`angle_row`]s for positions `0..rows`.
pub fn angle_table<B: Backend>(rows: usize, dim: usize, device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f32> = (0..rows).flat_map(|pos| angle_row(pos, dim)).collect();
    Tensor::from_data(TensorData::new(values, [rows, dim]), device)
}

/// Where position rows come from.
#[derive(Debug, Clone)]
pub enum PositionEncoding<B: Backend> {
    /// Computed on demand at a fixed rate.
    Sinusoid { dim: usize, rate: f32 },
    /// Learned `[max_positions, dim]` angle table indexed by position. Rows are
    /// scaled by `rate` before the sin/cos, like the computed form.
    Table { angles: Tensor<B, 2>, rate: f32 },
}

impl<B: Backend> PositionEncoding<B> {
    pub fn dim(&self) -> usize {
        match self {
            PositionEncoding::Sinusoid { dim, .. } => *dim,
            PositionEncoding::Table { angles, .. } => angles.dims()[1],
        }
    }

    /// Rows for positions `start..start + len` as `[len, dim]`.
    pub fn rows(&self, start: usize, len: usize, device: &B::Device) -> Tensor<B, 2> {
        match self {
            PositionEncoding::Sinusoid { dim, rate } => {
                let mut values = Vec::with_capacity(len * dim);
                for pos in start..start + len {
                    values.extend(sinusoid_row(pos, *dim, *rate));
                }
                Tensor::from_data(TensorData::new(values, [len, *dim]), device)
            }
            PositionEncoding::Table { angles, rate } => {
                let dim = angles.dims()[1];
                let scaled = lookup(angles, start, len).mul_scalar(*rate);
                let even: Vec<f32> = (0..dim).map(|i| ((i + 1) % 2) as f32).collect();
                let even = Tensor::<B, 2>::from_data(TensorData::new(even, [1, dim]), device);
                let odd = even.clone().neg().add_scalar(1.0);
                let encoded = scaled.clone().sin() * even + scaled.cos() * odd;
                // Position 0 is padding.
                let live: Vec<f32> = (start..start + len)
                    .map(|pos| if pos == 0 { 0.0 } else { 1.0 })
                    .collect();
                encoded * Tensor::<B, 2>::from_data(TensorData::new(live, [len, 1]), device)
            }
        }
    }
}

/// Table rows `start..start + len`; positions past the table repeat its last row.
fn lookup<B: Backend>(table: &Tensor<B, 2>, start: usize, len: usize) -> Tensor<B, 2> {
    let max = table.dims()[0];
    let end = (start + len).min(max);
    let start = start.min(end);
    let inside = end - start;
    if inside == len {
        return table.clone().narrow(0, start, len);
    }
    let pad = table.clone().narrow(0, max - 1, 1).repeat_dim(0, len - inside);
    if inside == 0 {
        return pad;
    }
    Tensor::cat(vec![table.clone().narrow(0, start, inside), pad], 0)
}

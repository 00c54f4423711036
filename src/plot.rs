//! Alignment heat-maps.
//!
//! Decoder steps run left to right, encoder tokens bottom to top. Each cell is
//! drawn as a square block so short utterances stay legible.

use crate::model::decoder::AttentionMatrix;
use crate::perf::{self, Metric};
use anyhow::{ensure, Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use std::path::Path;

/// Smallest width/height the rendered image is scaled up to, in pixels.
const MIN_EXTENT: usize = 256;
const MAX_CELL: usize = 16;

/// Viridis control points, low to high.
const PALETTE: [[f32; 3]; 5] = [
    [68.0, 1.0, 84.0],
    [59.0, 82.0, 139.0],
    [33.0, 145.0, 140.0],
    [94.0, 201.0, 98.0],
    [253.0, 231.0, 37.0],
];

fn colormap(value: f32) -> Rgb<u8> {
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let pos = v * (PALETTE.len() - 1) as f32;
    let lo = (pos.floor() as usize).min(PALETTE.len() - 2);
    let t = pos - lo as f32;
    let mut rgb = [0u8; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        let a = PALETTE[lo][c];
        let b = PALETTE[lo + 1][c];
        *out = (a + (b - a) * t).round() as u8;
    }
    Rgb(rgb)
}

/// Render the matrix, normalized by its maximum weight.
pub fn render_alignment(alignment: &AttentionMatrix) -> Result<RgbImage> {
    ensure!(
        alignment.steps > 0 && alignment.tokens > 0,
        "cannot plot an empty alignment ({}x{})",
        alignment.steps,
        alignment.tokens
    );
    let peak = alignment
        .data
        .iter()
        .copied()
        .filter(|w| w.is_finite())
        .fold(0.0f32, f32::max);
    let scale = if peak > 0.0 { 1.0 / peak } else { 0.0 };

    let shortest = alignment.steps.min(alignment.tokens).max(1);
    let cell = MIN_EXTENT.div_ceil(shortest).clamp(1, MAX_CELL);
    let width = (alignment.steps * cell) as u32;
    let height = (alignment.tokens * cell) as u32;
    let image: RgbImage = ImageBuffer::from_fn(width, height, |x, y| {
        let step = x as usize / cell;
        let token = alignment.tokens - 1 - y as usize / cell;
        colormap(alignment.row(step)[token] * scale)
    });
    Ok(image)
}

/// Write the alignment as a PNG.
pub fn save_alignment(alignment: &AttentionMatrix, path: impl AsRef<Path>) -> Result<()> {
    let _span = perf::span(Metric::AlignmentPlot);
    let path = path.as_ref();
    render_alignment(alignment)?
        .save(path)
        .with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn diagonal(n: usize) -> AttentionMatrix {
        let mut matrix = AttentionMatrix::new(n);
        for step in 0..n {
            let mut row = vec![0.0; n];
            row[step] = 1.0;
            matrix.push_row(&row);
        }
        matrix
    }

    #[test]
    fn palette_endpoints() {
        assert_eq!(colormap(0.0), Rgb([68, 1, 84]));
        assert_eq!(colormap(1.0), Rgb([253, 231, 37]));
        assert_eq!(colormap(f32::NAN), colormap(0.0));
    }

    #[test]
    fn diagonal_is_bright_bottom_left_to_top_right() {
        let image = render_alignment(&diagonal(4)).unwrap();
        let cell = image.width() / 4;
        assert_eq!(image.width(), image.height());
        let bottom_left = image.get_pixel(0, image.height() - 1);
        let top_left = image.get_pixel(0, 0);
        assert_eq!(*bottom_left, colormap(1.0));
        assert_eq!(*top_left, colormap(0.0));
        assert_eq!(*image.get_pixel(3 * cell, 0), colormap(1.0));
    }

    #[test]
    fn writes_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("align.png");
        save_alignment(&diagonal(3), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn empty_alignment_is_rejected() {
        assert!(render_alignment(&AttentionMatrix::new(3)).is_err());
    }
}

//! Local Binary Pattern Histograms.
//!
//! Radius-1, 8-neighbour LBP codes, summarized as an 8×8 grid of 256-bin
//! histograms, each normalized by its cell's pixel count. Distances are
//! symmetric chi-square, so two identical crops score 0 and the maximum is
//! `2 * GRID_X * GRID_Y`.

use serde::{Deserialize, Serialize};

pub(crate) const GRID_X: u32 = 8;
pub(crate) const GRID_Y: u32 = 8;
/// Largest grid accepted from a stored model.
pub(crate) const MAX_GRID: u32 = 64;
const BINS: usize = 256;

/// Neighbour offsets (dx, dy), clockwise from the top-left; bit 7 first.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct LbphParams {
    pub width: u32,
    pub height: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub histograms: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
}

impl LbphParams {
    pub fn histogram_len(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize * BINS
    }
}

/// Smallest crop side that still gives every grid cell at least one LBP pixel.
pub(crate) fn min_side() -> u32 {
    GRID_X.max(GRID_Y) + 2
}

/// LBP code image of size (width-2) × (height-2); border pixels have no code.
pub(crate) fn lbp_codes(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    if w < 3 || h < 3 || data.len() < w * h {
        return Vec::new();
    }
    let mut codes = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = data[y * w + x];
            let mut code = 0u8;
            for (dx, dy) in NEIGHBOURS {
                let nx = (x as i32 + dx) as usize;
                let ny = (y as i32 + dy) as usize;
                code = (code << 1) | u8::from(data[ny * w + nx] >= center);
            }
            codes.push(code);
        }
    }
    codes
}

/// Concatenated per-cell histograms of the LBP code image.
pub(crate) fn spatial_histogram(
    data: &[u8],
    width: u32,
    height: u32,
    grid_x: u32,
    grid_y: u32,
) -> Vec<f32> {
    let codes = lbp_codes(data, width, height);
    let lw = width.saturating_sub(2) as usize;
    let lh = height.saturating_sub(2) as usize;
    let (gx, gy) = (grid_x as usize, grid_y as usize);
    let mut hist = vec![0f32; gx * gy * BINS];
    if codes.is_empty() || gx == 0 || gy == 0 {
        return hist;
    }

    let cell_w = lw / gx;
    let cell_h = lh / gy;
    if cell_w == 0 || cell_h == 0 {
        return hist;
    }
    let cell_pixels = (cell_w * cell_h) as f32;

    for cy in 0..gy {
        for cx in 0..gx {
            let cell = &mut hist[(cy * gx + cx) * BINS..(cy * gx + cx + 1) * BINS];
            for y in cy * cell_h..(cy + 1) * cell_h {
                for x in cx * cell_w..(cx + 1) * cell_w {
                    cell[codes[y * lw + x] as usize] += 1.0;
                }
            }
            for bin in cell.iter_mut() {
                *bin /= cell_pixels;
            }
        }
    }
    hist
}

/// Symmetric chi-square distance between two histograms.
pub(crate) fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = x + y;
            if sum > f32::EPSILON {
                (x - y) * (x - y) / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_image_codes_are_all_ones() {
        // Every neighbour equals the centre, so every bit is set.
        let codes = lbp_codes(&[7u8; 9], 3, 3);
        assert_eq!(codes, vec![0xFF]);
    }

    #[test]
    fn test_bright_centre_has_zero_code() {
        let mut img = [10u8; 9];
        img[4] = 200;
        assert_eq!(lbp_codes(&img, 3, 3), vec![0x00]);
    }

    #[test]
    fn test_single_bright_neighbour_sets_its_bit() {
        let mut img = [50u8; 9];
        img[4] = 100;
        img[0] = 150; // top-left is the most significant bit
        assert_eq!(lbp_codes(&img, 3, 3), vec![0x80]);
    }

    #[test]
    fn test_cells_are_normalized() {
        let img: Vec<u8> = (0..34 * 34).map(|i| (i * 7 % 251) as u8).collect();
        let hist = spatial_histogram(&img, 34, 34, GRID_X, GRID_Y);
        assert_eq!(hist.len(), 64 * BINS);
        for cell in hist.chunks(BINS) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_chi_square_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(chi_square(&a, &a), 0.0);
        assert!((chi_square(&a, &b) - 2.0).abs() < 1e-6);
        assert_eq!(chi_square(&a, &b), chi_square(&b, &a));
    }

    #[test]
    fn test_too_small_image_yields_empty_codes() {
        assert!(lbp_codes(&[0u8; 4], 2, 2).is_empty());
    }
}

//! Eigenfaces (PCA) and Fisherfaces (PCA + LDA) projections.
//!
//! Pixels are scaled to [0, 1]. PCA uses the Gram-matrix trick, so the
//! eigenproblem is n×n in the number of samples rather than in the pixel count.
//! Fisher whitens the within-class scatter before diagonalizing the
//! between-class scatter, which keeps every eigenproblem symmetric.

use crate::error::{AuthError, Result};
use crate::linalg::symmetric_eigen;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Relative cut-off below which an eigenvalue is treated as zero.
const EIGEN_EPS: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SubspaceParams {
    pub width: u32,
    pub height: u32,
    /// Mean face, one value per pixel.
    pub mean: Vec<f32>,
    pub components: usize,
    /// `components × pixels`, row-major.
    pub basis: Vec<f32>,
    /// `samples × components`, row-major.
    pub projections: Vec<f32>,
    pub labels: Vec<usize>,
}

impl SubspaceParams {
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Structural consistency of a decoded payload.
    pub fn check_shape(&self) -> Result<()> {
        let d = self.pixels();
        let k = self.components;
        let n = self.labels.len();
        let problems = [
            (d == 0, "crop size"),
            (self.mean.len() != d, "mean length"),
            (k == 0, "component count"),
            (k.checked_mul(d) != Some(self.basis.len()), "basis size"),
            (n == 0, "sample count"),
            (n.checked_mul(k) != Some(self.projections.len()), "projection size"),
        ];
        match problems.iter().find(|(bad, _)| *bad) {
            Some((_, what)) => Err(AuthError::Format(format!(
                "subspace payload has inconsistent {what}"
            ))),
            None => Ok(()),
        }
    }

    /// Project a crop into the subspace.
    pub fn project(&self, data: &[u8]) -> Vec<f32> {
        let d = self.pixels();
        let centered: Vec<f32> = data
            .iter()
            .zip(self.mean.iter())
            .map(|(&p, &m)| p as f32 / 255.0 - m)
            .collect();
        self.basis
            .chunks(d)
            .map(|row| row.iter().zip(centered.iter()).map(|(b, c)| b * c).sum())
            .collect()
    }

    /// Nearest training projection: (distance, label index).
    ///
    /// Every training sample is visited.
    pub fn nearest(&self, data: &[u8]) -> (f32, usize) {
        let probe = self.project(data);
        let mut best = (f32::INFINITY, 0usize);
        for (row, &label) in self.projections.chunks(self.components).zip(&self.labels) {
            let dist = row
                .iter()
                .zip(probe.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt();
            if dist < best.0 {
                best = (dist, label);
            }
        }
        best
    }
}

/// Stack crops into an `n × pixels` matrix scaled to [0, 1].
pub(crate) fn sample_matrix(crops: &[&[u8]], pixels: usize) -> Array2<f64> {
    let mut x = Array2::<f64>::zeros((crops.len(), pixels));
    for (mut row, crop) in x.axis_iter_mut(Axis(0)).zip(crops) {
        for (dst, &p) in row.iter_mut().zip(crop.iter()) {
            *dst = p as f64 / 255.0;
        }
    }
    x
}

struct Pca {
    mean: Array1<f64>,
    centered: Array2<f64>,
    /// `k × pixels`
    basis: Array2<f64>,
}

fn pca(x: &Array2<f64>, max_components: usize) -> Result<Pca> {
    let mean = x
        .mean_axis(Axis(0))
        .ok_or_else(|| AuthError::InsufficientData("no samples to analyse".into()))?;
    let centered = x - &mean;
    let gram = centered.dot(&centered.t());
    let (values, vectors) = symmetric_eigen(&gram);

    let largest = values.iter().copied().fold(0.0f64, f64::max);
    let mut rows: Vec<Array1<f64>> = Vec::new();
    for (i, &lambda) in values.iter().enumerate() {
        if rows.len() == max_components || lambda <= EIGEN_EPS * largest.max(f64::MIN_POSITIVE) {
            break;
        }
        let u = centered.t().dot(&vectors.column(i));
        let norm = u.dot(&u).sqrt();
        if norm > 0.0 {
            rows.push(u / norm);
        }
    }

    let d = x.ncols();
    let mut basis = Array2::<f64>::zeros((rows.len(), d));
    for (mut dst, src) in basis.axis_iter_mut(Axis(0)).zip(&rows) {
        dst.assign(src);
    }
    Ok(Pca {
        mean,
        centered,
        basis,
    })
}

fn finish(
    width: u32,
    height: u32,
    mean: &Array1<f64>,
    centered: &Array2<f64>,
    basis: &Array2<f64>,
    labels: &[usize],
) -> SubspaceParams {
    let projections = centered.dot(&basis.t());
    SubspaceParams {
        width,
        height,
        mean: mean.iter().map(|&v| v as f32).collect(),
        components: basis.nrows(),
        basis: basis.iter().map(|&v| v as f32).collect(),
        projections: projections.iter().map(|&v| v as f32).collect(),
        labels: labels.to_vec(),
    }
}

/// Eigenfaces: keep every non-degenerate principal component.
pub(crate) fn train_eigen(
    crops: &[&[u8]],
    labels: &[usize],
    width: u32,
    height: u32,
) -> Result<SubspaceParams> {
    let x = sample_matrix(crops, (width * height) as usize);
    let pca = pca(&x, crops.len().saturating_sub(1))?;
    if pca.basis.nrows() == 0 {
        return Err(AuthError::InsufficientData(
            "eigen needs at least two distinct samples".into(),
        ));
    }
    tracing::debug!(components = pca.basis.nrows(), "eigenfaces computed");
    Ok(finish(width, height, &pca.mean, &pca.centered, &pca.basis, labels))
}

/// Fisherfaces: PCA to `n - c` dimensions, then LDA to at most `c - 1`.
pub(crate) fn train_fisher(
    crops: &[&[u8]],
    labels: &[usize],
    classes: usize,
    width: u32,
    height: u32,
) -> Result<SubspaceParams> {
    let n = crops.len();
    if classes < 2 {
        return Err(AuthError::InsufficientData(
            "fisher needs at least two distinct labels".into(),
        ));
    }
    if n <= classes {
        return Err(AuthError::InsufficientData(format!(
            "fisher needs more samples than labels ({n} samples, {classes} labels)"
        )));
    }

    let x = sample_matrix(crops, (width * height) as usize);
    let pca = pca(&x, n - classes)?;
    let k = pca.basis.nrows();
    if k == 0 {
        return Err(AuthError::InsufficientData("samples are all identical".into()));
    }
    let y = pca.centered.dot(&pca.basis.t()); // n × k

    let mut class_means = Array2::<f64>::zeros((classes, k));
    let mut counts = vec![0usize; classes];
    for (row, &label) in y.axis_iter(Axis(0)).zip(labels) {
        let mut mean = class_means.row_mut(label);
        mean += &row;
        counts[label] += 1;
    }
    for (mut mean, &count) in class_means.axis_iter_mut(Axis(0)).zip(&counts) {
        if count > 0 {
            mean /= count as f64;
        }
    }
    let global = y
        .mean_axis(Axis(0))
        .ok_or_else(|| AuthError::InsufficientData("no samples to analyse".into()))?;

    let mut sw = Array2::<f64>::zeros((k, k));
    for (row, &label) in y.axis_iter(Axis(0)).zip(labels) {
        let diff = &row - &class_means.row(label);
        sw += &outer(diff.view(), diff.view());
    }
    let mut sb = Array2::<f64>::zeros((k, k));
    for (mean, &count) in class_means.axis_iter(Axis(0)).zip(&counts) {
        let diff = &mean - &global;
        sb += &(outer(diff.view(), diff.view()) * count as f64);
    }

    // Whitening transform for Sw, dropping its null space.
    let (sw_values, sw_vectors) = symmetric_eigen(&sw);
    let sw_largest = sw_values.iter().copied().fold(0.0f64, f64::max);
    let kept: Vec<usize> = (0..k)
        .filter(|&i| sw_values[i] > EIGEN_EPS * sw_largest.max(f64::MIN_POSITIVE))
        .collect();
    if kept.is_empty() {
        return Err(AuthError::InsufficientData(
            "within-class scatter is degenerate; enroll more varied samples".into(),
        ));
    }
    let mut whiten = Array2::<f64>::zeros((k, kept.len()));
    for (dst, &src) in kept.iter().enumerate() {
        let scale = 1.0 / sw_values[src].sqrt();
        whiten
            .column_mut(dst)
            .assign(&(&sw_vectors.column(src) * scale));
    }

    let sb_white = whiten.t().dot(&sb).dot(&whiten);
    let (_, sb_vectors) = symmetric_eigen(&sb_white);
    let m = (classes - 1).min(kept.len());
    let lda = whiten.dot(&sb_vectors.slice(ndarray::s![.., ..m])); // k × m

    let basis = lda.t().dot(&pca.basis); // m × pixels
    tracing::debug!(pca = k, lda = m, "fisherfaces computed");
    Ok(finish(width, height, &pca.mean, &pca.centered, &basis, labels))
}

fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    let col = a.insert_axis(Axis(1));
    let row = b.insert_axis(Axis(0));
    col.dot(&row)
}

//! Classic (distance-based) recognizers over grayscale face crops.

use crate::error::{AuthError, Result};
use crate::lbph::{self, LbphParams};
use crate::model::Model;
use crate::recognizer::{check_label_indices, index_labels, Recognizer, TaggedModel};
use crate::subspace::{self, SubspaceParams};
use crate::types::{Algorithm, Descriptor, LabeledSample, MatchDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassicMethod {
    Lbph,
    Eigen,
    Fisher,
}

impl ClassicMethod {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            ClassicMethod::Lbph => Algorithm::ClassicLbph,
            ClassicMethod::Eigen => Algorithm::ClassicEigen,
            ClassicMethod::Fisher => Algorithm::ClassicFisher,
        }
    }
}

enum ClassicParams {
    Lbph(LbphParams),
    Subspace(SubspaceParams),
}

struct Trained {
    labels: Vec<String>,
    width: u32,
    height: u32,
    params: ClassicParams,
}

/// Nearest-neighbour matcher over LBPH histograms or a PCA/LDA subspace.
///
/// Scores are distances: `is_match = distance <= threshold`.
pub struct ClassicRecognizer {
    method: ClassicMethod,
    threshold: f32,
    trained: Option<Trained>,
}

impl ClassicRecognizer {
    pub fn new(method: ClassicMethod, threshold: f32) -> Self {
        Self {
            method,
            threshold,
            trained: None,
        }
    }

    pub fn method(&self) -> ClassicMethod {
        self.method
    }

    /// Distance from `data` to the closest enrolled sample, with its label index.
    fn nearest(trained: &Trained, data: &[u8]) -> (f32, usize) {
        match &trained.params {
            ClassicParams::Lbph(p) => {
                let probe = lbph::spatial_histogram(data, p.width, p.height, p.grid_x, p.grid_y);
                let mut best = (f32::INFINITY, 0usize);
                for (hist, &label) in p.histograms.iter().zip(&p.labels) {
                    let dist = lbph::chi_square(hist, &probe);
                    if dist < best.0 {
                        best = (dist, label);
                    }
                }
                best
            }
            ClassicParams::Subspace(p) => p.nearest(data),
        }
    }
}

/// Uniform-size crops pulled out of a training batch.
struct ImageBatch<'a> {
    width: u32,
    height: u32,
    crops: Vec<&'a [u8]>,
}

fn image_batch(samples: &[LabeledSample]) -> Result<ImageBatch<'_>> {
    let mut size: Option<(u32, u32)> = None;
    let mut crops = Vec::with_capacity(samples.len());

    for (index, sample) in samples.iter().enumerate() {
        let Descriptor::Image {
            data,
            width,
            height,
        } = &sample.descriptor
        else {
            return Err(AuthError::InvalidSample {
                index,
                reason: format!("classic recognizers need image descriptors, got {}", sample.descriptor.shape()),
            });
        };
        if data.len() != (*width as usize) * (*height as usize) {
            return Err(AuthError::InvalidSample {
                index,
                reason: format!("{width}x{height} image carries {} bytes", data.len()),
            });
        }
        match size {
            None => size = Some((*width, *height)),
            Some((w, h)) if (w, h) != (*width, *height) => {
                return Err(AuthError::InvalidSample {
                    index,
                    reason: format!("image is {width}x{height}, batch is {w}x{h}"),
                });
            }
            Some(_) => {}
        }
        crops.push(data.as_slice());
    }

    let (width, height) = size
        .ok_or_else(|| AuthError::InsufficientData("no training samples".into()))?;
    if width < lbph::min_side() || height < lbph::min_side() {
        return Err(AuthError::InvalidSample {
            index: 0,
            reason: format!(
                "images must be at least {0}x{0}, got {width}x{height}",
                lbph::min_side()
            ),
        });
    }
    Ok(ImageBatch {
        width,
        height,
        crops,
    })
}

impl Recognizer for ClassicRecognizer {
    fn algorithm(&self) -> Algorithm {
        self.method.algorithm()
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    fn train(&mut self, samples: &[LabeledSample]) -> Result<Model> {
        if samples.is_empty() {
            return Err(AuthError::InsufficientData(format!(
                "{} training needs at least one sample",
                self.algorithm()
            )));
        }
        let batch = image_batch(samples)?;
        let (label_set, label_idx) = index_labels(samples.iter().map(|s| s.label.as_str()));
        let (width, height) = (batch.width, batch.height);

        let (params, model) = match self.method {
            ClassicMethod::Lbph => {
                let histograms = batch
                    .crops
                    .iter()
                    .map(|crop| {
                        lbph::spatial_histogram(crop, width, height, lbph::GRID_X, lbph::GRID_Y)
                    })
                    .collect();
                let p = LbphParams {
                    width,
                    height,
                    grid_x: lbph::GRID_X,
                    grid_y: lbph::GRID_Y,
                    histograms,
                    labels: label_idx,
                };
                let model = Model::new(self.algorithm(), label_set.clone(), samples.len(), &p)?;
                (ClassicParams::Lbph(p), model)
            }
            ClassicMethod::Eigen | ClassicMethod::Fisher => {
                let p = if self.method == ClassicMethod::Eigen {
                    subspace::train_eigen(&batch.crops, &label_idx, width, height)?
                } else {
                    subspace::train_fisher(&batch.crops, &label_idx, label_set.len(), width, height)?
                };
                let model = Model::new(self.algorithm(), label_set.clone(), samples.len(), &p)?;
                (ClassicParams::Subspace(p), model)
            }
        };

        tracing::info!(
            algorithm = %self.algorithm(),
            samples = samples.len(),
            labels = label_set.len(),
            width,
            height,
            "classic recognizer trained"
        );

        self.trained = Some(Trained {
            labels: label_set,
            width,
            height,
            params,
        });
        Ok(model)
    }

    fn is_ready(&self) -> bool {
        self.trained.is_some()
    }

    fn predict(&self, descriptor: &Descriptor) -> Result<MatchDecision> {
        let trained = self
            .trained
            .as_ref()
            .ok_or_else(|| AuthError::Config(format!("{} recognizer has no model", self.algorithm())))?;

        let data = match descriptor {
            Descriptor::Image {
                data,
                width,
                height,
            } if (*width, *height) == (trained.width, trained.height)
                && data.len() == (*width as usize) * (*height as usize) =>
            {
                data
            }
            other => {
                return Err(AuthError::Extraction(format!(
                    "expected image {}x{}, got {}",
                    trained.width,
                    trained.height,
                    other.shape()
                )))
            }
        };

        let (distance, label) = Self::nearest(trained, data);
        Ok(MatchDecision {
            is_match: self.direction().passes(distance, self.threshold),
            score: distance,
            label: trained.labels.get(label).cloned(),
        })
    }

    fn restore(&mut self, model: TaggedModel<'_>) -> Result<()> {
        let labels = model.label_set.len();
        let (width, height, params) = match self.method {
            ClassicMethod::Lbph => {
                let p: LbphParams = model.decode_payload()?;
                if p.grid_x == 0 || p.grid_y == 0 || p.histograms.is_empty() {
                    return Err(AuthError::Format("LBPH payload is empty".into()));
                }
                if p.grid_x > lbph::MAX_GRID || p.grid_y > lbph::MAX_GRID {
                    return Err(AuthError::Format(format!(
                        "LBPH grid {}x{} exceeds {}",
                        p.grid_x,
                        p.grid_y,
                        lbph::MAX_GRID
                    )));
                }
                if p.width < lbph::min_side() || p.height < lbph::min_side() {
                    return Err(AuthError::Format(format!(
                        "LBPH payload image size {}x{} is too small",
                        p.width, p.height
                    )));
                }
                if p.histograms.len() != p.labels.len()
                    || p.histograms.iter().any(|h| h.len() != p.histogram_len())
                {
                    return Err(AuthError::Format("LBPH payload has inconsistent histograms".into()));
                }
                check_label_indices(&p.labels, labels)?;
                (p.width, p.height, ClassicParams::Lbph(p))
            }
            ClassicMethod::Eigen | ClassicMethod::Fisher => {
                let p: SubspaceParams = model.decode_payload()?;
                p.check_shape()?;
                check_label_indices(&p.labels, labels)?;
                (p.width, p.height, ClassicParams::Subspace(p))
            }
        };

        self.trained = Some(Trained {
            labels: model.label_set.clone(),
            width,
            height,
            params,
        });
        tracing::debug!(algorithm = %self.algorithm(), labels, "classic model loaded");
        Ok(())
    }
}

use std::path::PathBuf;

use anyhow::Context;
use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RoidbError, RoidbResult};
use crate::pipeline::cache::{CacheKey, CacheStore};
use crate::pipeline::config::FrcnConfig;
use crate::pipeline::sources::{AnnotationSource, GroundTruth, ImageSource, ProposalSource};
use crate::processing::bbox_regression::{
    compute_bbox_regression_targets, BBoxNormalization, ClassStatistics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionSource {
    GroundTruth,
    Proposal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionTarget {
    /// 0 when the region carries no regression signal.
    pub class: usize,
    /// [dx, dy, dw, dh]
    pub deltas: [f32; 4],
}

/// One row of an [`ImageRegionSet`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionCandidate {
    pub bbox: [f32; 4],
    pub overlap_class: usize,
    pub overlap_score: f32,
    pub regression_target: RegressionTarget,
    pub source: RegionSource,
}

/// All candidate regions of one image, ground truth rows first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegionSet {
    pub image_id: String,
    pub image_file: PathBuf,
    pub width: u32,
    pub height: u32,
    pub flipped: bool,
    /// The first `num_gt` rows are ground truth.
    pub num_gt: usize,
    /// k * 4
    pub boxes: Array2<f32>,
    /// k
    pub max_classes: Array1<usize>,
    /// k
    pub max_overlaps: Array1<f32>,
    /// [class, dx, dy, dw, dh], k * 5
    pub bbox_targets: Array2<f32>,
}

impl ImageRegionSet {
    pub fn empty(image_id: &str, image_file: PathBuf, width: u32, height: u32) -> Self {
        ImageRegionSet {
            image_id: image_id.to_string(),
            image_file,
            width,
            height,
            flipped: false,
            num_gt: 0,
            boxes: Array2::zeros((0, 4)),
            max_classes: Array1::zeros(0),
            max_overlaps: Array1::zeros(0),
            bbox_targets: Array2::zeros((0, 5)),
        }
    }

    /// Merges ground truth and labelled proposals. Box shapes and class
    /// indices are expected to be validated by the caller.
    pub fn from_ground_truth_and_proposals(
        mut entry: ImageRegionSet,
        gt: &GroundTruth,
        proposals: ArrayView2<f32>,
        overlap_thre: f32,
    ) -> Self {
        let num_gt = gt.boxes.nrows();
        let k = num_gt + proposals.nrows();
        let assignment = compute_bbox_regression_targets(
            proposals,
            gt.boxes.view(),
            gt.classes.view(),
            overlap_thre,
        );

        entry.num_gt = num_gt;
        entry.boxes = Array2::zeros((k, 4));
        entry.boxes.slice_mut(s![..num_gt, ..]).assign(&gt.boxes);
        entry.boxes.slice_mut(s![num_gt.., ..]).assign(&proposals);

        entry.max_classes = Array1::zeros(k);
        entry.max_classes.slice_mut(s![..num_gt]).assign(&gt.classes);
        entry
            .max_classes
            .slice_mut(s![num_gt..])
            .assign(&assignment.max_classes);

        entry.max_overlaps = Array1::ones(k);
        entry
            .max_overlaps
            .slice_mut(s![num_gt..])
            .assign(&assignment.max_overlaps);

        // ground truth regresses onto itself: class only, zero deltas
        entry.bbox_targets = Array2::zeros((k, 5));
        for (i, &cls) in gt.classes.iter().enumerate() {
            entry.bbox_targets[(i, 0)] = cls as f32;
        }
        entry
            .bbox_targets
            .slice_mut(s![num_gt.., ..])
            .assign(&assignment.bbox_targets);

        entry
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn candidate(&self, i: usize) -> RegionCandidate {
        let b = self.boxes.row(i);
        let t = self.bbox_targets.row(i);
        RegionCandidate {
            bbox: [b[0], b[1], b[2], b[3]],
            overlap_class: self.max_classes[i],
            overlap_score: self.max_overlaps[i],
            regression_target: RegressionTarget {
                class: t[0] as usize,
                deltas: [t[1], t[2], t[3], t[4]],
            },
            source: if i < self.num_gt {
                RegionSource::GroundTruth
            } else {
                RegionSource::Proposal
            },
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = RegionCandidate> + '_ {
        (0..self.len()).map(move |i| self.candidate(i))
    }

    /// Left-right mirror: x is reflected about the image width and the dx of
    /// every regression target changes sign.
    pub fn mirrored(&self) -> Self {
        let mut entry = self.clone();
        let width = self.width as f32;
        for (mut flipped, original) in entry.boxes.outer_iter_mut().zip(self.boxes.outer_iter()) {
            flipped[0] = width - original[2] - 1.0;
            flipped[2] = width - original[0] - 1.0;
        }
        for mut target in entry.bbox_targets.outer_iter_mut() {
            if target[0] > 0.0 {
                target[1] = -target[1];
            }
        }
        entry.flipped = !self.flipped;
        entry
    }
}

/// Region sets for every image of a split; flipped copies, when present,
/// follow all originals so that `flipped_index = index + num_images`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDatabase {
    pub entries: Vec<ImageRegionSet>,
    pub num_images: usize,
    pub num_classes: usize,
    /// Statistics the stored targets were normalized with.
    pub normalization: BBoxNormalization,
}

impl RegionDatabase {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_flipped(&self) -> bool {
        self.entries.len() > self.num_images
    }

    /// Index of the mirrored copy of original entry `index`, if flipping was enabled.
    pub fn flipped_index(&self, index: usize) -> Option<usize> {
        (self.has_flipped() && index < self.num_images).then_some(index + self.num_images)
    }
}

pub struct RoidbBuilder<'c> {
    config: &'c FrcnConfig,
}

impl<'c> RoidbBuilder<'c> {
    pub fn new(config: &'c FrcnConfig) -> RoidbResult<Self> {
        config.validate()?;
        Ok(RoidbBuilder { config })
    }

    /// Reuses a cached database for `key` when one exists, otherwise builds and stores it.
    pub fn build_cached<C, A, P, I>(
        &self,
        cache: &C,
        key: &CacheKey,
        annotations: &A,
        proposals: &P,
        images: &I,
    ) -> RoidbResult<RegionDatabase>
    where
        C: CacheStore + ?Sized,
        A: AnnotationSource + ?Sized,
        P: ProposalSource + ?Sized,
        I: ImageSource + ?Sized,
    {
        if let Some(roidb) = cache.load(key)? {
            if roidb.num_classes == self.config.num_classes {
                info!(key = %key.file_name(), entries = roidb.len(), "region database loaded from cache");
                return Ok(roidb);
            }
            warn!(
                key = %key.file_name(),
                cached = roidb.num_classes,
                expected = self.config.num_classes,
                "cached region database has a different class count, rebuilding"
            );
        }

        let roidb = self.build(annotations, proposals, images)?;
        cache.save(key, &roidb)?;
        info!(key = %key.file_name(), "wrote region database to cache");
        Ok(roidb)
    }

    pub fn build<A, P, I>(&self, annotations: &A, proposals: &P, images: &I) -> RoidbResult<RegionDatabase>
    where
        A: AnnotationSource + ?Sized,
        P: ProposalSource + ?Sized,
        I: ImageSource + ?Sized,
    {
        let config = self.config;
        let image_index = annotations.image_index().context("loading image index")?;
        let proposal_sets = proposals.proposals().context("loading proposals")?;

        if image_index.len() != proposal_sets.len() {
            return Err(RoidbError::ImageCountMismatch {
                annotations: image_index.len(),
                proposals: proposal_sets.len(),
            });
        }

        let num_images = image_index.len();
        info!(
            num_images,
            add_flipped = config.add_flipped,
            overlap_thre = config.overlap_thre,
            "building region database"
        );

        let mut entries = Vec::with_capacity(if config.add_flipped { 2 * num_images } else { num_images });
        for (index, (image_id, proposal)) in image_index.iter().zip(proposal_sets.iter()).enumerate() {
            if proposal.image_id != *image_id {
                return Err(RoidbError::ImageIdMismatch {
                    index,
                    expected: image_id.clone(),
                    found: proposal.image_id.clone(),
                });
            }

            let gt = annotations
                .ground_truth(image_id)
                .with_context(|| format!("loading annotation for image {image_id}"))?;
            self.check_ground_truth(image_id, &gt)?;
            check_columns("proposal", image_id, &proposal.boxes)?;
            if gt.boxes.nrows() == 0 {
                warn!(image_id = %image_id, "image has no ground truth boxes");
            }

            let (width, height) = images
                .dimensions(image_id)
                .with_context(|| format!("reading dimensions of image {image_id}"))?;
            let entry = ImageRegionSet::empty(image_id, images.image_path(image_id), width, height);

            entries.push(ImageRegionSet::from_ground_truth_and_proposals(
                entry,
                &gt,
                proposal.boxes.view(),
                config.overlap_thre,
            ));
        }

        if config.add_flipped {
            let mirrored: Vec<ImageRegionSet> = entries.iter().map(ImageRegionSet::mirrored).collect();
            entries.extend(mirrored);
        }

        let normalization = match &config.bbox_normalization {
            Some(precomputed) => {
                BBoxNormalization::precomputed(config.num_classes, precomputed.means, precomputed.stds)
            }
            None => {
                let mut stats = ClassStatistics::new(config.num_classes);
                for entry in &entries {
                    stats.accumulate(entry.bbox_targets.view());
                }
                for cls in 1..config.num_classes {
                    debug!(class = cls, count = stats.count(cls), "regression target samples");
                }
                stats.finish()
            }
        };
        debug!(means = ?normalization.means, stds = ?normalization.stds, "regression target normalization");

        for entry in &mut entries {
            normalization.normalize(&mut entry.bbox_targets);
        }

        info!(entries = entries.len(), "region database ready");
        Ok(RegionDatabase {
            entries,
            num_images,
            num_classes: config.num_classes,
            normalization,
        })
    }

    fn check_ground_truth(&self, image_id: &str, gt: &GroundTruth) -> RoidbResult<()> {
        check_columns("ground truth", image_id, &gt.boxes)?;
        if gt.boxes.nrows() != gt.classes.len() {
            return Err(RoidbError::GroundTruthLengthMismatch {
                image_id: image_id.to_string(),
                boxes: gt.boxes.nrows(),
                classes: gt.classes.len(),
            });
        }
        let num_classes = self.config.num_classes;
        if let Some(&class) = gt.classes.iter().find(|&&c| c == 0 || c >= num_classes) {
            return Err(RoidbError::InvalidClass {
                image_id: image_id.to_string(),
                class,
                num_classes,
            });
        }
        Ok(())
    }
}

fn check_columns(kind: &'static str, image_id: &str, boxes: &Array2<f32>) -> RoidbResult<()> {
    if boxes.ncols() != 4 {
        return Err(RoidbError::MalformedBoxes {
            kind,
            image_id: image_id.to_string(),
            columns: boxes.ncols(),
        });
    }
    Ok(())
}

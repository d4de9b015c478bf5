use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_npy::write_npy;
use serde::{Deserialize, Serialize};

use crate::error::{RoidbError, RoidbResult};
use crate::processing::bbox_transform::{nonlinear_transform, BBOX_EPS};
use crate::rcnn::bbox::bbox_overlaps;

/// Overlap-derived labels for one image's proposals.
#[derive(Debug, Clone)]
pub struct ProposalAssignment {
    /// Best IoU against any ground truth box, k.
    pub max_overlaps: Array1<f32>,
    /// Class of the best ground truth, or 0 below the use threshold, k.
    pub max_classes: Array1<usize>,
    /// [class, dx, dy, dw, dh], k * 5. Zero rows below the use threshold.
    pub bbox_targets: Array2<f32>,
}

/// compute_bbox_regression_targets: given proposals and ground truth, compute labels and targets
///
/// Every proposal keeps its raw best overlap. Proposals whose best overlap
/// reaches `overlap_thre` take the class of that ground truth box and a
/// regression target towards it; the rest are background with zero targets.
///
/// * `rois` - k * 4 proposals.
/// * `gt_boxes` - g * 4 ground truth boxes.
/// * `gt_classes` - g class indices.
pub fn compute_bbox_regression_targets(
    rois: ArrayView2<f32>,
    gt_boxes: ArrayView2<f32>,
    gt_classes: ArrayView1<usize>,
    overlap_thre: f32,
) -> ProposalAssignment {
    let k = rois.nrows();
    let mut max_overlaps = Array1::<f32>::zeros(k);
    let mut max_classes = Array1::<usize>::zeros(k);
    let mut bbox_targets = Array2::<f32>::zeros((k, 5));

    if gt_boxes.nrows() == 0 {
        return ProposalAssignment {
            max_overlaps,
            max_classes,
            bbox_targets,
        };
    }

    let ex_gt_overlaps = bbox_overlaps(rois, gt_boxes);

    let mut gt_assignment = Vec::with_capacity(k);
    for (i, overlaps) in ex_gt_overlaps.outer_iter().enumerate() {
        let (argmax, max) = overlaps
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (g, &o)| if o > best.1 { (g, o) } else { best });
        max_overlaps[i] = max;
        gt_assignment.push(argmax);
    }

    let ex_inds: Vec<usize> = max_overlaps
        .iter()
        .enumerate()
        .filter(|&(_, &overlap)| overlap > 0.0 && overlap >= overlap_thre)
        .map(|(i, _)| i)
        .collect();
    if ex_inds.is_empty() {
        return ProposalAssignment {
            max_overlaps,
            max_classes,
            bbox_targets,
        };
    }

    let ex_rois = rois.select(Axis(0), &ex_inds);
    let assigned: Vec<usize> = ex_inds.iter().map(|&i| gt_assignment[i]).collect();
    let gt_rois = gt_boxes.select(Axis(0), &assigned);
    let targets = nonlinear_transform(ex_rois.view(), gt_rois.view());

    for (row, (&ex_idx, &gt_idx)) in ex_inds.iter().zip(assigned.iter()).enumerate() {
        let cls = gt_classes[gt_idx];
        max_classes[ex_idx] = cls;
        bbox_targets[(ex_idx, 0)] = cls as f32;
        bbox_targets
            .slice_mut(s![ex_idx, 1..])
            .assign(&targets.row(row));
    }

    ProposalAssignment {
        max_overlaps,
        max_classes,
        bbox_targets,
    }
}

/// Per-class means and standard deviations of the regression targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BBoxNormalization {
    /// num_classes * 4
    pub means: Array2<f32>,
    /// num_classes * 4
    pub stds: Array2<f32>,
}

impl BBoxNormalization {
    /// The same means and stds for every class.
    pub fn precomputed(num_classes: usize, means: [f32; 4], stds: [f32; 4]) -> Self {
        let mut norm = BBoxNormalization {
            means: Array2::zeros((num_classes, 4)),
            stds: Array2::ones((num_classes, 4)),
        };
        for cls in 0..num_classes {
            norm.means.row_mut(cls).assign(&ArrayView1::from(&means[..]));
            norm.stds.row_mut(cls).assign(&ArrayView1::from(&stds[..]));
        }
        norm
    }

    pub fn num_classes(&self) -> usize {
        self.means.nrows()
    }

    /// Rewrites every non-background row of k * 5 compact targets in place.
    pub fn normalize(&self, bbox_targets: &mut Array2<f32>) {
        let num_classes = self.num_classes();
        for mut target in bbox_targets.outer_iter_mut() {
            let cls = target[0] as usize;
            if cls == 0 || cls >= num_classes {
                continue;
            }
            let mut deltas = target.slice_mut(s![1..]);
            deltas -= &self.means.row(cls);
            deltas /= &self.stds.row(cls);
        }
    }

    /// Undo [`normalize`](Self::normalize) for one predicted delta vector.
    pub fn denormalize(&self, cls: usize, deltas: &[f32; 4]) -> [f32; 4] {
        let mut out = *deltas;
        for (j, value) in out.iter_mut().enumerate() {
            *value = *value * self.stds[(cls, j)] + self.means[(cls, j)];
        }
        out
    }

    /// Writes `bbox_means.npy` and `bbox_stds.npy` into `dir`.
    pub fn write_npy(&self, dir: &Path) -> RoidbResult<()> {
        fs::create_dir_all(dir).map_err(|e| RoidbError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        for (name, array) in [("bbox_means.npy", &self.means), ("bbox_stds.npy", &self.stds)] {
            let path = dir.join(name);
            write_npy(&path, array).map_err(|e| RoidbError::Npy { path, source: e })?;
        }
        Ok(())
    }
}

/// Running count, sum and squared sum of targets per class, in f64.
#[derive(Debug, Clone)]
pub struct ClassStatistics {
    counts: Array1<f64>,
    sums: Array2<f64>,
    squared_sums: Array2<f64>,
}

impl ClassStatistics {
    pub fn new(num_classes: usize) -> Self {
        ClassStatistics {
            counts: Array1::zeros(num_classes),
            sums: Array2::zeros((num_classes, 4)),
            squared_sums: Array2::zeros((num_classes, 4)),
        }
    }

    /// Adds every non-background row of k * 5 compact targets.
    pub fn accumulate(&mut self, bbox_targets: ArrayView2<f32>) {
        let num_classes = self.counts.len();
        for target in bbox_targets.outer_iter() {
            let cls = target[0] as usize;
            if cls == 0 || cls >= num_classes {
                continue;
            }
            self.counts[cls] += 1.0;
            for j in 0..4 {
                let value = f64::from(target[j + 1]);
                self.sums[(cls, j)] += value;
                self.squared_sums[(cls, j)] += value * value;
            }
        }
    }

    pub fn count(&self, cls: usize) -> usize {
        self.counts[cls] as usize
    }

    /// Means and stds per class. Classes without samples, or with no spread,
    /// get a std of 1 so they pass through unscaled.
    pub fn finish(self) -> BBoxNormalization {
        let num_classes = self.counts.len();
        let mut means = Array2::<f32>::zeros((num_classes, 4));
        let mut stds = Array2::<f32>::ones((num_classes, 4));

        for cls in 1..num_classes {
            let count = self.counts[cls];
            if count == 0.0 {
                continue;
            }
            for j in 0..4 {
                let mean = self.sums[(cls, j)] / count;
                let variance = (self.squared_sums[(cls, j)] / count - mean * mean).max(0.0);
                let std = variance.sqrt();
                means[(cls, j)] = mean as f32;
                if std > f64::from(BBOX_EPS) {
                    stds[(cls, j)] = std as f32;
                }
            }
        }

        BBoxNormalization { means, stds }
    }
}

/// expand_bbox_regression_targets
/// Expand from 5 to 4 * num_classes; only the right class has non-zero bbox regression targets
/// :param bbox_targets_data: [k * 5]
/// :param num_classes: number of classes
/// :return: bbox target processed [k * 4 num_classes], and the matching mask
/// only foreground boxes have bbox regression computation!
pub fn expand_bbox_regression_targets(
    bbox_targets_data: ArrayView2<f32>,
    num_classes: usize,
) -> (Array2<f32>, Array2<f32>) {
    let k = bbox_targets_data.nrows();
    let mut bbox_targets = Array2::<f32>::zeros((k, 4 * num_classes));
    let mut bbox_mask = Array2::<f32>::zeros((k, 4 * num_classes));

    for (index, data) in bbox_targets_data.outer_iter().enumerate() {
        let cls = data[0] as usize;
        if cls == 0 || cls >= num_classes {
            continue;
        }
        let start = 4 * cls;
        let end = start + 4;
        bbox_targets
            .slice_mut(s![index, start..end])
            .assign(&data.slice(s![1..5]));
        bbox_mask.slice_mut(s![index, start..end]).fill(1.0);
    }

    (bbox_targets, bbox_mask)
}

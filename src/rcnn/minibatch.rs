use ndarray::{Array1, Array2, Axis};
use ndarray_rand::{RandomExt, SamplingStrategy};
use rand::Rng;

use crate::pipeline::config::FrcnConfig;
use crate::processing::bbox_regression::expand_bbox_regression_targets;
use crate::rcnn::roidb::ImageRegionSet;

/// Rois drawn from one image: foreground rows first, then background.
#[derive(Debug, Clone)]
pub struct SampledRois {
    /// k, 0 for every background row
    pub labels: Array1<usize>,
    /// k
    pub overlaps: Array1<f32>,
    /// k * 4, in original image coordinates
    pub rois: Array2<f32>,
    /// k * 4 num_classes
    pub bbox_targets: Array2<f32>,
    /// k * 4 num_classes
    pub bbox_mask: Array2<f32>,
    pub num_fg: usize,
}

impl SampledRois {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Draws a fixed-size, foreground/background balanced set of rois per image.
///
/// Foreground rois have an overlap of at least `fg_thre`; background rois
/// lie in `[bg_thre_lo, bg_thre_hi)`. Anything else is never sampled.
#[derive(Debug, Clone)]
pub struct RoiSampler {
    fg_rois_per_image: usize,
    rois_per_image: usize,
    num_classes: usize,
    fg_thre: f32,
    bg_thre_lo: f32,
    bg_thre_hi: f32,
    random_sample: bool,
}

impl RoiSampler {
    pub fn new(config: &FrcnConfig) -> Self {
        RoiSampler {
            fg_rois_per_image: config.fg_rois_per_img(),
            rois_per_image: config.rois_per_img,
            num_classes: config.num_classes,
            fg_thre: config.fg_thre,
            bg_thre_lo: config.bg_thre_lo,
            bg_thre_hi: config.bg_thre_hi,
            random_sample: config.rois_random_sample,
        }
    }

    /// Overrides the per-image quotas; `fg_rois_per_image` is clamped to `rois_per_image`.
    pub fn with_quotas(mut self, fg_rois_per_image: usize, rois_per_image: usize) -> Self {
        self.fg_rois_per_image = fg_rois_per_image.min(rois_per_image);
        self.rois_per_image = rois_per_image;
        self
    }

    pub fn rois_per_image(&self) -> usize {
        self.rois_per_image
    }

    /// May return fewer than `rois_per_image` rows when either pool runs
    /// out; foreground is never padded with other rows.
    pub fn sample<R: Rng + ?Sized>(&self, entry: &ImageRegionSet, rng: &mut R) -> SampledRois {
        let overlaps = &entry.max_overlaps;

        let fg_inds: Vec<usize> = overlaps
            .iter()
            .enumerate()
            .filter(|&(_, &o)| o >= self.fg_thre)
            .map(|(i, _)| i)
            .collect();
        let fg_rois_per_this_image = self.fg_rois_per_image.min(fg_inds.len());
        let fg_inds = self.choose(fg_inds, fg_rois_per_this_image, rng);

        // background stops where foreground starts
        let bg_thre_hi = self.bg_thre_hi.min(self.fg_thre);
        let bg_inds: Vec<usize> = overlaps
            .iter()
            .enumerate()
            .filter(|&(_, &o)| o < bg_thre_hi && o >= self.bg_thre_lo)
            .map(|(i, _)| i)
            .collect();
        let bg_rois_per_this_image = (self.rois_per_image - fg_rois_per_this_image).min(bg_inds.len());
        let bg_inds = self.choose(bg_inds, bg_rois_per_this_image, rng);

        let mut keep_inds = fg_inds;
        keep_inds.extend(bg_inds);

        let mut labels = entry.max_classes.select(Axis(0), &keep_inds);
        labels
            .slice_mut(ndarray::s![fg_rois_per_this_image..])
            .fill(0);

        let (bbox_targets, bbox_mask) = expand_bbox_regression_targets(
            entry.bbox_targets.select(Axis(0), &keep_inds).view(),
            self.num_classes,
        );

        SampledRois {
            labels,
            overlaps: overlaps.select(Axis(0), &keep_inds),
            rois: entry.boxes.select(Axis(0), &keep_inds),
            bbox_targets,
            bbox_mask,
            num_fg: fg_rois_per_this_image,
        }
    }

    fn choose<R: Rng + ?Sized>(&self, mut inds: Vec<usize>, n: usize, rng: &mut R) -> Vec<usize> {
        if n == 0 {
            return Vec::new();
        }
        if self.random_sample {
            Array1::from(inds)
                .sample_axis_using(Axis(0), n, SamplingStrategy::WithoutReplacement, rng)
                .to_vec()
        } else {
            inds.truncate(n);
            inds
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn entry_with_overlaps(overlaps: &[f32], classes: &[usize]) -> ImageRegionSet {
        let k = overlaps.len();
        let mut entry = ImageRegionSet::empty("000005", PathBuf::from("000005.jpg"), 100, 100);
        entry.boxes = Array2::from_shape_fn((k, 4), |(i, j)| (i * 4 + j) as f32);
        entry.max_overlaps = Array1::from(overlaps.to_vec());
        entry.max_classes = Array1::from(classes.to_vec());
        entry.bbox_targets = Array2::from_shape_fn((k, 5), |(i, j)| {
            if overlaps[i] < 0.5 {
                0.0
            } else if j == 0 {
                classes[i] as f32
            } else {
                0.1 * j as f32
            }
        });
        entry
    }

    fn sampler(rois_per_img: usize, random: bool) -> RoiSampler {
        RoiSampler::new(&FrcnConfig {
            num_classes: 4,
            rois_per_img,
            rois_random_sample: random,
            ..FrcnConfig::default()
        })
    }

    #[test]
    fn test_deterministic_sample_order() {
        let entry = entry_with_overlaps(
            &[1.0, 0.3, 0.05, 0.8, 0.45, 0.6, 0.1, 0.5],
            &[2, 2, 0, 3, 1, 1, 0, 2],
        );
        let mut rng = StdRng::seed_from_u64(0);
        // fg quota 2 of 8
        let sampled = sampler(8, false).sample(&entry, &mut rng);

        assert_eq!(sampled.num_fg, 2);
        // fg [0, 3], bg [1, 4, 6]; 0.05 is below bg_thre_lo
        assert_eq!(sampled.len(), 5);
        assert_eq!(sampled.labels, Array1::from(vec![2, 3, 0, 0, 0]));
        assert_eq!(sampled.overlaps, Array1::from(vec![1.0, 0.8, 0.3, 0.45, 0.1]));
        assert_eq!(sampled.rois.row(2), Array1::from(vec![4.0, 5.0, 6.0, 7.0]));

        assert_eq!(sampled.bbox_targets.dim(), (5, 16));
        assert_eq!(sampled.bbox_mask.row(0).sum(), 4.0);
        assert_eq!(sampled.bbox_mask[(0, 8)], 1.0);
        assert_eq!(sampled.bbox_mask[(1, 12)], 1.0);
        assert!((sampled.bbox_targets[(1, 13)] - 0.2).abs() < 1e-6);
        assert_eq!(sampled.bbox_mask.slice(ndarray::s![2.., ..]).sum(), 0.0);
    }

    #[test]
    fn test_partial_overlap_is_background_only() {
        let entry = entry_with_overlaps(&[0.3], &[5]);
        let mut rng = StdRng::seed_from_u64(0);
        let sampled = sampler(4, false).sample(&entry, &mut rng);

        assert_eq!(sampled.num_fg, 0);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled.labels[0], 0);
    }

    #[test]
    fn test_fg_shortfall_is_not_padded() {
        let mut overlaps = vec![0.9, 0.7, 0.55];
        overlaps.extend(std::iter::repeat(0.2).take(100));
        let classes: Vec<usize> = overlaps.iter().map(|&o| if o >= 0.5 { 1 } else { 0 }).collect();
        let entry = entry_with_overlaps(&overlaps, &classes);
        let mut rng = StdRng::seed_from_u64(3);

        // fg quota 16 of 64
        let sampled = sampler(64, true).sample(&entry, &mut rng);

        assert_eq!(sampled.num_fg, 3);
        assert_eq!(sampled.len(), 64);
        assert!(sampled.labels.slice(ndarray::s![..3]).iter().all(|&l| l == 1));
        assert!(sampled.labels.slice(ndarray::s![3..]).iter().all(|&l| l == 0));
        assert!(sampled.overlaps.slice(ndarray::s![3..]).iter().all(|&o| o == 0.2));
    }

    #[test]
    fn test_explicit_quotas() {
        let entry = entry_with_overlaps(&[0.9, 0.8, 0.7, 0.3, 0.2, 0.15], &[1, 2, 3, 0, 0, 0]);
        let mut rng = StdRng::seed_from_u64(0);

        let sampled = sampler(64, false).with_quotas(1, 3).sample(&entry, &mut rng);
        assert_eq!(sampled.num_fg, 1);
        assert_eq!(sampled.labels, Array1::from(vec![1, 0, 0]));

        let sampled = sampler(64, false).with_quotas(10, 2).sample(&entry, &mut rng);
        assert_eq!(sampled.num_fg, 2);
        assert_eq!(sampled.len(), 2);
    }

    #[test]
    fn test_roi_is_never_in_both_pools() {
        let entry = entry_with_overlaps(&[0.45], &[2]);
        let mut rng = StdRng::seed_from_u64(0);
        let sampler = RoiSampler::new(&FrcnConfig {
            num_classes: 4,
            fg_thre: 0.4,
            rois_per_img: 8,
            rois_random_sample: false,
            ..FrcnConfig::default()
        });

        let sampled = sampler.sample(&entry, &mut rng);
        assert_eq!(sampled.num_fg, 1);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled.labels, Array1::from(vec![2]));
    }

    #[test]
    fn test_short_batches_are_allowed() {
        let entry = entry_with_overlaps(&[0.9, 0.01], &[1, 0]);
        let mut rng = StdRng::seed_from_u64(0);
        let sampled = sampler(64, true).sample(&entry, &mut rng);
        assert_eq!(sampled.len(), 1);

        let empty = entry_with_overlaps(&[], &[]);
        let sampled = sampler(64, true).sample(&empty, &mut rng);
        assert!(sampled.is_empty());
        assert_eq!(sampled.bbox_targets.dim(), (0, 16));
    }

    #[test]
    fn test_random_sample_is_seeded_and_without_replacement() {
        let overlaps: Vec<f32> = (0..200).map(|i| (i % 10) as f32 / 10.0 + 0.05).collect();
        let classes: Vec<usize> = overlaps.iter().map(|&o| if o >= 0.5 { 3 } else { 1 }).collect();
        let entry = entry_with_overlaps(&overlaps, &classes);
        let sampler = sampler(64, true);

        let first = sampler.sample(&entry, &mut StdRng::seed_from_u64(42));
        let second = sampler.sample(&entry, &mut StdRng::seed_from_u64(42));
        assert_eq!(first.rois, second.rois);
        assert_eq!(first.labels, second.labels);

        assert_eq!(first.num_fg, 16);
        assert_eq!(first.len(), 64);
        assert!(first.labels.slice(ndarray::s![16..]).iter().all(|&l| l == 0));
        assert!(first.overlaps.slice(ndarray::s![..16]).iter().all(|&o| o >= 0.5));
        assert!(first
            .overlaps
            .slice(ndarray::s![16..])
            .iter()
            .all(|&o| (0.1..0.5).contains(&o)));

        let distinct: HashSet<u32> = first.rois.column(0).iter().map(|&x| x as u32).collect();
        assert_eq!(distinct.len(), 64);
    }
}

use anyhow::Context;
use ndarray::{s, Array1, Array2, Array4};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::error::{RoidbError, RoidbResult};
use crate::pipeline::config::{FrcnConfig, OutputType};
use crate::pipeline::sources::ImageSource;
use crate::rcnn::minibatch::RoiSampler;
use crate::rcnn::roidb::RegionDatabase;

#[derive(Debug, Clone)]
pub enum FrcnInputs {
    ImageRois {
        /// img_per_batch * 3 * max_scale * max_scale
        images: Array4<f32>,
        /// rois_per_batch * 5, [slot, x1, y1, x2, y2] in scaled coordinates
        rois: Array2<f32>,
    },
    Image {
        images: Array4<f32>,
    },
}

impl FrcnInputs {
    pub fn images(&self) -> &Array4<f32> {
        match self {
            FrcnInputs::ImageRois { images, .. } | FrcnInputs::Image { images } => images,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FrcnTargets {
    Detection {
        labels: Array1<usize>,
        /// rois_per_batch * 4 num_classes
        bbox_targets: Array2<f32>,
        bbox_mask: Array2<f32>,
    },
    Labels {
        labels: Array1<usize>,
    },
}

impl FrcnTargets {
    pub fn labels(&self) -> &Array1<usize> {
        match self {
            FrcnTargets::Detection { labels, .. } | FrcnTargets::Labels { labels } => labels,
        }
    }
}

/// Padded batches over a region database. Short roi sets and unused image
/// area are left as zeros.
pub struct RoiLoader<'a, I: ImageSource> {
    roidb: &'a RegionDatabase,
    images: I,
    sampler: RoiSampler,
    output_type: OutputType,
    img_per_batch: usize,
    max_scale: usize,
    num_classes: usize,
    shuffle: bool,
    nbatches: usize,
    rng: StdRng,
}

impl<'a, I: ImageSource> RoiLoader<'a, I> {
    pub fn new(roidb: &'a RegionDatabase, images: I, config: &FrcnConfig) -> RoidbResult<Self> {
        config.validate()?;
        if roidb.num_classes != config.num_classes {
            return Err(RoidbError::Config(format!(
                "region database was built for {} classes, loader configured for {}",
                roidb.num_classes, config.num_classes
            )));
        }

        let mut nbatches = roidb.len() / config.img_per_batch;
        if let Some(n_mb) = config.n_mb {
            nbatches = nbatches.min(n_mb);
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!(
            entries = roidb.len(),
            nbatches,
            img_per_batch = config.img_per_batch,
            rois_per_img = config.rois_per_img,
            output_type = ?config.output_type,
            "roi loader ready"
        );

        Ok(RoiLoader {
            roidb,
            images,
            sampler: RoiSampler::new(config),
            output_type: config.output_type,
            img_per_batch: config.img_per_batch,
            max_scale: config.max_scale as usize,
            num_classes: config.num_classes,
            shuffle: config.shuffle,
            nbatches,
            rng,
        })
    }

    pub fn nbatches(&self) -> usize {
        self.nbatches
    }

    pub fn ndata(&self) -> usize {
        self.roidb.len()
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    /// Starts a new epoch. Entries are reshuffled on every call when shuffling is enabled.
    pub fn iter(&mut self) -> EpochIter<'_, 'a, I> {
        let mut order: Vec<usize> = (0..self.roidb.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        EpochIter {
            loader: self,
            order,
            batch: 0,
        }
    }

    fn load_batch(&mut self, indices: &[usize]) -> RoidbResult<(FrcnInputs, FrcnTargets)> {
        let rois_per_image = self.sampler.rois_per_image();
        let rois_per_batch = rois_per_image * self.img_per_batch;
        let mut images = Array4::<f32>::zeros((self.img_per_batch, 3, self.max_scale, self.max_scale));
        let mut rois = Array2::<f32>::zeros((rois_per_batch, 5));
        let mut labels = Array1::<usize>::zeros(rois_per_batch);
        let mut bbox_targets = Array2::<f32>::zeros((rois_per_batch, 4 * self.num_classes));
        let mut bbox_mask = Array2::<f32>::zeros((rois_per_batch, 4 * self.num_classes));

        for (slot, &index) in indices.iter().enumerate() {
            let entry = &self.roidb.entries[index];
            let scaled = self
                .images
                .load_image(entry)
                .with_context(|| format!("loading image {}", entry.image_id))?;
            let (channels, height, width) = scaled.data.dim();
            if channels != 3 {
                return Err(RoidbError::ImageChannels {
                    image_id: entry.image_id.clone(),
                    channels,
                });
            }
            if height > self.max_scale || width > self.max_scale {
                return Err(RoidbError::ImageTooLarge {
                    image_id: entry.image_id.clone(),
                    width,
                    height,
                    max_scale: self.max_scale,
                });
            }
            images
                .slice_mut(s![slot, .., ..height, ..width])
                .assign(&scaled.data);

            let sampled = self.sampler.sample(entry, &mut self.rng);
            let start = slot * rois_per_image;
            let end = start + sampled.len();
            rois.slice_mut(s![start..end, 0]).fill(slot as f32);
            rois.slice_mut(s![start..end, 1..])
                .assign(&(&sampled.rois * scaled.scale));
            labels.slice_mut(s![start..end]).assign(&sampled.labels);
            bbox_targets
                .slice_mut(s![start..end, ..])
                .assign(&sampled.bbox_targets);
            bbox_mask
                .slice_mut(s![start..end, ..])
                .assign(&sampled.bbox_mask);

            debug!(
                image_id = %entry.image_id,
                flipped = entry.flipped,
                num_fg = sampled.num_fg,
                num_rois = sampled.len(),
                "sampled rois"
            );
        }

        let batch = match self.output_type {
            OutputType::Detection => (
                FrcnInputs::ImageRois { images, rois },
                FrcnTargets::Detection {
                    labels,
                    bbox_targets,
                    bbox_mask,
                },
            ),
            OutputType::LabelsWithRois => (
                FrcnInputs::ImageRois { images, rois },
                FrcnTargets::Labels { labels },
            ),
            OutputType::LabelsOnly => (FrcnInputs::Image { images }, FrcnTargets::Labels { labels }),
        };
        Ok(batch)
    }
}

/// One pass over the database, yielding exactly `nbatches` batches.
pub struct EpochIter<'l, 'a, I: ImageSource> {
    loader: &'l mut RoiLoader<'a, I>,
    order: Vec<usize>,
    batch: usize,
}

impl<'l, 'a, I: ImageSource> Iterator for EpochIter<'l, 'a, I> {
    type Item = RoidbResult<(FrcnInputs, FrcnTargets)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch >= self.loader.nbatches {
            return None;
        }
        let img_per_batch = self.loader.img_per_batch;
        let start = self.batch * img_per_batch;
        self.batch += 1;
        Some(self.loader.load_batch(&self.order[start..start + img_per_batch]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.loader.nbatches - self.batch;
        (remaining, Some(remaining))
    }
}

impl<'l, 'a, I: ImageSource> ExactSizeIterator for EpochIter<'l, 'a, I> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sources::{GroundTruth, InMemoryDataset, ScaledImage};
    use crate::rcnn::roidb::{ImageRegionSet, RoidbBuilder};
    use ndarray::{array, Array3};
    use std::path::PathBuf;

    /// Every image is doubled in size and filled with ones.
    struct DoubledImages;

    impl ImageSource for DoubledImages {
        fn image_path(&self, image_id: &str) -> PathBuf {
            PathBuf::from(format!("{image_id}.jpg"))
        }

        fn dimensions(&self, _image_id: &str) -> anyhow::Result<(u32, u32)> {
            Ok((100, 80))
        }

        fn load_image(&self, entry: &ImageRegionSet) -> anyhow::Result<ScaledImage> {
            let (h, w) = (2 * entry.height as usize, 2 * entry.width as usize);
            Ok(ScaledImage {
                data: Array3::ones((3, h, w)),
                scale: 2.0,
            })
        }
    }

    fn dataset(num_images: usize) -> InMemoryDataset {
        let mut dataset = InMemoryDataset::new();
        for i in 0..num_images {
            dataset.push(
                &format!("{i:06}"),
                GroundTruth {
                    boxes: array![[10.0, 10.0, 50.0, 50.0]],
                    classes: array![3],
                },
                array![[14.0, 12.0, 50.0, 48.0], [30.0, 10.0, 70.0, 50.0], [80.0, 60.0, 90.0, 70.0]],
            );
        }
        dataset
    }

    fn config() -> FrcnConfig {
        FrcnConfig {
            num_classes: 4,
            img_per_batch: 1,
            rois_per_img: 8,
            min_scale: 100,
            max_scale: 300,
            rois_random_sample: false,
            seed: Some(0),
            ..FrcnConfig::default()
        }
    }

    fn build(config: &FrcnConfig, num_images: usize) -> RegionDatabase {
        let dataset = dataset(num_images);
        RoidbBuilder::new(config)
            .unwrap()
            .build(&dataset, &dataset, &DoubledImages)
            .unwrap()
    }

    #[test]
    fn test_nbatches() {
        let config = FrcnConfig {
            img_per_batch: 2,
            ..config()
        };
        let roidb = build(&config, 3);
        let loader = RoiLoader::new(&roidb, DoubledImages, &config).unwrap();
        assert_eq!(loader.nbatches(), 1);
        assert_eq!(loader.ndata(), 3);

        let flipped = FrcnConfig {
            add_flipped: true,
            ..config.clone()
        };
        let roidb = build(&flipped, 3);
        let loader = RoiLoader::new(&roidb, DoubledImages, &flipped).unwrap();
        assert_eq!(loader.nbatches(), 3);

        let capped = FrcnConfig {
            n_mb: Some(2),
            ..flipped
        };
        let loader = RoiLoader::new(&roidb, DoubledImages, &capped).unwrap();
        assert_eq!(loader.nbatches(), 2);
        assert_eq!(loader.ndata(), 6);
    }

    #[test]
    fn test_detection_batch() {
        let config = config();
        let roidb = build(&config, 1);
        let mut loader = RoiLoader::new(&roidb, DoubledImages, &config).unwrap();

        let batches: Vec<_> = loader.iter().collect::<RoidbResult<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        let (inputs, targets) = &batches[0];

        let FrcnInputs::ImageRois { images, rois } = inputs else {
            panic!("expected image and rois");
        };
        assert_eq!(images.dim(), (1, 3, 300, 300));
        assert_eq!(images[[0, 0, 159, 199]], 1.0);
        assert_eq!(images[[0, 0, 160, 0]], 0.0);
        assert_eq!(images[[0, 2, 0, 200]], 0.0);

        // fg: ground truth and the first proposal, bg: the partial overlap,
        // the far proposal is below bg_thre_lo
        assert_eq!(rois.dim(), (8, 5));
        assert_eq!(rois.row(0), array![0.0, 20.0, 20.0, 100.0, 100.0]);
        assert_eq!(rois.row(1), array![0.0, 28.0, 24.0, 100.0, 96.0]);
        assert_eq!(rois.row(2), array![0.0, 60.0, 20.0, 140.0, 100.0]);
        assert_eq!(rois.row(3), array![0.0, 0.0, 0.0, 0.0, 0.0]);

        let FrcnTargets::Detection {
            labels,
            bbox_targets,
            bbox_mask,
        } = targets
        else {
            panic!("expected detection targets");
        };
        assert_eq!(labels, &array![3, 3, 0, 0, 0, 0, 0, 0]);
        assert_eq!(bbox_targets.dim(), (8, 16));
        assert_eq!(bbox_mask.slice(s![0, 12..]), array![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(bbox_mask.slice(s![1, 12..]), array![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(bbox_mask.slice(s![2.., ..]).sum(), 0.0);
        assert_eq!(bbox_mask.row(0).sum(), 4.0);
    }

    #[test]
    fn test_output_types() {
        let roidb = build(&config(), 2);

        let labels_only = FrcnConfig {
            output_type: OutputType::LabelsOnly,
            ..config()
        };
        let mut loader = RoiLoader::new(&roidb, DoubledImages, &labels_only).unwrap();
        for batch in loader.iter() {
            let (inputs, targets) = batch.unwrap();
            assert!(matches!(inputs, FrcnInputs::Image { .. }));
            assert!(matches!(targets, FrcnTargets::Labels { .. }));
            assert_eq!(targets.labels().len(), 8);
        }

        let with_rois = FrcnConfig {
            output_type: OutputType::LabelsWithRois,
            ..config()
        };
        let mut loader = RoiLoader::new(&roidb, DoubledImages, &with_rois).unwrap();
        let (inputs, targets) = loader.iter().next().unwrap().unwrap();
        assert!(matches!(inputs, FrcnInputs::ImageRois { .. }));
        assert!(matches!(targets, FrcnTargets::Labels { .. }));
        assert_eq!(inputs.images().dim(), (1, 3, 300, 300));
    }

    #[test]
    fn test_class_count_mismatch() {
        let roidb = build(&config(), 1);
        let other = FrcnConfig {
            num_classes: 21,
            ..config()
        };
        assert!(matches!(
            RoiLoader::new(&roidb, DoubledImages, &other),
            Err(RoidbError::Config(_))
        ));
    }

    #[test]
    fn test_image_larger_than_buffer() {
        let config = FrcnConfig {
            max_scale: 150,
            ..config()
        };
        let roidb = build(&config, 1);
        let mut loader = RoiLoader::new(&roidb, DoubledImages, &config).unwrap();
        let result = loader.iter().next().unwrap();
        assert!(matches!(
            result,
            Err(RoidbError::ImageTooLarge {
                width: 200,
                height: 160,
                max_scale: 150,
                ..
            })
        ));
    }

    struct GrayImages;

    impl ImageSource for GrayImages {
        fn image_path(&self, image_id: &str) -> PathBuf {
            PathBuf::from(format!("{image_id}.png"))
        }

        fn dimensions(&self, _image_id: &str) -> anyhow::Result<(u32, u32)> {
            Ok((100, 80))
        }

        fn load_image(&self, entry: &ImageRegionSet) -> anyhow::Result<ScaledImage> {
            Ok(ScaledImage {
                data: Array3::zeros((1, entry.height as usize, entry.width as usize)),
                scale: 1.0,
            })
        }
    }

    #[test]
    fn test_single_channel_image_is_rejected() {
        let config = config();
        let roidb = build(&config, 1);
        let mut loader = RoiLoader::new(&roidb, GrayImages, &config).unwrap();
        let result = loader.iter().next().unwrap();
        assert!(matches!(
            result,
            Err(RoidbError::ImageChannels { channels: 1, .. })
        ));
    }

    fn collect_rois(loader: &mut RoiLoader<'_, DoubledImages>) -> Vec<Array2<f32>> {
        loader
            .iter()
            .map(|batch| match batch.unwrap().0 {
                FrcnInputs::ImageRois { rois, .. } => rois,
                FrcnInputs::Image { .. } => panic!("expected rois"),
            })
            .collect()
    }

    #[test]
    fn test_seeded_epochs_are_reproducible() {
        let config = FrcnConfig {
            add_flipped: true,
            shuffle: true,
            rois_random_sample: true,
            seed: Some(11),
            ..config()
        };
        let roidb = build(&config, 4);

        let mut first = RoiLoader::new(&roidb, DoubledImages, &config).unwrap();
        let mut second = RoiLoader::new(&roidb, DoubledImages, &config).unwrap();
        let epoch_a = collect_rois(&mut first);
        assert_eq!(epoch_a.len(), 8);
        assert_eq!(epoch_a, collect_rois(&mut second));

        // a second epoch starts over with a full set of batches
        assert_eq!(collect_rois(&mut first).len(), 8);
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ndarray::{Array1, Array2, Array3};

use crate::pipeline::config::FrcnConfig;
use crate::rcnn::roidb::ImageRegionSet;
use crate::utils::image_ops::{image_scale, image_to_blob, load_rgb_image, prepare_image};

/// Ground truth of one image: 0-based inclusive boxes and their class indices.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    /// g * 4
    pub boxes: Array2<f32>,
    /// g
    pub classes: Array1<usize>,
}

impl GroundTruth {
    pub fn empty() -> Self {
        GroundTruth {
            boxes: Array2::zeros((0, 4)),
            classes: Array1::zeros(0),
        }
    }
}

/// Unlabelled proposals for one image, already as (x1, y1, x2, y2).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProposals {
    pub image_id: String,
    pub boxes: Array2<f32>,
}

/// A decoded, rescaled image in 3 * h * w layout and the scale applied to it.
#[derive(Debug, Clone)]
pub struct ScaledImage {
    pub data: Array3<f32>,
    pub scale: f32,
}

pub trait AnnotationSource {
    /// Image ids in dataset order.
    fn image_index(&self) -> Result<Vec<String>>;

    fn ground_truth(&self, image_id: &str) -> Result<GroundTruth>;
}

pub trait ProposalSource {
    /// One proposal set per image, in the same order as the image index.
    fn proposals(&self) -> Result<Vec<ImageProposals>>;
}

pub trait ImageSource {
    fn image_path(&self, image_id: &str) -> PathBuf;

    /// (width, height) in pixels.
    fn dimensions(&self, image_id: &str) -> Result<(u32, u32)>;

    /// Pixels for `entry`, rescaled and mirrored when the entry is flipped.
    fn load_image(&self, entry: &ImageRegionSet) -> Result<ScaledImage>;
}

/// Annotations and proposals held in memory, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    image_ids: Vec<String>,
    ground_truth: HashMap<String, GroundTruth>,
    proposals: Vec<ImageProposals>,
}

impl InMemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, image_id: &str, ground_truth: GroundTruth, proposals: Array2<f32>) {
        self.image_ids.push(image_id.to_string());
        self.ground_truth.insert(image_id.to_string(), ground_truth);
        self.proposals.push(ImageProposals {
            image_id: image_id.to_string(),
            boxes: proposals,
        });
    }

    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}

impl AnnotationSource for InMemoryDataset {
    fn image_index(&self) -> Result<Vec<String>> {
        Ok(self.image_ids.clone())
    }

    fn ground_truth(&self, image_id: &str) -> Result<GroundTruth> {
        self.ground_truth
            .get(image_id)
            .cloned()
            .ok_or_else(|| anyhow!("no annotation for image {image_id}"))
    }
}

impl ProposalSource for InMemoryDataset {
    fn proposals(&self) -> Result<Vec<ImageProposals>> {
        Ok(self.proposals.clone())
    }
}

/// Images stored as `<root>/<image_id><extension>`, decoded with the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageFolderSource {
    root: PathBuf,
    extension: String,
    min_scale: u32,
    max_scale: u32,
    pixel_means: [f32; 3],
}

impl ImageFolderSource {
    pub fn new(root: &Path, config: &FrcnConfig) -> Self {
        ImageFolderSource {
            root: root.to_path_buf(),
            extension: ".jpg".to_string(),
            min_scale: config.min_scale,
            max_scale: config.max_scale,
            pixel_means: config.pixel_means,
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }
}

impl ImageSource for ImageFolderSource {
    fn image_path(&self, image_id: &str) -> PathBuf {
        self.root.join(format!("{image_id}{}", self.extension))
    }

    fn dimensions(&self, image_id: &str) -> Result<(u32, u32)> {
        let path = self.image_path(image_id);
        image::image_dimensions(&path)
            .with_context(|| format!("reading dimensions of {}", path.display()))
    }

    fn load_image(&self, entry: &ImageRegionSet) -> Result<ScaledImage> {
        let img = load_rgb_image(&entry.image_file)?;
        let scale = image_scale(img.width(), img.height(), self.min_scale, self.max_scale);
        let prepared = prepare_image(&img, scale, entry.flipped);
        Ok(ScaledImage {
            data: image_to_blob(&prepared, &self.pixel_means),
            scale,
        })
    }
}

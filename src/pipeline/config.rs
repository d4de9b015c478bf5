use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RoidbError, RoidbResult};

/// Background class is always indexed at 0.
pub const PASCAL_VOC_CLASSES: [&str; 21] = [
    "__background__",
    "aeroplane",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "diningtable",
    "dog",
    "horse",
    "motorbike",
    "person",
    "pottedplant",
    "sheep",
    "sofa",
    "train",
    "tvmonitor",
];

/// Which (inputs, targets) pair the loader yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// X: (image, rois) Y: (labels, (bbox targets, bbox mask))
    #[default]
    Detection,
    /// X: (image, rois) Y: labels
    LabelsWithRois,
    /// X: image Y: labels
    LabelsOnly,
}

impl TryFrom<u8> for OutputType {
    type Error = RoidbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OutputType::Detection),
            1 => Ok(OutputType::LabelsWithRois),
            2 => Ok(OutputType::LabelsOnly),
            other => Err(RoidbError::UnsupportedOutputType(other)),
        }
    }
}

/// Fixed regression target statistics used instead of computing them from the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecomputedNormalization {
    pub means: [f32; 4],
    pub stds: [f32; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrcnConfig {
    /// Object classes plus background.
    pub num_classes: usize,
    pub img_per_batch: usize,
    pub rois_per_img: usize,
    /// Share of each image's rois drawn from the foreground.
    pub fg_fraction: f32,
    /// Proposals below this best overlap get no class and no regression target.
    pub overlap_thre: f32,
    pub fg_thre: f32,
    pub bg_thre_lo: f32,
    pub bg_thre_hi: f32,
    /// Target length of the shorter image side.
    pub min_scale: u32,
    /// Cap on the longer image side; also the side of the padded batch buffer.
    pub max_scale: u32,
    /// BGR
    pub pixel_means: [f32; 3],
    pub add_flipped: bool,
    pub shuffle: bool,
    pub rois_random_sample: bool,
    pub output_type: OutputType,
    /// Caps the number of minibatches per epoch.
    pub n_mb: Option<usize>,
    pub seed: Option<u64>,
    pub bbox_normalization: Option<PrecomputedNormalization>,
}

impl Default for FrcnConfig {
    fn default() -> Self {
        FrcnConfig {
            num_classes: PASCAL_VOC_CLASSES.len(),
            img_per_batch: 4,
            rois_per_img: 64,
            fg_fraction: 0.25,
            overlap_thre: 0.5,
            fg_thre: 0.5,
            bg_thre_lo: 0.1,
            bg_thre_hi: 0.5,
            min_scale: 600,
            max_scale: 1000,
            pixel_means: [102.9801, 115.9465, 122.7717],
            add_flipped: false,
            shuffle: false,
            rois_random_sample: true,
            output_type: OutputType::Detection,
            n_mb: None,
            seed: None,
            bbox_normalization: None,
        }
    }
}

impl FrcnConfig {
    pub fn load(path: &Path) -> RoidbResult<Self> {
        let raw = fs::read(path).map_err(|e| RoidbError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: FrcnConfig = serde_json::from_slice(&raw).map_err(|e| RoidbError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn fg_rois_per_img(&self) -> usize {
        (self.fg_fraction * self.rois_per_img as f32) as usize
    }

    pub fn rois_per_batch(&self) -> usize {
        self.rois_per_img * self.img_per_batch
    }

    pub fn validate(&self) -> RoidbResult<()> {
        fn invalid(msg: impl Into<String>) -> RoidbResult<()> {
            Err(RoidbError::Config(msg.into()))
        }

        if self.num_classes < 2 {
            return invalid(format!(
                "num_classes must include background and at least one object class, got {}",
                self.num_classes
            ));
        }
        if self.img_per_batch == 0 {
            return invalid("img_per_batch must be positive");
        }
        if self.rois_per_img == 0 {
            return invalid("rois_per_img must be positive");
        }
        if !(0.0..=1.0).contains(&self.fg_fraction) {
            return invalid(format!("fg_fraction {} is outside [0, 1]", self.fg_fraction));
        }
        for (name, value) in [
            ("overlap_thre", self.overlap_thre),
            ("fg_thre", self.fg_thre),
            ("bg_thre_lo", self.bg_thre_lo),
            ("bg_thre_hi", self.bg_thre_hi),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} {value} is outside [0, 1]"));
            }
        }
        if self.bg_thre_lo > self.bg_thre_hi {
            return invalid(format!(
                "bg_thre_lo {} is above bg_thre_hi {}",
                self.bg_thre_lo, self.bg_thre_hi
            ));
        }
        if self.bg_thre_hi > self.fg_thre {
            return invalid(format!(
                "bg_thre_hi {} is above fg_thre {}, a roi could be both foreground and background",
                self.bg_thre_hi, self.fg_thre
            ));
        }
        if self.overlap_thre > self.fg_thre {
            return invalid(format!(
                "overlap_thre {} is above fg_thre {}, foreground rois could carry no class",
                self.overlap_thre, self.fg_thre
            ));
        }
        if self.min_scale == 0 || self.min_scale > self.max_scale {
            return invalid(format!(
                "min_scale {} must be positive and at most max_scale {}",
                self.min_scale, self.max_scale
            ));
        }
        if let Some(norm) = &self.bbox_normalization {
            if norm.stds.iter().any(|&s| !(s > 0.0)) {
                return invalid(format!("precomputed bbox stds {:?} must be positive", norm.stds));
            }
        }
        if self.n_mb == Some(0) {
            return invalid("n_mb must be positive when set");
        }
        Ok(())
    }
}

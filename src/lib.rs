//! Region database and minibatch pipeline for Fast R-CNN training.
//!
//! A [`RegionDatabase`] is built once per dataset split from ground truth
//! annotations and external object proposals, then a [`RoiLoader`] draws
//! fixed-size batches of images, rois and regression targets from it.

pub mod error;
pub mod pipeline;
pub mod processing;
pub mod rcnn;
pub mod utils;

pub use error::{RoidbError, RoidbResult};
pub use pipeline::cache::{CacheKey, CacheStore, JsonCacheStore};
pub use pipeline::config::{FrcnConfig, OutputType, PrecomputedNormalization, PASCAL_VOC_CLASSES};
pub use pipeline::loader::{EpochIter, FrcnInputs, FrcnTargets, RoiLoader};
pub use pipeline::sources::{
    AnnotationSource, GroundTruth, ImageFolderSource, ImageProposals, ImageSource, InMemoryDataset,
    ProposalSource, ScaledImage,
};
pub use processing::bbox_regression::{BBoxNormalization, ClassStatistics};
pub use rcnn::bbox::bbox_overlaps;
pub use rcnn::minibatch::{RoiSampler, SampledRois};
pub use rcnn::roidb::{
    ImageRegionSet, RegionCandidate, RegionDatabase, RegionSource, RegressionTarget, RoidbBuilder,
};

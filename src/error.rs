use std::path::PathBuf;
use thiserror::Error;

pub type RoidbResult<T> = Result<T, RoidbError>;

#[derive(Debug, Error)]
pub enum RoidbError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unsupported output type {0}, expected 0 (detection), 1 (labels with rois) or 2 (labels only)")]
    UnsupportedOutputType(u8),
    #[error("{annotations} annotated images but {proposals} proposal sets")]
    ImageCountMismatch { annotations: usize, proposals: usize },
    #[error("proposal set {index} belongs to image {found}, expected {expected}")]
    ImageIdMismatch {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("{kind} boxes for image {image_id} have {columns} columns, expected 4")]
    MalformedBoxes {
        kind: &'static str,
        image_id: String,
        columns: usize,
    },
    #[error("image {image_id}: {boxes} ground truth boxes but {classes} class labels")]
    GroundTruthLengthMismatch {
        image_id: String,
        boxes: usize,
        classes: usize,
    },
    #[error("class index {class} for image {image_id} is outside 1..{num_classes}")]
    InvalidClass {
        image_id: String,
        class: usize,
        num_classes: usize,
    },
    #[error("image {image_id} is {height}x{width} after scaling, larger than the {max_scale}px batch buffer")]
    ImageTooLarge {
        image_id: String,
        width: usize,
        height: usize,
        max_scale: usize,
    },
    #[error("image {image_id} has {channels} channels, expected 3")]
    ImageChannels { image_id: String, channels: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("npy write error at {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::WriteNpyError,
    },
    #[error(transparent)]
    Source(#[from] anyhow::Error),
}

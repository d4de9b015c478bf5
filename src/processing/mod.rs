pub mod bbox_regression;
pub mod bbox_transform;

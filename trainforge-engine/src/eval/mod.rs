//! Validation, scoring and inference.

pub mod fragment;
pub mod nms;
pub mod pipeline;

pub use fragment::{Detection, FragmentOptions, TileConfig, TileRect, Tileable, fragment_predict, tile_rects};
pub use nms::{iou, non_max_suppression};
pub use pipeline::{PredictOptions, Predictor};

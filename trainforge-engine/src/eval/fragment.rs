//! Tiled inference for inputs larger than the model's input size.
//!
//! The input is cut into overlapping tiles, every tile is inferred through
//! [`Predictor::batch_predict`], detections are shifted back to input
//! coordinates and merged with [`non_max_suppression`] under a caller-chosen
//! overlap measure, usually [`crate::eval::nms::iou`].

use crate::data::DataSource;
use crate::error::{EngineError, Result};
use crate::eval::nms::{BBox, non_max_suppression};
use crate::eval::pipeline::Predictor;
use crate::hooks::ModelHooks;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tile rectangle in input pixels, `[x1, x2) x [y1, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl TileRect {
    pub fn width(&self) -> usize {
        self.x2 - self.x1
    }

    pub fn height(&self) -> usize {
        self.y2 - self.y1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileConfig {
    pub max_size: usize,
    /// Pixels shared by neighbouring tiles.
    pub overlap: usize,
    /// A final strip thinner than this is merged into its neighbour.
    pub min_remainder: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            max_size: 640,
            overlap: 128,
            min_remainder: 0,
        }
    }
}

/// `(start, end)` spans covering `0..len` along one axis.
fn axis_spans(len: usize, config: &TileConfig) -> Vec<(usize, usize)> {
    let stride = config.max_size - config.overlap;
    let mut spans = Vec::new();
    let mut start = 0;
    while start < len {
        let mut end = (start + config.max_size).min(len);
        if len - end < config.min_remainder {
            end = len;
        }
        spans.push((start, end));
        if end == len {
            break;
        }
        start += stride;
    }
    spans
}

/// Split a `height x width` input into overlapping tiles, row-major.
///
/// Tiles never exceed `max_size` on either side except where a thin final
/// strip was merged in. Their union always covers the whole input.
pub fn tile_rects(height: usize, width: usize, config: &TileConfig) -> Result<Vec<TileRect>> {
    if config.max_size == 0 || config.overlap >= config.max_size {
        return Err(EngineError::invalid_config(format!(
            "tile overlap {} must be smaller than max_size {}",
            config.overlap, config.max_size
        )));
    }
    let rows = axis_spans(height, config);
    let cols = axis_spans(width, config);
    Ok(rows
        .iter()
        .flat_map(|&(y1, y2)| cols.iter().map(move |&(x1, x2)| TileRect { x1, y1, x2, y2 }))
        .collect())
}

/// Inputs that can be cut into tiles.
pub trait Tileable {
    /// `(height, width)`.
    fn size(&self) -> (usize, usize);

    fn crop(&self, rect: &TileRect) -> Self;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class: usize,
    pub confidence: f32,
}

impl Detection {
    pub fn translated(mut self, dx: f32, dy: f32) -> Self {
        self.bbox[0] += dx;
        self.bbox[1] += dy;
        self.bbox[2] += dx;
        self.bbox[3] += dy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentOptions {
    pub tile: TileConfig,
    /// Overlap above which the weaker of two detections is dropped.
    pub iou_threshold: f32,
    /// Suppress across classes instead of per class.
    pub class_agnostic: bool,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            tile: TileConfig::default(),
            iou_threshold: 0.6,
            class_agnostic: true,
        }
    }
}

/// Tile `input`, infer every tile, and merge the detections back in input
/// coordinates. `overlap` scores how much two boxes coincide.
pub fn fragment_predict<H, D, F>(
    predictor: &mut Predictor<'_, H, D>,
    input: &H::Input,
    options: &FragmentOptions,
    overlap: F,
) -> Result<Vec<Detection>>
where
    H: ModelHooks<Prediction = Vec<Detection>>,
    H::Input: Tileable,
    D: DataSource<Record = H::Record>,
    F: Fn(&BBox, &BBox) -> f32,
{
    let (height, width) = input.size();
    let tiles = tile_rects(height, width, &options.tile)?;
    let crops = tiles.iter().map(|rect| input.crop(rect)).collect();
    let per_tile = predictor.batch_predict(crops)?;
    tracing::debug!(tiles = tiles.len(), height, width, "fragment inference");

    let detections: Vec<Detection> = tiles
        .iter()
        .zip(per_tile)
        .flat_map(|(rect, dets)| {
            let (dx, dy) = (rect.x1 as f32, rect.y1 as f32);
            dets.into_iter().map(move |d| d.translated(dx, dy))
        })
        .collect();

    Ok(merge_detections(detections, options, overlap))
}

/// NMS over all detections, per class unless `class_agnostic`. Output is in
/// descending confidence within each class, classes ascending.
pub fn merge_detections<F>(detections: Vec<Detection>, options: &FragmentOptions, overlap: F) -> Vec<Detection>
where
    F: Fn(&BBox, &BBox) -> f32,
{
    let mut groups: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
    for det in detections {
        let key = if options.class_agnostic { 0 } else { det.class };
        groups.entry(key).or_default().push(det);
    }

    let mut merged = Vec::new();
    for group in groups.into_values() {
        let boxes: Vec<BBox> = group.iter().map(|d| d.bbox).collect();
        let scores: Vec<f32> = group.iter().map(|d| d.confidence).collect();
        let keep = non_max_suppression(&boxes, &scores, &overlap, options.iou_threshold);
        merged.extend(keep.into_iter().map(|i| group[i].clone()));
    }
    merged
}

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use image::{imageops, GrayImage};
use ndarray::Array4;
use ort::{session::Session, value::Value};
use serde::{Deserialize, Serialize};

use crate::model::SharedSession;
use crate::yunet::{self, Candidate, INPUT_SIZE};

/// Axis-aligned face region in frame pixels.
///
/// Coordinates are signed because detections near the border can start
/// outside the frame; [`BoundingBox::clamp_to`] brings them back in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
    pub score: f32,
}

/// A [`BoundingBox`] that is known to lie inside its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<Region> {
        let x0 = self.x.clamp(0, frame_width as i64);
        let y0 = self.y.clamp(0, frame_height as i64);
        let x1 = (self.x + self.width).clamp(0, frame_width as i64);
        let y1 = (self.y + self.height).clamp(0, frame_height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Region {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub score_threshold: f32,
    /// IoU above which two candidates are treated as the same face.
    pub nms_threshold: f32,
    /// Shrink ratio between pyramid levels.
    pub scale_factor: f32,
    /// Overlapping candidates a face must gather to be reported.
    pub min_neighbors: usize,
    /// Smallest accepted face side, in frame pixels.
    pub min_size: u32,
    pub pyramid_levels: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            nms_threshold: 0.3,
            scale_factor: 1.1,
            min_neighbors: 2,
            min_size: 30,
            pyramid_levels: 1,
        }
    }
}

/// Finds faces in a grayscale frame. An empty result is not an error.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, frame: &GrayImage) -> Result<Vec<BoundingBox>>;
}

/// YuNet ONNX detector run over a small image pyramid.
pub struct YuNetLocator {
    session: SharedSession,
    config: DetectorConfig,
}

impl YuNetLocator {
    pub fn new(session: Session, config: DetectorConfig) -> Self {
        Self::with_session(Arc::new(Mutex::new(session)), config)
    }

    /// Wrap a session that may also back other handles.
    pub fn with_session(session: SharedSession, config: DetectorConfig) -> Self {
        Self { session, config }
    }

    pub fn from_file(path: &Path, config: DetectorConfig) -> Result<Self> {
        let session = crate::model::load_session(path).context("load face detector")?;
        Ok(Self::new(session, config))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run the network once on the frame letterboxed at `1 / shrink` of the
    /// fitting scale; boxes come back in frame coordinates.
    fn detect_level(&self, frame: &GrayImage, shrink: f32) -> Result<Vec<Candidate>> {
        let letterbox = Letterbox::new(frame, INPUT_SIZE as u32, shrink);
        let input = Value::from_array(letterbox.to_tensor())?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("detector session lock poisoned"))?;
        let outputs = session.run(ort::inputs![input])?;

        let mut owned: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
        for (_name, output) in outputs.iter() {
            let (shape, data) = output.try_extract_tensor::<f32>()?;
            owned.push((shape.iter().copied().collect(), data.to_vec()));
        }
        drop(outputs);
        drop(session);

        let views: Vec<yunet::RawOutput<'_>> = owned
            .iter()
            .map(|(s, d)| (s.as_slice(), d.as_slice()))
            .collect();
        let raw = yunet::decode(&views, INPUT_SIZE, self.config.score_threshold)?;
        Ok(raw.into_iter().map(|c| letterbox.unmap(c)).collect())
    }
}

impl FaceLocator for YuNetLocator {
    fn locate(&self, frame: &GrayImage) -> Result<Vec<BoundingBox>> {
        let (width, height) = frame.dimensions();
        let mut candidates = self.detect_level(frame, 1.0)?;

        // Deeper levels shrink the frame inside the canvas so faces that
        // fill the whole picture land in the detector's working range.
        let factor = self.config.scale_factor.max(1.0);
        for level in 1..self.config.pyramid_levels {
            let shrink = factor.powi(level as i32);
            let longest = INPUT_SIZE as f32 / shrink;
            if longest < self.config.min_size as f32 {
                break;
            }
            candidates.extend(self.detect_level(frame, shrink)?);
        }

        let faces = group_candidates(candidates, &self.config)
            .into_iter()
            .filter(|b| b.clamp_to(width, height).is_some())
            .collect::<Vec<_>>();
        log::trace!("located {} face(s) in {}x{} frame", faces.len(), width, height);
        Ok(faces)
    }
}

/// Gray frame scaled into the square detector input with centred padding.
struct Letterbox {
    canvas: GrayImage,
    scale: f32,
    offset_x: u32,
    offset_y: u32,
}

impl Letterbox {
    fn new(img: &GrayImage, target: u32, shrink: f32) -> Self {
        let (w, h) = img.dimensions();
        let scale = target as f32 / w.max(h).max(1) as f32 / shrink.max(1.0);
        let new_w = ((w as f32 * scale) as u32).clamp(1, target);
        let new_h = ((h as f32 * scale) as u32).clamp(1, target);
        let resized = imageops::resize(img, new_w, new_h, imageops::FilterType::Triangle);

        let mut canvas = GrayImage::new(target, target);
        let offset_x = (target - new_w) / 2;
        let offset_y = (target - new_h) / 2;
        imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);
        Self {
            canvas,
            scale,
            offset_x,
            offset_y,
        }
    }

    /// `[1, 3, H, W]` BGR planes; a gray frame fills all three identically.
    fn to_tensor(&self) -> Array4<f32> {
        let (w, h) = self.canvas.dimensions();
        let plane: Vec<f32> = self.canvas.as_raw().iter().map(|&p| p as f32).collect();
        let mut data = Vec::with_capacity(plane.len() * 3);
        for _ in 0..3 {
            data.extend_from_slice(&plane);
        }
        Array4::from_shape_vec((1, 3, h as usize, w as usize), data)
            .unwrap_or_else(|_| Array4::zeros((1, 3, h as usize, w as usize)))
    }

    fn unmap(&self, c: Candidate) -> Candidate {
        Candidate {
            x: (c.x - self.offset_x as f32) / self.scale,
            y: (c.y - self.offset_y as f32) / self.scale,
            width: c.width / self.scale,
            height: c.height / self.scale,
            score: c.score,
        }
    }
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let inter = (x2 - x1) * (y2 - y1);
    inter / (a.width * a.height + b.width * b.height - inter)
}

/// Greedy IoU grouping of raw candidates into faces.
///
/// The best-scoring candidate of each group represents it; groups with fewer
/// than `min_neighbors` absorbed members and faces smaller than `min_size`
/// are dropped.
pub fn group_candidates(mut candidates: Vec<Candidate>, config: &DetectorConfig) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut absorbed = vec![false; candidates.len()];
    let mut faces = Vec::new();

    for i in 0..candidates.len() {
        if absorbed[i] {
            continue;
        }
        let mut neighbors = 0;
        for j in (i + 1)..candidates.len() {
            if !absorbed[j] && iou(&candidates[i], &candidates[j]) > config.nms_threshold {
                absorbed[j] = true;
                neighbors += 1;
            }
        }

        let best = &candidates[i];
        let min = config.min_size as f32;
        if neighbors < config.min_neighbors || best.width < min || best.height < min {
            continue;
        }
        faces.push(BoundingBox {
            x: best.x.round() as i64,
            y: best.y.round() as i64,
            width: best.width.round() as i64,
            height: best.height.round() as i64,
            score: best.score,
        });
    }

    faces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, side: f32, score: f32) -> Candidate {
        Candidate {
            x,
            y,
            width: side,
            height: side,
            score,
        }
    }

    fn config(min_neighbors: usize, min_size: u32) -> DetectorConfig {
        DetectorConfig {
            min_neighbors,
            min_size,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn test_iou() {
        let a = cand(10.0, 10.0, 20.0, 1.0);
        let b = cand(15.0, 15.0, 20.0, 1.0);
        let v = iou(&a, &b);
        assert!(v > 0.0 && v < 1.0);
        assert_eq!(iou(&a, &cand(100.0, 100.0, 10.0, 1.0)), 0.0);
    }

    #[test]
    fn test_grouping_requires_neighbors() {
        let candidates = vec![
            cand(100.0, 100.0, 60.0, 0.9),
            cand(102.0, 101.0, 60.0, 0.8),
            cand(98.0, 99.0, 62.0, 0.7),
            // isolated, no support
            cand(400.0, 50.0, 60.0, 0.95),
        ];
        let faces = group_candidates(candidates.clone(), &config(2, 30));
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].x, 100);
        assert!((faces[0].score - 0.9).abs() < 1e-6);

        let all = group_candidates(candidates, &config(0, 30));
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_grouping_drops_small_faces() {
        let faces = group_candidates(vec![cand(0.0, 0.0, 20.0, 0.9)], &config(0, 30));
        assert!(faces.is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let img = GrayImage::new(320, 160);
        let lb = Letterbox::new(&img, 640, 1.0);
        assert_eq!(lb.offset_x, 0);
        assert_eq!(lb.offset_y, 160);
        let back = lb.unmap(cand(100.0, 260.0, 40.0, 0.5));
        assert!((back.x - 50.0).abs() < 1e-4);
        assert!((back.y - 50.0).abs() < 1e-4);
        assert!((back.width - 20.0).abs() < 1e-4);
        assert_eq!(lb.to_tensor().shape(), &[1, 3, 640, 640]);

        // half-size level: 320x160 frame drawn as 320x160 in the middle
        let half = Letterbox::new(&img, 640, 2.0);
        assert_eq!((half.offset_x, half.offset_y), (160, 240));
        let back = half.unmap(cand(160.0, 240.0, 10.0, 0.5));
        assert!(back.x.abs() < 1e-4 && back.y.abs() < 1e-4);
        assert!((back.width - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_clamp_to_frame() {
        let b = BoundingBox {
            x: -10,
            y: 5,
            width: 50,
            height: 200,
            score: 1.0,
        };
        let r = b.clamp_to(100, 100).unwrap();
        assert_eq!(
            r,
            Region {
                x: 0,
                y: 5,
                width: 40,
                height: 95
            }
        );
        let outside = BoundingBox { x: 120, ..b };
        assert!(outside.clamp_to(100, 100).is_none());
    }
}

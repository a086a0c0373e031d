//! YuNet output decoding.
//!
//! The 2023mar export emits twelve tensors, four groups of three strides
//! (8, 16, 32): `cls`, `obj`, `bbox`, `kps`, each shaped `[1, H*W, C]`.
//! Boxes are anchor-free: the centre is `(grid + delta) * stride`, the size
//! is `exp(delta) * stride`. Landmarks are not needed for cropping and are
//! ignored.

use anyhow::Result;

pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Detector input side in pixels.
pub const INPUT_SIZE: usize = 640;

/// Candidate box in detector-input pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

/// Borrowed view of one output tensor.
pub type RawOutput<'a> = (&'a [i64], &'a [f32]);

fn checked<'a>(
    outputs: &[RawOutput<'a>],
    index: usize,
    rows: usize,
    cols: usize,
) -> Result<&'a [f32]> {
    let Some((shape, data)) = outputs.get(index).copied() else {
        anyhow::bail!("yunet output {} missing ({} present)", index, outputs.len());
    };
    let shape_ok = shape.len() == 3
        && shape[0] == 1
        && shape[1] as usize == rows
        && shape[2] as usize == cols;
    if !shape_ok || data.len() != rows * cols {
        anyhow::bail!(
            "yunet output {} has shape {:?}, expected [1, {}, {}]",
            index,
            shape,
            rows,
            cols
        );
    }
    Ok(data)
}

/// Decode every grid cell scoring at least `score_threshold`.
///
/// Score is `sqrt(cls * obj)`, both clamped to `[0, 1]` first.
pub fn decode(
    outputs: &[RawOutput<'_>],
    input_size: usize,
    score_threshold: f32,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();

    for (scale, &stride) in STRIDES.iter().enumerate() {
        let cols = input_size / stride;
        let cells = cols * cols;
        let cls = checked(outputs, scale, cells, 1)?;
        let obj = checked(outputs, scale + 3, cells, 1)?;
        let bbox = checked(outputs, scale + 6, cells, 4)?;

        for cell in 0..cells {
            let score = (cls[cell].clamp(0.0, 1.0) * obj[cell].clamp(0.0, 1.0)).sqrt();
            if score < score_threshold {
                continue;
            }
            let (row, col) = (cell / cols, cell % cols);
            let d = &bbox[cell * 4..cell * 4 + 4];
            let s = stride as f32;
            let cx = (col as f32 + d[0]) * s;
            let cy = (row as f32 + d[1]) * s;
            let width = d[2].exp() * s;
            let height = d[3].exp() * s;
            candidates.push(Candidate {
                x: cx - width / 2.0,
                y: cy - height / 2.0,
                width,
                height,
                score,
            });
        }
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tensors {
        shapes: Vec<Vec<i64>>,
        data: Vec<Vec<f32>>,
    }

    impl Tensors {
        fn empty(input_size: usize) -> Self {
            let mut shapes = Vec::new();
            let mut data = Vec::new();
            for cols in [1usize, 1, 4, 10] {
                for stride in STRIDES {
                    let cells = (input_size / stride).pow(2);
                    shapes.push(vec![1, cells as i64, cols as i64]);
                    data.push(vec![0.0; cells * cols]);
                }
            }
            Self { shapes, data }
        }

        fn views(&self) -> Vec<RawOutput<'_>> {
            self.shapes
                .iter()
                .zip(&self.data)
                .map(|(s, d)| (s.as_slice(), d.as_slice()))
                .collect()
        }
    }

    #[test]
    fn test_decode_single_cell() {
        let mut t = Tensors::empty(INPUT_SIZE);
        // stride 32 grid is 20x20; cell (row 10, col 10)
        let cell = 10 * 20 + 10;
        t.data[2][cell] = 0.81;
        t.data[5][cell] = 1.0;
        let b = &mut t.data[8][cell * 4..cell * 4 + 4];
        b.copy_from_slice(&[0.5, 0.25, 4f32.ln(), 4f32.ln()]);

        let found = decode(&t.views(), INPUT_SIZE, 0.5).unwrap();
        assert_eq!(found.len(), 1);
        let c = found[0];
        // centre (336, 328), size 128x128
        assert!((c.x - 272.0).abs() < 1e-3);
        assert!((c.y - 264.0).abs() < 1e-3);
        assert!((c.width - 128.0).abs() < 1e-3);
        assert!((c.height - 128.0).abs() < 1e-3);
        assert!((c.score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_decode_filters_low_scores() {
        let mut t = Tensors::empty(INPUT_SIZE);
        t.data[0][0] = 0.2;
        t.data[3][0] = 0.2;
        assert!(decode(&t.views(), INPUT_SIZE, 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let mut t = Tensors::empty(INPUT_SIZE);
        t.shapes[6] = vec![1, 10, 4];
        assert!(decode(&t.views(), INPUT_SIZE, 0.5).is_err());
        assert!(decode(&t.views()[..5], INPUT_SIZE, 0.5).is_err());
    }
}

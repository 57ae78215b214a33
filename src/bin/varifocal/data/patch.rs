/// Window into one sample, `height x width` pixels starting at `(y, x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Patch {
    pub sample: usize,
    pub y: usize,
    pub x: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchShape {
    pub height: usize,
    pub width: usize,
}

impl PatchShape {
    pub fn pixel_count(&self) -> usize {
        self.height * self.width
    }
}

/// Tiles every sample into non-overlapping patches, row-major within a sample.
/// Leftover rows and columns that do not fill a whole patch are dropped.
pub fn tile_patches(
    samples: impl IntoIterator<Item = usize>,
    image_height: usize,
    image_width: usize,
    shape: PatchShape,
) -> Vec<Patch> {
    let rows = image_height / shape.height;
    let cols = image_width / shape.width;
    let mut patches = Vec::new();

    for sample in samples {
        for row in 0..rows {
            for col in 0..cols {
                patches.push(Patch {
                    sample,
                    y: row * shape.height,
                    x: col * shape.width,
                });
            }
        }
    }

    patches
}

/// Copies the patch window out of a row-major `image_width` wide plane.
pub fn crop_into(
    plane: &[f32],
    image_width: usize,
    patch: &Patch,
    shape: PatchShape,
    out: &mut [f32],
) {
    for row in 0..shape.height {
        let src = (patch.y + row) * image_width + patch.x;
        let dst = row * shape.width;
        out[dst..dst + shape.width].copy_from_slice(&plane[src..src + shape.width]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_patches_grid() {
        let shape = PatchShape {
            height: 2,
            width: 3,
        };
        let patches = tile_patches([4, 7], 5, 6, shape);

        // 5 rows fit two patch rows, 6 columns fit two patch columns
        assert_eq!(patches.len(), 8);
        assert_eq!(patches[0], Patch { sample: 4, y: 0, x: 0 });
        assert_eq!(patches[1], Patch { sample: 4, y: 0, x: 3 });
        assert_eq!(patches[3], Patch { sample: 4, y: 2, x: 3 });
        assert_eq!(patches[4].sample, 7);
    }

    #[test]
    fn test_full_frame_is_one_patch() {
        let shape = PatchShape {
            height: 4,
            width: 4,
        };
        let patches = tile_patches(0..3, 4, 4, shape);
        assert_eq!(patches.len(), 3);
        assert!(patches.iter().all(|p| p.x == 0 && p.y == 0));
    }

    #[test]
    fn test_crop_into() {
        let plane: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let shape = PatchShape {
            height: 2,
            width: 2,
        };
        let mut out = [0.0; 4];
        crop_into(&plane, 4, &Patch { sample: 0, y: 2, x: 1 }, shape, &mut out);
        assert_eq!(out, [9.0, 10.0, 13.0, 14.0]);
    }
}

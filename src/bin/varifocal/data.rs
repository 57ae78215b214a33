pub mod patch;

use crate::{
    config::Config,
    optics::{diopter_map, focal_planes},
};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{info, warn};
use patch::{tile_patches, Patch, PatchShape};
use std::{
    fs::OpenOptions,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

/// Colour channels per scene. Each one is trained as its own mono sample.
pub const CHANNELS: usize = 3;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "tiff", "tif"];

#[derive(Error, Debug)]
pub enum SceneLoadError {
    #[error("image {path:?} is {width}x{height}, expected {expected_width}x{expected_height}")]
    SizeMismatch {
        path: PathBuf,
        width: u32,
        height: u32,
        expected_width: usize,
        expected_height: usize,
    },
    #[error("depth map {path:?} holds {len} bytes, expected {expected}")]
    DepthSizeMismatch {
        path: PathBuf,
        len: u64,
        expected: u64,
    },
    #[error("frame {image_width}x{image_height} is smaller than the {patch_width}x{patch_height} patch")]
    PatchTooLarge {
        image_width: usize,
        image_height: usize,
        patch_width: usize,
        patch_height: usize,
    },
    #[error("no scene could be loaded from {0:?}")]
    EmptyDataset(PathBuf),
    #[error("{eval} validation scenes requested but only {loaded} scenes loaded")]
    NotEnoughScenes { eval: usize, loaded: usize },
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One colour channel of one scene.
#[derive(Debug, Clone)]
pub struct Sample {
    pub scene: usize,
    pub channel: usize,
    /// All-in-focus intensity.
    pub clean: Vec<f32>,
    /// Metric depth shared by the three channels of a scene.
    pub depth: Arc<[f32]>,
    /// `1 / depth / diopter_scale`, shared by the three channels of a scene.
    pub diopter: Arc<[f32]>,
    /// Ground-truth defocus planes, `focal_planes.len()` planes back to back.
    /// Empty when the focal stack is not loaded.
    pub focal_stack: Vec<f32>,
}

impl Sample {
    pub fn focal_plane(&self, index: usize, pixel_count: usize) -> &[f32] {
        &self.focal_stack[index * pixel_count..(index + 1) * pixel_count]
    }
}

#[derive(Debug)]
pub struct FocalStackDataset {
    pub image_height: usize,
    pub image_width: usize,
    pub patch_shape: PatchShape,
    /// Focal distance in diopters of each stack plane.
    pub focal_planes: Vec<f32>,
    pub samples: Vec<Sample>,
    pub num_train_samples: usize,
    pub num_eval_samples: usize,
    pub train_patches: Vec<Patch>,
    pub eval_patches: Vec<Patch>,
    /// Indices of the scenes that loaded, in sample order.
    pub valid_scene_indices: Vec<usize>,
}

impl FocalStackDataset {
    pub fn load(config: &Config) -> Result<Self, SceneLoadError> {
        let (image_height, image_width) = (config.image_height, config.image_width);
        let patch_shape = PatchShape {
            height: config.patch_height,
            width: config.patch_width,
        };

        if patch_shape.height > image_height || patch_shape.width > image_width {
            return Err(SceneLoadError::PatchTooLarge {
                image_width,
                image_height,
                patch_width: patch_shape.width,
                patch_height: patch_shape.height,
            });
        }

        let optics = &config.optics;
        let focal_planes = focal_planes(
            optics.num_focal_planes,
            optics.min_focal_diopter,
            optics.max_focal_diopter,
        );

        let mut samples = Vec::new();
        let mut valid_scene_indices = Vec::new();

        for scene in config.start_scene..=config.end_scene {
            let dir = scene_dir(&config.data_path, scene);
            let layout = SceneFiles::locate(&dir, focal_planes.len(), config.load_focal_stack);
            let layout = match layout {
                Some(layout) => layout,
                None => {
                    warn!("skipping scene {} with missing files in {:?}", scene, dir);
                    continue;
                }
            };

            let scene_samples = load_scene(
                scene,
                &layout,
                image_width,
                image_height,
                optics.diopter_scale,
            )?;
            samples.extend(scene_samples);
            valid_scene_indices.push(scene);
        }

        if valid_scene_indices.is_empty() {
            return Err(SceneLoadError::EmptyDataset(config.data_path.clone()));
        }
        if valid_scene_indices.len() <= config.num_eval_scenes && config.num_eval_scenes > 0 {
            return Err(SceneLoadError::NotEnoughScenes {
                eval: config.num_eval_scenes,
                loaded: valid_scene_indices.len(),
            });
        }

        let num_eval_samples = config.num_eval_scenes * CHANNELS;
        let num_train_samples = samples.len() - num_eval_samples;

        let train_patches =
            tile_patches(0..num_train_samples, image_height, image_width, patch_shape);
        let eval_patches = tile_patches(
            num_train_samples..samples.len(),
            image_height,
            image_width,
            patch_shape,
        );

        info!(
            "loaded {} scenes: {} train samples ({} patches), {} eval samples ({} patches)",
            valid_scene_indices.len(),
            num_train_samples,
            train_patches.len(),
            num_eval_samples,
            eval_patches.len()
        );

        Ok(Self {
            image_height,
            image_width,
            patch_shape,
            focal_planes,
            samples,
            num_train_samples,
            num_eval_samples,
            train_patches,
            eval_patches,
            valid_scene_indices,
        })
    }

    pub fn num_focal_planes(&self) -> usize {
        self.focal_planes.len()
    }

    pub fn pixel_count(&self) -> usize {
        self.image_height * self.image_width
    }

    pub fn has_focal_stack(&self) -> bool {
        self.samples.iter().all(|s| !s.focal_stack.is_empty())
    }
}

pub fn scene_dir(data_path: &Path, scene: usize) -> PathBuf {
    data_path.join(format!("seq{:03}", scene))
}

#[derive(Debug)]
struct SceneFiles {
    clean: PathBuf,
    depth: PathBuf,
    focal_stack: Vec<PathBuf>,
}

impl SceneFiles {
    fn locate(dir: &Path, num_focal_planes: usize, load_focal_stack: bool) -> Option<Self> {
        let clean = find_image(dir, "clean")?;
        let depth = dir.join("depth.bin");
        if !depth.is_file() {
            return None;
        }

        let focal_stack = match load_focal_stack {
            true => (0..num_focal_planes)
                .map(|n| find_image(dir, &format!("fs{:03}", n)))
                .collect::<Option<Vec<_>>>()?,
            false => Vec::new(),
        };

        Some(Self {
            clean,
            depth,
            focal_stack,
        })
    }
}

fn find_image(dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|path| path.is_file())
}

fn load_scene(
    scene: usize,
    files: &SceneFiles,
    width: usize,
    height: usize,
    diopter_scale: f32,
) -> Result<Vec<Sample>, SceneLoadError> {
    let pixel_count = width * height;

    let clean = load_rgb_planes(&files.clean, width, height)?;
    let depth: Arc<[f32]> = load_depth(&files.depth, width, height)?.into();
    let mut diopter = vec![0.0; pixel_count];
    diopter_map(&depth, diopter_scale, &mut diopter);
    let diopter: Arc<[f32]> = diopter.into();

    let mut stacks = vec![Vec::with_capacity(pixel_count * files.focal_stack.len()); CHANNELS];
    for path in &files.focal_stack {
        let planes = load_rgb_planes(path, width, height)?;
        for (stack, plane) in stacks.iter_mut().zip(planes) {
            stack.extend(plane);
        }
    }

    Ok(clean
        .into_iter()
        .zip(stacks)
        .enumerate()
        .map(|(channel, (clean, focal_stack))| Sample {
            scene,
            channel,
            clean,
            depth: depth.clone(),
            diopter: diopter.clone(),
            focal_stack,
        })
        .collect())
}

/// Loads an RGB image as three row-major planes in `[0, 1]`.
fn load_rgb_planes(
    path: &Path,
    width: usize,
    height: usize,
) -> Result<[Vec<f32>; CHANNELS], SceneLoadError> {
    let image = image::open(path)?.to_rgb32f();

    if image.width() as usize != width || image.height() as usize != height {
        return Err(SceneLoadError::SizeMismatch {
            path: path.to_path_buf(),
            width: image.width(),
            height: image.height(),
            expected_width: width,
            expected_height: height,
        });
    }

    let mut planes = [
        Vec::with_capacity(width * height),
        Vec::with_capacity(width * height),
        Vec::with_capacity(width * height),
    ];
    for pixel in image.pixels() {
        for (plane, value) in planes.iter_mut().zip(pixel.0) {
            plane.push(value);
        }
    }

    Ok(planes)
}

/// Reads a little-endian `f32` depth map in metres.
fn load_depth(path: &Path, width: usize, height: usize) -> Result<Vec<f32>, SceneLoadError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let len = file.metadata()?.len();
    let expected = (width * height * std::mem::size_of::<f32>()) as u64;

    if len != expected {
        return Err(SceneLoadError::DepthSizeMismatch {
            path: path.to_path_buf(),
            len,
            expected,
        });
    }

    let mut depth = vec![0.0f32; width * height];
    BufReader::new(file).read_f32_into::<LittleEndian>(&mut depth)?;

    Ok(depth)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::Mode;
    use byteorder::WriteBytesExt;
    use image::{ImageBuffer, Rgb};
    use std::{fs::File, io::BufWriter};

    pub const TEST_SIZE: usize = 8;
    pub const TEST_PLANES: usize = 3;

    pub fn write_scene(root: &Path, scene: usize, depth_m: f32) {
        let dir = scene_dir(root, scene);
        std::fs::create_dir_all(&dir).unwrap();
        let size = TEST_SIZE as u32;

        let clean = ImageBuffer::from_fn(size, size, |x, y| {
            Rgb([(x * 30) as u8, (y * 30) as u8, 200u8])
        });
        clean.save(dir.join("clean.png")).unwrap();

        let mut writer = BufWriter::new(File::create(dir.join("depth.bin")).unwrap());
        for _ in 0..TEST_SIZE * TEST_SIZE {
            writer.write_f32::<LittleEndian>(depth_m).unwrap();
        }

        for n in 0..TEST_PLANES {
            let pixel = Rgb([(n * 1000) as u16, 30000u16, 65535u16]);
            let plane = ImageBuffer::from_pixel(size, size, pixel);
            plane.save(dir.join(format!("fs{:03}.tiff", n))).unwrap();
        }
    }

    pub fn test_config(root: &Path, mode: Mode, scenes: usize, eval: usize) -> Config {
        let mut config = Config::for_mode(mode);
        config.data_path = root.to_path_buf();
        config.start_scene = 0;
        config.end_scene = scenes - 1;
        config.num_eval_scenes = eval;
        config.image_height = TEST_SIZE;
        config.image_width = TEST_SIZE;
        config.patch_height = TEST_SIZE / 2;
        config.patch_width = TEST_SIZE / 2;
        config.optics.num_focal_planes = TEST_PLANES;
        config
    }

    #[test]
    fn test_load_splits_channels_and_eval_scenes() {
        let root = tempfile::tempdir().unwrap();
        for scene in 0..3 {
            write_scene(root.path(), scene, 0.5 + scene as f32);
        }

        let config = test_config(root.path(), Mode::Train, 3, 1);
        let dataset = FocalStackDataset::load(&config).unwrap();

        assert_eq!(dataset.samples.len(), 9);
        assert_eq!(dataset.num_train_samples, 6);
        assert_eq!(dataset.num_eval_samples, 3);
        assert_eq!(dataset.valid_scene_indices, vec![0, 1, 2]);
        // 8x8 frames tile into four 4x4 patches
        assert_eq!(dataset.train_patches.len(), 24);
        assert_eq!(dataset.eval_patches.len(), 12);
        assert!(dataset.eval_patches.iter().all(|p| p.sample >= 6));

        let blue = &dataset.samples[2];
        assert_eq!(blue.channel, 2);
        assert!((blue.clean[0] - 200.0 / 255.0).abs() < 1e-5);
        assert_eq!(blue.focal_stack.len(), TEST_PLANES * TEST_SIZE * TEST_SIZE);
        assert!((blue.focal_plane(1, TEST_SIZE * TEST_SIZE)[0] - 1.0).abs() < 1e-5);
        assert!((blue.diopter[0] - 2.0 / 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_missing_scene_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write_scene(root.path(), 0, 1.0);
        write_scene(root.path(), 2, 1.0);
        std::fs::remove_file(scene_dir(root.path(), 2).join("fs001.tiff")).unwrap();

        let config = test_config(root.path(), Mode::Train, 3, 0);
        let dataset = FocalStackDataset::load(&config).unwrap();

        assert_eq!(dataset.valid_scene_indices, vec![0]);
        assert_eq!(dataset.samples.len(), CHANNELS);
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path(), Mode::Test, 2, 0);
        assert!(matches!(
            FocalStackDataset::load(&config),
            Err(SceneLoadError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_truncated_depth_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        write_scene(root.path(), 0, 1.0);
        std::fs::write(scene_dir(root.path(), 0).join("depth.bin"), [0u8; 12]).unwrap();

        let config = test_config(root.path(), Mode::Test, 1, 0);
        assert!(matches!(
            FocalStackDataset::load(&config),
            Err(SceneLoadError::DepthSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_eval_split_needs_training_scenes() {
        let root = tempfile::tempdir().unwrap();
        write_scene(root.path(), 0, 1.0);

        let config = test_config(root.path(), Mode::Train, 1, 1);
        assert!(matches!(
            FocalStackDataset::load(&config),
            Err(SceneLoadError::NotEnoughScenes { eval: 1, loaded: 1 })
        ));
    }
}

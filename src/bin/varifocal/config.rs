use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
#[command(author, version, about = "Train or evaluate the varifocal defocus synthesis network")]
pub struct Cli {
    #[command(subcommand)]
    pub mode: ModeArgs,
}

#[derive(Debug, Subcommand)]
pub enum ModeArgs {
    /// Train the network on the training scene range.
    Train(RunArgs),
    /// Reconstruct held-out focal stacks and report PSNR/SSIM.
    Test(RunArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Root directory holding the `seqNNN` scene folders.
    #[arg(long)]
    pub data_path: Option<PathBuf>,
    /// Run name used for the logs and results directories.
    #[arg(long)]
    pub run_version: Option<String>,
    /// Directory the logs and results directories are created in.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Directory to restore a checkpoint from.
    #[arg(long)]
    pub restore: Option<PathBuf>,
    #[arg(long)]
    pub start_scene: Option<usize>,
    #[arg(long)]
    pub end_scene: Option<usize>,
    /// Number of trailing scenes held out for validation while training.
    #[arg(long)]
    pub eval_scenes: Option<usize>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long, value_enum)]
    pub loss: Option<LossKind>,
    #[arg(long, value_enum)]
    pub format: Option<ExportFormat>,
    /// Skip writing reconstructed images.
    #[arg(long)]
    pub no_export: bool,
    /// Skip the PSNR/SSIM report.
    #[arg(long)]
    pub no_quality: bool,
    /// Scenes have no ground-truth focal stack; test mode only reconstructs.
    #[arg(long)]
    pub no_focal_stack: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mode {
    Train,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
pub enum LossKind {
    /// log10 of the L1 error of intensities and image gradients.
    LogL1,
    /// PSNR style log10 of the L2 error of intensities and image gradients.
    LogL2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
pub enum ExportFormat {
    Tiff16,
    Png8,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Tiff16 => "tiff",
            ExportFormat::Png8 => "png",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpticsConfig {
    /// Number of images in each focal stack.
    pub num_focal_planes: usize,
    pub min_focal_diopter: f32,
    pub max_focal_diopter: f32,
    /// Distance between the camera film plane and the lens plane, metres.
    pub film_distance: f32,
    /// Horizontal field of view, radians.
    pub fov: f32,
    /// Pupil diameter, metres.
    pub pupil_diameter: f32,
    pub diopter_scale: f32,
    pub coc_scale: f32,
}

impl Default for OpticsConfig {
    fn default() -> Self {
        Self {
            num_focal_planes: 40,
            min_focal_diopter: 0.1,
            max_focal_diopter: 4.0,
            film_distance: 0.017,
            fov: 20.0f32.to_radians(),
            pupil_diameter: 0.004,
            diopter_scale: 4.0,
            coc_scale: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub mode: Mode,
    pub data_path: PathBuf,
    pub start_scene: usize,
    pub end_scene: usize,
    pub num_eval_scenes: usize,
    pub version: String,
    pub output_dir: PathBuf,
    pub restore_dir: Option<PathBuf>,

    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub renorm_scale: f64,
    pub renormalize_input: bool,
    pub interleave_rate: i64,
    pub loss: LossKind,
    pub max_to_keep: usize,

    /// Size of the rendered scenes.
    pub image_height: usize,
    pub image_width: usize,
    /// Size of the network input, a patch while training and the full frame while testing.
    pub patch_height: usize,
    pub patch_width: usize,

    pub optics: OpticsConfig,
    /// Pixels cropped from every side before computing PSNR/SSIM.
    pub crop_width: usize,

    pub load_focal_stack: bool,
    pub export_images: bool,
    pub export_format: ExportFormat,
    pub report_quality: bool,
    pub vis_step: usize,
    pub seed: u64,
}

impl Config {
    pub fn for_mode(mode: Mode) -> Self {
        let (start_scene, end_scene, num_eval_scenes) = match mode {
            Mode::Train => (0, 109, 20),
            Mode::Test => (110, 124, 0),
        };
        let (patch_height, patch_width) = match mode {
            Mode::Train => (128, 128),
            Mode::Test => (512, 512),
        };

        Self {
            mode,
            data_path: PathBuf::from("../../../data/"),
            start_scene,
            end_scene,
            num_eval_scenes,
            version: "lvf-new".to_owned(),
            output_dir: PathBuf::from("."),
            restore_dir: None,
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            batch_size: 16,
            epochs: 30,
            renorm_scale: 1.0,
            renormalize_input: true,
            interleave_rate: 2,
            loss: LossKind::LogL1,
            max_to_keep: 5,
            image_height: 512,
            image_width: 512,
            patch_height,
            patch_width,
            optics: OpticsConfig::default(),
            crop_width: 0,
            load_focal_stack: true,
            export_images: true,
            export_format: ExportFormat::Tiff16,
            report_quality: true,
            vis_step: 10,
            seed: 1,
        }
    }

    pub fn from_args(mode: Mode, args: RunArgs) -> Self {
        let mut config = Self::for_mode(mode);

        if let Some(data_path) = args.data_path {
            config.data_path = data_path;
        }
        if let Some(version) = args.run_version {
            config.version = version;
        }
        if let Some(output_dir) = args.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(start_scene) = args.start_scene {
            config.start_scene = start_scene;
        }
        if let Some(end_scene) = args.end_scene {
            config.end_scene = end_scene;
        }
        if let Some(num_eval_scenes) = args.eval_scenes {
            config.num_eval_scenes = num_eval_scenes;
        }
        if let Some(epochs) = args.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = args.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = args.lr {
            config.lr = lr;
        }
        if let Some(loss) = args.loss {
            config.loss = loss;
        }
        if let Some(format) = args.format {
            config.export_format = format;
        }
        config.export_images = !args.no_export;
        config.report_quality = !args.no_quality;
        config.load_focal_stack = !args.no_focal_stack;

        // testing always needs weights, the best model of this run by default
        config.restore_dir = match (args.restore, mode) {
            (Some(dir), _) => Some(dir),
            (None, Mode::Test) => Some(config.select_dir()),
            (None, Mode::Train) => None,
        };

        config
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join(format!("saved_models-{}", self.version))
    }

    pub fn select_dir(&self) -> PathBuf {
        self.logs_dir().join("select")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.output_dir.join(format!("results-{}", self.version))
    }

    pub fn psnr_path(&self) -> PathBuf {
        self.images_dir().join(format!("test_PSNRs-{}.txt", self.version))
    }

    pub fn ssim_path(&self) -> PathBuf {
        self.images_dir().join(format!("test_SSIMs-{}.txt", self.version))
    }

    /// Tag family for the TensorBoard scalars of this run.
    pub fn summary_tag(&self) -> String {
        format!("v-{}", self.version)
    }

    pub fn prepare_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.select_dir())?;
        std::fs::create_dir_all(self.images_dir())?;
        Ok(())
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_defaults() {
        let train = Config::for_mode(Mode::Train);
        assert_eq!((train.start_scene, train.end_scene), (0, 109));
        assert_eq!(train.num_eval_scenes, 20);
        assert_eq!((train.patch_height, train.patch_width), (128, 128));

        let test = Config::for_mode(Mode::Test);
        assert_eq!((test.start_scene, test.end_scene), (110, 124));
        assert_eq!(test.num_eval_scenes, 0);
        assert_eq!(test.patch_height, test.image_height);
    }

    #[test]
    fn test_write_json_dumps_resolved_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::from_args(
            Mode::Train,
            RunArgs {
                run_version: Some("json".to_owned()),
                lr: Some(3e-4),
                ..Default::default()
            },
        );
        config.write_json(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["version"], "json");
        assert_eq!(json["lr"].as_f64(), Some(3e-4));
        assert_eq!(json["batch_size"].as_u64(), Some(config.batch_size as u64));
    }

    #[test]
    fn test_restore_dir_defaults_to_select_in_test_mode() {
        let config = Config::from_args(Mode::Test, RunArgs::default());
        assert_eq!(config.restore_dir, Some(config.select_dir()));

        let config = Config::from_args(Mode::Train, RunArgs::default());
        assert_eq!(config.restore_dir, None);
    }

    #[test]
    fn test_derived_paths() {
        let config = Config::from_args(
            Mode::Test,
            RunArgs {
                run_version: Some("abc".to_owned()),
                ..Default::default()
            },
        );
        assert_eq!(config.logs_dir(), PathBuf::from("./saved_models-abc"));
        assert_eq!(config.select_dir(), PathBuf::from("./saved_models-abc/select"));
        assert!(config.psnr_path().ends_with("test_PSNRs-abc.txt"));
        assert!(config.ssim_path().ends_with("test_SSIMs-abc.txt"));
        assert_eq!(config.summary_tag(), "v-abc");
    }

    #[test]
    fn test_cli_parses_train_flags() {
        let cli = Cli::parse_from(["varifocal", "train", "--epochs", "3", "--loss", "log-l2"]);
        match cli.mode {
            ModeArgs::Train(args) => {
                assert_eq!(args.epochs, Some(3));
                assert_eq!(args.loss, Some(LossKind::LogL2));
            }
            ModeArgs::Test(_) => panic!("expected train mode"),
        }
    }
}

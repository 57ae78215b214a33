use crate::{
    batch::{BatchBuilder, BatchItem},
    config::{Config, ExportFormat},
    data::{patch::Patch, FocalStackDataset, CHANNELS},
    export::{save_rgb, write_quality_report, ExportError},
    metrics::{focal_stack_psnr, focal_stack_ssim, mean},
    net::Net,
};
use log::{debug, info};
use std::{path::PathBuf, time::Instant};
use tch::{nn::ModuleT, Device, Tensor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TesterError {
    #[error("tch error: {0:?}")]
    Tch(#[from] tch::TchError),
    #[error("export error: {0}")]
    Export(#[from] ExportError),
    #[error("testing runs on full {image_width}x{image_height} frames, got {patch_width}x{patch_height} patches")]
    PartialFrame {
        image_width: usize,
        image_height: usize,
        patch_width: usize,
        patch_height: usize,
    },
}

/// Per-scene quality rows, one value per focal plane.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QualityReport {
    pub scenes: Vec<usize>,
    pub psnrs: Vec<Vec<f64>>,
    pub ssims: Vec<Vec<f64>>,
}

#[derive(Debug)]
pub struct Tester<'a> {
    net: &'a Net,
    builder: BatchBuilder,
    images_dir: PathBuf,
    export_images: bool,
    export_format: ExportFormat,
    report_quality: bool,
    crop_width: i64,
    psnr_path: PathBuf,
    ssim_path: PathBuf,
}

impl<'a> Tester<'a> {
    pub fn new(net: &'a Net, builder: BatchBuilder, config: &Config) -> Self {
        Self {
            net,
            builder,
            images_dir: config.images_dir(),
            export_images: config.export_images,
            export_format: config.export_format,
            report_quality: config.report_quality,
            crop_width: config.crop_width as i64,
            psnr_path: config.psnr_path(),
            ssim_path: config.ssim_path(),
        }
    }

    pub fn test(&self, dataset: &FocalStackDataset) -> Result<QualityReport, TesterError> {
        if dataset.patch_shape.height != dataset.image_height
            || dataset.patch_shape.width != dataset.image_width
        {
            return Err(TesterError::PartialFrame {
                image_width: dataset.image_width,
                image_height: dataset.image_height,
                patch_width: dataset.patch_shape.width,
                patch_height: dataset.patch_shape.height,
            });
        }

        let with_truth = dataset.has_focal_stack();
        let mut report = QualityReport::default();

        for (i, &scene) in dataset.valid_scene_indices.iter().enumerate() {
            info!("reconstructing focal stack of scene {}", scene);
            let (recon, truth) = tch::no_grad(|| self.reconstruct(dataset, i));

            if self.export_images {
                self.export(scene, &recon, truth.as_ref())?;
            }

            if let (true, Some(truth)) = (self.report_quality, truth.as_ref()) {
                info!("calculating PSNR and SSIM...");
                report.scenes.push(scene);
                report.ssims.push(focal_stack_ssim(&recon, truth, self.crop_width)?);
                report.psnrs.push(focal_stack_psnr(&recon, truth, self.crop_width)?);
            }
        }

        if self.report_quality && with_truth {
            self.write_report(&report)?;
        }
        info!("test is done!");

        Ok(report)
    }

    /// Runs the network once per colour channel and focal plane of scene `i` and returns
    /// `[N, 3, H, W]` reconstructed and ground-truth stacks.
    fn reconstruct(&self, dataset: &FocalStackDataset, i: usize) -> (Tensor, Option<Tensor>) {
        let planes = dataset.num_focal_planes();
        let empty = || -> Vec<Vec<Tensor>> {
            (0..planes).map(|_| Vec::with_capacity(CHANNELS)).collect()
        };
        let mut recon = empty();
        let mut truth = empty();

        for channel in 0..CHANNELS {
            let patch = Patch {
                sample: i * CHANNELS + channel,
                y: 0,
                x: 0,
            };
            for focal in 0..planes {
                let batch = self.builder.make_batch(dataset, &[BatchItem { patch, focal }]);

                let start = Instant::now();
                let predictions = self.net.forward_t(&batch.inputs, false).to_device(Device::Cpu);
                let sample = &dataset.samples[patch.sample];
                debug!(
                    "scene {}, channel {}, plane {}: {:?}",
                    sample.scene,
                    sample.channel,
                    focal,
                    start.elapsed()
                );

                recon[focal].push(predictions);
                if let Some(targets) = batch.targets {
                    truth[focal].push(targets.to_device(Device::Cpu));
                }
            }
        }

        let stack = |planes: Vec<Vec<Tensor>>| {
            let images: Vec<Tensor> = planes
                .iter()
                .map(|channels| Tensor::cat(channels.as_slice(), 1))
                .collect();
            Tensor::cat(images.as_slice(), 0)
        };
        let with_truth = truth.iter().all(|channels| channels.len() == CHANNELS);

        (stack(recon), with_truth.then(|| stack(truth)))
    }

    fn export(
        &self,
        scene: usize,
        recon: &Tensor,
        truth: Option<&Tensor>,
    ) -> Result<(), TesterError> {
        let size = recon.size();
        let (planes, height, width) = (size[0], size[2] as u32, size[3] as u32);
        let extension = self.export_format.extension();

        for n in 0..planes {
            let path = self
                .images_dir
                .join(format!("recon_fs{:03}_im{:03}.{}", scene, n, extension));
            save_rgb(&to_interleaved(&recon.get(n))?, width, height, self.export_format, path)?;

            if let Some(truth) = truth {
                let path = self
                    .images_dir
                    .join(format!("gt_fs{:03}_im{:03}.{}", scene, n, extension));
                save_rgb(&to_interleaved(&truth.get(n))?, width, height, self.export_format, path)?;
            }
        }

        Ok(())
    }

    fn write_report(&self, report: &QualityReport) -> Result<(), TesterError> {
        write_quality_report(&self.psnr_path, "PSNR", &report.psnrs)?;
        write_quality_report(&self.ssim_path, "SSIM", &report.ssims)?;

        let each = |rows: &[Vec<f64>]| rows.iter().map(|row| mean(row)).collect::<Vec<_>>();
        let all = |rows: &[Vec<f64>]| mean(&rows.concat());
        info!("mean_PSNR_all: {:.4}", all(&report.psnrs));
        info!("mean_PSNR_each: {:.4?}", each(&report.psnrs));
        info!("mean_SSIM_all: {:.4}", all(&report.ssims));
        info!("mean_SSIM_each: {:.4?}", each(&report.ssims));

        Ok(())
    }
}

/// `[3, H, W]` planes to row-major interleaved RGB values.
fn to_interleaved(image: &Tensor) -> Result<Vec<f32>, tch::TchError> {
    Vec::<f32>::try_from(image.permute([1, 2, 0]).contiguous().flatten(0, -1))
}

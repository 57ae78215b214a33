use crate::{
    batch::{BatchBuilder, BatchGenerator},
    checkpoint::{CheckpointError, Checkpointer},
    config::{Config, LossKind},
    data::FocalStackDataset,
    loss::{loss, mse},
    metrics::{mean, psnr, ssim},
    net::Net,
    summary::TrainingSummary,
};
use log::info;
use std::{path::PathBuf, sync::Arc};
use tch::{
    nn::{Adam, ModuleT, Optimizer, OptimizerConfig, VarStore},
    Kind,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("tch error: {0:?}")]
    Tch(#[from] tch::TchError),
    #[error("batch generator error: {0:?}")]
    BatchGenerator(#[from] crate::batch::BatchGeneratorError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("training needs the ground-truth focal stack")]
    MissingFocalStack,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub psnr: f64,
    pub ssim: f64,
}

#[derive(Debug)]
pub struct Trainer {
    vs: VarStore,
    net: Net,
    optimizer: Optimizer,
    builder: BatchBuilder,
    loss_kind: LossKind,
    renorm_scale: f64,
    vis_step: usize,
    summary: TrainingSummary,
    checkpoints: Checkpointer,
    best_checkpoints: Checkpointer,
    best_loss: Option<f64>,
    logs_dir: PathBuf,
    select_dir: PathBuf,
}

impl Trainer {
    pub fn new(
        vs: VarStore,
        net: Net,
        builder: BatchBuilder,
        config: &Config,
    ) -> Result<Self, TrainerError> {
        let optimizer = Adam {
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            ..Default::default()
        }
        .build(&vs, config.lr)?;

        let logs_dir = config.logs_dir();
        let select_dir = config.select_dir();
        let checkpoints = Checkpointer::new(&logs_dir, "model.ckpt", config.max_to_keep)?;
        let best_checkpoints =
            Checkpointer::new(&select_dir, "model-best.ckpt", config.max_to_keep)?;

        Ok(Self {
            vs,
            net,
            optimizer,
            builder,
            loss_kind: config.loss,
            renorm_scale: config.renorm_scale,
            vis_step: config.vis_step.max(1),
            summary: TrainingSummary::new(&logs_dir, config.summary_tag()),
            checkpoints,
            best_checkpoints,
            best_loss: None,
            logs_dir,
            select_dir,
        })
    }

    /// Trains for `epochs` epochs and returns the best validation loss, if any
    /// validation samples exist.
    pub async fn train(
        &mut self,
        epochs: usize,
        batch_size: usize,
        dataset: Arc<FocalStackDataset>,
        seed: u64,
    ) -> Result<Option<f64>, TrainerError> {
        if !dataset.has_focal_stack() {
            return Err(TrainerError::MissingFocalStack);
        }

        let mut batch_generator =
            BatchGenerator::new(self.builder, batch_size, dataset.clone(), seed)?;
        let period = batch_generator.period;
        let eval_step = (period / 5).max(1);
        info!("number of periods per epoch = {}", period);

        for epoch in 0..epochs {
            info!("--training epoch: {}", epoch);

            let mut i = 0;
            loop {
                let batch = batch_generator.next().await?;
                let batch = match batch {
                    Some(batch) => batch,
                    None => break,
                };
                let targets = batch.targets.as_ref().ok_or(TrainerError::MissingFocalStack)?;

                let predictions = self.net.forward_t(&batch.inputs, true);
                let loss = loss(self.loss_kind, &predictions, targets, self.renorm_scale);
                self.optimizer.backward_step(&loss);

                let loss = f64::try_from(loss.detach())?;
                let step = epoch * period + i;
                self.summary.training_loss(loss as f32, step);

                if i == 1 || i == period - 1 || i % self.vis_step == 0 {
                    info!(
                        "training epoch {}, period {}: batch loss (train): {:.6}",
                        epoch, i, loss
                    );
                }

                if i == period - 1 || (i > 0 && i % eval_step == 0) {
                    self.validate(&dataset, epoch, step)?;
                }

                i += 1;
            }
        }

        self.summary.flush();
        info!("training is done!");
        info!("run the command line:\n--> tensorboard --logdir={}", self.logs_dir.display());
        info!("the best model is stored at: {}", self.select_dir.display());

        Ok(self.best_loss)
    }

    fn validate(
        &mut self,
        dataset: &FocalStackDataset,
        epoch: usize,
        step: usize,
    ) -> Result<(), TrainerError> {
        if dataset.eval_patches.is_empty() {
            let path = self.checkpoints.save(&self.vs, epoch)?;
            info!("saved model to {:?}", path);
            return Ok(());
        }

        let evaluation = self.evaluate(dataset)?;
        info!(
            "training epoch {}, step {}, loss (validate): {:.6}",
            epoch, step, evaluation.loss
        );
        info!(
            "training epoch {}, step {}, psnr intensity (validate): {:.6}",
            epoch, step, evaluation.psnr
        );
        info!(
            "training epoch {}, step {}, ssim intensity (validate): {:.6}",
            epoch, step, evaluation.ssim
        );
        self.summary.validation(
            evaluation.loss as f32,
            evaluation.psnr as f32,
            evaluation.ssim as f32,
            step,
        );

        let improved = self.best_loss.map_or(true, |best| evaluation.loss < best);
        if epoch == 0 || improved {
            self.best_loss = Some(evaluation.loss);
            let path = self.best_checkpoints.save(&self.vs, step)?;
            info!("saved best model to {:?}", path);
        }

        Ok(())
    }

    /// Mean loss, PSNR and SSIM over the focal sweeps of every validation patch.
    pub fn evaluate(&self, dataset: &FocalStackDataset) -> Result<Evaluation, TrainerError> {
        let mut losses = Vec::with_capacity(dataset.eval_patches.len());
        let mut psnrs = Vec::with_capacity(dataset.eval_patches.len());
        let mut ssims = Vec::with_capacity(dataset.eval_patches.len());

        tch::no_grad(|| -> Result<(), TrainerError> {
            for &patch in &dataset.eval_patches {
                let batch = self.builder.make_focal_sweep(dataset, patch);
                let targets = batch.targets.as_ref().ok_or(TrainerError::MissingFocalStack)?;
                let predictions = self.net.forward_t(&batch.inputs, false);

                let value = loss(self.loss_kind, &predictions, targets, self.renorm_scale);
                losses.push(f64::try_from(value)?);
                psnrs.push(f64::try_from(psnr(&mse(targets, &predictions), self.renorm_scale))?);
                ssims.push(f64::try_from(ssim(targets, &predictions, 1.0).mean(Kind::Float))?);
            }
            Ok(())
        })?;

        Ok(Evaluation {
            loss: mean(&losses),
            psnr: mean(&psnrs),
            ssim: mean(&ssims),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::latest,
        config::Mode,
        data::tests::{test_config, write_scene},
        net::NetConfig,
        optics::Optics,
    };
    use tch::Device;

    fn trainer(config: &Config) -> Trainer {
        let vs = VarStore::new(Device::Cpu);
        let net = Net::new(&vs.root(), NetConfig::from_config(config));
        let builder = BatchBuilder {
            device: Device::Cpu,
            optics: Optics::new(&config.optics, config.image_width),
            coc_scale: config.optics.coc_scale,
            interleave_rate: config.interleave_rate,
        };
        Trainer::new(vs, net, builder, config).unwrap()
    }

    #[tokio::test]
    async fn test_train_saves_best_model() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for scene in 0..2 {
            write_scene(data.path(), scene, 0.4 + scene as f32);
        }
        let mut config = test_config(data.path(), Mode::Train, 2, 1);
        config.output_dir = out.path().to_path_buf();
        config.prepare_dirs().unwrap();

        let dataset = Arc::new(FocalStackDataset::load(&config).unwrap());
        let mut trainer = trainer(&config);
        let best = trainer.train(1, 4, dataset, 1).await.unwrap();

        assert!(best.unwrap().is_finite());
        assert!(latest(&config.select_dir()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_train_without_validation_saves_epoch_checkpoints() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_scene(data.path(), 0, 0.7);
        let mut config = test_config(data.path(), Mode::Train, 1, 0);
        config.output_dir = out.path().to_path_buf();
        config.prepare_dirs().unwrap();

        let dataset = Arc::new(FocalStackDataset::load(&config).unwrap());
        let mut trainer = trainer(&config);
        let best = trainer.train(2, 8, dataset, 1).await.unwrap();

        assert_eq!(best, None);
        let newest = latest(&config.logs_dir()).unwrap().unwrap();
        assert!(newest.ends_with("model.ckpt-1.ot"));
    }

    #[test]
    fn test_best_model_needs_improvement_after_first_epoch() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for scene in 0..2 {
            write_scene(data.path(), scene, 0.6);
        }
        let mut config = test_config(data.path(), Mode::Train, 2, 1);
        config.output_dir = out.path().to_path_buf();
        config.prepare_dirs().unwrap();

        let dataset = FocalStackDataset::load(&config).unwrap();
        let mut trainer = trainer(&config);
        let best = |step: usize| config.select_dir().join(format!("model-best.ckpt-{}.ot", step));

        // nothing beats this loss, but the first epoch always saves
        trainer.best_loss = Some(f64::NEG_INFINITY);
        trainer.validate(&dataset, 0, 3).unwrap();
        assert!(best(3).is_file());

        trainer.best_loss = Some(f64::NEG_INFINITY);
        trainer.validate(&dataset, 1, 7).unwrap();
        assert!(!best(7).is_file());
        assert_eq!(trainer.best_loss, Some(f64::NEG_INFINITY));

        trainer.best_loss = Some(f64::INFINITY);
        trainer.validate(&dataset, 1, 9).unwrap();
        assert!(best(9).is_file());
        assert!(trainer.best_loss.unwrap().is_finite());
    }

    #[tokio::test]
    async fn test_train_needs_focal_stack() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_scene(data.path(), 0, 0.7);
        let mut config = test_config(data.path(), Mode::Train, 1, 0);
        config.output_dir = out.path().to_path_buf();
        config.load_focal_stack = false;
        config.prepare_dirs().unwrap();

        let dataset = Arc::new(FocalStackDataset::load(&config).unwrap());
        let result = trainer(&config).train(1, 4, dataset, 1).await;

        assert!(matches!(result, Err(TrainerError::MissingFocalStack)));
    }

    #[test]
    fn test_evaluate_reports_bounded_ssim() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for scene in 0..2 {
            write_scene(data.path(), scene, 1.0);
        }
        let mut config = test_config(data.path(), Mode::Train, 2, 1);
        config.output_dir = out.path().to_path_buf();

        let dataset = FocalStackDataset::load(&config).unwrap();
        let evaluation = trainer(&config).evaluate(&dataset).unwrap();

        assert!(evaluation.loss.is_finite());
        assert!(evaluation.psnr.is_finite());
        assert!(evaluation.ssim <= 1.0 + 1e-6);
    }
}

use std::path::Path;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Scalar summaries of a training run, readable with `tensorboard --logdir`.
pub struct TrainingSummary {
    writer: SummaryWriter,
    tag: String,
}

impl TrainingSummary {
    pub fn new(logdir: &Path, tag: impl Into<String>) -> Self {
        let logdir = logdir.to_path_buf();
        Self {
            writer: SummaryWriter::new(&logdir),
            tag: tag.into(),
        }
    }

    pub fn training_loss(&mut self, loss: f32, step: usize) {
        let tag = format!("{}/training loss", self.tag);
        self.writer.add_scalar(&tag, loss, step);
    }

    pub fn validation(&mut self, loss: f32, psnr: f32, ssim: f32, step: usize) {
        let tag = &self.tag;
        self.writer.add_scalar(&format!("validation loss ({})", tag), loss, step);
        self.writer.add_scalar(&format!("validation psnr intensity ({})", tag), psnr, step);
        self.writer.add_scalar(&format!("validation ssim intensity ({})", tag), ssim, step);
        self.writer.flush();
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

impl std::fmt::Debug for TrainingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingSummary")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

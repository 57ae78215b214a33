use crate::{
    data::{
        patch::{crop_into, Patch},
        FocalStackDataset,
    },
    interleave::interleave,
    net::INPUT_DIM,
    optics::Optics,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{sync::Arc, time::Duration};
use tch::{Device, Tensor};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

#[derive(Error, Debug)]
pub enum BatchGeneratorError {
    #[error("invalid batch size: {0}")]
    InvalidBatchSize(usize),
    #[error("dataset has no training patches")]
    EmptyDataset,
    #[error("channel closed unexpectedly")]
    ChannelClosed,
}

/// One network input: a patch rendered at one focal plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    pub patch: Patch,
    pub focal: usize,
}

#[derive(Debug)]
pub struct Batch {
    pub size: usize,
    /// Interleaved network input, `[B, 3 * r^2, H / r, W / r]`.
    pub inputs: Tensor,
    /// Ground-truth defocus intensity, `[B, 1, H, W]`. `None` without a loaded focal stack.
    pub targets: Option<Tensor>,
}

/// Renders network inputs from dataset samples.
#[derive(Debug, Clone, Copy)]
pub struct BatchBuilder {
    pub device: Device,
    pub optics: Optics,
    pub coc_scale: f32,
    pub interleave_rate: i64,
}

impl BatchBuilder {
    pub fn make_batch(&self, dataset: &FocalStackDataset, items: &[BatchItem]) -> Batch {
        let shape = dataset.patch_shape;
        let pixels = shape.pixel_count();
        let has_targets = dataset.has_focal_stack();
        let stride = INPUT_DIM as usize * pixels;

        let mut input_data = vec![0.0f32; items.len() * stride];
        let mut target_data = match has_targets {
            true => vec![0.0f32; items.len() * pixels],
            false => Vec::new(),
        };
        let mut depth = vec![0.0f32; pixels];

        for (index, item) in items.iter().enumerate() {
            let sample = &dataset.samples[item.patch.sample];
            let input = &mut input_data[index * stride..(index + 1) * stride];
            let (intensity, rest) = input.split_at_mut(pixels);
            let (diopter, coc) = rest.split_at_mut(pixels);

            crop_into(&sample.clean, dataset.image_width, &item.patch, shape, intensity);
            crop_into(&sample.diopter, dataset.image_width, &item.patch, shape, diopter);
            crop_into(&sample.depth, dataset.image_width, &item.patch, shape, &mut depth);
            self.optics.coc_map(
                &depth,
                dataset.focal_planes[item.focal],
                self.coc_scale,
                coc,
            );

            if has_targets {
                crop_into(
                    sample.focal_plane(item.focal, dataset.pixel_count()),
                    dataset.image_width,
                    &item.patch,
                    shape,
                    &mut target_data[index * pixels..(index + 1) * pixels],
                );
            }
        }

        let (h, w) = (shape.height as i64, shape.width as i64);
        let inputs = Tensor::from_slice(&input_data)
            .reshape([items.len() as i64, INPUT_DIM, h, w])
            .to_device(self.device);
        let targets = has_targets.then(|| {
            Tensor::from_slice(&target_data)
                .reshape([items.len() as i64, 1, h, w])
                .to_device(self.device)
        });

        Batch {
            size: items.len(),
            inputs: interleave(&inputs, self.interleave_rate),
            targets,
        }
    }

    /// All focal planes of one patch, in focal order.
    pub fn make_focal_sweep(&self, dataset: &FocalStackDataset, patch: Patch) -> Batch {
        let items: Vec<BatchItem> = (0..dataset.num_focal_planes())
            .map(|focal| BatchItem { patch, focal })
            .collect();
        self.make_batch(dataset, &items)
    }
}

/// Full batches per epoch over `items` inputs, at least one.
pub fn batches_per_epoch(items: usize, batch_size: usize) -> usize {
    (items / batch_size).max(1)
}

#[derive(Debug)]
pub struct BatchGenerator {
    pub rx: Receiver<Option<Batch>>,
    pub tx_stop: Option<tokio::sync::oneshot::Sender<()>>,
    pub period: usize,
}

impl BatchGenerator {
    pub fn new(
        builder: BatchBuilder,
        batch_size: usize,
        dataset: Arc<FocalStackDataset>,
        seed: u64,
    ) -> Result<Self, BatchGeneratorError> {
        if batch_size == 0 {
            return Err(BatchGeneratorError::InvalidBatchSize(batch_size));
        }

        if dataset.train_patches.is_empty() || dataset.num_focal_planes() == 0 {
            return Err(BatchGeneratorError::EmptyDataset);
        }

        let items: Vec<BatchItem> = dataset
            .train_patches
            .iter()
            .flat_map(|&patch| {
                (0..dataset.num_focal_planes()).map(move |focal| BatchItem { patch, focal })
            })
            .collect();
        let period = batches_per_epoch(items.len(), batch_size);

        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let (tx_stop, rx_stop) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let rng = StdRng::seed_from_u64(seed);
            batch_generator_loop(builder, batch_size, dataset, items, rng, tx, rx_stop).await;
        });

        Ok(Self {
            rx,
            tx_stop: Some(tx_stop),
            period,
        })
    }

    /// Returns the next batch in the generator.
    ///
    /// It returns `None` once `period` batches of the epoch have been produced.
    /// The following call starts a freshly shuffled epoch.
    pub async fn next(&mut self) -> Result<Option<Batch>, BatchGeneratorError> {
        self.rx.recv().await.ok_or(BatchGeneratorError::ChannelClosed)
    }
}

impl Drop for BatchGenerator {
    fn drop(&mut self) {
        if let Some(tx) = self.tx_stop.take() {
            let _ = tx.send(());
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

async fn batch_generator_loop(
    builder: BatchBuilder,
    batch_size: usize,
    dataset: Arc<FocalStackDataset>,
    mut items: Vec<BatchItem>,
    mut rng: StdRng,
    tx: Sender<Option<Batch>>,
    mut rx_stop: tokio::sync::oneshot::Receiver<()>,
) {
    let batch_size = batch_size.min(items.len());
    let period = batches_per_epoch(items.len(), batch_size);
    items.shuffle(&mut rng);
    let mut index = 0;

    loop {
        let batch = match index < period {
            true => {
                let chunk = &items[index * batch_size..(index + 1) * batch_size];
                index += 1;
                Some(builder.make_batch(&dataset, chunk))
            }
            false => {
                index = 0;
                items.shuffle(&mut rng);
                None
            }
        };

        tokio::select! {
            result = tx.send(batch) => {
                if let Err(err) = result {
                    log::error!("error sending batch: {err:#?}");
                    break;
                }
            }
            _ = &mut rx_stop => {
                break;
            }
        }
    }
}

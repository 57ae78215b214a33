mod batch;
mod checkpoint;
mod config;
mod data;
mod export;
mod interleave;
mod loss;
mod metrics;
mod net;
mod optics;
mod summary;
mod tester;
mod trainer;

use batch::BatchBuilder;
use clap::Parser;
use config::{Cli, Config, Mode, ModeArgs};
use data::FocalStackDataset;
use log::info;
use net::{Net, NetConfig};
use optics::Optics;
use std::sync::Arc;
use tch::{nn::VarStore, Device};
use tester::Tester;
use trainer::Trainer;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let config = match Cli::parse().mode {
        ModeArgs::Train(args) => Config::from_args(Mode::Train, args),
        ModeArgs::Test(args) => Config::from_args(Mode::Test, args),
    };
    config.prepare_dirs()?;
    config.write_json(config.logs_dir().join("config.json"))?;

    tch::manual_seed(config.seed as i64);

    let device = if tch::Cuda::is_available() {
        info!("CUDA is available, using CUDA");
        Device::cuda_if_available()
    } else if tch::utils::has_mps() {
        info!("MPS is available, using MPS");
        Device::Mps
    } else {
        info!("no accelerator available, using CPU");
        Device::Cpu
    };

    info!("loading data...");
    let dataset = FocalStackDataset::load(&config)?;
    info!(
        "numTrainSamples={}, numEvalSamples={}",
        dataset.num_train_samples, dataset.num_eval_samples
    );

    let mut vs = VarStore::new(device);
    let net = Net::new(&vs.root(), NetConfig::from_config(&config));
    if let Some(dir) = &config.restore_dir {
        checkpoint::restore(&mut vs, dir)?;
    }

    let builder = BatchBuilder {
        device,
        optics: Optics::new(&config.optics, config.image_width),
        coc_scale: config.optics.coc_scale,
        interleave_rate: config.interleave_rate,
    };

    match config.mode {
        Mode::Train => {
            info!("training mode");
            let mut trainer = Trainer::new(vs, net, builder, &config)?;
            let best = trainer
                .train(config.epochs, config.batch_size, Arc::new(dataset), config.seed)
                .await?;
            if let Some(best) = best {
                info!("best validation loss: {:.6}", best);
            }
        }
        Mode::Test => {
            info!("test mode");
            Tester::new(&net, builder, &config).test(&dataset)?;
        }
    }

    Ok(())
}

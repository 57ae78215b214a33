use crate::{config::Config, interleave::deinterleave};
use tch::{
    nn::{
        batch_norm2d, conv2d, BatchNorm, BatchNormConfig, Conv2D, ConvConfig, Init, ModuleT, Path,
    },
    Kind, Tensor,
};

pub const NUM_LAYERS: usize = 12;
pub const FILTER_WIDTH: i64 = 3;
pub const HIDDEN_CHANNELS: i64 = 128;
/// Colour intensity, diopter and circle of confusion.
pub const INPUT_DIM: i64 = 3;
/// Defocused intensity.
pub const OUTPUT_DIM: i64 = 1;

const WEIGHT_SCALE: f64 = 0.25;
const BIAS_STDDEV: f64 = 0.01;
const BN_EPS: f64 = 1e-3;

#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub interleave_rate: i64,
    /// Subtracted from the input when set.
    pub input_offset: Option<f64>,
}

impl NetConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interleave_rate: config.interleave_rate,
            input_offset: config
                .renormalize_input
                .then_some(0.5 * config.renorm_scale),
        }
    }
}

#[derive(Debug)]
struct Layer {
    conv: Conv2D,
    bn: BatchNorm,
}

/// Fully convolutional defocus network working on interleaved inputs,
/// `[B, 3 * r^2, H / r, W / r] -> [B, 1, H, W]`.
#[derive(Debug)]
pub struct Net {
    config: NetConfig,
    layers: Vec<Layer>,
}

impl Net {
    pub fn new(vs: &Path, config: NetConfig) -> Self {
        let block = config.interleave_rate * config.interleave_rate;
        let layers = (0..NUM_LAYERS)
            .map(|i| {
                let in_dim = if i == 0 { INPUT_DIM * block } else { HIDDEN_CHANNELS };
                let out_dim = if i == NUM_LAYERS - 1 {
                    OUTPUT_DIM * block
                } else {
                    HIDDEN_CHANNELS
                };
                let bound = WEIGHT_SCALE * (6.0 / (in_dim + out_dim) as f64).sqrt();
                let conv = conv2d(
                    vs / format!("conv{}", i),
                    in_dim,
                    out_dim,
                    FILTER_WIDTH,
                    ConvConfig {
                        padding: FILTER_WIDTH / 2,
                        ws_init: Init::Uniform {
                            lo: -bound,
                            up: bound,
                        },
                        bs_init: Init::Randn {
                            mean: 0.0,
                            stdev: BIAS_STDDEV,
                        },
                        ..Default::default()
                    },
                );
                // truncated normal: resample draws beyond two standard deviations
                if let Some(bs) = &conv.bs {
                    truncate_normal(bs, BIAS_STDDEV);
                }
                let bn = batch_norm2d(
                    vs / format!("bn{}", i),
                    out_dim,
                    BatchNormConfig {
                        eps: BN_EPS,
                        ..Default::default()
                    },
                );
                Layer { conv, bn }
            })
            .collect();

        Self { config, layers }
    }
}

fn truncate_normal(xs: &Tensor, stdev: f64) {
    tch::no_grad(|| loop {
        let outliers = xs.abs().gt(2.0 * stdev);
        if outliers.sum(Kind::Int64).int64_value(&[]) == 0 {
            break;
        }
        let resampled = xs.randn_like() * stdev;
        let kept = resampled.where_self(&outliers, xs);
        xs.shallow_clone().copy_(&kept);
    });
}

/// Layer `i` adds the output of layer `i - 3` to its input for odd `i >= 3`.
pub fn has_skip(i: usize) -> bool {
    i >= 3 && i % 2 == 1
}

impl ModuleT for Net {
    /// Batch norm never switches to batch statistics: it normalises with its
    /// initial moving mean and variance in both modes, so it acts as a learned
    /// per-channel affine map.
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let xs = match self.config.input_offset {
            Some(offset) => xs - offset,
            None => xs.shallow_clone(),
        };
        let mut outputs: Vec<Tensor> = Vec::with_capacity(self.layers.len());

        for (i, layer) in self.layers.iter().enumerate() {
            let input = match i {
                0 => xs.shallow_clone(),
                _ if has_skip(i) => &outputs[i - 1] + &outputs[i - 3],
                _ => outputs[i - 1].shallow_clone(),
            };
            let ys = input.apply(&layer.conv).apply_t(&layer.bn, false);
            let ys = match i == self.layers.len() - 1 {
                true => ys.tanh(),
                false => ys.elu(),
            };
            outputs.push(ys);
        }

        // tanh output renormalised to [0, 1]
        let ys = &outputs[outputs.len() - 1] * 0.5 + 0.5;
        deinterleave(&ys, self.config.interleave_rate)
    }
}

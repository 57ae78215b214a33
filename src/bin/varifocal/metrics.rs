use tch::{Kind, Tensor};

const SSIM_WINDOW: i64 = 11;
const SSIM_SIGMA: f64 = 1.5;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

/// `20 log10(scale) - 10 log10(mse)`.
pub fn psnr(mse: &Tensor, scale: f64) -> Tensor {
    mse.log10() * -10.0 + 20.0 * scale.log10()
}

fn gaussian_window(size: i64, sigma: f64, channels: i64, xs: &Tensor) -> Tensor {
    let center = (size - 1) as f64 / 2.0;
    let weights: Vec<f32> = (0..size)
        .map(|i| (-((i as f64 - center).powi(2)) / (2.0 * sigma * sigma)).exp() as f32)
        .collect();
    let g = Tensor::from_slice(&weights);
    let g = &g / g.sum(Kind::Float);
    g.unsqueeze(1)
        .matmul(&g.unsqueeze(0))
        .view([1, 1, size, size])
        .repeat([channels, 1, 1, 1])
        .to_kind(xs.kind())
        .to_device(xs.device())
}

/// Structural similarity of `[B, C, H, W]` images, one value per image.
///
/// Gaussian weighted window with valid padding, averaged over channels and
/// positions. Images narrower than the 11 pixel window use a window as wide
/// as the image.
pub fn ssim(a: &Tensor, b: &Tensor, max_val: f64) -> Tensor {
    let size = a.size();
    let (channels, h, w) = (size[1], size[2], size[3]);
    let window = SSIM_WINDOW.min(h).min(w);
    let kernel = gaussian_window(window, SSIM_SIGMA, channels, a);
    let filter = |xs: &Tensor| xs.conv2d(&kernel, None::<Tensor>, [1, 1], [0, 0], [1, 1], channels);

    let c1 = (SSIM_K1 * max_val).powi(2);
    let c2 = (SSIM_K2 * max_val).powi(2);

    let mu_a = filter(a);
    let mu_b = filter(b);
    let mu_aa = &mu_a * &mu_a;
    let mu_bb = &mu_b * &mu_b;
    let mu_ab = &mu_a * &mu_b;
    let sigma_aa = filter(&(a * a)) - &mu_aa;
    let sigma_bb = filter(&(b * b)) - &mu_bb;
    let sigma_ab = filter(&(a * b)) - &mu_ab;

    let luminance = (&mu_ab * 2.0 + c1) / (mu_aa + mu_bb + c1);
    let contrast_structure = (sigma_ab * 2.0 + c2) / (sigma_aa + sigma_bb + c2);

    (luminance * contrast_structure).mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float)
}

fn crop(xs: &Tensor, width: i64) -> Tensor {
    match width {
        0 => xs.shallow_clone(),
        _ => {
            let size = xs.size();
            xs.narrow(2, width, size[2] - 2 * width)
                .narrow(3, width, size[3] - 2 * width)
        }
    }
}

/// PSNR of every slice of `[N, C, H, W]` focal stacks holding values in `[0, 1]`.
pub fn focal_stack_psnr(
    recon: &Tensor,
    truth: &Tensor,
    crop_width: i64,
) -> Result<Vec<f64>, tch::TchError> {
    let (recon, truth) = (crop(recon, crop_width), crop(truth, crop_width));
    let mse = (recon - truth)
        .square()
        .mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float);
    Vec::<f64>::try_from(psnr(&mse, 1.0).to_kind(Kind::Double))
}

/// SSIM of every slice of `[N, C, H, W]` focal stacks holding values in `[0, 1]`.
pub fn focal_stack_ssim(
    recon: &Tensor,
    truth: &Tensor,
    crop_width: i64,
) -> Result<Vec<f64>, tch::TchError> {
    let (recon, truth) = (crop(recon, crop_width), crop(truth, crop_width));
    Vec::<f64>::try_from(ssim(&recon, &truth, 1.0).to_kind(Kind::Double))
}

pub fn mean(values: &[f64]) -> f64 {
    match values.len() {
        0 => f64::NAN,
        n => values.iter().sum::<f64>() / n as f64,
    }
}

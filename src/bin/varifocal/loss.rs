use crate::{config::LossKind, metrics::psnr};
use tch::{Kind, Tensor};

/// Forward differences of `[B, C, H, W]` images along x and y.
pub fn image_gradients(xs: &Tensor) -> (Tensor, Tensor) {
    let (h, w) = (xs.size()[2], xs.size()[3]);
    let dx = xs.narrow(3, 1, w - 1) - xs.narrow(3, 0, w - 1);
    let dy = xs.narrow(2, 1, h - 1) - xs.narrow(2, 0, h - 1);
    (dx, dy)
}

fn mean_abs(a: &Tensor, b: &Tensor) -> Tensor {
    (a - b).abs().mean(Kind::Float)
}

pub fn mse(a: &Tensor, b: &Tensor) -> Tensor {
    (a - b).square().mean(Kind::Float)
}

pub fn loss(kind: LossKind, predictions: &Tensor, labels: &Tensor, scale: f64) -> Tensor {
    let (labels_dx, labels_dy) = image_gradients(labels);
    let (preds_dx, preds_dy) = image_gradients(predictions);

    match kind {
        LossKind::LogL1 => {
            let intensity = mean_abs(labels, predictions).log10();
            let grad_x = mean_abs(&labels_dx, &preds_dx).log10();
            let grad_y = mean_abs(&labels_dy, &preds_dy).log10();
            intensity + (grad_x + grad_y) * 0.5
        }
        LossKind::LogL2 => {
            let offset = 20.0 * scale.log10();
            let intensity = psnr(&mse(labels, predictions), scale);
            let grad_x = mse(&labels_dx, &preds_dx).log10() * 10.0 - offset;
            let grad_y = mse(&labels_dy, &preds_dy).log10() * 10.0 - offset;
            -intensity + (grad_x + grad_y) * 0.5
        }
    }
}

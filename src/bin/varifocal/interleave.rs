use tch::Tensor;

/// Folds every `rate x rate` pixel block into channels:
/// `[B, C, H, W] -> [B, C * rate^2, H / rate, W / rate]`.
pub fn interleave(xs: &Tensor, rate: i64) -> Tensor {
    match rate {
        1 => xs.shallow_clone(),
        _ => xs.pixel_unshuffle(rate),
    }
}

/// Inverse of [`interleave`].
pub fn deinterleave(xs: &Tensor, rate: i64) -> Tensor {
    match rate {
        1 => xs.shallow_clone(),
        _ => xs.pixel_shuffle(rate),
    }
}

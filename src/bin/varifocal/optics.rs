use crate::config::OpticsConfig;

/// Closest depth, in metres, that is inverted into diopters.
pub const MIN_DEPTH: f32 = 1e-3;

/// `n` evenly spaced focal distances from `lo` to `hi` diopters, both inclusive.
pub fn focal_planes(n: usize, lo: f32, hi: f32) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => {
            let step = (hi - lo) / (n - 1) as f32;
            (0..n).map(|i| lo + step * i as f32).collect()
        }
    }
}

fn to_diopter(depth: f32) -> f32 {
    1.0 / depth.max(MIN_DEPTH)
}

/// Writes `1 / depth / diopter_scale` for every pixel.
pub fn diopter_map(depth: &[f32], diopter_scale: f32, out: &mut [f32]) {
    for (out, &depth) in out.iter_mut().zip(depth) {
        *out = to_diopter(depth) / diopter_scale;
    }
}

/// Thin lens camera that rendered the focal stacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optics {
    pub pupil_diameter: f32,
    pub film_distance: f32,
    pub fov: f32,
    /// Width of the rendered frame in pixels. Patches keep its pixel pitch.
    pub image_width: usize,
}

impl Optics {
    pub fn new(config: &OpticsConfig, image_width: usize) -> Self {
        Self {
            pupil_diameter: config.pupil_diameter,
            film_distance: config.film_distance,
            fov: config.fov,
            image_width,
        }
    }

    /// Size of one pixel on the film, in metres.
    pub fn pixel_pitch(&self) -> f32 {
        2.0 * self.film_distance * (self.fov / 2.0).tan() / self.image_width as f32
    }

    /// Diameter of the circle of confusion in pixels for a point at `depth` metres
    /// while the lens is focused at `focal_diopter`.
    ///
    /// With the film fixed at `s'` and the lens power chosen to focus at
    /// `focal_diopter`, the blur on the film is `D * s' * |1/depth - focal_diopter|`.
    pub fn coc_pixels(&self, depth: f32, focal_diopter: f32) -> f32 {
        let blur = self.pupil_diameter
            * self.film_distance
            * (to_diopter(depth) - focal_diopter).abs();
        blur / self.pixel_pitch()
    }

    /// Writes the circle of confusion map divided by `coc_scale`.
    pub fn coc_map(&self, depth: &[f32], focal_diopter: f32, coc_scale: f32, out: &mut [f32]) {
        for (out, &depth) in out.iter_mut().zip(depth) {
            *out = self.coc_pixels(depth, focal_diopter) / coc_scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn optics() -> Optics {
        Optics::new(&OpticsConfig::default(), 512)
    }

    #[test]
    fn test_focal_planes_match_reference_stack() {
        let planes = focal_planes(40, 0.1, 4.0);
        assert_eq!(planes.len(), 40);
        assert_relative_eq!(planes[0], 0.1);
        assert_relative_eq!(planes[1], 0.2, epsilon = 1e-6);
        assert_relative_eq!(planes[39], 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_focal_planes_degenerate() {
        assert!(focal_planes(0, 0.1, 4.0).is_empty());
        assert_eq!(focal_planes(1, 0.5, 4.0), vec![0.5]);
    }

    #[test]
    fn test_coc_vanishes_at_focus() {
        let optics = optics();
        assert_relative_eq!(optics.coc_pixels(0.5, 2.0), 0.0, epsilon = 1e-5);
        assert!(optics.coc_pixels(0.25, 2.0) > 0.0);
    }

    #[test]
    fn test_coc_is_symmetric_in_diopters() {
        let optics = optics();
        let near = optics.coc_pixels(1.0 / 3.0, 2.0);
        let far = optics.coc_pixels(1.0, 2.0);
        assert_relative_eq!(near, far, epsilon = 1e-4);
    }

    #[test]
    fn test_coc_pixel_value() {
        // 1 diopter of defocus: 0.004 m pupil over a 512 px, 20 degree frame
        let optics = optics();
        let expected = 0.004 * 512.0 / (2.0 * (10.0f32).to_radians().tan());
        assert_relative_eq!(optics.coc_pixels(1.0, 2.0), expected, epsilon = 1e-3);
    }

    #[test]
    fn test_coc_map_applies_scale() {
        let optics = optics();
        let depth = [1.0, 0.5, 0.0];
        let mut out = [0.0; 3];
        optics.coc_map(&depth, 2.0, 30.0, &mut out);

        assert_relative_eq!(out[0], optics.coc_pixels(1.0, 2.0) / 30.0, epsilon = 1e-5);
        assert_relative_eq!(out[1], 0.0, epsilon = 1e-5);
        assert!(out[2].is_finite());
    }

    #[test]
    fn test_diopter_map_clamps_zero_depth() {
        let mut out = [0.0; 2];
        diopter_map(&[0.5, 0.0], 4.0, &mut out);
        assert_relative_eq!(out[0], 0.5);
        assert_relative_eq!(out[1], 1.0 / MIN_DEPTH / 4.0);
    }
}

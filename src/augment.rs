//! Random geometric augmentation for training images.
//!
//! Every transform is one affine map around the image centre (rotation, shear, zoom,
//! shift) followed by an optional horizontal mirror. Output pixels are pulled back
//! into the source image and bilinearly sampled; coordinates falling outside are
//! resolved with the configured [`FillMode`].

use burn::config::Config;
use image::{Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// How pixels outside the source image are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillMode {
    /// Repeat the closest edge pixel: `aaaa|abcd|dddd`.
    Nearest,
    /// Use `fill_value`.
    Constant,
    /// Mirror at the border: `dcba|abcd|dcba`.
    Reflect,
    /// Tile the image: `abcd|abcd|abcd`.
    Wrap,
}

#[derive(Config, Debug)]
pub struct AugmentationConfig {
    #[config(default = true)]
    pub enabled: bool,

    /// Maximum rotation, in degrees, either direction.
    #[config(default = 20.0)]
    pub rotation_range: f32,

    /// Maximum horizontal shift as a fraction of the width.
    #[config(default = 0.2)]
    pub width_shift_range: f32,

    /// Maximum vertical shift as a fraction of the height.
    #[config(default = 0.2)]
    pub height_shift_range: f32,

    /// Maximum shear angle, in degrees.
    #[config(default = 0.2)]
    pub shear_range: f32,

    /// Zoom factors are drawn from `[1 - zoom_range, 1 + zoom_range]` per axis.
    #[config(default = 0.2)]
    pub zoom_range: f32,

    #[config(default = true)]
    pub horizontal_flip: bool,

    #[config(default = "FillMode::Nearest")]
    pub fill_mode: FillMode,

    /// Intensity in `[0, 1]` used by [`FillMode::Constant`].
    #[config(default = 0.0)]
    pub fill_value: f32,
}

impl AugmentationConfig {
    pub fn disabled() -> Self {
        Self::new().with_enabled(false)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let ranges = [
            ("augmentation.rotation_range", self.rotation_range),
            ("augmentation.width_shift_range", self.width_shift_range),
            ("augmentation.height_shift_range", self.height_shift_range),
            ("augmentation.shear_range", self.shear_range),
            ("augmentation.zoom_range", self.zoom_range),
        ];
        for (field, value) in ranges {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigurationError::InvalidValue {
                    field,
                    reason: format!("must be a non-negative number, got {value}"),
                });
            }
        }
        if self.zoom_range >= 1.0 {
            return Err(ConfigurationError::InvalidValue {
                field: "augmentation.zoom_range",
                reason: format!("must be below 1, got {}", self.zoom_range),
            });
        }
        if !(0.0..=1.0).contains(&self.fill_value) {
            return Err(ConfigurationError::InvalidValue {
                field: "augmentation.fill_value",
                reason: format!("must lie in [0, 1], got {}", self.fill_value),
            });
        }
        Ok(())
    }

    /// Draws one random transform for an image of the given size.
    pub fn sample<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> Transform {
        if !self.enabled {
            return Transform::identity();
        }

        let rotation = symmetric(rng, self.rotation_range).to_radians();
        let shear = symmetric(rng, self.shear_range).to_radians();
        let shift_x = symmetric(rng, self.width_shift_range) * width as f32;
        let shift_y = symmetric(rng, self.height_shift_range) * height as f32;
        let (zoom_x, zoom_y) = if self.zoom_range > 0.0 {
            (
                rng.gen_range(1.0 - self.zoom_range..=1.0 + self.zoom_range),
                rng.gen_range(1.0 - self.zoom_range..=1.0 + self.zoom_range),
            )
        } else {
            (1.0, 1.0)
        };
        let flip = self.horizontal_flip && rng.gen_bool(0.5);

        Transform {
            rotation,
            shear,
            shift: (shift_x, shift_y),
            zoom: (zoom_x, zoom_y),
            flip,
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// One concrete augmentation: angles in radians, shift in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub rotation: f32,
    pub shear: f32,
    pub shift: (f32, f32),
    pub zoom: (f32, f32),
    pub flip: bool,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shear: 0.0,
            shift: (0.0, 0.0),
            zoom: (1.0, 1.0),
            flip: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        !self.flip
            && self.rotation == 0.0
            && self.shear == 0.0
            && self.shift == (0.0, 0.0)
            && self.zoom == (1.0, 1.0)
    }

    /// Output-to-input matrix: rotation * shear * zoom.
    fn matrix(&self) -> [[f32; 2]; 2] {
        let (sin_r, cos_r) = self.rotation.sin_cos();
        let (sin_s, cos_s) = self.shear.sin_cos();
        let (zx, zy) = self.zoom;

        // rotation * shear
        let rs = [
            [cos_r, -cos_r * sin_s - sin_r * cos_s],
            [sin_r, -sin_r * sin_s + cos_r * cos_s],
        ];

        [[rs[0][0] * zx, rs[0][1] * zy], [rs[1][0] * zx, rs[1][1] * zy]]
    }

    pub fn apply(&self, image: &RgbImage, fill_mode: FillMode, fill_value: f32) -> RgbImage {
        if self.is_identity() {
            return image.clone();
        }

        let (width, height) = image.dimensions();
        let center_x = (width as f32 - 1.0) / 2.0;
        let center_y = (height as f32 - 1.0) / 2.0;
        let m = self.matrix();
        let fill = (fill_value * 255.0).clamp(0.0, 255.0);

        RgbImage::from_fn(width, height, |x, y| {
            let x = if self.flip { width - 1 - x } else { x };
            let dx = x as f32 - center_x;
            let dy = y as f32 - center_y;

            let source_x = m[0][0] * dx + m[0][1] * dy + center_x + self.shift.0;
            let source_y = m[1][0] * dx + m[1][1] * dy + center_y + self.shift.1;

            bilinear(image, source_x, source_y, fill_mode, fill)
        })
    }
}

/// Maps a possibly out-of-range coordinate back into `[0, size)`.
fn resolve(coord: i64, size: u32, mode: FillMode) -> Option<u32> {
    let size = size as i64;
    if (0..size).contains(&coord) {
        return Some(coord as u32);
    }

    let resolved = match mode {
        FillMode::Constant => return None,
        FillMode::Nearest => coord.clamp(0, size - 1),
        FillMode::Wrap => coord.rem_euclid(size),
        FillMode::Reflect => {
            let period = coord.rem_euclid(2 * size);
            if period < size {
                period
            } else {
                2 * size - 1 - period
            }
        }
    };

    Some(resolved as u32)
}

fn bilinear(image: &RgbImage, x: f32, y: f32, mode: FillMode, fill: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let ax = x - x0;
    let ay = y - y0;

    let corners = [
        (0, 0, (1.0 - ax) * (1.0 - ay)),
        (1, 0, ax * (1.0 - ay)),
        (0, 1, (1.0 - ax) * ay),
        (1, 1, ax * ay),
    ];

    let mut acc = [0.0f32; 3];
    for (dx, dy, weight) in corners {
        if weight == 0.0 {
            continue;
        }
        let px = resolve(x0 as i64 + dx, width, mode);
        let py = resolve(y0 as i64 + dy, height, mode);
        match (px, py) {
            (Some(px), Some(py)) => {
                let pixel = image.get_pixel(px, py);
                for (channel, value) in acc.iter_mut().enumerate() {
                    *value += weight * pixel[channel] as f32;
                }
            }
            _ => acc.iter_mut().for_each(|value| *value += weight * fill),
        }
    }

    Rgb(acc.map(|value| value.round().clamp(0.0, 255.0) as u8))
}

/// Applies randomly drawn transforms with a fixed configuration.
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn apply<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let (width, height) = image.dimensions();
        let transform = self.config.sample(rng, width, height);
        transform.apply(image, self.config.fill_mode, self.config.fill_value)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 7]))
    }

    #[test]
    fn resolve_modes() {
        assert_eq!(resolve(-1, 4, FillMode::Nearest), Some(0));
        assert_eq!(resolve(5, 4, FillMode::Nearest), Some(3));
        assert_eq!(resolve(-1, 4, FillMode::Wrap), Some(3));
        assert_eq!(resolve(4, 4, FillMode::Wrap), Some(0));
        assert_eq!(resolve(-1, 4, FillMode::Reflect), Some(0));
        assert_eq!(resolve(4, 4, FillMode::Reflect), Some(3));
        assert_eq!(resolve(6, 4, FillMode::Reflect), Some(1));
        assert_eq!(resolve(-1, 4, FillMode::Constant), None);
        assert_eq!(resolve(2, 4, FillMode::Constant), Some(2));
    }

    #[test]
    fn identity_keeps_pixels() {
        let image = gradient(8, 6);
        let out = Transform::identity().apply(&image, FillMode::Nearest, 0.0);
        assert_eq!(out, image);
    }

    #[test]
    fn flip_mirrors_rows() {
        let image = gradient(8, 6);
        let transform = Transform {
            flip: true,
            ..Transform::identity()
        };
        let out = transform.apply(&image, FillMode::Nearest, 0.0);
        for y in 0..6 {
            for x in 0..8 {
                assert_eq!(out.get_pixel(x, y), image.get_pixel(7 - x, y));
            }
        }
    }

    #[test]
    fn whole_image_shift_with_constant_fill() {
        let image = gradient(8, 8);
        let transform = Transform {
            shift: (100.0, 0.0),
            ..Transform::identity()
        };
        let out = transform.apply(&image, FillMode::Constant, 1.0);
        assert!(out.pixels().all(|pixel| pixel.0 == [255, 255, 255]));
    }

    #[test]
    fn integer_shift_moves_content() {
        let image = gradient(8, 8);
        let transform = Transform {
            shift: (2.0, 0.0),
            ..Transform::identity()
        };
        let out = transform.apply(&image, FillMode::Nearest, 0.0);
        assert_eq!(out.get_pixel(0, 3), image.get_pixel(2, 3));
        assert_eq!(out.get_pixel(7, 3), image.get_pixel(7, 3));
    }

    #[test]
    fn disabled_config_samples_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let transform = AugmentationConfig::disabled().sample(&mut rng, 32, 32);
        assert!(transform.is_identity());
    }

    #[test]
    fn same_seed_same_output() {
        let image = gradient(16, 16);
        let augmenter = Augmenter::new(AugmentationConfig::new().with_rotation_range(40.0));

        let first = augmenter.apply(&image, &mut ChaCha8Rng::seed_from_u64(9));
        let second = augmenter.apply(&image, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(first, second);
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        assert!(AugmentationConfig::new().validate().is_ok());
        assert!(AugmentationConfig::new().with_zoom_range(1.5).validate().is_err());
        assert!(AugmentationConfig::new().with_rotation_range(-1.0).validate().is_err());
        assert!(AugmentationConfig::new().with_fill_value(2.0).validate().is_err());
    }
}

use burn::prelude::*;
use image::{imageops::FilterType, GrayImage, Luma};
use ndarray::Array3;
use rand::{rngs::StdRng, Rng};

/// Number of label fields stored per sample: x, y, w, h, angle.
pub const LABEL_FIELDS: usize = 5;

pub type Label = [f32; LABEL_FIELDS];

/// Image and label perturbation applied to every sample before it is batched.
///
/// Implementations must keep the label consistent with the geometric changes
/// they apply to the image.
pub trait Augment: Sync {
    fn augment(&self, image: GrayImage, label: Label, rng: &mut StdRng) -> (GrayImage, Label);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Augment for Identity {
    fn augment(&self, image: GrayImage, label: Label, _rng: &mut StdRng) -> (GrayImage, Label) {
        (image, label)
    }
}

#[derive(Config, Debug)]
pub struct AugmentConfig {
    /// Maximum translation in pixels along each axis.
    #[config(default = 4)]
    pub max_shift: u32,

    #[config(default = 0.5)]
    pub flip_probability: f64,

    /// Maximum brightness offset in gray levels.
    #[config(default = 10.0)]
    pub brightness: f32,

    /// Amplitude of the uniform per-pixel noise in gray levels.
    #[config(default = 5.0)]
    pub noise: f32,
}

impl AugmentConfig {
    pub fn init(&self) -> NoiseAugmenter {
        NoiseAugmenter {
            max_shift: self.max_shift as i64,
            flip_probability: self.flip_probability.clamp(0.0, 1.0),
            brightness: self.brightness.abs(),
            noise: self.noise.abs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NoiseAugmenter {
    max_shift: i64,
    flip_probability: f64,
    brightness: f32,
    noise: f32,
}

impl Augment for NoiseAugmenter {
    fn augment(&self, image: GrayImage, label: Label, rng: &mut StdRng) -> (GrayImage, Label) {
        let (image, label) = if rng.gen_bool(self.flip_probability) {
            flip_horizontal(&image, label)
        } else {
            (image, label)
        };

        let (image, label) = if self.max_shift > 0 {
            let dx = rng.gen_range(-self.max_shift..=self.max_shift);
            let dy = rng.gen_range(-self.max_shift..=self.max_shift);
            translate(&image, label, dx, dy)
        } else {
            (image, label)
        };

        let offset = if self.brightness > 0.0 {
            rng.gen_range(-self.brightness..=self.brightness)
        } else {
            0.0
        };

        let mut image = image;
        for pixel in image.pixels_mut() {
            let jitter = if self.noise > 0.0 {
                rng.gen_range(-self.noise..=self.noise)
            } else {
                0.0
            };
            let value = pixel.0[0] as f32 + offset + jitter;
            pixel.0[0] = value.round().clamp(0.0, 255.0) as u8;
        }

        (image, label)
    }
}

/// Mirrors the image around its vertical axis; the box center moves to
/// `width - x` and the angle changes sign.
pub fn flip_horizontal(image: &GrayImage, label: Label) -> (GrayImage, Label) {
    let [x, y, w, h, angle] = label;
    let flipped = image::imageops::flip_horizontal(image);

    (flipped, [image.width() as f32 - x, y, w, h, -angle])
}

/// Shifts the image content by `(dx, dy)` pixels, replicating border pixels
/// into the uncovered area.
pub fn translate(image: &GrayImage, label: Label, dx: i64, dy: i64) -> (GrayImage, Label) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return (image.clone(), label);
    }

    let shifted = GrayImage::from_fn(width, height, |x, y| {
        let src_x = (x as i64 - dx).clamp(0, width as i64 - 1) as u32;
        let src_y = (y as i64 - dy).clamp(0, height as i64 - 1) as u32;
        *image.get_pixel(src_x, src_y)
    });

    let [x, y, w, h, angle] = label;
    (shifted, [x + dx as f32, y + dy as f32, w, h, angle])
}

/// Scales the positional label fields from a `from` sized image to a `to`
/// sized one.
pub fn rescale_label(label: Label, from: (u32, u32), to: (u32, u32)) -> Label {
    let sx = to.0 as f32 / from.0.max(1) as f32;
    let sy = to.1 as f32 / from.1.max(1) as f32;
    let [x, y, w, h, angle] = label;

    [x * sx, y * sy, w * sx, h * sy, angle]
}

/// Resizes to the network input size, scales pixels to `[0, 1]` and repeats
/// the gray plane `channels` times. Output shape is `[channels, height, width]`.
pub fn change_channel(
    image: &GrayImage,
    label: Label,
    channels: usize,
    width: usize,
    height: usize,
) -> (Array3<f32>, Label) {
    let from = image.dimensions();
    let to = (width as u32, height as u32);

    let resized;
    let (image, label) = if from == to {
        (image, label)
    } else {
        resized = image::imageops::resize(image, to.0, to.1, FilterType::Triangle);
        (&resized, rescale_label(label, from, to))
    };

    let planes = Array3::from_shape_fn((channels, height, width), |(_, y, x)| {
        let Luma([value]) = *image.get_pixel(x as u32, y as u32);
        value as f32 / 255.
    });

    (planes, label)
}

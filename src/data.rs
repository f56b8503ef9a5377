use std::path::Path;

use burn::{data::dataloader::batcher::Batcher, prelude::*};
use image::{imageops::FilterType, DynamicImage, ImageError, ImageReader, RgbImage};

use crate::error::DataPipelineError;

pub const CHANNEL_COUNT: usize = 3;

/// Extensions picked up when scanning class folders.
pub const IMAGE_EXTENSIONS: [&str; 9] = [
    "png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff", "gif", "webp",
];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// A preprocessed sample: CHW pixels scaled to `[0, 1]` and its label index.
#[derive(Debug, Clone)]
pub struct WasteItem {
    pub image: Vec<f32>,
    pub label: usize,
}

pub fn load_image(path: &Path, dataset: &str) -> Result<DynamicImage, DataPipelineError> {
    let unreadable = |source: ImageError| DataPipelineError::Unreadable {
        dataset: dataset.to_string(),
        path: path.to_path_buf(),
        source,
    };

    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| unreadable(ImageError::IoError(e)))?
        .decode()
        .map_err(unreadable)
}

/// Resizes to `img_dim x img_dim` RGB regardless of the native resolution.
pub fn resize(image: &DynamicImage, img_dim: usize) -> RgbImage {
    image
        .resize_exact(img_dim as u32, img_dim as u32, FilterType::Triangle)
        .to_rgb8()
}

/// Planar `[3, height, width]` layout with intensities divided by 255.
pub fn to_chw(image: &RgbImage) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; CHANNEL_COUNT * plane];

    for (i, pixel) in image.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        data[i] = r as f32 / 255.;
        data[plane + i] = g as f32 / 255.;
        data[2 * plane + i] = b as f32 / 255.;
    }

    data
}

/// The preprocessing contract shared by training and inference.
pub fn preprocess(image: &DynamicImage, img_dim: usize) -> Vec<f32> {
    to_chw(&resize(image, img_dim))
}

#[derive(Clone, Debug)]
pub struct WasteBatch<B: Backend> {
    /// `[batch, 3, img_dim, img_dim]`
    pub images: Tensor<B, 4>,
    /// One-hot `[batch, classes]`
    pub targets: Tensor<B, 2>,
}

#[derive(Clone)]
pub struct WasteBatcher<B: Backend> {
    device: B::Device,
    img_dim: usize,
    classes: usize,
}

impl<B: Backend> WasteBatcher<B> {
    pub fn new(device: B::Device, img_dim: usize, classes: usize) -> Self {
        Self {
            device,
            img_dim,
            classes,
        }
    }

    pub fn images(&self, items: &[WasteItem]) -> Tensor<B, 4> {
        let data: Vec<f32> = items
            .iter()
            .flat_map(|item| item.image.iter().copied())
            .collect();
        let shape = [items.len(), CHANNEL_COUNT, self.img_dim, self.img_dim];

        Tensor::from_data(
            TensorData::new(data, shape).convert::<B::FloatElem>(),
            &self.device,
        )
    }
}

impl<B: Backend> Batcher<WasteItem, WasteBatch<B>> for WasteBatcher<B> {
    fn batch(&self, items: Vec<WasteItem>) -> WasteBatch<B> {
        let images = self.images(&items);

        let mut one_hot = vec![0.0f32; items.len() * self.classes];
        for (row, item) in items.iter().enumerate() {
            debug_assert!(item.label < self.classes);
            one_hot[row * self.classes + item.label] = 1.0;
        }
        let targets = Tensor::from_data(
            TensorData::new(one_hot, [items.len(), self.classes]).convert::<B::FloatElem>(),
            &self.device,
        );

        WasteBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use image::Rgb;

    use super::*;

    type TestBackend = NdArray<f32>;

    #[test]
    fn preprocess_shape_and_range() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(37, 19, |x, y| {
            Rgb([(x * 7) as u8, 255, (y * 13) as u8])
        }));

        let resized = resize(&image, 24);
        assert_eq!(resized.dimensions(), (24, 24));

        let data = preprocess(&image, 24);
        assert_eq!(data.len(), 24 * 24 * CHANNEL_COUNT);
        assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
        // green plane is saturated everywhere
        assert!(data[24 * 24..2 * 24 * 24].iter().all(|v| *v == 1.0));
    }

    #[test]
    fn one_hot_targets() {
        let device = Default::default();
        let batcher = WasteBatcher::<TestBackend>::new(device, 2, 6);
        let items = (0..4)
            .map(|label| WasteItem {
                image: vec![0.5; CHANNEL_COUNT * 4],
                label,
            })
            .collect();

        let batch = batcher.batch(items);
        assert_eq!(batch.images.dims(), [4, 3, 2, 2]);
        assert_eq!(batch.targets.dims(), [4, 6]);

        let rows = batch.targets.clone().sum_dim(1).into_data().to_vec::<f32>().unwrap();
        assert!(rows.iter().all(|sum| *sum == 1.0));

        let hot = batch.targets.argmax(1).into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(hot, vec![0, 1, 2, 3]);
    }

    #[test]
    fn missing_image_is_a_pipeline_error() {
        let err = load_image(Path::new("/nonexistent/glass_1.jpg"), "trashnet").unwrap_err();
        assert!(matches!(err, DataPipelineError::Unreadable { .. }));
        assert!(err.to_string().contains("glass_1.jpg"));
    }

    #[test]
    fn extension_filter() {
        assert!(is_image_file(Path::new("a/b.JPG")));
        assert!(is_image_file(Path::new("a/b.png")));
        assert!(!is_image_file(Path::new("a/b.txt")));
        assert!(!is_image_file(Path::new("a/README")));
    }
}

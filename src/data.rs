use anyhow::{anyhow, bail, Context, Result};
use burn::{
    data::dataset::Dataset,
    tensor::{backend::Backend, Tensor},
};
use image::{imageops::FilterType, ImageReader, RgbImage};
use rand::{seq::SliceRandom, Rng};
use rayon::prelude::*;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::augmentation::{AugmentationConfig, RandomTransform};

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

#[derive(Debug, Clone, PartialEq)]
pub struct ImageItem {
    pub image_path: PathBuf,
    pub label: usize,
}

#[derive(Debug, Clone)]
pub struct CatDataset {
    pub items: Vec<ImageItem>,
}

impl CatDataset {
    /// Collects images from `root/<class_dirs[label]>/`, sorted by file name
    /// within each class.
    pub fn scan<P: AsRef<Path>>(root: P, class_dirs: &[&str]) -> Result<Self> {
        let root = root.as_ref();
        info!("Scanning dataset at {}", root.display());

        let mut items = Vec::new();
        for (label, class_dir) in class_dirs.iter().enumerate() {
            let files = Self::collect_image_files(&root.join(class_dir))?;
            info!("  class {label} ({class_dir}): {} images", files.len());
            items.extend(files.into_iter().map(|image_path| ImageItem { image_path, label }));
        }

        if items.is_empty() {
            return Err(anyhow!("No images found under {}", root.display()));
        }
        Ok(Self { items })
    }

    fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("Failed to read class directory {}", dir.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(ext) = path.extension() {
                let ext = ext.to_string_lossy().to_lowercase();
                if IMAGE_EXTENSIONS.iter().any(|&e| e == ext) {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Per class, the first `floor(fraction * n)` files become validation
    /// samples and the remainder training samples.
    pub fn split(&self, validation_fraction: f64) -> (Self, Self) {
        let mut train = Vec::new();
        let mut valid = Vec::new();

        let mut labels: Vec<usize> = self.items.iter().map(|item| item.label).collect();
        labels.sort_unstable();
        labels.dedup();

        for label in labels {
            let class_items: Vec<&ImageItem> =
                self.items.iter().filter(|item| item.label == label).collect();
            let n_valid = (class_items.len() as f64 * validation_fraction).floor() as usize;
            valid.extend(class_items[..n_valid].iter().map(|&item| item.clone()));
            train.extend(class_items[n_valid..].iter().map(|&item| item.clone()));
        }

        info!(
            "Split (validation {:.0}%): {} train, {} validation",
            validation_fraction * 100.0,
            train.len(),
            valid.len()
        );
        (Self { items: train }, Self { items: valid })
    }

    pub fn class_counts(&self) -> [usize; 2] {
        let mut counts = [0; 2];
        for item in &self.items {
            if let Some(count) = counts.get_mut(item.label) {
                *count += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }
}

impl Dataset<ImageItem> for CatDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.get(index)
    }

    fn len(&self) -> usize {
        self.len()
    }
}

/// Restartable sequence of index batches; each call to [`BatchSequence::epoch`]
/// reshuffles the full index range.
#[derive(Debug, Clone, Copy)]
pub struct BatchSequence {
    len: usize,
    batch_size: usize,
}

impl BatchSequence {
    pub fn new(len: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be > 0");
        }
        Ok(Self { len, batch_size })
    }

    pub fn num_batches(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    pub fn epoch<R: Rng + ?Sized>(&self, rng: &mut R) -> impl Iterator<Item = Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len).collect();
        order.shuffle(rng);
        let batch_size = self.batch_size;
        (0..self.num_batches()).map(move |i| {
            let start = i * batch_size;
            let end = (start + batch_size).min(order.len());
            order[start..end].to_vec()
        })
    }
}

pub fn load_resized(path: &Path, height: usize, width: usize) -> Result<RgbImage> {
    let img = ImageReader::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("Failed to sniff image format of {}", path.display()))?
        .decode()
        .with_context(|| format!("Failed to decode image {}", path.display()))?;
    Ok(img
        .resize_exact(width as u32, height as u32, FilterType::Nearest)
        .to_rgb8())
}

/// Augments `img` and lays it out channel-first with the rescale applied.
pub fn to_chw(img: &RgbImage, transform: &RandomTransform, rescale: f32) -> Vec<f32> {
    let augmented = transform.apply(img);
    let (width, height) = augmented.dimensions();
    let frame_size = (width * height) as usize;

    let mut chw = vec![0.0; frame_size * 3];
    for (i, pixel) in augmented.pixels().enumerate() {
        chw[i] = (pixel[0] * rescale).clamp(0.0, 1.0);
        chw[i + frame_size] = (pixel[1] * rescale).clamp(0.0, 1.0);
        chw[i + 2 * frame_size] = (pixel[2] * rescale).clamp(0.0, 1.0);
    }
    chw
}

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 3, height, width]`, values in `[0, 1]`.
    pub images: Tensor<B, 4>,
    /// `[batch, 1]`, 1.0 for cats.
    pub targets: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct CatBatcher<B: Backend> {
    pub image_height: usize,
    pub image_width: usize,
    pub augmentation: AugmentationConfig,
    pub device: B::Device,
}

impl<B: Backend> CatBatcher<B> {
    pub fn new(
        image_height: usize,
        image_width: usize,
        augmentation: AugmentationConfig,
        device: B::Device,
    ) -> Self {
        Self {
            image_height,
            image_width,
            augmentation,
            device,
        }
    }

    /// Decodes, augments and stacks `items`. Random draws are taken from `rng`
    /// in item order before decoding fans out across threads.
    pub fn batch<R: Rng + ?Sized>(&self, items: &[ImageItem], rng: &mut R) -> Result<ImageBatch<B>> {
        let batch_size = items.len();
        if batch_size == 0 {
            return Err(anyhow!("cannot build an empty batch"));
        }

        let transforms: Vec<RandomTransform> = items
            .iter()
            .map(|_| {
                self.augmentation
                    .sample(rng, self.image_height as u32, self.image_width as u32)
            })
            .collect();

        let frames: Vec<Vec<f32>> = items
            .par_iter()
            .zip(transforms.par_iter())
            .map(|(item, transform)| -> Result<Vec<f32>> {
                let img = load_resized(&item.image_path, self.image_height, self.image_width)?;
                Ok(to_chw(&img, transform, self.augmentation.rescale))
            })
            .collect::<Result<_>>()?;
        debug!("decoded batch of {batch_size} images");

        let images_data: Vec<f32> = frames.into_iter().flatten().collect();
        let targets_data: Vec<f32> = items.iter().map(|item| item.label as f32).collect();

        let images = Tensor::<B, 1>::from_floats(&*images_data, &self.device).reshape([
            batch_size,
            3,
            self.image_height,
            self.image_width,
        ]);
        let targets =
            Tensor::<B, 1>::from_floats(&*targets_data, &self.device).reshape([batch_size, 1]);

        Ok(ImageBatch { images, targets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;
    use rand::{rngs::StdRng, SeedableRng};
    use std::collections::HashSet;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn write_png(path: &Path, color: [u8; 3]) {
        let img = RgbImage::from_fn(12, 10, |x, y| {
            Rgb([color[0], color[1].wrapping_add((x * y) as u8), color[2]])
        });
        img.save(path).unwrap();
    }

    fn dataset_tree(n_other: usize, n_cat: usize) -> TempDir {
        let root = TempDir::new().unwrap();
        for (dir, n, color) in [("others", n_other, [10, 20, 30]), ("cats", n_cat, [250, 240, 5])] {
            let class_dir = root.path().join(dir);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..n {
                write_png(&class_dir.join(format!("{dir}_{i:03}.png")), color);
            }
        }
        root
    }

    #[test]
    fn scan_labels_and_filters_files() {
        let root = dataset_tree(3, 2);
        fs::write(root.path().join("cats").join("notes.txt"), b"not an image").unwrap();
        fs::create_dir(root.path().join("cats").join("nested")).unwrap();

        let dataset = CatDataset::scan(root.path(), &["others", "cats"]).unwrap();
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.class_counts(), [3, 2]);
        assert!(dataset.items[..3].iter().all(|item| item.label == 0));
        assert!(dataset.items[3..].iter().all(|item| item.label == 1));
    }

    #[test]
    fn missing_class_directory_fails() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("others")).unwrap();
        assert!(CatDataset::scan(root.path(), &["others", "cats"]).is_err());
    }

    fn synthetic(n_other: usize, n_cat: usize) -> CatDataset {
        let mut items = Vec::new();
        for i in 0..n_other {
            items.push(ImageItem { image_path: PathBuf::from(format!("others/{i:04}.jpg")), label: 0 });
        }
        for i in 0..n_cat {
            items.push(ImageItem { image_path: PathBuf::from(format!("cats/{i:04}.jpg")), label: 1 });
        }
        CatDataset { items }
    }

    #[test]
    fn split_reserves_a_fifth_without_overlap() {
        let dataset = synthetic(400, 100);
        let (train, valid) = dataset.split(0.2);

        assert_eq!(valid.len(), 100);
        assert_eq!(train.len(), 400);
        assert_eq!(valid.class_counts(), [80, 20]);

        let train_paths: HashSet<_> = train.items.iter().map(|i| &i.image_path).collect();
        let valid_paths: HashSet<_> = valid.items.iter().map(|i| &i.image_path).collect();
        assert!(train_paths.is_disjoint(&valid_paths));
        assert_eq!(train_paths.len() + valid_paths.len(), dataset.len());
    }

    #[test]
    fn split_rounds_validation_down_per_class() {
        let (train, valid) = synthetic(7, 3).split(0.2);
        assert_eq!(valid.class_counts(), [1, 0]);
        assert_eq!(train.class_counts(), [6, 3]);
    }

    #[test]
    fn sequence_covers_every_sample_each_pass() {
        let seq = BatchSequence::new(10, 4).unwrap();
        assert_eq!(seq.num_batches(), 3);

        let mut rng = StdRng::seed_from_u64(0);
        let mut orders = Vec::new();
        for _ in 0..3 {
            let batches: Vec<Vec<usize>> = seq.epoch(&mut rng).collect();
            assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
            let mut seen: Vec<usize> = batches.concat();
            orders.push(seen.clone());
            seen.sort_unstable();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
        assert!(orders.windows(2).any(|w| w[0] != w[1]), "passes should reshuffle");
    }

    #[test]
    fn zero_batch_size_is_an_error() {
        let err = BatchSequence::new(10, 0).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn resize_keeps_source_pixel_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stripes.png");
        let img = RgbImage::from_fn(4, 4, |x, _| if x < 2 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) });
        img.save(&path).unwrap();

        let resized = load_resized(&path, 8, 8).unwrap();
        assert_eq!(resized.dimensions(), (8, 8));
        assert!(resized
            .pixels()
            .all(|p| *p == Rgb([255, 0, 0]) || *p == Rgb([0, 0, 255])));
        assert_eq!(*resized.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert_eq!(*resized.get_pixel(7, 7), Rgb([0, 0, 255]));
    }

    #[test]
    fn batches_are_rescaled_into_unit_range() {
        let root = dataset_tree(2, 2);
        let dataset = CatDataset::scan(root.path(), &["others", "cats"]).unwrap();
        let batcher = CatBatcher::<TestBackend>::new(16, 16, AugmentationConfig::default(), Default::default());
        let mut rng = StdRng::seed_from_u64(9);

        let batch = batcher.batch(&dataset.items, &mut rng).unwrap();
        assert_eq!(batch.images.dims(), [4, 3, 16, 16]);
        assert_eq!(batch.targets.dims(), [4, 1]);

        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(pixels.iter().any(|&v| v > 0.5), "bright cat pixels should survive rescaling");

        let targets = batch.targets.into_data().to_vec::<f32>().unwrap();
        assert_eq!(targets, vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn corrupt_image_is_fatal() {
        let root = dataset_tree(1, 1);
        let broken = root.path().join("cats").join("broken.png");
        fs::write(&broken, b"definitely not a png").unwrap();

        let batcher = CatBatcher::<TestBackend>::new(8, 8, AugmentationConfig::default(), Default::default());
        let item = ImageItem { image_path: broken, label: 1 };
        let err = batcher.batch(&[item], &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(format!("{err:#}").contains("broken.png"));
    }
}

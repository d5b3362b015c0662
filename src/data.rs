use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::ImageReader;
use ndarray::Array3;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::{debug, info};

use crate::{
    augment::{change_channel, Augment, Label, LABEL_FIELDS},
    error::{Error, Result},
};

/// One row of the data list: an image path followed by the raw label fields
/// `x, y, w, h, a`. Labels are parsed only when the sample is batched.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image_path: String,
    pub fields: [String; LABEL_FIELDS],
}

impl Sample {
    pub fn label(&self) -> Result<Label> {
        let mut label = [0.0; LABEL_FIELDS];
        for (value, field) in label.iter_mut().zip(&self.fields) {
            *value = field.trim().parse().map_err(|_| Error::InvalidLabel {
                image: self.image_path.clone(),
                value: field.clone(),
            })?;
        }

        Ok(label)
    }
}

pub struct SampleDataset {
    pub dataset: InMemDataset<Sample>,
}

impl Dataset<Sample> for SampleDataset {
    fn get(&self, index: usize) -> Option<Sample> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl SampleDataset {
    /// Reads a comma-separated `image_path,x,y,w,h,a` list. Extra fields are
    /// ignored, blank lines skipped.
    pub fn load(data_path: &Path) -> Result<Self> {
        if !data_path.is_file() {
            return Err(Error::DataListNotFound(data_path.to_path_buf()));
        }

        let content = fs::read_to_string(data_path)?;
        let mut items = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let values: Vec<&str> = line.split(',').collect();
            if values.len() < LABEL_FIELDS + 1 {
                return Err(Error::MalformedRow {
                    path: data_path.to_path_buf(),
                    line: index + 1,
                    fields: values.len(),
                });
            }

            items.push(Sample {
                image_path: values[0].to_string(),
                fields: std::array::from_fn(|i| values[i + 1].to_string()),
            });
        }

        debug!("loaded {} samples from {}", items.len(), data_path.display());

        Ok(Self {
            dataset: InMemDataset::new(items),
        })
    }
}

/// A decoded, augmented and normalized sample.
#[derive(Debug, Clone)]
pub struct Example {
    /// `[channels, height, width]`, values in `[0, 1]`.
    pub image: Array3<f32>,
    /// The first `label_len` label fields.
    pub label: Vec<f32>,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub items: Vec<Example>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn images(&self) -> impl Iterator<Item = &Array3<f32>> {
        self.items.iter().map(|item| &item.image)
    }

    pub fn labels(&self) -> impl Iterator<Item = &[f32]> {
        self.items.iter().map(|item| item.label.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.name.as_str())
    }
}

/// Shape the generator brings every image into.
#[derive(Debug, Clone, Copy)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

/// Shuffles the sample list at the start of every pass and hands out batches
/// of at most `batch_size` examples.
pub struct Batchizer {
    dataset: SampleDataset,
    batch_size: usize,
    batch_count: usize,
    rng: StdRng,
}

impl Batchizer {
    pub fn new(data_path: &Path, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_string()));
        }

        let dataset = SampleDataset::load(data_path)?;
        let batch_count = dataset.len().div_ceil(batch_size);

        info!(
            "{}: {} samples, {} batches of up to {}",
            data_path.display(),
            dataset.len(),
            batch_count,
            batch_size
        );

        Ok(Self {
            dataset,
            batch_size,
            batch_count,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Number of batches in one pass over the data.
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Endless batch stream: each pass over the data is reshuffled, the last
    /// batch of a pass may be short. Ends immediately for an empty list.
    pub fn batches<'a, A: Augment>(
        &'a mut self,
        augmenter: &'a A,
        label_len: usize,
        shape: ImageShape,
    ) -> Batches<'a, A> {
        Batches {
            batchizer: self,
            augmenter,
            label_len,
            shape,
            order: Vec::new(),
            cursor: 0,
            endless: true,
        }
    }

    /// A single shuffled pass over the data.
    pub fn epoch<'a, A: Augment>(
        &'a mut self,
        augmenter: &'a A,
        label_len: usize,
        shape: ImageShape,
    ) -> Batches<'a, A> {
        Batches {
            endless: false,
            ..self.batches(augmenter, label_len, shape)
        }
    }
}

pub struct Batches<'a, A> {
    batchizer: &'a mut Batchizer,
    augmenter: &'a A,
    label_len: usize,
    shape: ImageShape,
    order: Vec<usize>,
    cursor: usize,
    endless: bool,
}

impl<A: Augment> Batches<'_, A> {
    fn reshuffle(&mut self) {
        self.order = (0..self.batchizer.dataset.len()).collect();
        self.order.shuffle(&mut self.batchizer.rng);
        self.cursor = 0;
    }

    fn load(&mut self, indices: &[usize]) -> Result<Batch> {
        let mut jobs: Vec<(Sample, u64)> = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self
                .batchizer
                .dataset
                .get(index)
                .ok_or(Error::EmptyDataset)?;
            jobs.push((sample, self.batchizer.rng.gen()));
        }

        let augmenter = self.augmenter;
        let label_len = self.label_len;
        let shape = self.shape;

        let items = jobs
            .into_par_iter()
            .map(|(sample, seed)| {
                let mut rng = StdRng::seed_from_u64(seed);
                load_example(&sample, augmenter, label_len, shape, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Batch { items })
    }
}

impl<A: Augment> Iterator for Batches<'_, A> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batchizer.dataset.is_empty() {
            return None;
        }

        if self.order.is_empty() {
            self.reshuffle();
        } else if self.cursor >= self.order.len() {
            if !self.endless {
                return None;
            }
            self.reshuffle();
        }

        let end = (self.cursor + self.batchizer.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        Some(self.load(&indices))
    }
}

/// Reads one image as 8-bit grayscale, augments it together with its label
/// and normalizes it to the requested shape.
pub fn load_example<A: Augment + ?Sized>(
    sample: &Sample,
    augmenter: &A,
    label_len: usize,
    shape: ImageShape,
    rng: &mut StdRng,
) -> Result<Example> {
    let image = read_grayscale(Path::new(&sample.image_path))?;
    let label = sample.label()?;

    let (image, label) = augmenter.augment(image, label, rng);
    let (image, label) = change_channel(&image, label, shape.channels, shape.width, shape.height);

    Ok(Example {
        image,
        label: label[..label_len.min(LABEL_FIELDS)].to_vec(),
        name: sample.image_path.clone(),
    })
}

pub fn read_grayscale(path: &Path) -> Result<image::GrayImage> {
    let to_error = |source| Error::Image {
        path: path.display().to_string(),
        source,
    };

    let image = ImageReader::open(path)?.decode().map_err(to_error)?;
    Ok(image.to_luma8())
}

/// Normalizes standalone images (no label) for prediction.
pub fn load_images(paths: &[PathBuf], shape: ImageShape) -> Result<Vec<Array3<f32>>> {
    paths
        .into_par_iter()
        .map(|path| {
            let image = read_grayscale(path)?;
            let (planes, _) = change_channel(
                &image,
                [0.0; LABEL_FIELDS],
                shape.channels,
                shape.width,
                shape.height,
            );
            Ok(planes)
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct RegressionBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2>,
    pub names: Vec<String>,
}

#[derive(Clone)]
pub struct RegressionBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> RegressionBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// Stacks `[C, H, W]` planes into a `[N, C, H, W]` tensor.
    pub fn images(&self, images: &[Array3<f32>]) -> Tensor<B, 4> {
        let images = images
            .iter()
            .map(|image| {
                let [c, h, w] = [image.shape()[0], image.shape()[1], image.shape()[2]];
                let data = TensorData::new(image.iter().copied().collect::<Vec<f32>>(), [c, h, w])
                    .convert::<B::FloatElem>();
                Tensor::<B, 3>::from_data(data, &self.device).reshape([1, c, h, w])
            })
            .collect();

        Tensor::cat(images, 0)
    }
}

impl<B: Backend> Batcher<Example, RegressionBatch<B>> for RegressionBatcher<B> {
    fn batch(&self, items: Vec<Example>) -> RegressionBatch<B> {
        let label_len = items.first().map_or(0, |item| item.label.len());

        let images = items
            .iter()
            .map(|item| item.image.clone())
            .collect::<Vec<_>>();
        let images = self.images(&images);

        let targets = items
            .iter()
            .flat_map(|item| item.label.iter().copied())
            .collect::<Vec<f32>>();
        let targets = TensorData::new(targets, [items.len(), label_len]).convert::<B::FloatElem>();
        let targets = Tensor::<B, 2>::from_data(targets, &self.device);

        let names = items.into_iter().map(|item| item.name).collect();

        RegressionBatch {
            images,
            targets,
            names,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use burn::backend::NdArray;
    use image::{GrayImage, Luma};

    use super::*;
    use crate::augment::Identity;

    type TestBackend = NdArray<f32>;

    pub const SHAPE: ImageShape = ImageShape {
        channels: 1,
        height: 8,
        width: 8,
    };

    /// Writes `count` small gray images plus a matching list file.
    pub fn fixture(dir: &Path, count: usize) -> PathBuf {
        let list_path = dir.join("labels.csv");
        let mut list = fs::File::create(&list_path).unwrap();

        for i in 0..count {
            let image_path = dir.join(format!("img_{i}.png"));
            GrayImage::from_pixel(8, 8, Luma([(i * 20) as u8]))
                .save(&image_path)
                .unwrap();
            writeln!(
                list,
                "{},{},{},4,2,{}",
                image_path.display(),
                i,
                i + 1,
                i * 10
            )
            .unwrap();
        }

        list_path
    }

    #[test]
    fn missing_list_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = Batchizer::new(&dir.path().join("nope.csv"), 4);

        assert!(matches!(result, Err(Error::DataListNotFound(_))));
    }

    #[test]
    fn short_row_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        fs::write(&path, "a.png,1,2,3,4,5\n\nb.png,1,2\n").unwrap();

        let result = SampleDataset::load(&path);
        assert!(matches!(
            result,
            Err(Error::MalformedRow {
                line: 3,
                fields: 3,
                ..
            })
        ));
    }

    #[test]
    fn batch_count_rounds_up() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 7);

        assert_eq!(Batchizer::new(&list, 3).unwrap().batch_count(), 3);
        assert_eq!(Batchizer::new(&list, 7).unwrap().batch_count(), 1);
        assert_eq!(Batchizer::new(&list, 10).unwrap().batch_count(), 1);
        assert!(Batchizer::new(&list, 0).is_err());
    }

    #[test]
    fn pass_visits_every_sample_once_with_short_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 7);
        let mut batchizer = Batchizer::new(&list, 3).unwrap().with_seed(1);

        let batches = batchizer
            .epoch(&Identity, 4, SHAPE)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let sizes: Vec<_> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let mut names: Vec<_> = batches
            .iter()
            .flat_map(|batch| batch.names().map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 7);
    }

    #[test]
    fn endless_stream_reshuffles_between_passes() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 6);
        let mut batchizer = Batchizer::new(&list, 6).unwrap().with_seed(3);

        let passes: Vec<Vec<String>> = batchizer
            .batches(&Identity, 4, SHAPE)
            .take(8)
            .map(|batch| batch.unwrap().names().map(str::to_string).collect())
            .collect();

        assert!(passes.iter().all(|pass| pass.len() == 6));
        assert!(passes.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn same_seed_gives_same_order() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 5);

        let order = |seed| {
            let mut batchizer = Batchizer::new(&list, 5).unwrap().with_seed(seed);
            let batch = batchizer.epoch(&Identity, 4, SHAPE).next().unwrap().unwrap();
            batch.names().map(str::to_string).collect::<Vec<_>>()
        };

        assert_eq!(order(11), order(11));
    }

    #[test]
    fn labels_are_truncated_and_paired_with_images() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 3);
        let mut batchizer = Batchizer::new(&list, 3).unwrap().with_seed(0);

        let batch = batchizer.epoch(&Identity, 2, SHAPE).next().unwrap().unwrap();

        for item in &batch.items {
            let index: usize = item
                .name
                .rsplit("img_")
                .next()
                .and_then(|rest| rest.trim_end_matches(".png").parse().ok())
                .unwrap();
            assert_eq!(item.label, vec![index as f32, index as f32 + 1.0]);
            assert_eq!(item.image.shape(), &[1, 8, 8]);
            let expected = (index * 20) as f32 / 255.;
            assert!((item.image[[0, 0, 0]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn invalid_label_surfaces_at_batch_time() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("img.png");
        GrayImage::from_pixel(8, 8, Luma([0])).save(&image_path).unwrap();
        let list = dir.path().join("labels.csv");
        fs::write(&list, format!("{},1,2,x,4,5\n", image_path.display())).unwrap();

        let mut batchizer = Batchizer::new(&list, 1).unwrap();
        let first = batchizer.epoch(&Identity, 4, SHAPE).next().unwrap();

        assert!(matches!(first, Err(Error::InvalidLabel { .. })));
    }

    #[test]
    fn empty_list_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("labels.csv");
        fs::write(&list, "\n").unwrap();

        let mut batchizer = Batchizer::new(&list, 2).unwrap();
        assert_eq!(batchizer.batch_count(), 0);
        assert!(batchizer.batches(&Identity, 4, SHAPE).next().is_none());
    }

    #[test]
    fn batcher_builds_nchw_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let list = fixture(dir.path(), 4);
        let mut batchizer = Batchizer::new(&list, 4).unwrap();
        let batch = batchizer.epoch(&Identity, 3, SHAPE).next().unwrap().unwrap();

        let batcher = RegressionBatcher::<TestBackend>::new(Default::default());
        let tensors = batcher.batch(batch.items);

        assert_eq!(tensors.images.dims(), [4, 1, 8, 8]);
        assert_eq!(tensors.targets.dims(), [4, 3]);
        assert_eq!(tensors.names.len(), 4);
    }
}

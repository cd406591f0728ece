//! Labelled datasets, label-pair splits and batched loaders.
//!
//! This module defines the [`LabeledDataset`] trait plus two concrete
//! implementations:
//!
//! - [`NpyImageDataset`]: images and labels held in memory, either read from
//!   `.npy` files on disk or built from arrays.
//! - [`SyntheticImageDataset`]: fully deterministic class-dependent images,
//!   used by tests, benches and `--dry-run`. **Never uses random data.**
//!
//! [`Subset`] restricts any dataset to the examples selected by a
//! [`LabelSplit`], and [`DataLoader`] yields stacked [`Batch`]es with an
//! optional seeded shuffle that changes every epoch.
//!
//! # Directory layout expected by `NpyImageDataset::load`
//!
//! ```text
//! <root>/
//!   cifar10_train_images.npy   # float32 [N, C, H, W]
//!   cifar10_train_labels.npy   # int64   [N]
//!   cifar10_test_images.npy
//!   cifar10_test_labels.npy
//! ```
//!
//! # Example – synthetic dataset
//!
//! ```rust
//! use deup_train::dataset::{DataLoader, LabeledDataset, SyntheticImageConfig, SyntheticImageDataset};
//!
//! let ds = SyntheticImageDataset::new(20, SyntheticImageConfig::default());
//! assert_eq!(ds.len(), 20);
//! assert_eq!(ds.get(0).unwrap().input.shape(), &[3, 32, 32]);
//!
//! let loader = DataLoader::new(&ds, 8, true, 7);
//! let batches: Vec<_> = loader.iter_epoch(0).collect();
//! assert_eq!(batches.len(), 3);
//! assert_eq!(batches[0].inputs.shape(), &[8, 3, 32, 32]);
//! ```

use ndarray::{ArrayD, Axis, IxDyn};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::DatasetError;

// ---------------------------------------------------------------------------
// Sample / Batch
// ---------------------------------------------------------------------------

/// A single input paired with its class label.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Input array, e.g. `[C, H, W]` for images or `[D]` for vectors.
    pub input: ArrayD<f32>,
    /// Class label in `0..num_classes`.
    pub label: usize,
}

/// A stack of samples with a leading batch axis.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Stacked inputs, shape `[B, ...sample_shape]`.
    pub inputs: ArrayD<f32>,
    /// Labels in the same order as `inputs`.
    pub labels: Vec<usize>,
}

impl Batch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` when the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Stack `samples` along a new leading axis.
    ///
    /// # Errors
    ///
    /// [`DatasetError::SampleShape`] when the samples differ in shape and
    /// [`DatasetError::Empty`] when `samples` is empty.
    pub fn from_samples(samples: &[Sample]) -> Result<Self, DatasetError> {
        let first = samples.first().ok_or_else(|| DatasetError::Empty { name: "batch".into() })?;
        let shape = first.input.shape().to_vec();
        let per = first.input.len();
        let mut data = Vec::with_capacity(per * samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for s in samples {
            if s.input.shape() != shape.as_slice() {
                return Err(DatasetError::SampleShape { expected: shape, actual: s.input.shape().to_vec() });
            }
            data.extend(s.input.iter().copied());
            labels.push(s.label);
        }
        let mut full_shape = Vec::with_capacity(shape.len() + 1);
        full_shape.push(samples.len());
        full_shape.extend_from_slice(&shape);
        let inputs = ArrayD::from_shape_vec(IxDyn(&full_shape), data)
            .map_err(|e| DatasetError::invalid_format("<batch>", e.to_string()))?;
        Ok(Batch { inputs, labels })
    }
}

// ---------------------------------------------------------------------------
// LabeledDataset trait
// ---------------------------------------------------------------------------

/// Common interface for all classification datasets.
///
/// Implementations must be `Send + Sync` so one dataset can back several
/// loaders.
pub trait LabeledDataset: Send + Sync {
    /// Total number of samples.
    fn len(&self) -> usize;

    /// Load the sample at position `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::IndexOutOfBounds`] when `idx >= self.len()`.
    fn get(&self, idx: usize) -> Result<Sample, DatasetError>;

    /// Labels of every sample in index order, used for subset filtering.
    fn targets(&self) -> Vec<usize>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Shape of a single input.
    fn sample_shape(&self) -> Vec<usize>;

    /// Returns `true` when the dataset contains no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of scalar features per input.
    fn input_dim(&self) -> usize {
        self.sample_shape().iter().product()
    }
}

// ---------------------------------------------------------------------------
// Label splits
// ---------------------------------------------------------------------------

/// Label pairs that define the five distribution-shift splits.
pub const LABEL_PAIRS: [(usize, usize); 5] = [(0, 1), (2, 3), (4, 5), (6, 7), (8, 9)];

/// One of the five label-pair splits.
///
/// Split `i` holds out the classes `LABEL_PAIRS[i]`: its training set is every
/// other class, and the held-out pair serves as the OOD set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelSplit {
    index: usize,
}

impl LabelSplit {
    /// Split `index`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::UnknownSplit`] when `index >= LABEL_PAIRS.len()`.
    pub fn new(index: usize) -> Result<Self, DatasetError> {
        if index >= LABEL_PAIRS.len() {
            return Err(DatasetError::UnknownSplit { split: index, available: LABEL_PAIRS.len() });
        }
        Ok(LabelSplit { index })
    }

    /// All defined splits in order.
    pub fn all() -> impl Iterator<Item = LabelSplit> {
        (0..LABEL_PAIRS.len()).map(|index| LabelSplit { index })
    }

    /// Split index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The held-out label pair.
    pub fn pair(&self) -> (usize, usize) {
        LABEL_PAIRS[self.index]
    }

    /// Whether `label` belongs to the held-out pair.
    pub fn holds_out(&self, label: usize) -> bool {
        let (a, b) = self.pair();
        label == a || label == b
    }
}

// ---------------------------------------------------------------------------
// Subset
// ---------------------------------------------------------------------------

/// A view of a base dataset restricted to selected indices.
pub struct Subset<'a> {
    base: &'a dyn LabeledDataset,
    indices: Vec<usize>,
    name: String,
}

impl<'a> Subset<'a> {
    /// Keep the samples whose label passes `keep`.
    pub fn filter_labels(base: &'a dyn LabeledDataset, name: String, keep: impl Fn(usize) -> bool) -> Self {
        let indices: Vec<usize> = base
            .targets()
            .into_iter()
            .enumerate()
            .filter(|&(_, label)| keep(label))
            .map(|(i, _)| i)
            .collect();
        debug!("subset {name}: {} of {} samples", indices.len(), base.len());
        Subset { base, indices, name }
    }

    /// The training set of `split`: every sample whose label is not held out.
    pub fn excluding_pair(base: &'a dyn LabeledDataset, split: LabelSplit) -> Self {
        let name = format!("{}_split_{}", base.name(), split.index());
        Self::filter_labels(base, name, |label| !split.holds_out(label))
    }

    /// The held-out samples of `split`.
    pub fn with_pair(base: &'a dyn LabeledDataset, split: LabelSplit) -> Self {
        let name = format!("{}_pair_{}", base.name(), split.index());
        Self::filter_labels(base, name, |label| split.holds_out(label))
    }

    /// Indices into the base dataset.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl LabeledDataset for Subset<'_> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, idx: usize) -> Result<Sample, DatasetError> {
        let base_idx = *self
            .indices
            .get(idx)
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.indices.len() })?;
        self.base.get(base_idx)
    }

    fn targets(&self) -> Vec<usize> {
        let all = self.base.targets();
        self.indices.iter().map(|&i| all[i]).collect()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample_shape(&self) -> Vec<usize> {
        self.base.sample_shape()
    }
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

/// Batched, optionally shuffled iterator over a [`LabeledDataset`].
///
/// The shuffle order is a pure function of `(seed, epoch, len)`, so a run is
/// reproducible while each epoch still sees a fresh order. Loaders built with
/// `shuffle = false` (validation, OOD) always yield dataset order.
pub struct DataLoader<'a> {
    dataset: &'a dyn LabeledDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl<'a> DataLoader<'a> {
    /// Create a new `DataLoader`.
    ///
    /// - `batch_size` – samples per batch, clamped to at least 1. The last
    ///   batch may be smaller.
    /// - `shuffle`    – shuffle deterministically at the start of each epoch.
    /// - `seed`       – base seed for the shuffle.
    pub fn new(dataset: &'a dyn LabeledDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        DataLoader { dataset, batch_size: batch_size.max(1), shuffle, seed }
    }

    /// The underlying dataset.
    pub fn dataset(&self) -> &'a dyn LabeledDataset {
        self.dataset
    }

    /// Samples per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of complete (or partial) batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Iterate one epoch.
    ///
    /// Samples that fail to load or whose shape differs from
    /// [`LabeledDataset::sample_shape`] are skipped with a `warn!` log.
    pub fn iter_epoch(&self, epoch: u64) -> DataLoaderIter<'_> {
        let n = self.dataset.len();
        let indices = if self.shuffle {
            shuffled_indices(n, epoch_seed(self.seed, epoch))
        } else {
            (0..n).collect()
        };
        DataLoaderIter {
            dataset: self.dataset,
            expected_shape: self.dataset.sample_shape(),
            indices,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

/// Iterator returned by [`DataLoader::iter_epoch`].
pub struct DataLoaderIter<'a> {
    dataset: &'a dyn LabeledDataset,
    expected_shape: Vec<usize>,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.indices.len() {
            let end = (self.cursor + self.batch_size).min(self.indices.len());
            let batch_indices = &self.indices[self.cursor..end];
            self.cursor = end;

            let mut samples = Vec::with_capacity(batch_indices.len());
            for &idx in batch_indices {
                match self.dataset.get(idx) {
                    Ok(sample) if sample.input.shape() == self.expected_shape.as_slice() => samples.push(sample),
                    Ok(sample) => {
                        warn!(
                            "Skipping sample {idx} of {}: shape {:?} != {:?}",
                            self.dataset.name(),
                            sample.input.shape(),
                            self.expected_shape
                        );
                    }
                    Err(e) => warn!("Skipping sample {idx}: {e}"),
                }
            }
            if samples.is_empty() {
                continue;
            }
            match Batch::from_samples(&samples) {
                Ok(batch) => return Some(batch),
                Err(e) => warn!("Skipping batch: {e}"),
            }
        }
        None
    }
}

/// Mix the per-epoch counter into the base seed.
pub fn epoch_seed(seed: u64, epoch: u64) -> u64 {
    seed ^ epoch.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// A deterministic permutation of `0..n`.
///
/// In-place Fisher-Yates driven by a 64-bit Xorshift generator; identical on
/// every platform. Also used by the ensemble to share one batch stream across
/// replicas.
pub fn shuffled_indices(n: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    if n <= 1 {
        return indices;
    }
    let mut state = if seed == 0 { 0x853c_49e6_748f_ea9b } else { seed };
    for i in (1..n).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state % (i as u64 + 1)) as usize;
        indices.swap(i, j);
    }
    indices
}

// ---------------------------------------------------------------------------
// NpyImageDataset
// ---------------------------------------------------------------------------

/// In-memory image classification dataset.
pub struct NpyImageDataset {
    name: String,
    images: ArrayD<f32>,
    labels: Vec<usize>,
}

impl NpyImageDataset {
    /// Build from an array with a leading sample axis and matching labels.
    ///
    /// # Errors
    ///
    /// [`DatasetError::InvalidFormat`] when the leading axis and the label
    /// count differ or `images` has no sample axis.
    pub fn from_arrays(name: impl Into<String>, images: ArrayD<f32>, labels: Vec<usize>) -> Result<Self, DatasetError> {
        let name = name.into();
        if images.ndim() < 2 {
            return Err(DatasetError::invalid_format(&name, format!("expected [N, ...], got {:?}", images.shape())));
        }
        if images.shape()[0] != labels.len() {
            return Err(DatasetError::invalid_format(
                &name,
                format!("{} inputs but {} labels", images.shape()[0], labels.len()),
            ));
        }
        Ok(NpyImageDataset { name, images, labels })
    }

    /// Read `<name>_images.npy` (`float32 [N, C, H, W]`) and
    /// `<name>_labels.npy` (`int64 [N]`) from `root`.
    pub fn load(root: &Path, name: &str) -> Result<Self, DatasetError> {
        use ndarray_npy::ReadNpyExt;

        let image_path = root.join(format!("{name}_images.npy"));
        let label_path = root.join(format!("{name}_labels.npy"));
        for p in [&image_path, &label_path] {
            if !p.exists() {
                return Err(DatasetError::not_found(p.as_path(), "expected .npy file is missing"));
            }
        }

        let images = ArrayD::<f32>::read_npy(std::fs::File::open(&image_path)?)
            .map_err(|e| DatasetError::invalid_format(&image_path, format!("NPY read error: {e}")))?;
        if images.ndim() != 4 {
            return Err(DatasetError::invalid_format(
                &image_path,
                format!("expected 4-D [N, C, H, W], got {:?}", images.shape()),
            ));
        }
        let raw_labels = ndarray::Array1::<i64>::read_npy(std::fs::File::open(&label_path)?)
            .map_err(|e| DatasetError::invalid_format(&label_path, format!("NPY read error: {e}")))?;
        let labels = raw_labels
            .iter()
            .map(|&l| usize::try_from(l).map_err(|_| DatasetError::invalid_format(&label_path, format!("negative label {l}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let ds = Self::from_arrays(name, images, labels)?;
        info!("Loaded {} ({} samples, shape {:?})", ds.name, ds.len(), ds.sample_shape());
        Ok(ds)
    }
}

impl LabeledDataset for NpyImageDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, idx: usize) -> Result<Sample, DatasetError> {
        if idx >= self.len() {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.len() });
        }
        Ok(Sample { input: self.images.index_axis(Axis(0), idx).to_owned(), label: self.labels[idx] })
    }

    fn targets(&self) -> Vec<usize> {
        self.labels.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample_shape(&self) -> Vec<usize> {
        self.images.shape()[1..].to_vec()
    }
}

// ---------------------------------------------------------------------------
// SyntheticImageDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticImageDataset`].
#[derive(Debug, Clone)]
pub struct SyntheticImageConfig {
    /// Channels per image. Default: 3.
    pub channels: usize,
    /// Image height. Default: 32.
    pub height: usize,
    /// Image width. Default: 32.
    pub width: usize,
    /// Number of classes; sample `i` has label `i % num_classes`. Default: 10.
    pub num_classes: usize,
    /// Constant added to every pixel, to produce a shifted distribution.
    /// Default: 0.0.
    pub shift: f32,
    /// Name reported by the dataset. Default: `"synthetic"`.
    pub name: String,
}

impl Default for SyntheticImageConfig {
    fn default() -> Self {
        SyntheticImageConfig {
            channels: 3,
            height: 32,
            width: 32,
            num_classes: 10,
            shift: 0.0,
            name: "synthetic".into(),
        }
    }
}

/// Deterministic image dataset.
///
/// Each class draws a distinct 2-D sinusoid pattern; a small index-dependent
/// ripple keeps samples of the same class distinct. Pixel values stay in
/// `[0.05, 0.95] + shift`.
pub struct SyntheticImageDataset {
    num_samples: usize,
    config: SyntheticImageConfig,
}

impl SyntheticImageDataset {
    /// Create a dataset of `num_samples` images.
    pub fn new(num_samples: usize, config: SyntheticImageConfig) -> Self {
        let num_classes = config.num_classes.max(1);
        SyntheticImageDataset { num_samples, config: SyntheticImageConfig { num_classes, ..config } }
    }

    fn pixel(&self, idx: usize, label: usize, c: usize, y: usize, x: usize) -> f32 {
        let cfg = &self.config;
        let fy = y as f32 / cfg.height as f32;
        let fx = x as f32 / cfg.width as f32;
        let k = (label + 1) as f32;
        let pattern = (std::f32::consts::TAU * k * fx + 0.7 * label as f32 + 0.3 * c as f32).sin()
            * (std::f32::consts::PI * k * fy).cos();
        let ripple = 0.05 * (1.3 * idx as f32 + 0.17 * (y * cfg.width + x) as f32).sin();
        0.5 + 0.4 * pattern + ripple + cfg.shift
    }
}

impl LabeledDataset for SyntheticImageDataset {
    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, idx: usize) -> Result<Sample, DatasetError> {
        if idx >= self.num_samples {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.num_samples });
        }
        let label = idx % self.config.num_classes;
        let cfg = &self.config;
        let input = ArrayD::from_shape_fn(IxDyn(&[cfg.channels, cfg.height, cfg.width]), |ix| {
            self.pixel(idx, label, ix[0], ix[1], ix[2])
        });
        Ok(Sample { input, label })
    }

    fn targets(&self) -> Vec<usize> {
        (0..self.num_samples).map(|i| i % self.config.num_classes).collect()
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn sample_shape(&self) -> Vec<usize> {
        vec![self.config.channels, self.config.height, self.config.width]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

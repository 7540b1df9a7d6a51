use crate::{device::split_ranges, result::Result};
use anyhow::{ensure, Context};
use ndarray::{s, stack, Array1, Array5, Array6, ArrayView1, ArrayView6, Axis};
use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

mod folds;
pub use folds::{FoldFiles, FoldSplit};

mod loader;
pub use loader::{ClipLoader, ClipShape, SyntheticLoader};

mod manifest;
pub use manifest::{Manifest, ManifestEntry, ManifestError};

/// A manifest paired with a [`ClipLoader`].
#[derive(Clone)]
pub struct Dataset {
    clips_root: PathBuf,
    manifest: Manifest,
    loader: Arc<dyn ClipLoader>,
}

impl Dataset {
    /// Creates a dataset of the clips in `manifest`, relative to `clips_root`.
    pub fn new(
        clips_root: impl Into<PathBuf>,
        manifest: Manifest,
        loader: Arc<dyn ClipLoader>,
    ) -> Self {
        Self {
            clips_root: clips_root.into(),
            manifest,
            loader,
        }
    }
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.manifest.len()
    }
    /// Whether there are no samples.
    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }
    /// The manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
    /// The directory clip paths are relative to.
    pub fn clips_root(&self) -> &Path {
        &self.clips_root
    }
    /// Loads sample `index`.
    ///
    /// **Errors**
    /// - The loader failed.
    /// - The loaded sample does not have the loader's shape.
    pub fn load(&self, index: usize) -> Result<Array5<f32>> {
        let entry = &self.manifest.entries()[index];
        let clip = self
            .loader
            .load(&self.clips_root, entry)
            .with_context(|| format!("Failed to load clip {:?}!", entry.path))?;
        let expected = self.loader.shape().dim();
        ensure!(
            clip.shape() == expected,
            "Clip {:?} has shape {:?}, expected {:?}!",
            entry.path,
            clip.shape(),
            expected
        );
        Ok(clip)
    }
}

/// A batch of samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Shape = [batch, clips, frames, channels, height, width].
    pub clips: Array6<f32>,
    /// Shape = [batch].
    pub labels: Array1<u32>,
}

impl Batch {
    /// The number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }
    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
    /// The number of clips per sample.
    pub fn clip_count(&self) -> usize {
        self.clips.dim().1
    }
    /// Splits the batch into at most `count` contiguous shards, in order.
    ///
    /// See [`split_ranges()`].
    pub fn shards(&self, count: usize) -> Vec<(ArrayView6<'_, f32>, ArrayView1<'_, u32>)> {
        split_ranges(self.len(), count)
            .into_iter()
            .map(|range| {
                (
                    self.clips.slice(s![range.clone(), .., .., .., .., ..]),
                    self.labels.slice(s![range]),
                )
            })
            .collect()
    }
}

/// Iterates over a [`Dataset`] in batches.
///
/// Samples of a batch are loaded in parallel on a thread pool with `workers` threads.
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    rng: Option<Mutex<StdRng>>,
    pool: Arc<ThreadPool>,
}

impl DataLoader {
    /// Creates a loader over `dataset` with `batch_size`, using `workers` threads.
    ///
    /// **Errors**
    /// - `batch_size` is 0.
    /// - The thread pool could not be created.
    pub fn new(dataset: Dataset, batch_size: usize, workers: usize) -> Result<Self> {
        ensure!(batch_size > 0, "Batch size must be positive!");
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("clip-loader-{i}"))
            .build()?;
        Ok(Self::with_pool(dataset, batch_size, Arc::new(pool)))
    }
    /// Creates a loader sharing `pool`.
    pub fn with_pool(dataset: Dataset, batch_size: usize, pool: Arc<ThreadPool>) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle: false,
            rng: None,
            pool,
        }
    }
    /// Whether to shuffle the samples on each pass. Defaults to false.
    pub fn shuffle(self, shuffle: bool) -> Self {
        Self { shuffle, ..self }
    }
    /// Seeds the shuffle. By default the thread rng is used.
    pub fn seed(self, seed: Option<u64>) -> Self {
        Self {
            rng: seed.map(|seed| Mutex::new(StdRng::seed_from_u64(seed))),
            ..self
        }
    }
    /// The dataset.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }
    /// The batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
    /// The number of batches per pass.
    pub fn batch_count(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }
    /// Iterates over the batches. The last batch may be smaller than the batch size.
    pub fn iter(&self) -> Batches<'_> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            match self.rng.as_ref() {
                Some(rng) => indices.shuffle(&mut *rng.lock()),
                None => indices.shuffle(&mut rand::thread_rng()),
            }
        }
        Batches {
            loader: self,
            indices,
            offset: 0,
        }
    }
    fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let dataset = &self.dataset;
        let clips = self.pool.install(|| {
            indices
                .par_iter()
                .map(|index| dataset.load(*index))
                .collect::<Result<Vec<_>>>()
        })?;
        let views: Vec<_> = clips.iter().map(Array5::view).collect();
        let clips = stack(Axis(0), &views)?;
        let entries = dataset.manifest().entries();
        let labels = indices.iter().map(|index| entries[*index].label).collect();
        Ok(Batch { clips, labels })
    }
}

/// Iterator returned by [`DataLoader::iter()`].
pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    offset: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.indices.len() {
            return None;
        }
        let end = (self.offset + self.loader.batch_size).min(self.indices.len());
        let batch = self.loader.load_batch(&self.indices[self.offset..end]);
        self.offset = end;
        Some(batch)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len() - self.offset;
        let batches = (remaining + self.loader.batch_size - 1) / self.loader.batch_size;
        (batches, Some(batches))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ClipShape {
        ClipShape {
            clips: 2,
            frames: 2,
            channels: 3,
            height: 2,
            width: 2,
        }
    }

    fn dataset(n: usize) -> Dataset {
        let entries = (0..n)
            .map(|i| ManifestEntry {
                path: format!("clip_{i}.mp4"),
                frames: None,
                label: (i % 2) as u32,
            })
            .collect();
        Dataset::new(
            "Clips",
            Manifest::from_entries(entries),
            Arc::new(SyntheticLoader::new(shape())),
        )
    }

    #[test]
    fn batches_keep_manifest_order() -> Result<()> {
        let loader = DataLoader::new(dataset(5), 2, 2)?;
        assert_eq!(loader.batch_count(), 3);
        let batches = loader.iter().collect::<Result<Vec<_>>>()?;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].clips.dim(), (2, 2, 2, 3, 2, 2));
        assert_eq!(batches[2].len(), 1);
        let labels: Vec<u32> = batches.iter().flat_map(|x| x.labels.to_vec()).collect();
        assert_eq!(labels, [0, 1, 0, 1, 0]);
        Ok(())
    }

    #[test]
    fn shuffle_visits_every_sample() -> Result<()> {
        let loader = DataLoader::new(dataset(7), 3, 1)?
            .shuffle(true)
            .seed(Some(0));
        let mut labels: Vec<u32> = loader
            .iter()
            .map(|batch| batch.map(|x| x.labels.to_vec()))
            .collect::<Result<Vec<_>>>()?
            .concat();
        labels.sort_unstable();
        assert_eq!(labels, [0, 0, 0, 0, 1, 1, 1]);
        Ok(())
    }

    #[test]
    fn shards_preserve_order() -> Result<()> {
        let loader = DataLoader::new(dataset(3), 3, 1)?;
        let batch = loader.iter().next().unwrap()?;
        let shards = batch.shards(2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].1.to_vec(), [0]);
        assert_eq!(shards[1].1.to_vec(), [1, 0]);
        assert_eq!(shards[1].0.dim().0, 2);
        Ok(())
    }

    struct WrongShape;

    impl ClipLoader for WrongShape {
        fn shape(&self) -> ClipShape {
            shape()
        }
        fn load(&self, _root: &Path, _entry: &ManifestEntry) -> Result<Array5<f32>> {
            Ok(Array5::zeros([1, 1, 1, 1, 1]))
        }
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let dataset = Dataset::new(
            "Clips",
            dataset(1).manifest().clone(),
            Arc::new(WrongShape),
        );
        assert!(dataset.load(0).is_err());
    }
}

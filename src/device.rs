use crate::result::Result;
use anyhow::ensure;
use ndarray::{Array5, ArrayView6};
use parking_lot::Mutex;
use std::{
    fmt::{self, Debug},
    mem::size_of,
    ops::Range,
    sync::Arc,
};

/// A compute context.
///
/// Batches are split across a list of devices, see [`split_ranges()`]. Each device keeps a cache of
/// staging buffers that is reused between batches, and released with [`.empty_cache()`](Device::empty_cache).
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    index: usize,
    cache: Mutex<Vec<Vec<f32>>>,
}

impl Device {
    /// Creates a device with `index`.
    pub fn new(index: usize) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                index,
                cache: Mutex::default(),
            }),
        }
    }
    /// The host device.
    pub fn host() -> Self {
        Self::new(0)
    }
    /// Creates `count` devices, indexed from 0.
    ///
    /// **Errors**
    /// `count` is 0.
    pub fn list(count: usize) -> Result<Vec<Self>> {
        ensure!(count > 0, "Expected at least 1 device!");
        Ok((0..count).map(Self::new).collect())
    }
    /// The index of the device.
    pub fn index(&self) -> usize {
        self.inner.index
    }
    /// Takes a zeroed buffer of `len` elements, reusing a cached buffer when possible.
    pub(crate) fn alloc(&self, len: usize) -> Vec<f32> {
        let cached = {
            let mut cache = self.inner.cache.lock();
            cache
                .iter()
                .position(|buffer| buffer.capacity() >= len)
                .map(|i| cache.swap_remove(i))
        };
        let mut buffer = cached.unwrap_or_else(|| Vec::with_capacity(len));
        buffer.clear();
        buffer.resize(len, 0.);
        buffer
    }
    /// Returns `buffer` to the cache.
    pub(crate) fn recycle(&self, buffer: Vec<f32>) {
        self.inner.cache.lock().push(buffer);
    }
    /// Copies `clips` into a staging buffer, flattening the clip axis into the batch axis.
    ///
    /// The shape [batch, clips, frames, channels, height, width] becomes
    /// [batch * clips, frames, channels, height, width]. Return the output with
    /// [`.recycle()`](Device::recycle) when finished.
    pub(crate) fn stage_clips(&self, clips: ArrayView6<f32>) -> Result<Array5<f32>> {
        let (batch, clip_count, frames, channels, height, width) = clips.dim();
        let mut buffer = self.alloc(clips.len());
        for (y, x) in buffer.iter_mut().zip(clips.iter()) {
            *y = *x;
        }
        Ok(Array5::from_shape_vec(
            [batch * clip_count, frames, channels, height, width],
            buffer,
        )?)
    }
    /// The size of the cache in bytes.
    pub fn cached_bytes(&self) -> usize {
        self.inner
            .cache
            .lock()
            .iter()
            .map(|buffer| buffer.capacity() * size_of::<f32>())
            .sum()
    }
    /// Releases all cached buffers.
    pub fn empty_cache(&self) {
        let mut cache = self.inner.cache.lock();
        cache.clear();
        cache.shrink_to_fit();
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Device").field(&self.inner.index).finish()
    }
}

/// Splits `size` items into at most `count` contiguous ranges, in order.
///
/// Every range but the last has `size / count` items, the last takes the remainder. If `size` is
/// less than `count`, returns `size` ranges of 1.
pub fn split_ranges(size: usize, count: usize) -> Vec<Range<usize>> {
    if size == 0 || count == 0 {
        return Vec::new();
    }
    let count = count.min(size);
    let step = size / count;
    (0..count)
        .map(|i| {
            let start = i * step;
            let end = if i + 1 < count { start + step } else { size };
            start..end
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array6;

    #[test]
    fn split_ranges_even() {
        assert_eq!(split_ranges(4, 2), vec![0..2, 2..4]);
    }

    #[test]
    fn split_ranges_remainder() {
        assert_eq!(split_ranges(5, 2), vec![0..2, 2..5]);
        assert_eq!(split_ranges(2, 3), vec![0..1, 1..2]);
        assert!(split_ranges(0, 3).is_empty());
    }

    #[test]
    fn stage_clips_flattens_clip_axis() -> Result<()> {
        let device = Device::host();
        let clips = Array6::from_shape_fn([2, 3, 1, 1, 1, 2], |(b, c, _, _, _, w)| {
            (b * 100 + c * 10 + w) as f32
        });
        let staged = device.stage_clips(clips.view())?;
        assert_eq!(staged.dim(), (6, 1, 1, 1, 2));
        assert_eq!(staged[[4, 0, 0, 0, 1]], 111.);
        device.recycle(staged.into_raw_vec());
        assert!(device.cached_bytes() > 0);
        device.empty_cache();
        assert_eq!(device.cached_bytes(), 0);
        Ok(())
    }

    #[test]
    fn alloc_reuses_cache() {
        let device = Device::host();
        let buffer = device.alloc(16);
        device.recycle(buffer);
        let buffer = device.alloc(8);
        assert_eq!(buffer.len(), 8);
        assert!(buffer.iter().all(|x| *x == 0.));
        assert_eq!(device.cached_bytes(), 0);
    }

    #[test]
    fn device_list() {
        let devices = Device::list(2).unwrap();
        assert_eq!(devices[1].index(), 1);
        assert_ne!(devices[0], devices[1]);
        assert!(Device::list(0).is_err());
    }
}

use std::mem;
use std::sync::{Arc, Mutex};

/// Max size of all pooled buffers, in bytes.
/// Currently 1GB.
const MAX_BUFFERS_SIZE: usize = 1024 * 1024 * 1024;
/// When total pooled bytes exceed this, trim largest buffers down to this level.
const TRIM_THRESHOLD: usize = MAX_BUFFERS_SIZE / 2;

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Current total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Number of times a buffer was reused instead of allocated.
    pub hits: usize,
    /// Number of times a new buffer was allocated.
    pub misses: usize,
    /// Number of times a buffer was dropped due to pool size cap.
    pub drops: usize,
}

#[derive(Debug)]
/// Keeps the storage of finished ephemeral buffers around for the next frames.
pub struct BufferPool {
    pool: Vec<Vec<f32>>,
    max_size: usize,
    trim_threshold: usize,
    /// Usage statistics for this pool.
    pub metrics: PoolMetrics,
}

/// Shared reference to a BufferPool for automatic recycling.
pub type SharedPool = Arc<Mutex<BufferPool>>;

#[derive(Debug)]
/// Wrapper around `Vec<f32>` that returns its storage to the pool on drop.
pub struct PooledBuffer {
    buf: Vec<f32>,
    pool: Option<SharedPool>,
}

impl PooledBuffer {
    /// Wrap an existing Vec and attach it to the pool.
    pub fn new(buf: Vec<f32>, pool: SharedPool) -> Self {
        PooledBuffer {
            buf,
            pool: Some(pool),
        }
    }

    /// A buffer that is simply freed when dropped.
    pub fn detached(buf: Vec<f32>) -> Self {
        PooledBuffer { buf, pool: None }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<f32>;
    fn deref(&self) -> &Vec<f32> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<f32> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buf = std::mem::take(&mut self.buf);
            // A poisoned pool just loses this buffer.
            if let Ok(mut pool) = pool.lock() {
                pool.recycle_buffer(buf);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::with_limits(MAX_BUFFERS_SIZE, TRIM_THRESHOLD)
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_size: usize, trim_threshold: usize) -> Self {
        BufferPool {
            pool: Vec::new(),
            max_size,
            trim_threshold,
            metrics: PoolMetrics::default(),
        }
    }

    /// Grab a zeroed Vec of length `len`, reusing the smallest pooled buffer that fits.
    pub fn get_buffer(&mut self, len: usize) -> Vec<f32> {
        let smallest_fit = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= len)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);

        let mut buf = if let Some(idx) = smallest_fit {
            // record a reuse hit
            self.metrics.hits += 1;
            let buf = self.pool.swap_remove(idx);
            self.metrics.current_size = self
                .metrics
                .current_size
                .saturating_sub(buf.capacity() * mem::size_of::<f32>());
            self.debug_check_size();
            buf
        } else {
            // record an allocation miss
            self.metrics.misses += 1;
            Vec::with_capacity(len)
        };
        buf.clear();
        buf.resize(len, 0.0);
        buf
    }

    /// Return a Vec back into the pool for reuse.
    pub fn recycle_buffer(&mut self, buf: Vec<f32>) {
        let buffer_bytes = buf.capacity() * mem::size_of::<f32>();
        if buffer_bytes == 0 {
            return;
        }
        if self.metrics.current_size + buffer_bytes <= self.max_size {
            self.metrics.current_size += buffer_bytes;
            self.pool.push(buf);
            self.debug_check_size();
            self.trim_excess();
        } else {
            // record a dropped buffer due to cap
            self.metrics.drops += 1;
        }
    }

    /// Remove largest buffers until total pooled bytes ≤ the trim threshold.
    fn trim_excess(&mut self) {
        while self.metrics.current_size > self.trim_threshold {
            let Some((max_idx, max_bytes)) = self
                .pool
                .iter()
                .map(|b| b.capacity() * mem::size_of::<f32>())
                .enumerate()
                .max_by_key(|(_, bytes)| *bytes)
            else {
                break;
            };
            self.pool.swap_remove(max_idx);
            self.metrics.current_size = self.metrics.current_size.saturating_sub(max_bytes);
        }
        self.debug_check_size();
    }

    fn debug_check_size(&self) {
        debug_assert_eq!(
            self.metrics.current_size,
            self.pool
                .iter()
                .map(|b| b.capacity() * mem::size_of::<f32>())
                .sum::<usize>()
        );
    }

    /// Number of buffers waiting for reuse.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Returns a snapshot of current pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.clone()
    }
}

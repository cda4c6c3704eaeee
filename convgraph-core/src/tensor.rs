use std::ops::Range;

use crate::{Dims, Error, Result};

/// A host-resident NHWC image batch.
///
/// This is what callers hand to [`Device::upload`](crate::Device::upload) and what
/// [`Graph::evaluate`](crate::Graph::evaluate) returns.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    dims: Dims,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(dims: Dims, data: Vec<f32>) -> Result<Self> {
        if data.len() != dims.element_count() {
            return Err(Error::msg(format!(
                "tensor of dims {dims} needs {} values, got {}",
                dims.element_count(),
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    pub(crate) fn from_parts(dims: Dims, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), dims.element_count());
        Self { dims, data }
    }

    pub fn zeros(dims: Dims) -> Self {
        Self::full(dims, 0.0)
    }

    pub fn full(dims: Dims, v: f32) -> Self {
        Self {
            dims,
            data: vec![v; dims.element_count()],
        }
    }

    /// Build a tensor by evaluating `f(image, y, x, channel)` at every position.
    pub fn from_fn(dims: Dims, mut f: impl FnMut(usize, usize, usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(dims.element_count());
        for n in 0..dims.num_images {
            for y in 0..dims.height {
                for x in 0..dims.width {
                    for c in 0..dims.channels {
                        data.push(f(n, y, x, c));
                    }
                }
            }
        }
        Self { dims, data }
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn index(&self, image: usize, y: usize, x: usize, c: usize) -> usize {
        ((image * self.dims.height + y) * self.dims.width + x) * self.dims.channels + c
    }

    #[inline]
    pub fn get(&self, image: usize, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.index(image, y, x, c)]
    }

    /// Copy out a single image.
    pub fn image(&self, image: usize) -> Result<Tensor> {
        if image >= self.dims.num_images {
            crate::bail!("image {} out of range for {}", image, self.dims);
        }
        let len = self.dims.image_len();
        Ok(Tensor {
            dims: self.dims.with_images(1),
            data: self.data[image * len..(image + 1) * len].to_vec(),
        })
    }

    /// Copy out a contiguous range of channels.
    pub fn channels(&self, range: Range<usize>) -> Result<Tensor> {
        if range.start > range.end || range.end > self.dims.channels {
            crate::bail!("channels {:?} out of range for {}", range, self.dims);
        }
        let dims = Dims {
            channels: range.len(),
            ..self.dims
        };
        let data = self
            .data
            .chunks_exact(self.dims.channels)
            .flat_map(|pixel| pixel[range.clone()].iter().copied())
            .collect();
        Ok(Tensor { dims, data })
    }

    /// Position-weighted sum of all values, handy to tell outputs apart even when
    /// they are normalized.
    pub fn checksum(&self) -> f64 {
        self.data
            .iter()
            .enumerate()
            .map(|(i, &v)| (i % 97 + 1) as f64 * v as f64)
            .sum()
    }

    /// Largest absolute elementwise difference, `None` when the dims differ.
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f32> {
        if self.dims != other.dims {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}

use gemm::{gemm, Parallelism};
use rayon::prelude::*;

use crate::{
    bail,
    device::Parameters,
    ops::{
        Activation, Convolution, Dense, DepthwiseConvolution, MergeOp, OpKind, PoolKind, Pooling,
        Resize, ZeroPad,
    },
    Dims, Error, Operation, Padding, Result, Shape, Tensor,
};

/// An operation bound to its shapes and parameters, ready to run on host memory.
#[derive(Debug)]
pub struct CpuKernel {
    op: Operation,
    input: Shape,
    output: Dims,
    weights: Vec<f32>,
    biases: Option<Vec<f32>>,
}

impl CpuKernel {
    pub(crate) fn new(op: &Operation, input: Shape, output: Dims, params: Parameters) -> Result<Self> {
        let in_channels = input.channels;
        let expected = match op.kind() {
            OpKind::Convolution(c) => in_channels
                .map(|ic| ic * c.kernel_height * c.kernel_width * c.channels),
            OpKind::DepthwiseConvolution(d) => {
                Some(d.kernel_height * d.kernel_width * output.channels)
            }
            OpKind::Dense(d) => input.element_count().map(|len| {
                len / input.num_images.unwrap_or(1).max(1) * d.neurons
            }),
            _ => Some(0),
        };
        let Some(expected) = expected else {
            bail!("{} needs a known input shape, got {}", op.type_name(), input);
        };
        let weights = params.weights.unwrap_or_default();
        if weights.len() != expected {
            bail!(
                "{} expects {} weights, got {}",
                op.type_name(),
                expected,
                weights.len()
            );
        }
        if let Some(b) = &params.biases {
            if b.len() != output.channels {
                bail!(
                    "{} expects {} biases, got {}",
                    op.type_name(),
                    output.channels,
                    b.len()
                );
            }
        }
        log::debug!(
            "built cpu kernel {} ({} -> {}, {} weights)",
            op.type_name(),
            input,
            output,
            weights.len()
        );
        Ok(Self {
            op: op.clone(),
            input,
            output,
            weights,
            biases: params.biases,
        })
    }

    pub fn output(&self) -> Dims {
        self.output
    }

    /// Run the kernel on a dense input, producing a dense tensor of `out` dims.
    pub(crate) fn forward(&self, x: &Tensor, out: Dims) -> Result<Tensor> {
        if !self.input.accepts(x.dims()) {
            return Err(Error::invariant(format!(
                "{} built for {} was given {}",
                self.op.type_name(),
                self.input,
                x.dims()
            )));
        }
        let merges = matches!(self.op.kind(), OpKind::Merge(_));
        if !merges && x.dims().num_images != out.num_images {
            return Err(Error::invariant(format!(
                "{} maps {} images to {}",
                self.op.type_name(),
                x.dims().num_images,
                out.num_images
            )));
        }
        let biases = self.biases.as_deref();
        let y = match self.op.kind() {
            OpKind::Convolution(c) => convolution(x, c, &self.weights, biases, out),
            OpKind::DepthwiseConvolution(d) => depthwise(x, d, &self.weights, biases, out),
            OpKind::Pooling(p) => pooling(x, p, out),
            OpKind::GlobalAveragePooling => global_average(x, out),
            OpKind::Dense(d) => dense(x, d, &self.weights, biases, out),
            OpKind::Activation(a) => {
                let mut y = x.clone();
                let f = a.as_closure();
                y.data_mut().par_iter_mut().for_each(|v| *v = f(*v));
                y
            }
            OpKind::Softmax => softmax(x),
            OpKind::Resize(r) => resize(x, r, out),
            OpKind::ZeroPad(p) => zero_pad(x, p, out),
            OpKind::SpaceToDepthX2 => space_to_depth(x, out),
            OpKind::Merge(m) => merge(x, *m, out),
            OpKind::Custom(c) => {
                let mut y = Tensor::zeros(out);
                c.kernel.compute(x, &mut y)?;
                y
            }
        };
        if y.dims() != out {
            return Err(Error::invariant(format!(
                "{} produced {} instead of {}",
                self.op.type_name(),
                y.dims(),
                out
            )));
        }
        Ok(y)
    }
}

fn parallelism() -> Parallelism {
    let num_threads = num_cpus::get();
    if num_threads > 1 {
        Parallelism::Rayon(num_threads)
    } else {
        Parallelism::None
    }
}

/// Add per-channel biases and apply a fused activation in place.
fn epilogue(y: &mut Tensor, biases: Option<&[f32]>, activation: Option<Activation>) {
    if biases.is_none() && activation.is_none() {
        return;
    }
    let channels = y.dims().channels;
    y.data_mut().par_chunks_mut(channels).for_each(|pixel| {
        for (c, v) in pixel.iter_mut().enumerate() {
            if let Some(b) = biases {
                *v += b[c];
            }
            if let Some(a) = activation {
                *v = a.apply(*v);
            }
        }
    });
}

/// Maps output position `o` to the first input position of its window.
#[inline]
fn window_start(o: usize, stride: usize, pad: usize) -> isize {
    (o * stride) as isize - pad as isize
}

/// im2col followed by one GEMM per image. Weights are `[out][kh][kw][in]`, which is
/// the transposed right-hand side of `cols[pixels][kh*kw*in]`.
fn convolution(
    x: &Tensor,
    c: &Convolution,
    weights: &[f32],
    biases: Option<&[f32]>,
    out: Dims,
) -> Tensor {
    let i = x.dims();
    let (kh, kw, ic, oc) = (c.kernel_height, c.kernel_width, i.channels, c.channels);
    let k = kh * kw * ic;
    let m = out.height * out.width;
    let pad_top = c.padding.leading(i.height, out.height, kh, c.stride_y);
    let pad_left = c.padding.leading(i.width, out.width, kw, c.stride_x);

    let mut y = Tensor::zeros(out);
    let mut cols = vec![0f32; m * k];
    for n in 0..i.num_images {
        cols.par_chunks_mut(k).enumerate().for_each(|(row, col)| {
            let oy = row / out.width;
            let ox = row % out.width;
            let y0 = window_start(oy, c.stride_y, pad_top);
            let x0 = window_start(ox, c.stride_x, pad_left);
            for ky in 0..kh {
                let iy = y0 + ky as isize;
                for kx in 0..kw {
                    let ix = x0 + kx as isize;
                    let dst = &mut col[(ky * kw + kx) * ic..(ky * kw + kx + 1) * ic];
                    if iy < 0 || ix < 0 || iy as usize >= i.height || ix as usize >= i.width {
                        dst.fill(0.0);
                    } else {
                        let start = x.index(n, iy as usize, ix as usize, 0);
                        dst.copy_from_slice(&x.data()[start..start + ic]);
                    }
                }
            }
        });

        let dst = &mut y.data_mut()[n * m * oc..(n + 1) * m * oc];
        unsafe {
            gemm(
                /* m: usize = */ m,
                /* n: usize = */ oc,
                /* k: usize = */ k,
                /* dst: *mut T = */ dst.as_mut_ptr(),
                /* dst_cs: isize = */ 1,
                /* dst_rs: isize = */ oc as isize,
                /* read_dst: bool = */ false,
                /* lhs: *const T = */ cols.as_ptr(),
                /* lhs_cs: isize = */ 1,
                /* lhs_rs: isize = */ k as isize,
                /* rhs: *const T = */ weights.as_ptr(),
                /* rhs_cs: isize = */ k as isize,
                /* rhs_rs: isize = */ 1,
                /* alpha: T = */ 0.0,
                /* beta: T = */ 1.0,
                /* conj_dst: bool = */ false,
                /* conj_lhs: bool = */ false,
                /* conj_rhs: bool = */ false,
                parallelism(),
            )
        }
    }
    epilogue(&mut y, biases, c.activation);
    y
}

fn depthwise(
    x: &Tensor,
    d: &DepthwiseConvolution,
    weights: &[f32],
    biases: Option<&[f32]>,
    out: Dims,
) -> Tensor {
    let i = x.dims();
    let (kh, kw, mult) = (d.kernel_height, d.kernel_width, d.channel_multiplier);
    let pad_top = Padding::Same.leading(i.height, out.height, kh, d.stride_y);
    let pad_left = Padding::Same.leading(i.width, out.width, kw, d.stride_x);

    let mut y = Tensor::zeros(out);
    let row_len = out.width * out.channels;
    y.data_mut()
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(row, dst)| {
            let n = row / out.height;
            let oy = row % out.height;
            let y0 = window_start(oy, d.stride_y, pad_top);
            for ox in 0..out.width {
                let x0 = window_start(ox, d.stride_x, pad_left);
                for o in 0..out.channels {
                    let ic = o / mult;
                    let mut sum = 0.0;
                    for ky in 0..kh {
                        let iy = y0 + ky as isize;
                        if iy < 0 || iy as usize >= i.height {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = x0 + kx as isize;
                            if ix < 0 || ix as usize >= i.width {
                                continue;
                            }
                            sum += x.get(n, iy as usize, ix as usize, ic)
                                * weights[(o * kh + ky) * kw + kx];
                        }
                    }
                    dst[ox * out.channels + o] = sum;
                }
            }
        });
    epilogue(&mut y, biases, d.activation);
    y
}

fn pooling(x: &Tensor, p: &Pooling, out: Dims) -> Tensor {
    let i = x.dims();
    let pad_top = p.padding.leading(i.height, out.height, p.kernel_height, p.stride_y);
    let pad_left = p.padding.leading(i.width, out.width, p.kernel_width, p.stride_x);

    let mut y = Tensor::zeros(out);
    let row_len = out.width * out.channels;
    y.data_mut()
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(row, dst)| {
            let n = row / out.height;
            let oy = row % out.height;
            let y0 = window_start(oy, p.stride_y, pad_top);
            for ox in 0..out.width {
                let x0 = window_start(ox, p.stride_x, pad_left);
                for c in 0..out.channels {
                    let mut acc = match p.kind {
                        PoolKind::Max => f32::NEG_INFINITY,
                        PoolKind::Average => 0.0,
                    };
                    let mut count = 0usize;
                    for ky in 0..p.kernel_height {
                        let iy = y0 + ky as isize;
                        if iy < 0 || iy as usize >= i.height {
                            continue;
                        }
                        for kx in 0..p.kernel_width {
                            let ix = x0 + kx as isize;
                            if ix < 0 || ix as usize >= i.width {
                                continue;
                            }
                            let v = x.get(n, iy as usize, ix as usize, c);
                            acc = match p.kind {
                                PoolKind::Max => acc.max(v),
                                PoolKind::Average => acc + v,
                            };
                            count += 1;
                        }
                    }
                    dst[ox * out.channels + c] = match (p.kind, count) {
                        (_, 0) => 0.0,
                        (PoolKind::Max, _) => acc,
                        (PoolKind::Average, count) => acc / count as f32,
                    };
                }
            }
        });
    y
}

fn global_average(x: &Tensor, out: Dims) -> Tensor {
    let i = x.dims();
    let area = (i.width * i.height) as f32;
    let mut y = Tensor::zeros(out);
    y.data_mut()
        .par_chunks_mut(out.channels)
        .enumerate()
        .for_each(|(n, dst)| {
            let image = &x.data()[n * i.image_len()..(n + 1) * i.image_len()];
            for pixel in image.chunks_exact(i.channels) {
                for (d, v) in dst.iter_mut().zip(pixel) {
                    *d += v;
                }
            }
            dst.iter_mut().for_each(|d| *d /= area);
        });
    y
}

/// Weights are `[neurons][height][width][channels]`, one dot product per neuron.
fn dense(x: &Tensor, d: &Dense, weights: &[f32], biases: Option<&[f32]>, out: Dims) -> Tensor {
    let len = x.dims().image_len();
    let mut y = Tensor::zeros(out);
    for (n, dst) in y.data_mut().chunks_exact_mut(d.neurons).enumerate() {
        let image = &x.data()[n * len..(n + 1) * len];
        dst.par_iter_mut().enumerate().for_each(|(j, o)| {
            let row = &weights[j * len..(j + 1) * len];
            *o = image.iter().zip(row).map(|(a, b)| a * b).sum();
        });
    }
    epilogue(&mut y, biases, d.activation);
    y
}

fn softmax(x: &Tensor) -> Tensor {
    let mut y = x.clone();
    let channels = y.dims().channels;
    y.data_mut().par_chunks_mut(channels).for_each(|pixel| {
        let max = pixel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in pixel.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        pixel.iter_mut().for_each(|v| *v /= sum);
    });
    y
}

/// Bilinear sampling at pixel centers. Extra output channels repeat the last input
/// channel; extra input channels are dropped.
fn resize(x: &Tensor, _r: &Resize, out: Dims) -> Tensor {
    let i = x.dims();
    let scale_x = i.width as f32 / out.width as f32;
    let scale_y = i.height as f32 / out.height as f32;
    let source = |o: usize, scale: f32, len: usize| {
        let s = ((o as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
        let s0 = s.floor() as usize;
        let s1 = (s0 + 1).min(len - 1);
        (s0, s1, s - s0 as f32)
    };

    let mut y = Tensor::zeros(out);
    let row_len = out.width * out.channels;
    y.data_mut()
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(row, dst)| {
            let n = row / out.height;
            let (y0, y1, fy) = source(row % out.height, scale_y, i.height);
            for ox in 0..out.width {
                let (x0, x1, fx) = source(ox, scale_x, i.width);
                for c in 0..out.channels {
                    let ic = c.min(i.channels - 1);
                    let top = x.get(n, y0, x0, ic) * (1.0 - fx) + x.get(n, y0, x1, ic) * fx;
                    let bottom = x.get(n, y1, x0, ic) * (1.0 - fx) + x.get(n, y1, x1, ic) * fx;
                    dst[ox * out.channels + c] = top * (1.0 - fy) + bottom * fy;
                }
            }
        });
    y
}

fn zero_pad(x: &Tensor, p: &ZeroPad, out: Dims) -> Tensor {
    let i = x.dims();
    let mut y = Tensor::full(out, p.value);
    for n in 0..i.num_images {
        for iy in 0..i.height {
            let src = x.index(n, iy, 0, 0);
            let dst = y.index(n, iy + p.top, p.left, 0);
            let len = i.width * i.channels;
            y.data_mut()[dst..dst + len].copy_from_slice(&x.data()[src..src + len]);
        }
    }
    y
}

/// Output channel `(dy * 2 + dx) * C + c` holds input `(2y + dy, 2x + dx, c)`.
fn space_to_depth(x: &Tensor, out: Dims) -> Tensor {
    let c = x.dims().channels;
    let mut y = Tensor::zeros(out);
    for n in 0..out.num_images {
        for oy in 0..out.height {
            for ox in 0..out.width {
                for dy in 0..2 {
                    for dx in 0..2 {
                        let src = x.index(n, 2 * oy + dy, 2 * ox + dx, 0);
                        let dst = y.index(n, oy, ox, (dy * 2 + dx) * c);
                        y.data_mut()[dst..dst + c].copy_from_slice(&x.data()[src..src + c]);
                    }
                }
            }
        }
    }
    y
}

fn merge(x: &Tensor, op: MergeOp, out: Dims) -> Tensor {
    let i = x.dims();
    let len = i.image_len();
    let images: Vec<&[f32]> = x.data().chunks_exact(len).collect();
    let mut y = Tensor::zeros(out);
    y.data_mut().par_iter_mut().enumerate().for_each(|(e, v)| {
        let values = images.iter().map(|img| img[e]);
        *v = match op {
            MergeOp::Add => values.sum(),
            MergeOp::Multiply => values.product(),
            MergeOp::Maximum => values.fold(f32::NEG_INFINITY, f32::max),
            MergeOp::Average => values.sum::<f32>() / i.num_images as f32,
        };
    });
    y
}

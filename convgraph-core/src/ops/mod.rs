//! Operation variants and their static contracts: output shape inference and
//! parameter requirements. None of this looks at buffer contents.
//!
//! Parameter layouts expected from a [`ParameterSource`](crate::ParameterSource):
//! - convolution weights: `[out_channels][kernel_height][kernel_width][in_channels]`
//! - depthwise weights: `[in_channels * multiplier][kernel_height][kernel_width]`,
//!   output channel `o` reads input channel `o / multiplier`
//! - dense weights: `[neurons][height][width][channels]`
//! - biases: one value per output channel

use std::{fmt, sync::Arc};

use crate::{Padding, Result, Shape, Tensor};

mod activation;

pub use activation::Activation;

#[derive(Clone, Debug, PartialEq)]
pub struct Convolution {
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub channels: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub padding: Padding,
    pub activation: Option<Activation>,
    pub use_bias: bool,
}

impl Convolution {
    /// A square `kernel`x`kernel` convolution producing `channels` output channels,
    /// stride 1 and same padding.
    pub fn new(kernel: usize, channels: usize) -> Self {
        Self {
            kernel_width: kernel,
            kernel_height: kernel,
            channels,
            stride_x: 1,
            stride_y: 1,
            padding: Padding::Same,
            activation: None,
            use_bias: true,
        }
    }

    /// 1x1 convolution.
    pub fn pointwise(channels: usize) -> Self {
        Self::new(1, channels)
    }

    pub fn kernel_size(mut self, width: usize, height: usize) -> Self {
        self.kernel_width = width;
        self.kernel_height = height;
        self
    }

    pub fn stride(self, stride: usize) -> Self {
        self.stride_xy(stride, stride)
    }

    pub fn stride_xy(mut self, x: usize, y: usize) -> Self {
        self.stride_x = x;
        self.stride_y = y;
        self
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DepthwiseConvolution {
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub channel_multiplier: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub activation: Option<Activation>,
    pub use_bias: bool,
}

impl DepthwiseConvolution {
    pub fn new(kernel: usize) -> Self {
        Self {
            kernel_width: kernel,
            kernel_height: kernel,
            channel_multiplier: 1,
            stride_x: 1,
            stride_y: 1,
            activation: None,
            use_bias: true,
        }
    }

    pub fn channel_multiplier(mut self, multiplier: usize) -> Self {
        self.channel_multiplier = multiplier;
        self
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride_x = stride;
        self.stride_y = stride;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolKind {
    Max,
    Average,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pooling {
    pub kind: PoolKind,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub padding: Padding,
}

impl Pooling {
    fn new(kind: PoolKind, kernel: usize, stride: usize) -> Self {
        Self {
            kind,
            kernel_width: kernel,
            kernel_height: kernel,
            stride_x: stride,
            stride_y: stride,
            padding: Padding::Valid,
        }
    }

    pub fn max(kernel: usize, stride: usize) -> Self {
        Self::new(PoolKind::Max, kernel, stride)
    }

    pub fn average(kernel: usize, stride: usize) -> Self {
        Self::new(PoolKind::Average, kernel, stride)
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }
}

/// Fully connected layer over the whole image; output is `1x1xneurons`.
#[derive(Clone, Debug, PartialEq)]
pub struct Dense {
    pub neurons: usize,
    pub activation: Option<Activation>,
    pub use_bias: bool,
}

impl Dense {
    pub fn new(neurons: usize) -> Self {
        Self {
            neurons,
            activation: None,
            use_bias: true,
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }
}

/// Bilinear resampling to a fixed size. Accepts inputs of any size.
#[derive(Clone, Debug, PartialEq)]
pub struct Resize {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl Resize {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            channels: 3,
        }
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ZeroPad {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
    pub value: f32,
}

impl ZeroPad {
    pub fn new(top: usize, bottom: usize, left: usize, right: usize) -> Self {
        Self {
            top,
            bottom,
            left,
            right,
            value: 0.0,
        }
    }

    pub fn uniform(pad: usize) -> Self {
        Self::new(pad, pad, pad, pad)
    }

    pub fn value(mut self, value: f32) -> Self {
        self.value = value;
        self
    }
}

/// Reduction over the image slots of a collected tensor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MergeOp {
    Add,
    Multiply,
    Maximum,
    Average,
}

impl MergeOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Multiply => "Multiply",
            Self::Maximum => "Maximum",
            Self::Average => "Average",
        }
    }
}

/// User supplied computation run by the CPU backend.
pub trait CustomKernel: Send + Sync {
    fn name(&self) -> &str;

    /// `output` arrives zeroed with the dims the graph inferred for this node.
    fn compute(&self, input: &Tensor, output: &mut Tensor) -> Result<()>;
}

/// An operation backed by a [`CustomKernel`]. Dimensions that are not fixed are
/// taken from the input.
#[derive(Clone)]
pub struct Custom {
    pub kernel: Arc<dyn CustomKernel>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub channels: Option<usize>,
}

impl Custom {
    pub fn new(kernel: impl CustomKernel + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
            width: None,
            height: None,
            channels: None,
        }
    }

    pub fn size(mut self, width: usize, height: usize) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels);
        self
    }
}

impl fmt::Debug for Custom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Custom")
            .field("kernel", &self.kernel.name())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum OpKind {
    Convolution(Convolution),
    DepthwiseConvolution(DepthwiseConvolution),
    Pooling(Pooling),
    GlobalAveragePooling,
    Dense(Dense),
    Activation(Activation),
    /// Softmax across channels, independently for every pixel.
    Softmax,
    Resize(Resize),
    ZeroPad(ZeroPad),
    /// Moves each 2x2 spatial block into channels: `w/2 x h/2 x 4c`.
    SpaceToDepthX2,
    Merge(MergeOp),
    Custom(Custom),
}

/// A named, parameterized transformation. The name keys parameter lookups and is
/// assigned automatically at compile time when left empty.
#[derive(Clone, Debug)]
pub struct Operation {
    name: Option<String>,
    kind: OpKind,
}

impl Operation {
    pub fn new(kind: impl Into<OpKind>) -> Self {
        Self {
            name: None,
            kind: kind.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            OpKind::Convolution(_) => "Conv",
            OpKind::DepthwiseConvolution(_) => "DepthwiseConv",
            OpKind::Pooling(p) => match p.kind {
                PoolKind::Max => "MaxPool",
                PoolKind::Average => "AvgPool",
            },
            OpKind::GlobalAveragePooling => "GlobalAvgPool",
            OpKind::Dense(_) => "Dense",
            OpKind::Activation(a) => a.name(),
            OpKind::Softmax => "Softmax",
            OpKind::Resize(_) => "Resize",
            OpKind::ZeroPad(_) => "ZeroPad",
            OpKind::SpaceToDepthX2 => "SpaceToDepthX2",
            OpKind::Merge(m) => m.name(),
            OpKind::Custom(c) => c.kernel.name(),
        }
    }

    /// Operations that produce a fully specified shape no matter what comes in.
    pub fn allows_incomplete_input(&self) -> bool {
        match &self.kind {
            OpKind::Resize(_) => true,
            OpKind::Custom(c) => c.width.is_some() && c.height.is_some() && c.channels.is_some(),
            _ => false,
        }
    }

    pub fn output_shape(&self, input: Shape) -> Shape {
        let windowed = |kw: usize, kh: usize, sx: usize, sy: usize, padding: Padding| Shape {
            width: input.width.and_then(|w| padding.output_size(w, kw, sx)),
            height: input.height.and_then(|h| padding.output_size(h, kh, sy)),
            ..input
        };
        match &self.kind {
            OpKind::Convolution(c) => Shape {
                channels: Some(c.channels),
                ..windowed(
                    c.kernel_width,
                    c.kernel_height,
                    c.stride_x,
                    c.stride_y,
                    c.padding,
                )
            },
            OpKind::DepthwiseConvolution(d) => Shape {
                channels: input.channels.map(|c| c * d.channel_multiplier),
                ..windowed(
                    d.kernel_width,
                    d.kernel_height,
                    d.stride_x,
                    d.stride_y,
                    Padding::Same,
                )
            },
            OpKind::Pooling(p) => {
                windowed(p.kernel_width, p.kernel_height, p.stride_x, p.stride_y, p.padding)
            }
            OpKind::GlobalAveragePooling => Shape {
                width: Some(1),
                height: Some(1),
                ..input
            },
            OpKind::Dense(d) => Shape {
                width: Some(1),
                height: Some(1),
                channels: Some(d.neurons),
                ..input
            },
            OpKind::Activation(_) | OpKind::Softmax => input,
            OpKind::Resize(r) => Shape {
                width: Some(r.width),
                height: Some(r.height),
                channels: Some(r.channels),
                num_images: input.num_images.or(Some(1)),
            },
            OpKind::ZeroPad(p) => Shape {
                width: input.width.map(|w| w + p.left + p.right),
                height: input.height.map(|h| h + p.top + p.bottom),
                ..input
            },
            OpKind::SpaceToDepthX2 => Shape {
                width: input.width.map(|w| w / 2).filter(|&w| w > 0),
                height: input.height.map(|h| h / 2).filter(|&h| h > 0),
                channels: input.channels.map(|c| c * 4),
                ..input
            },
            OpKind::Merge(_) => Shape {
                num_images: Some(1),
                ..input
            },
            OpKind::Custom(c) => Shape {
                width: c.width.or(input.width),
                height: c.height.or(input.height),
                channels: c.channels.or(input.channels),
                num_images: input.num_images.or(Some(1)),
            },
        }
    }

    /// Number of weights, given the node's input and output shapes. Unknown
    /// dimensions count as zero.
    pub fn weight_count(&self, input: Shape, output: Shape) -> usize {
        let in_c = input.channels.unwrap_or(0);
        match &self.kind {
            OpKind::Convolution(c) => in_c * c.kernel_height * c.kernel_width * c.channels,
            OpKind::DepthwiseConvolution(d) => {
                d.kernel_height * d.kernel_width * output.channels.unwrap_or(0)
            }
            OpKind::Dense(d) => {
                input.width.unwrap_or(0) * input.height.unwrap_or(0) * in_c * d.neurons
            }
            _ => 0,
        }
    }

    pub fn bias_count(&self, output: Shape) -> usize {
        let uses_bias = match &self.kind {
            OpKind::Convolution(c) => c.use_bias,
            OpKind::DepthwiseConvolution(d) => d.use_bias,
            OpKind::Dense(d) => d.use_bias,
            _ => false,
        };
        if uses_bias {
            output.channels.unwrap_or(0)
        } else {
            0
        }
    }

    pub fn param_count(&self, input: Shape, output: Shape) -> usize {
        self.weight_count(input, output) + self.bias_count(output)
    }

    /// Reject static parameters no kernel could run with.
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        let positive = |what: &str, v: usize| {
            if v == 0 {
                Err(format!("{what} must be positive"))
            } else {
                Ok(())
            }
        };
        match &self.kind {
            OpKind::Convolution(c) => {
                positive("kernel width", c.kernel_width)?;
                positive("kernel height", c.kernel_height)?;
                positive("stride", c.stride_x.min(c.stride_y))?;
                positive("output channels", c.channels)
            }
            OpKind::DepthwiseConvolution(d) => {
                positive("kernel width", d.kernel_width)?;
                positive("kernel height", d.kernel_height)?;
                positive("stride", d.stride_x.min(d.stride_y))?;
                positive("channel multiplier", d.channel_multiplier)
            }
            OpKind::Pooling(p) => {
                positive("kernel width", p.kernel_width)?;
                positive("kernel height", p.kernel_height)?;
                positive("stride", p.stride_x.min(p.stride_y))
            }
            OpKind::Dense(d) => positive("neurons", d.neurons),
            OpKind::Resize(r) => {
                positive("width", r.width)?;
                positive("height", r.height)?;
                positive("channels", r.channels)
            }
            _ => Ok(()),
        }
    }
}

macro_rules! into_operation {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for OpKind {
                fn from(value: $variant) -> Self {
                    OpKind::$variant(value)
                }
            }

            impl From<$variant> for Operation {
                fn from(value: $variant) -> Self {
                    Operation::new(value)
                }
            }
        )*
    };
}

into_operation!(
    Convolution,
    DepthwiseConvolution,
    Pooling,
    Dense,
    Activation,
    Resize,
    ZeroPad,
    Custom
);

impl From<MergeOp> for OpKind {
    fn from(value: MergeOp) -> Self {
        OpKind::Merge(value)
    }
}

impl From<MergeOp> for Operation {
    fn from(value: MergeOp) -> Self {
        Operation::new(value)
    }
}

impl From<OpKind> for Operation {
    fn from(value: OpKind) -> Self {
        Operation::new(value)
    }
}

use crate::{
    node::Region,
    params::ParameterKind,
    Dims, Operation, Result, Shape, Tensor,
};

/// Allocation descriptor, one per distinct node shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferDesc {
    pub dims: Dims,
}

impl BufferDesc {
    pub fn len(&self) -> usize {
        self.dims.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rectangular window into a buffer: `dims` worth of values starting at
/// `channel_offset`/`image_offset` inside a buffer whose extent is `extent`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct View {
    pub dims: Dims,
    pub extent: Dims,
    pub channel_offset: usize,
    pub image_offset: usize,
}

impl View {
    /// The whole buffer.
    pub fn full(dims: Dims) -> Self {
        Self {
            dims,
            extent: dims,
            channel_offset: 0,
            image_offset: 0,
        }
    }

    /// A window of `dims` placed at `region` relative to this view.
    pub fn region(&self, region: Region, dims: Dims) -> Self {
        let (channel_offset, image_offset) = match region {
            Region::Channels(c) => (self.channel_offset + c, self.image_offset),
            Region::Images(n) => (self.channel_offset, self.image_offset + n),
        };
        Self {
            dims,
            extent: self.extent,
            channel_offset,
            image_offset,
        }
    }

    pub fn is_full(&self) -> bool {
        self.dims == self.extent
    }

    /// Whether the window lies inside the buffer.
    pub fn fits(&self) -> bool {
        self.channel_offset + self.dims.channels <= self.extent.channels
            && self.image_offset + self.dims.num_images <= self.extent.num_images
            && self.dims.width <= self.extent.width
            && self.dims.height <= self.extent.height
    }

    /// Offset of element `(image, y, x, c)` of the window within the buffer.
    #[inline]
    pub fn index(&self, image: usize, y: usize, x: usize, c: usize) -> usize {
        let e = &self.extent;
        (((image + self.image_offset) * e.height + y) * e.width + x) * e.channels
            + c
            + self.channel_offset
    }

    /// Copy the window out of `data` into a dense tensor.
    pub fn gather(&self, data: &[f32]) -> Tensor {
        if self.is_full() {
            return Tensor::from_parts(self.dims, data[..self.dims.element_count()].to_vec());
        }
        let d = self.dims;
        let mut out = Vec::with_capacity(d.element_count());
        for n in 0..d.num_images {
            for y in 0..d.height {
                for x in 0..d.width {
                    let start = self.index(n, y, x, 0);
                    out.extend_from_slice(&data[start..start + d.channels]);
                }
            }
        }
        Tensor::from_parts(d, out)
    }

    /// Write a dense tensor with this window's dims into `data`.
    pub fn scatter(&self, src: &Tensor, data: &mut [f32]) {
        if self.is_full() {
            data[..src.data().len()].copy_from_slice(src.data());
            return;
        }
        let d = self.dims;
        for (pixel, values) in src.data().chunks_exact(d.channels).enumerate() {
            let x = pixel % d.width;
            let y = (pixel / d.width) % d.height;
            let n = pixel / (d.width * d.height);
            let start = self.index(n, y, x, 0);
            data[start..start + d.channels].copy_from_slice(values);
        }
    }
}

/// Parameters resolved for one operation at compile time.
#[derive(Clone, Debug, Default)]
pub struct Parameters {
    pub weights: Option<Vec<f32>>,
    pub biases: Option<Vec<f32>>,
}

impl Parameters {
    pub fn get(&self, kind: ParameterKind) -> Option<&[f32]> {
        match kind {
            ParameterKind::Weights => self.weights.as_deref(),
            ParameterKind::Biases => self.biases.as_deref(),
        }
    }
}

/// Completion handle for submitted commands.
pub trait Submission {
    /// Block until every command has run. Errors raised by kernels surface here.
    fn wait(self) -> Result<()>;
}

/// The boundary between the graph compiler and hardware specifics.
///
/// The graph owns scheduling and buffer lifetimes; a device only allocates,
/// builds kernels, records their execution into a command sequence and runs it.
pub trait Device {
    type Buffer: Clone;
    type Commands;
    type Kernel;
    type Submission: Submission;

    fn new_commands(&self) -> Self::Commands;

    /// A buffer that only needs to live as long as `commands`.
    fn allocate_ephemeral(
        &self,
        desc: &BufferDesc,
        commands: &mut Self::Commands,
    ) -> Result<Self::Buffer>;

    /// A buffer that lives until the caller drops it.
    fn allocate_durable(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    /// Build a kernel for `op` reading `input` and producing `output`. The input shape
    /// may be incomplete for operations that accept any input size.
    fn build(
        &self,
        op: &Operation,
        input: Shape,
        output: Dims,
        params: Parameters,
    ) -> Result<Self::Kernel>;

    /// Record one kernel execution. Input and output may be windows of the same buffer.
    fn execute(
        &self,
        commands: &mut Self::Commands,
        kernel: &Self::Kernel,
        input: (&Self::Buffer, View),
        output: (&Self::Buffer, View),
    ) -> Result<()>;

    /// Record zeroing the whole buffer.
    fn clear(&self, commands: &mut Self::Commands, buffer: &Self::Buffer) -> Result<()>;

    fn submit(&self, commands: Self::Commands) -> Self::Submission;

    /// Extent of a buffer, as used to check the graph's source.
    fn dims(&self, buffer: &Self::Buffer) -> Dims;

    fn upload(&self, tensor: &Tensor) -> Result<Self::Buffer>;

    /// Read a window back to the host. Only meaningful once the commands that wrote
    /// it have completed.
    fn download(&self, buffer: &Self::Buffer, view: View) -> Result<Tensor>;
}

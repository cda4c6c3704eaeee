use std::fmt::{self, Display};

/// Concrete extent of an image batch, stored as NHWC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Dims {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub num_images: usize,
}

impl Dims {
    pub const fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
            num_images: 1,
        }
    }

    pub const fn with_images(self, num_images: usize) -> Self {
        Self { num_images, ..self }
    }

    /// Number of elements in a single image.
    pub const fn image_len(&self) -> usize {
        self.width * self.height * self.channels
    }

    pub const fn element_count(&self) -> usize {
        self.image_len() * self.num_images
    }
}

impl Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&Shape::from(*self), f)
    }
}

/// Width/height/channels/image-count descriptor of a node's value.
///
/// Any field may be unknown. Only the graph input is allowed to keep unknown fields
/// after compilation, every other node must resolve to a fully specified shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Shape {
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub channels: Option<usize>,
    pub num_images: Option<usize>,
}

impl Shape {
    /// A single image of the given size.
    pub const fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            channels: Some(channels),
            num_images: Some(1),
        }
    }

    /// A shape where nothing is known yet.
    pub const fn unknown() -> Self {
        Self {
            width: None,
            height: None,
            channels: None,
            num_images: None,
        }
    }

    pub const fn with_images(self, num_images: usize) -> Self {
        Self {
            num_images: Some(num_images),
            ..self
        }
    }

    pub const fn with_channels(self, channels: usize) -> Self {
        Self {
            channels: Some(channels),
            ..self
        }
    }

    pub fn is_fully_specified(&self) -> bool {
        self.dims().is_some()
    }

    /// The concrete extent, if every field is known.
    pub fn dims(&self) -> Option<Dims> {
        Some(Dims {
            width: self.width?,
            height: self.height?,
            channels: self.channels?,
            num_images: self.num_images?,
        })
    }

    /// Number of elements, or `None` while the shape is incomplete.
    pub fn element_count(&self) -> Option<usize> {
        self.dims().map(|d| d.element_count())
    }

    /// Whether a concrete extent satisfies every known field of this shape.
    pub fn accepts(&self, dims: Dims) -> bool {
        fn field(known: Option<usize>, actual: usize) -> bool {
            known.is_none_or(|k| k == actual)
        }
        field(self.width, dims.width)
            && field(self.height, dims.height)
            && field(self.channels, dims.channels)
            && field(self.num_images, dims.num_images)
    }
}

impl From<Dims> for Shape {
    fn from(d: Dims) -> Self {
        Shape::new(d.width, d.height, d.channels).with_images(d.num_images)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field(v: Option<usize>) -> String {
            v.map_or_else(|| "?".to_string(), |v| v.to_string())
        }
        write!(
            f,
            "{}x{}x{}",
            field(self.width),
            field(self.height),
            field(self.channels)
        )?;
        if self.num_images != Some(1) {
            write!(f, " [{}]", field(self.num_images))?;
        }
        Ok(())
    }
}

/// Border handling for windowed operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Padding {
    /// Output covers every input position: `ceil(input / stride)`.
    #[default]
    Same,
    /// Only windows that fit entirely inside the input: `(input - kernel) / stride + 1`.
    Valid,
}

impl Padding {
    /// Output length along one axis, `None` when the window does not fit.
    pub fn output_size(self, input: usize, kernel: usize, stride: usize) -> Option<usize> {
        if stride == 0 || input == 0 {
            return None;
        }
        match self {
            Self::Same => Some((input - 1) / stride + 1),
            Self::Valid => input.checked_sub(kernel).map(|d| d / stride + 1),
        }
    }

    /// Number of padded positions before the first input element along one axis.
    pub fn leading(self, input: usize, output: usize, kernel: usize, stride: usize) -> usize {
        match self {
            Self::Same => ((output - 1) * stride + kernel).saturating_sub(input) / 2,
            Self::Valid => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_rounds_up() {
        assert_eq!(Padding::Same.output_size(16, 3, 1), Some(16));
        assert_eq!(Padding::Same.output_size(16, 3, 2), Some(8));
        assert_eq!(Padding::Same.output_size(15, 3, 2), Some(8));
        assert_eq!(Padding::Same.output_size(1, 3, 2), Some(1));
    }

    #[test]
    fn valid_padding_drops_partial_windows() {
        assert_eq!(Padding::Valid.output_size(16, 2, 2), Some(8));
        assert_eq!(Padding::Valid.output_size(15, 2, 2), Some(7));
        assert_eq!(Padding::Valid.output_size(5, 3, 1), Some(3));
        assert_eq!(Padding::Valid.output_size(2, 3, 1), None);
    }

    #[test]
    fn same_padding_is_centered() {
        // 16 -> 8 with k=3, s=2 needs one padded column, placed after the input.
        assert_eq!(Padding::Same.leading(16, 8, 3, 2), 0);
        assert_eq!(Padding::Same.leading(16, 16, 3, 1), 1);
        assert_eq!(Padding::Valid.leading(16, 14, 3, 1), 0);
    }

    #[test]
    fn partial_shapes() {
        let s = Shape {
            channels: Some(3),
            ..Shape::unknown()
        };
        assert!(!s.is_fully_specified());
        assert_eq!(s.element_count(), None);
        assert!(s.accepts(Dims::new(10, 20, 3)));
        assert!(!s.accepts(Dims::new(10, 20, 4)));
        assert_eq!(s.to_string(), "?x?x3 [?]");
    }

    #[test]
    fn full_shapes() {
        let s = Shape::new(4, 5, 6).with_images(2);
        assert_eq!(s.dims(), Some(Dims::new(4, 5, 6).with_images(2)));
        assert_eq!(s.element_count(), Some(240));
        assert_eq!(s.to_string(), "4x5x6 [2]");
        assert_eq!(Shape::new(4, 5, 6).to_string(), "4x5x6");
    }
}

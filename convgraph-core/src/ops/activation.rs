/// Elementwise nonlinearity, either fused into a convolution/dense kernel or used as
/// a standalone operation.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Activation {
    ReLU,
    /// `x` for positive inputs, `alpha * x` otherwise.
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    /// `a * x + b`
    Linear { a: f32, b: f32 },
}

impl Activation {
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Self::ReLU => x.max(0.0),
            Self::LeakyReLU(alpha) => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Linear { a, b } => a * x + b,
        }
    }

    pub fn as_closure(self) -> impl Fn(f32) -> f32 + Send + Sync {
        move |x| self.apply(x)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReLU => "ReLU",
            Self::LeakyReLU(_) => "LeakyReLU",
            Self::Sigmoid => "Sigmoid",
            Self::Tanh => "Tanh",
            Self::Linear { .. } => "Linear",
        }
    }
}

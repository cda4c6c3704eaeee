use std::{convert::Infallible, fmt::Display};

use crate::{params::ParameterKind, NodeId, Shape};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Message: {0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// Arbitrary errors wrapping.
    #[error(transparent)]
    Wrapped(Box<dyn std::error::Error + Send + Sync>),

    /// A wrapped error with a note on what was being done.
    #[error("{context}: {wrapped}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },

    /// A malformed graph was described (e.g. incompatible Concatenate/Collect inputs).
    #[error("cannot build node {node}: {message}")]
    Construction { node: String, message: String },

    #[error("input shape {shape} for operation '{operation}' has unknown dimensions")]
    UnresolvedShape { operation: String, shape: Shape },

    #[error("missing {kind} for operation '{operation}' (expected {expected} values)")]
    MissingParameters {
        operation: String,
        kind: ParameterKind,
        expected: usize,
    },

    #[error("operation '{operation}' expected {expected} {kind} values, parameter source gave {actual}")]
    ParameterCount {
        operation: String,
        kind: ParameterKind,
        expected: usize,
        actual: usize,
    },

    #[error("compile error in operation '{operation}': {message}")]
    Compile { operation: String, message: String },

    #[error("graph has already been compiled")]
    AlreadyCompiled,

    #[error("graph failed to compile earlier and cannot be recompiled: {0}")]
    CompileFailed(String),

    #[error("graph has not been compiled yet")]
    NotCompiled,

    #[error("in-flight slot {slot} is out of range, graph was compiled with {slots} slots")]
    InvalidSlot { slot: usize, slots: usize },

    #[error("source buffer has shape {actual}, the input node expects {expected}")]
    SourceShape { expected: Shape, actual: Shape },

    #[error("node {0} does not belong to this graph")]
    UnknownNode(NodeId),

    /// Encode-time bookkeeping went wrong. This is a bug in the compiled plan, not a
    /// caller mistake; the frame is abandoned.
    #[error("invariant violated during encode: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    ///
    /// If the message implements `std::error::Error`, prefer using [`Error::wrap`] instead.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    /// Wrap an arbitrary error.
    pub fn wrap(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Wrapped(Box::new(err)).bt()
    }

    pub(crate) fn construction<N: Display, M: Display>(node: N, message: M) -> Self {
        Self::Construction {
            node: node.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invariant<M: Display>(message: M) -> Self {
        let message = message.to_string();
        log::error!("{message}");
        Self::Invariant(message)
    }

    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// Strip any backtrace wrapper, returning the underlying error.
    pub fn inner(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.inner(),
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::Msg(format!($msg).into()).bt())
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::Msg(format!($err).into()).bt())
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($fmt, $($arg)*).into()).bt())
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Turn foreign errors and missing values into [`Error`] with a note attached.
pub trait Context<T, E>: private::Sealed {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static;

    /// Like [`Context::context`], building the note only on failure.
    fn with_context<C, F>(self, f: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context.to_string(),
            }
            .bt()),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Ok(ok) => Ok(ok),
            Err(error) => Err(Error::WrappedContext {
                wrapped: Box::new(error),
                context: context().to_string(),
            }
            .bt()),
        }
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context)),
        }
    }

    fn with_context<C, F>(self, context: F) -> std::result::Result<T, Error>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        match self {
            Some(ok) => Ok(ok),
            None => Err(Error::msg(context())),
        }
    }
}

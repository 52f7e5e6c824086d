use crate::shape::Shape;

/// All errors that can occur within meshlm.
///
/// The variants fall into three families that callers branch on:
/// configuration errors (the model or run cannot be built as described),
/// shape errors (named dimensions or layouts do not line up), and
/// unsupported execution modes. Use [`Error::is_config_error`] and
/// [`Error::is_shape_error`] to classify.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model or run configuration is invalid (missing key, unknown
    /// attention type, indivisible microbatching, vocabulary too small, ...).
    #[error("config error: {0}")]
    Config(String),

    /// Generic shape problem not covered by the structured variants below.
    #[error("shape error: {0}")]
    Shape(String),

    /// A shape was built with the same dimension name twice.
    #[error("shape error: duplicate dimension name '{name}'")]
    DuplicateDimension { name: String },

    /// A named dimension was looked up in a shape that does not carry it.
    #[error("shape error: dimension '{name}' not found in {shape}")]
    DimensionNotFound { name: String, shape: Shape },

    /// The same dimension name appears with two different sizes.
    #[error("shape error: dimension '{name}' has size {expected} in one operand and {got} in another")]
    DimensionSizeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// A layout maps a dimension to a mesh axis whose device count does not
    /// divide the dimension size.
    #[error("shape error: dimension '{dim}' of size {size} is not divisible by mesh axis '{axis}' ({devices} devices)")]
    IndivisibleLayout {
        dim: String,
        size: usize,
        axis: String,
        devices: usize,
    },

    /// Element count mismatch when creating a tensor from raw data.
    #[error("shape error: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// The requested execution mode is not supported.
    #[error("unsupported mode: {0}")]
    UnsupportedMode(String),

    /// I/O failure in a checkpoint hook.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a configuration error.
    pub fn config(s: impl Into<String>) -> Self {
        Error::Config(s.into())
    }

    /// Create a generic shape error.
    pub fn shape(s: impl Into<String>) -> Self {
        Error::Shape(s.into())
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            Error::Shape(_)
                | Error::DuplicateDimension { .. }
                | Error::DimensionNotFound { .. }
                | Error::DimensionSizeMismatch { .. }
                | Error::IndivisibleLayout { .. }
                | Error::ElementCountMismatch { .. }
        )
    }

    pub fn is_unsupported_mode(&self) -> bool {
        matches!(self, Error::UnsupportedMode(_))
    }
}

/// Convenience Result type used throughout meshlm.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

/// Early return with a formatted [`Error::Config`].
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Config(format!($($arg)*)))
    };
}

/// Early return with a formatted [`Error::Shape`].
#[macro_export]
macro_rules! shape_bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Shape(format!($($arg)*)))
    };
}

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the service.
///
/// `Setup` is fatal: the process cannot serve without its weights and device.
/// `Validation` is raised at the request boundary, before any engine work.
/// Everything else is a request-scoped engine failure; a request either
/// returns its full output set or fails entirely, and nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("setup error: {0}")]
    Setup(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("control image {path}: {source}")]
    ControlImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Engine(#[from] candle_core::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn setup(msg: impl Into<String>) -> Self {
        Self::Setup(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(Error::setup("x").to_string().contains("setup error:"));
        assert!(Error::validation("x").to_string().contains("validation error:"));
        assert!(Error::internal("x").to_string().contains("internal error:"));
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = Error::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}

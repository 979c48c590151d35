/// Result alias that carries the custom [`HeadbangError`] type.
pub type Result<T> = std::result::Result<T, HeadbangError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum HeadbangError {
    /// Free-form failure raised by a subsystem that has no richer variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around configuration (de)serialization errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// FFT processing failure inside the tempo estimator.
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
    /// The audio input device could not be opened or read.
    #[error("audio source unavailable: {0}")]
    AudioSource(String),
    /// The light peripheral link is gone; the command channel degrades to a
    /// no-op rather than propagating this to callers.
    #[error("lamp peripheral disconnected")]
    LampDisconnected,
}

impl HeadbangError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for HeadbangError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for HeadbangError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

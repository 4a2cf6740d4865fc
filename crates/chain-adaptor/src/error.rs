use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

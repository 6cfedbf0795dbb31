use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PatchError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("degenerate region: {0}")]
    DegenerateRegion(String),

    #[error("reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

impl From<image::ImageError> for PatchError {
    fn from(err: image::ImageError) -> Self {
        PatchError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

use std::path::PathBuf;

use thiserror::Error;

/// Failure categories surfaced by the library. Call sites attach context with `anyhow`.
#[derive(Debug, Error)]
pub enum FillError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("input image not found: {}", .0.display())]
	MissingImage(PathBuf),

	#[error("segmentation failed: {0}")]
	Segmentation(String),

	#[error("inpainting failed: {0}")]
	Inpainting(String),

	#[error("model unavailable: {0}")]
	Model(String),

	#[error("i/o error at {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error
	}
}

impl FillError {
	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		FillError::Io { path: path.into(), source }
	}
}

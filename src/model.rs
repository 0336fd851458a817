use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::download;
use crate::error::FillError;

const HUB: &str = "https://huggingface.co";

/// One file of a model bundle. `rel` is kept as the on-disk path under the bundle directory so
/// ONNX external-data files stay next to their graph.
pub struct ModelFile {
	pub rel: &'static str,
	/// Stored with Git LFS; the pointer's SHA-256 is checked against the download.
	pub lfs: bool
}

pub struct ModelSpec {
	pub name: &'static str,
	pub repo: &'static str,
	pub revision: &'static str,
	pub files: &'static [ModelFile]
}

impl ModelSpec {
	pub fn file_url(&self, rel: &str) -> String {
		format!("{HUB}/{}/resolve/{}/{rel}", self.repo, self.revision)
	}

	/// Where the hub serves the git blob itself, which for LFS files is the pointer.
	pub fn pointer_url(&self, rel: &str) -> String {
		format!("{HUB}/{}/raw/{}/{rel}", self.repo, self.revision)
	}
}

const fn lfs(rel: &'static str) -> ModelFile {
	ModelFile { rel, lfs: true }
}

const fn plain(rel: &'static str) -> ModelFile {
	ModelFile { rel, lfs: false }
}

pub const CLIPSEG: ModelSpec = ModelSpec {
	name: "clipseg-rd64-refined",
	repo: "Xenova/clipseg-rd64-refined",
	revision: "main",
	files: &[lfs("onnx/model.onnx"), plain("tokenizer.json")]
};

pub const SD_INPAINT: ModelSpec = ModelSpec {
	name: "sd-inpainting",
	repo: "runwayml/stable-diffusion-inpainting",
	revision: "onnx",
	files: &[
		lfs("text_encoder/model.onnx"),
		lfs("unet/model.onnx"),
		lfs("unet/weights.pb"),
		lfs("vae_encoder/model.onnx"),
		lfs("vae_decoder/model.onnx")
	]
};

/// The CLIP BPE vocabulary is shared by CLIPSeg and the SD text encoder.
pub const CLIP_TOKENIZER: &str = "tokenizer.json";

pub struct ModelStore {
	root: PathBuf,
	allow_download: bool
}

impl ModelStore {
	pub fn new(root: Option<&Path>, allow_download: bool) -> Result<Self> {
		let root = match root {
			Some(p) => p.to_path_buf(),
			None => cache_base_dir()?.join("models")
		};
		Ok(ModelStore { root, allow_download })
	}

	pub fn bundle_dir(&self, spec: &ModelSpec) -> PathBuf {
		self.root.join(spec.name)
	}

	/// Make sure every file of `spec` is present, downloading what is missing.
	pub fn ensure(&self, spec: &ModelSpec) -> Result<ModelBundle> {
		let dir = self.bundle_dir(spec);
		for f in spec.files {
			let path = dir.join(f.rel);
			if path.is_file() {
				continue;
			}
			let url = spec.file_url(f.rel);
			if !self.allow_download {
				return Err(FillError::Model(format!("{} missing {} (offline, would fetch {url})", spec.name, path.display())).into());
			}
			let sha256 = if f.lfs { expected_sha256(spec, f) } else { None };
			download::fetch(&url, &path, sha256.as_deref()).with_context(|| format!("download {} from {url}", spec.name))?;
		}
		Ok(ModelBundle { dir })
	}
}

pub struct ModelBundle {
	dir: PathBuf
}

impl ModelBundle {
	pub fn path(&self, rel: &str) -> PathBuf {
		self.dir.join(rel)
	}
}

fn expected_sha256(spec: &ModelSpec, f: &ModelFile) -> Option<String> {
	let url = spec.pointer_url(f.rel);
	match download::lfs_sha256(&url) {
		Ok(Some(sha256)) => Some(sha256),
		Ok(None) => {
			tracing::warn!(%url, "no LFS pointer, downloading unverified");
			None
		}
		Err(e) => {
			tracing::warn!(%url, "LFS pointer lookup failed, downloading unverified: {e:#}");
			None
		}
	}
}

fn cache_base_dir() -> Result<PathBuf> {
	let dirs = directories::ProjectDirs::from("rs", "segfill", "segfill-rs")
		.ok_or_else(|| anyhow::anyhow!("unable to resolve user cache directory"))?;
	Ok(dirs.cache_dir().to_path_buf())
}

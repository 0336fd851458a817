use std::path::Path;

use anyhow::{Result, anyhow};
use tokenizers::Tokenizer;

/// CLIP text models take at most 77 positions, start and end tokens included.
pub const CLIP_MAX_LEN: usize = 77;

const END_OF_TEXT: &str = "<|endoftext|>";

pub struct ClipTokenizer {
	inner: Tokenizer,
	eot_id: u32
}

impl ClipTokenizer {
	pub fn from_file(path: &Path) -> Result<Self> {
		let inner = Tokenizer::from_file(path).map_err(|e| anyhow!("load tokenizer {}: {e}", path.display()))?;
		let eot_id = inner
			.token_to_id(END_OF_TEXT)
			.ok_or_else(|| anyhow!("tokenizer {} has no {END_OF_TEXT} token", path.display()))?;
		Ok(ClipTokenizer { inner, eot_id })
	}

	/// Token ids with start/end markers, truncated to [`CLIP_MAX_LEN`] (the end marker is kept).
	pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
		let enc = self.inner.encode(text, true).map_err(|e| anyhow!("tokenize {text:?}: {e}"))?;
		let mut ids = enc.get_ids().to_vec();
		if ids.len() > CLIP_MAX_LEN {
			ids.truncate(CLIP_MAX_LEN);
			ids[CLIP_MAX_LEN - 1] = self.eot_id;
		}
		Ok(ids)
	}

	/// Encode and pad with the end-of-text id up to `len`.
	pub fn encode_padded(&self, text: &str, len: usize) -> Result<Vec<u32>> {
		let mut ids = self.encode(text)?;
		pad_to(&mut ids, len, self.eot_id);
		Ok(ids)
	}

	pub fn pad_id(&self) -> u32 {
		self.eot_id
	}
}

/// Right-pad `ids` to `len` with `pad`. Longer inputs are left alone.
pub fn pad_to(ids: &mut Vec<u32>, len: usize, pad: u32) {
	if ids.len() < len {
		ids.resize(len, pad);
	}
}

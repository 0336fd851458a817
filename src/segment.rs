use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array2, Array3, Array4, Axis, Ix3};
use ort::session::Session;
use ort::value::TensorRef;

use crate::device::{self, ComputeDevice, SessionOptions};
use crate::error::FillError;
use crate::imageio;
use crate::mask::{BBox, Mask};
use crate::tokenizer::{ClipTokenizer, pad_to};

/// One region found for a prompt.
#[derive(Debug, Clone)]
pub struct SegmentResult {
	pub mask: Mask,
	/// Mean probability inside the region.
	pub score: f32,
	pub bbox: BBox,
	pub prompt_index: usize
}

/// Everything a segmentation call produced.
#[derive(Debug, Clone, Default)]
pub struct Prediction {
	/// Per-prompt probability maps at image resolution (0-255).
	pub raw: Vec<GrayImage>,
	/// Regions ordered by score, best first.
	pub results: Vec<SegmentResult>
}

pub trait Segmenter {
	fn predict(&mut self, image_path: &Path, prompts: &[String], device: ComputeDevice) -> Result<Prediction>;
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentSettings {
	/// Probability in `[0, 1]` a pixel needs to be part of the object.
	pub threshold: f32,
	/// Regions smaller than this share of the image are dropped.
	pub min_region_frac: f32
}

impl Default for SegmentSettings {
	fn default() -> Self {
		SegmentSettings {
			threshold: 0.4,
			min_region_frac: 0.002
		}
	}
}

/// Turn one probability map into ordered regions.
pub fn regions_from_probabilities(prob: &GrayImage, prompt_index: usize, settings: SegmentSettings) -> Vec<SegmentResult> {
	let threshold = (settings.threshold.clamp(0.0, 1.0) * 255.0).round() as u8;
	let binary = Mask::from_gray(prob, threshold.max(1));
	let total = prob.width() as u64 * prob.height() as u64;
	let min_area = (settings.min_region_frac.max(0.0) as f64 * total as f64).ceil() as u64;

	let mut out: Vec<SegmentResult> = binary
		.regions(min_area)
		.into_iter()
		.filter_map(|mask| {
			let bbox = mask.bbox()?;
			let mut sum = 0u64;
			let mut n = 0u64;
			for y in bbox.y..bbox.y + bbox.height {
				for x in bbox.x..bbox.x + bbox.width {
					if mask.get(x, y) {
						sum += prob.get_pixel(x, y).0[0] as u64;
						n += 1;
					}
				}
			}
			let score = if n == 0 { 0.0 } else { sum as f32 / n as f32 / 255.0 };
			Some(SegmentResult {
				mask,
				score,
				bbox,
				prompt_index
			})
		})
		.collect();

	out.sort_by(best_first);
	out
}

/// Higher score first, larger area on ties.
fn best_first(a: &SegmentResult, b: &SegmentResult) -> std::cmp::Ordering {
	b.score
		.total_cmp(&a.score)
		.then_with(|| b.mask.area().cmp(&a.mask.area()))
}

const CLIPSEG_SIZE: u32 = 352;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Text-prompted segmentation with a CLIPSeg ONNX export.
pub struct ClipSegSegmenter {
	model_path: PathBuf,
	tokenizer: ClipTokenizer,
	settings: SegmentSettings,
	deterministic: bool,
	session: Option<(ComputeDevice, Session)>
}

impl ClipSegSegmenter {
	pub fn new(model_path: PathBuf, tokenizer_path: &Path, settings: SegmentSettings, deterministic: bool) -> Result<Self> {
		let tokenizer = ClipTokenizer::from_file(tokenizer_path)?;
		Ok(ClipSegSegmenter {
			model_path,
			tokenizer,
			settings,
			deterministic,
			session: None
		})
	}

	fn session(&mut self, device: ComputeDevice) -> Result<&mut Session> {
		let stale = !matches!(&self.session, Some((d, _)) if *d == device);
		if stale {
			let s = device::open_session(
				&self.model_path,
				SessionOptions {
					device,
					deterministic: self.deterministic
				}
			)?;
			self.session = Some((device, s));
		}
		match self.session.as_mut() {
			Some((_, s)) => Ok(s),
			None => bail!("segmentation session missing")
		}
	}

	fn token_batch(&self, prompts: &[String]) -> Result<(Array2<i64>, Array2<i64>)> {
		let mut rows = Vec::with_capacity(prompts.len());
		for p in prompts {
			rows.push(self.tokenizer.encode(p)?);
		}
		let len = rows.iter().map(Vec::len).max().unwrap_or(0);

		let mut ids = Array2::<i64>::zeros((rows.len(), len));
		let mut attn = Array2::<i64>::zeros((rows.len(), len));
		for (i, mut row) in rows.into_iter().enumerate() {
			let real = row.len();
			pad_to(&mut row, len, self.tokenizer.pad_id());
			for (j, id) in row.into_iter().enumerate() {
				ids[[i, j]] = id as i64;
				attn[[i, j]] = (j < real) as i64;
			}
		}
		Ok((ids, attn))
	}
}

impl Segmenter for ClipSegSegmenter {
	fn predict(&mut self, image_path: &Path, prompts: &[String], device: ComputeDevice) -> Result<Prediction> {
		if prompts.is_empty() {
			return Ok(Prediction::default());
		}
		let img = imageio::load_image(image_path)?;
		let pixels = pixel_batch(&img, prompts.len());
		let (ids, attn) = self.token_batch(prompts)?;
		let settings = self.settings;

		tracing::info!(prompts = prompts.len(), %device, "running segmentation");
		let session = self.session(device)?;
		let logits = {
			let outputs = session
				.run(ort::inputs![
					"input_ids" => TensorRef::from_array_view(&ids)?,
					"pixel_values" => TensorRef::from_array_view(&pixels)?,
					"attention_mask" => TensorRef::from_array_view(&attn)?
				])
				.map_err(|e| FillError::Segmentation(e.to_string()))?;
			if outputs.len() == 0 {
				return Err(FillError::Segmentation("model produced no outputs".into()).into());
			}
			outputs[0].try_extract_array::<f32>().context("extract logits")?.to_owned()
		};
		let logits = logits_per_prompt(logits.into_dyn(), prompts.len())?;

		let mut pred = Prediction::default();
		for (i, plane) in logits.axis_iter(Axis(0)).enumerate() {
			let (h, w) = (plane.shape()[0], plane.shape()[1]);
			let small = GrayImage::from_fn(w as u32, h as u32, |x, y| {
				let v = plane[[y as usize, x as usize]];
				let p = 1.0 / (1.0 + (-v).exp());
				Luma([(p * 255.0).round() as u8])
			});
			let prob = image::imageops::resize(&small, img.width(), img.height(), FilterType::Triangle);
			pred.results.extend(regions_from_probabilities(&prob, i, settings));
			pred.raw.push(prob);
		}
		pred.results.sort_by(best_first);
		tracing::info!(regions = pred.results.len(), "segmentation done");
		Ok(pred)
	}
}

fn pixel_batch(img: &RgbImage, batch: usize) -> Array4<f32> {
	let resized = image::imageops::resize(img, CLIPSEG_SIZE, CLIPSEG_SIZE, FilterType::Triangle);
	let s = CLIPSEG_SIZE as usize;
	let mut t = Array4::<f32>::zeros((batch, 3, s, s));
	for (x, y, p) in resized.enumerate_pixels() {
		for c in 0..3 {
			let v = (p.0[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
			for b in 0..batch {
				t[[b, c, y as usize, x as usize]] = v;
			}
		}
	}
	t
}

/// Exports differ in whether they keep the batch or channel axis; normalize to `[prompts, H, W]`.
fn logits_per_prompt(out: ndarray::ArrayD<f32>, prompts: usize) -> Result<Array3<f32>> {
	let shape = out.shape().to_vec();
	let out = match shape.len() {
		2 => out.insert_axis(Axis(0)),
		3 => out,
		4 if shape[1] == 1 => out.remove_axis(Axis(1)),
		n => bail!("unexpected logits rank: {n} (shape {shape:?})")
	};
	let out = out.into_dimensionality::<Ix3>().context("reshape logits")?;
	if out.shape()[0] != prompts {
		bail!("logits batch {} does not match {} prompts", out.shape()[0], prompts);
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn blob(prob: &mut GrayImage, x0: u32, y0: u32, w: u32, h: u32, v: u8) {
		for y in y0..y0 + h {
			for x in x0..x0 + w {
				prob.put_pixel(x, y, Luma([v]));
			}
		}
	}

	#[test]
	fn regions_ordered_by_score() {
		let mut prob = GrayImage::new(100, 100);
		blob(&mut prob, 5, 5, 20, 20, 150);
		blob(&mut prob, 60, 60, 10, 10, 250);
		blob(&mut prob, 90, 5, 2, 2, 255);

		let r = regions_from_probabilities(&prob, 0, SegmentSettings::default());
		// 2x2 region is under 0.2% of the image.
		assert_eq!(r.len(), 2);
		assert_eq!(r[0].bbox, BBox { x: 60, y: 60, width: 10, height: 10 });
		assert!((r[0].score - 250.0 / 255.0).abs() < 1e-4);
		assert_eq!(r[1].mask.area(), 400);
	}

	#[test]
	fn equal_scores_across_prompts_prefer_larger_area() {
		let mut small = GrayImage::new(100, 100);
		blob(&mut small, 10, 10, 5, 5, 200);
		let mut large = GrayImage::new(100, 100);
		blob(&mut large, 40, 40, 30, 30, 200);

		let mut all = regions_from_probabilities(&small, 0, SegmentSettings::default());
		all.extend(regions_from_probabilities(&large, 1, SegmentSettings::default()));
		all.sort_by(best_first);
		assert_eq!(all.len(), 2);
		assert_eq!(all[0].prompt_index, 1);
		assert_eq!(all[0].mask.area(), 900);
		assert_eq!(all[1].prompt_index, 0);
	}

	#[test]
	fn below_threshold_yields_nothing() {
		let mut prob = GrayImage::new(50, 50);
		blob(&mut prob, 0, 0, 50, 50, 90);
		assert!(regions_from_probabilities(&prob, 0, SegmentSettings::default()).is_empty());
	}

	#[test]
	fn logits_shapes_normalize() {
		let two = ndarray::ArrayD::<f32>::zeros(vec![8, 8]);
		assert_eq!(logits_per_prompt(two, 1).unwrap().shape(), &[1, 8, 8]);

		let four = ndarray::ArrayD::<f32>::zeros(vec![2, 1, 8, 8]);
		assert_eq!(logits_per_prompt(four, 2).unwrap().shape(), &[2, 8, 8]);

		let wrong = ndarray::ArrayD::<f32>::zeros(vec![3, 8, 8]);
		assert!(logits_per_prompt(wrong, 1).is_err());
	}

	#[test]
	fn pixel_batch_normalizes() {
		let img = RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
		let t = pixel_batch(&img, 2);
		assert_eq!(t.shape(), &[2, 3, 352, 352]);
		let expect = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
		assert!((t[[1, 0, 100, 100]] - expect).abs() < 1e-5);
	}
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::cli::{Args, FailurePolicy};
use crate::device::ComputeDevice;
use crate::error::FillError;
use crate::imageio;
use crate::inpaint::Inpainter;
use crate::mask::Mask;
use crate::segment::Segmenter;
use crate::visualize::{DEFAULT_DPI, Figure, MaskColor};

/// Options for one run, validated and fixed before any work starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
	pub input_img: PathBuf,
	pub seg_prompt: String,
	pub fill_prompt: String,
	pub dilate_kernel_size: Option<u32>,
	pub output_dir: PathBuf,
	pub seed: Option<u64>,
	pub on_error: FailurePolicy
}

impl RunConfig {
	pub fn new(input_img: impl Into<PathBuf>, seg_prompt: &str, fill_prompt: &str, output_dir: impl Into<PathBuf>) -> Result<Self> {
		let seg_prompt = seg_prompt.trim();
		let fill_prompt = fill_prompt.trim();
		if seg_prompt.is_empty() {
			return Err(FillError::InvalidInput("segmentation prompt is empty".into()).into());
		}
		if fill_prompt.is_empty() {
			return Err(FillError::InvalidInput("fill prompt is empty".into()).into());
		}
		Ok(RunConfig {
			input_img: input_img.into(),
			seg_prompt: seg_prompt.to_string(),
			fill_prompt: fill_prompt.to_string(),
			dilate_kernel_size: None,
			output_dir: output_dir.into(),
			seed: None,
			on_error: FailurePolicy::FailFast
		})
	}

	pub fn from_args(args: &Args) -> Result<Self> {
		let mut cfg = RunConfig::new(&args.input_img, &args.seg_prompt, &args.fill_prompt, &args.output_dir)?;
		cfg.dilate_kernel_size = args.dilate_kernel_size;
		cfg.seed = args.seed;
		cfg.on_error = args.on_error;
		Ok(cfg)
	}
}

/// File names under `<output_dir>/<image stem>/`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
	dir: PathBuf
}

impl OutputLayout {
	pub fn for_input(output_dir: &Path, input_img: &Path) -> Self {
		let stem = input_img
			.file_stem()
			.and_then(|s| s.to_str())
			.unwrap_or("out");
		OutputLayout { dir: output_dir.join(stem) }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn mask(&self, idx: usize) -> PathBuf {
		self.dir.join(format!("mask_{idx}.png"))
	}

	pub fn with_points(&self) -> PathBuf {
		self.dir.join("with_points.png")
	}

	pub fn with_mask(&self, idx: usize) -> PathBuf {
		self.dir.join(format!("with_mask_{idx}.png"))
	}

	pub fn filled(&self, idx: usize) -> PathBuf {
		self.dir.join(format!("filled_with_mask_{idx}.png"))
	}
}

#[derive(Debug)]
pub struct MaskFailure {
	pub index: usize,
	pub error: anyhow::Error
}

#[derive(Debug)]
pub struct RunReport {
	pub output_dir: PathBuf,
	pub masks: usize,
	pub written: Vec<PathBuf>,
	pub failures: Vec<MaskFailure>
}

impl RunReport {
	pub fn is_success(&self) -> bool {
		self.failures.is_empty()
	}
}

/// Segment, dilate, visualize and fill. Only per-mask steps are subject to `cfg.on_error`;
/// loading and segmentation failures always abort.
pub fn run<S, I>(cfg: &RunConfig, device: ComputeDevice, segmenter: &mut S, inpainter: &mut I) -> Result<RunReport>
where
	S: Segmenter + ?Sized,
	I: Inpainter + ?Sized
{
	let img = imageio::load_image(&cfg.input_img)?;

	let prompts = [cfg.seg_prompt.clone()];
	let prediction = segmenter
		.predict(&cfg.input_img, &prompts, device)
		.with_context(|| format!("segment {:?} in {}", cfg.seg_prompt, cfg.input_img.display()))?;
	let mut masks: Vec<Mask> = prediction.results.into_iter().map(|r| r.mask).collect();
	tracing::info!(masks = masks.len(), prompt = %cfg.seg_prompt, "segmentation returned");

	if let Some(k) = cfg.dilate_kernel_size {
		masks = masks.iter().map(|m| m.dilate(k)).collect();
	}

	let layout = OutputLayout::for_input(&cfg.output_dir, &cfg.input_img);
	fs::create_dir_all(layout.dir()).map_err(|e| FillError::io(layout.dir(), e))?;

	let mut report = RunReport {
		output_dir: layout.dir().to_path_buf(),
		masks: masks.len(),
		written: Vec::new(),
		failures: Vec::new()
	};
	let mut failed = vec![false; masks.len()];

	for (idx, mask) in masks.iter().enumerate() {
		let step = visualize_mask(&img, mask, idx, &layout, &mut report.written);
		if let Err(e) = step {
			on_mask_error(cfg.on_error, idx, e.context("visualize"), &mut report)?;
			failed[idx] = true;
		}
	}

	for (idx, mask) in masks.iter().enumerate() {
		if failed[idx] {
			continue;
		}
		let mut rng = match cfg.seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_os_rng()
		};
		let step = inpainter
			.fill(&img, mask, &cfg.fill_prompt, device, &mut rng)
			.with_context(|| format!("fill mask {idx}"))
			.and_then(|filled| {
				let p = layout.filled(idx);
				imageio::save_image(&filled, &p)?;
				tracing::info!(mask = idx, path = %p.display(), "filled");
				Ok(p)
			});
		match step {
			Ok(p) => report.written.push(p),
			Err(e) => on_mask_error(cfg.on_error, idx, e, &mut report)?
		}
	}

	tracing::info!(
		dir = %report.output_dir.display(),
		files = report.written.len(),
		failures = report.failures.len(),
		"run finished"
	);
	Ok(report)
}

fn visualize_mask(img: &image::RgbImage, mask: &Mask, idx: usize, layout: &OutputLayout, written: &mut Vec<PathBuf>) -> Result<()> {
	let mask_p = layout.mask(idx);
	imageio::save_mask(mask, &mask_p)?;
	written.push(mask_p);

	let mut fig = Figure::show_image(img, DEFAULT_DPI);
	let points_p = layout.with_points();
	fig.save(&points_p)?;
	if !written.contains(&points_p) {
		written.push(points_p);
	}

	fig.show_mask(mask, MaskColor::Fixed);
	let mask_vis_p = layout.with_mask(idx);
	fig.save(&mask_vis_p)?;
	written.push(mask_vis_p);
	Ok(())
}

fn on_mask_error(policy: FailurePolicy, idx: usize, error: anyhow::Error, report: &mut RunReport) -> Result<()> {
	match policy {
		FailurePolicy::FailFast => Err(error.context(format!("mask {idx}"))),
		FailurePolicy::Continue => {
			tracing::warn!(mask = idx, "skipping mask: {error:#}");
			report.failures.push(MaskFailure { index: idx, error });
			Ok(())
		}
	}
}

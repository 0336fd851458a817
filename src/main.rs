use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use segfill_rs::error::FillError;
use segfill_rs::inpaint::{SamplerSettings, StableDiffusionInpainter};
use segfill_rs::model::{self, ModelStore};
use segfill_rs::pipeline::{self, RunConfig};
use segfill_rs::segment::{ClipSegSegmenter, SegmentSettings};
use segfill_rs::{cli, device};

fn main() {
	// Logs and errors go to stderr; stdout stays clean.
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	if let Err(e) = run() {
		eprintln!("{e:#}");
		std::process::exit(1);
	}
}

fn run() -> Result<()> {
	let args = cli::Args::parse();
	let cfg = RunConfig::from_args(&args)?;
	// Fail before any model download when the input is missing.
	if !cfg.input_img.is_file() {
		return Err(FillError::MissingImage(cfg.input_img.clone()).into());
	}

	let device = device::select(args.device)?;
	tracing::info!(%device, deterministic = args.deterministic, "compute device selected");

	let store = ModelStore::new(args.model_dir.as_deref(), !args.offline)?;
	let seg_bundle = store.ensure(&model::CLIPSEG)?;
	let sd_bundle = store.ensure(&model::SD_INPAINT)?;
	let tokenizer = seg_bundle.path(model::CLIP_TOKENIZER);

	let mut segmenter = ClipSegSegmenter::new(
		seg_bundle.path("onnx/model.onnx"),
		&tokenizer,
		SegmentSettings {
			threshold: args.seg_threshold,
			min_region_frac: args.min_region_frac
		},
		args.deterministic
	)?;
	let mut inpainter = StableDiffusionInpainter::new(
		&sd_bundle,
		&tokenizer,
		SamplerSettings {
			steps: args.steps as usize,
			guidance_scale: args.guidance_scale
		},
		args.deterministic
	)?;

	let report = pipeline::run(&cfg, device, &mut segmenter, &mut inpainter)?;
	if report.masks == 0 {
		tracing::warn!(prompt = %cfg.seg_prompt, "no region matched the segmentation prompt");
	}
	if !report.is_success() {
		let failed: Vec<String> = report.failures.iter().map(|f| f.index.to_string()).collect();
		bail!("{} of {} masks failed: {}", failed.len(), report.masks, failed.join(", "));
	}
	Ok(())
}

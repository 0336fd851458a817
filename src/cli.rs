use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Device {
	/// Use CUDA when ONNX Runtime reports it available, CPU otherwise.
	Auto,
	/// Always use CPU inference.
	Cpu,
	/// Require CUDA. Fails if the provider is unavailable.
	Gpu
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FailurePolicy {
	/// Abort the run on the first failing mask.
	#[default]
	FailFast,
	/// Log the failure, skip that mask and keep going. Exit status is still non-zero.
	Continue
}

#[derive(Debug, Parser)]
#[command(name = "segfill-rs", version, about = "Segment an object by text prompt and fill it with a diffusion model")]
pub struct Args {
	/// Path to a single input image.
	#[arg(long = "input_img")]
	pub input_img: PathBuf,

	/// Text describing the object to segment.
	#[arg(long = "seg_prompt")]
	pub seg_prompt: String,

	/// Text describing what to paint in place of the object.
	#[arg(long = "fill_prompt")]
	pub fill_prompt: String,

	/// Square dilation kernel applied to every mask. No dilation when omitted.
	#[arg(long = "dilate_kernel_size", value_parser = clap::value_parser!(u32).range(1..))]
	pub dilate_kernel_size: Option<u32>,

	/// Results go to `<output_dir>/<input stem>/`.
	#[arg(long = "output_dir")]
	pub output_dir: PathBuf,

	/// Seed for the fill step. Every mask starts from this seed.
	#[arg(long)]
	pub seed: Option<u64>,

	/// Ask ONNX Runtime for deterministic kernels.
	#[arg(long)]
	pub deterministic: bool,

	/// Device selection.
	#[arg(long, value_enum, default_value_t = Device::Auto)]
	pub device: Device,

	/// What to do when filling one mask fails.
	#[arg(long = "on_error", value_enum, default_value_t = FailurePolicy::FailFast)]
	pub on_error: FailurePolicy,

	/// Denoising steps for the inpainting sampler.
	#[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..))]
	pub steps: u32,

	/// Classifier-free guidance scale. Values <= 1 disable guidance.
	#[arg(long = "guidance_scale", default_value_t = 7.5)]
	pub guidance_scale: f32,

	/// Probability above which a pixel belongs to the segmented object (0-1).
	#[arg(long = "seg_threshold", default_value_t = 0.4)]
	pub seg_threshold: f32,

	/// Drop segmented regions smaller than this fraction of the image.
	#[arg(long = "min_region_frac", default_value_t = 0.002)]
	pub min_region_frac: f32,

	/// Model cache directory (defaults to the per-user cache).
	#[arg(long = "model_dir")]
	pub model_dir: Option<PathBuf>,

	/// Never download models; fail if any are missing from the cache.
	#[arg(long)]
	pub offline: bool
}

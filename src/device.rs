use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ort::ep::{self, ExecutionProvider};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};

use crate::cli;

/// Where inference runs. Chosen once per process and passed to every model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
	Cpu,
	Cuda
}

impl ComputeDevice {
	pub fn as_str(self) -> &'static str {
		match self {
			ComputeDevice::Cpu => "cpu",
			ComputeDevice::Cuda => "cuda"
		}
	}
}

impl fmt::Display for ComputeDevice {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Session settings shared by every model in a run.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
	pub device: ComputeDevice,
	pub deterministic: bool
}

pub fn select(pref: cli::Device) -> Result<ComputeDevice> {
	match pref {
		cli::Device::Cpu => Ok(ComputeDevice::Cpu),
		cli::Device::Gpu => {
			if !cuda_available() {
				bail!("--device gpu requested but the CUDA execution provider is not available");
			}
			Ok(ComputeDevice::Cuda)
		}
		cli::Device::Auto => Ok(if cuda_available() { ComputeDevice::Cuda } else { ComputeDevice::Cpu })
	}
}

fn cuda_available() -> bool {
	match ep::CUDA::default().is_available() {
		Ok(ok) => ok,
		Err(e) => {
			tracing::debug!("CUDA availability check failed: {e}");
			false
		}
	}
}

fn base_builder(deterministic: bool) -> Result<SessionBuilder> {
	let builder = Session::builder()
		.context("create ORT session builder")?
		.with_optimization_level(GraphOptimizationLevel::Level3)
		.context("set optimization level")?;
	if deterministic {
		return builder
			.with_deterministic_compute(true)
			.context("enable deterministic compute");
	}
	Ok(builder)
}

/// Build a session for `model_path`. A CUDA session that fails to initialize falls back to CPU.
pub fn open_session(model_path: &Path, opts: SessionOptions) -> Result<Session> {
	tracing::debug!(model = %model_path.display(), device = %opts.device, "loading model");
	match opts.device {
		ComputeDevice::Cpu => base_builder(opts.deterministic)?
			.commit_from_file(model_path)
			.with_context(|| format!("load onnx model: {}", model_path.display())),
		ComputeDevice::Cuda => {
			let cuda = base_builder(opts.deterministic)?
				.with_execution_providers([ep::CUDA::default().build()])
				.context("configure CUDA EP")?
				.commit_from_file(model_path);
			match cuda {
				Ok(s) => Ok(s),
				Err(e) => {
					tracing::warn!("CUDA init failed for {}, falling back to CPU: {e:#}", model_path.display());
					base_builder(opts.deterministic)?
						.commit_from_file(model_path)
						.with_context(|| format!("load onnx model (CPU fallback): {}", model_path.display()))
				}
			}
		}
	}
}

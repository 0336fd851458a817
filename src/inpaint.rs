use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::{Rgb, RgbImage};
use ndarray::{Array1, Array2, Array3, Array4, Axis, Ix3, Ix4, concatenate, s};
use ort::session::Session;
use ort::value::TensorRef;
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;

use crate::crop::{FillWindow, WORK_SIZE};
use crate::device::{self, ComputeDevice, SessionOptions};
use crate::error::FillError;
use crate::mask::Mask;
use crate::model::ModelBundle;
use crate::scheduler::DdimScheduler;
use crate::tokenizer::{CLIP_MAX_LEN, ClipTokenizer};

pub trait Inpainter {
	/// Return `image` with the pixels under `mask` repainted to match `prompt`. All randomness
	/// comes from `rng`.
	fn fill(&mut self, image: &RgbImage, mask: &Mask, prompt: &str, device: ComputeDevice, rng: &mut StdRng) -> Result<RgbImage>;
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
	pub steps: usize,
	pub guidance_scale: f32
}

impl Default for SamplerSettings {
	fn default() -> Self {
		SamplerSettings {
			steps: 50,
			guidance_scale: 7.5
		}
	}
}

impl SamplerSettings {
	fn guided(&self) -> bool {
		self.guidance_scale > 1.0
	}
}

const LATENT_SCALE: f32 = 0.18215;
const LATENT_CHANNELS: usize = 4;

struct SdSessions {
	text_encoder: Session,
	unet: Session,
	vae_encoder: Session,
	vae_decoder: Session
}

/// Stable Diffusion inpainting over four ONNX graphs.
pub struct StableDiffusionInpainter {
	text_encoder: PathBuf,
	unet: PathBuf,
	vae_encoder: PathBuf,
	vae_decoder: PathBuf,
	tokenizer: ClipTokenizer,
	settings: SamplerSettings,
	deterministic: bool,
	sessions: Option<(ComputeDevice, SdSessions)>
}

impl StableDiffusionInpainter {
	pub fn new(bundle: &ModelBundle, tokenizer_path: &Path, settings: SamplerSettings, deterministic: bool) -> Result<Self> {
		Ok(StableDiffusionInpainter {
			text_encoder: bundle.path("text_encoder/model.onnx"),
			unet: bundle.path("unet/model.onnx"),
			vae_encoder: bundle.path("vae_encoder/model.onnx"),
			vae_decoder: bundle.path("vae_decoder/model.onnx"),
			tokenizer: ClipTokenizer::from_file(tokenizer_path)?,
			settings,
			deterministic,
			sessions: None
		})
	}

	fn sessions(&mut self, device: ComputeDevice) -> Result<&mut SdSessions> {
		let stale = !matches!(&self.sessions, Some((d, _)) if *d == device);
		if stale {
			let opts = SessionOptions {
				device,
				deterministic: self.deterministic
			};
			let s = SdSessions {
				text_encoder: device::open_session(&self.text_encoder, opts)?,
				unet: device::open_session(&self.unet, opts)?,
				vae_encoder: device::open_session(&self.vae_encoder, opts)?,
				vae_decoder: device::open_session(&self.vae_decoder, opts)?
			};
			self.sessions = Some((device, s));
		}
		match self.sessions.as_mut() {
			Some((_, s)) => Ok(s),
			None => bail!("inpainting sessions missing")
		}
	}

	fn text_embeddings(&mut self, prompt: &str, device: ComputeDevice) -> Result<Array3<f32>> {
		let cond_ids = self.tokenizer.encode_padded(prompt, CLIP_MAX_LEN)?;
		let uncond_ids = if self.settings.guided() {
			Some(self.tokenizer.encode_padded("", CLIP_MAX_LEN)?)
		} else {
			None
		};

		let sessions = self.sessions(device)?;
		let cond = encode_text(&mut sessions.text_encoder, &cond_ids)?;
		match uncond_ids {
			Some(ids) => {
				let uncond = encode_text(&mut sessions.text_encoder, &ids)?;
				Ok(concatenate(Axis(0), &[uncond.view(), cond.view()])?)
			}
			None => Ok(cond)
		}
	}

	fn sample(&mut self, crop: &RgbImage, mask: &Mask, prompt: &str, device: ComputeDevice, rng: &mut StdRng) -> Result<RgbImage> {
		let settings = self.settings;
		let embeddings = self.text_embeddings(prompt, device)?;
		let sessions = self.sessions(device)?;

		let (w, h) = crop.dimensions();
		let (lw, lh) = ((w / 8) as usize, (h / 8) as usize);

		let masked = masked_image_tensor(crop, mask);
		let masked_latents = run_single(&mut sessions.vae_encoder, "sample", &masked)?.mapv(|v| v * LATENT_SCALE);
		let mask_latent = mask_tensor(&mask.resize(lw as u32, lh as u32));

		let scheduler = DdimScheduler::new(settings.steps);
		let sigma = scheduler.init_noise_sigma();
		let mut latents = Array4::<f32>::from_shape_fn((1, LATENT_CHANNELS, lh, lw), |_| rng.sample::<f32, _>(StandardNormal) * sigma);

		let batch = embeddings.shape()[0];
		for (i, &t) in scheduler.timesteps().iter().enumerate() {
			let step_in = concatenate(Axis(1), &[latents.view(), mask_latent.view(), masked_latents.view()])?;
			let unet_in = if batch == 2 {
				concatenate(Axis(0), &[step_in.view(), step_in.view()])?
			} else {
				step_in
			};
			// The exported UNet takes an int64 timestep.
			let timestep = Array1::<i64>::from_elem(1, t as i64);

			let eps = {
				let outputs = sessions
					.unet
					.run(ort::inputs![
						"sample" => TensorRef::from_array_view(&unet_in)?,
						"timestep" => TensorRef::from_array_view(&timestep)?,
						"encoder_hidden_states" => TensorRef::from_array_view(&embeddings)?
					])
					.with_context(|| format!("unet step {i} (t={t})"))?;
				outputs[0]
					.try_extract_array::<f32>()
					.context("extract unet output")?
					.to_owned()
					.into_dimensionality::<Ix4>()
					.context("unet output rank")?
			};
			let eps = if batch == 2 { apply_guidance(&eps, settings.guidance_scale) } else { eps };
			latents = scheduler.step(&eps, t, &latents);
			tracing::trace!(step = i + 1, total = settings.steps, t, "denoise");
		}

		let latents = latents.mapv(|v| v / LATENT_SCALE);
		let decoded = run_single(&mut sessions.vae_decoder, "latent_sample", &latents)?;
		Ok(tensor_to_image(&decoded))
	}
}

impl Inpainter for StableDiffusionInpainter {
	fn fill(&mut self, image: &RgbImage, mask: &Mask, prompt: &str, device: ComputeDevice, rng: &mut StdRng) -> Result<RgbImage> {
		if mask.dimensions() != image.dimensions() {
			return Err(FillError::InvalidInput(format!(
				"mask is {:?} but image is {:?}",
				mask.dimensions(),
				image.dimensions()
			))
			.into());
		}
		let Some(window) = FillWindow::around(mask, WORK_SIZE) else {
			tracing::debug!("empty mask, nothing to fill");
			return Ok(image.clone());
		};
		tracing::info!(
			x = window.region.x,
			y = window.region.y,
			w = window.region.width,
			h = window.region.height,
			steps = self.settings.steps,
			%device,
			"inpainting window"
		);

		let (crop, crop_mask) = window.extract(image, mask);
		let filled = self
			.sample(&crop, &crop_mask, prompt, device, rng)
			.map_err(|e| FillError::Inpainting(format!("{e:#}")))?;
		Ok(window.paste(image, mask, &filled))
	}
}

fn encode_text(session: &mut Session, ids: &[u32]) -> Result<Array3<f32>> {
	let ids = Array2::<i32>::from_shape_fn((1, ids.len()), |(_, j)| ids[j] as i32);
	let outputs = session
		.run(ort::inputs!["input_ids" => TensorRef::from_array_view(&ids)?])
		.context("run text encoder")?;
	let out = outputs[0]
		.try_extract_array::<f32>()
		.context("extract text embeddings")?
		.to_owned()
		.into_dimensionality::<Ix3>()
		.context("text embedding rank")?;
	Ok(out)
}

fn run_single(session: &mut Session, input: &str, x: &Array4<f32>) -> Result<Array4<f32>> {
	let outputs = session
		.run(ort::inputs![input => TensorRef::from_array_view(x)?])
		.with_context(|| format!("run model on {input}"))?;
	let out = outputs[0]
		.try_extract_array::<f32>()
		.context("extract output tensor")?
		.to_owned()
		.into_dimensionality::<Ix4>()
		.context("output rank")?;
	Ok(out)
}

/// `uncond + scale * (cond - uncond)` over a `[2, C, H, W]` prediction.
fn apply_guidance(eps: &Array4<f32>, scale: f32) -> Array4<f32> {
	let uncond = eps.slice(s![0..1, .., .., ..]);
	let cond = eps.slice(s![1..2, .., .., ..]);
	&uncond + &((&cond - &uncond) * scale)
}

/// Image scaled to `[-1, 1]` with masked pixels zeroed.
fn masked_image_tensor(img: &RgbImage, mask: &Mask) -> Array4<f32> {
	let (w, h) = (img.width() as usize, img.height() as usize);
	let mut t = Array4::<f32>::zeros((1, 3, h, w));
	for (x, y, p) in img.enumerate_pixels() {
		if mask.get(x, y) {
			continue;
		}
		for c in 0..3 {
			t[[0, c, y as usize, x as usize]] = p.0[c] as f32 / 127.5 - 1.0;
		}
	}
	t
}

fn mask_tensor(mask: &Mask) -> Array4<f32> {
	let (w, h) = mask.dimensions();
	Array4::from_shape_fn((1, 1, h as usize, w as usize), |(_, _, y, x)| if mask.get(x as u32, y as u32) { 1.0 } else { 0.0 })
}

fn tensor_to_image(t: &Array4<f32>) -> RgbImage {
	let (h, w) = (t.shape()[2], t.shape()[3]);
	RgbImage::from_fn(w as u32, h as u32, |x, y| {
		let px = |c: usize| {
			let v = t[[0, c, y as usize, x as usize]] / 2.0 + 0.5;
			(v.clamp(0.0, 1.0) * 255.0).round() as u8
		};
		Rgb([px(0), px(1), px(2)])
	})
}

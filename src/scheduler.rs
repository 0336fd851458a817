//! DDIM sampling schedule (eta = 0) with scaled-linear betas, the configuration Stable Diffusion
//! inpainting checkpoints are trained with.

use ndarray::Array4;

pub const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

#[derive(Debug, Clone)]
pub struct DdimScheduler {
	alphas_cumprod: Vec<f64>,
	final_alpha_cumprod: f64,
	step_ratio: usize,
	timesteps: Vec<usize>
}

impl DdimScheduler {
	pub fn new(inference_steps: usize) -> Self {
		let steps = inference_steps.clamp(1, TRAIN_TIMESTEPS);
		let (s0, s1) = (BETA_START.sqrt(), BETA_END.sqrt());

		let mut alphas_cumprod = Vec::with_capacity(TRAIN_TIMESTEPS);
		let mut acc = 1.0f64;
		for i in 0..TRAIN_TIMESTEPS {
			let b = s0 + (s1 - s0) * (i as f64) / ((TRAIN_TIMESTEPS - 1) as f64);
			acc *= 1.0 - b * b;
			alphas_cumprod.push(acc);
		}
		// Without "set alpha to one" the last step lands on the first training alpha.
		let final_alpha_cumprod = alphas_cumprod[0];

		let step_ratio = TRAIN_TIMESTEPS / steps;
		let timesteps = (0..steps).rev().map(|i| (i * step_ratio + STEPS_OFFSET).min(TRAIN_TIMESTEPS - 1)).collect();

		DdimScheduler {
			alphas_cumprod,
			final_alpha_cumprod,
			step_ratio,
			timesteps
		}
	}

	/// Timesteps in sampling order (descending).
	pub fn timesteps(&self) -> &[usize] {
		&self.timesteps
	}

	pub fn init_noise_sigma(&self) -> f32 {
		1.0
	}

	pub fn alpha_cumprod(&self, t: usize) -> f64 {
		self.alphas_cumprod[t]
	}

	/// One deterministic DDIM update from `t` to the previous timestep given predicted noise.
	pub fn step(&self, eps: &Array4<f32>, t: usize, sample: &Array4<f32>) -> Array4<f32> {
		let a_t = self.alphas_cumprod[t];
		let a_prev = match t.checked_sub(self.step_ratio) {
			Some(prev) => self.alphas_cumprod[prev],
			None => self.final_alpha_cumprod
		};

		let sqrt_a_t = a_t.sqrt() as f32;
		let sqrt_1m_a_t = (1.0 - a_t).sqrt() as f32;
		let sqrt_a_prev = a_prev.sqrt() as f32;
		let sqrt_1m_a_prev = (1.0 - a_prev).sqrt() as f32;

		let mut out = sample.clone();
		ndarray::Zip::from(&mut out).and(eps).for_each(|x, &e| {
			let x0 = (*x - sqrt_1m_a_t * e) / sqrt_a_t;
			*x = sqrt_a_prev * x0 + sqrt_1m_a_prev * e;
		});
		out
	}
}

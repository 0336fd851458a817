use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use image::{Rgb, RgbImage};
use rand::Rng;
use rand::rngs::StdRng;

use segfill_rs::cli::FailurePolicy;
use segfill_rs::device::ComputeDevice;
use segfill_rs::error::FillError;
use segfill_rs::imageio;
use segfill_rs::inpaint::Inpainter;
use segfill_rs::mask::Mask;
use segfill_rs::pipeline::{self, RunConfig};
use segfill_rs::segment::{Prediction, SegmentResult, Segmenter};

struct FixedSegmenter {
	masks: Vec<Mask>,
	calls: Vec<(PathBuf, Vec<String>)>
}

impl FixedSegmenter {
	fn new(masks: Vec<Mask>) -> Self {
		FixedSegmenter { masks, calls: Vec::new() }
	}
}

impl Segmenter for FixedSegmenter {
	fn predict(&mut self, image_path: &Path, prompts: &[String], _device: ComputeDevice) -> Result<Prediction> {
		self.calls.push((image_path.to_path_buf(), prompts.to_vec()));
		let results = self
			.masks
			.iter()
			.map(|m| SegmentResult {
				mask: m.clone(),
				score: 1.0,
				bbox: m.bbox().expect("test masks are non-empty"),
				prompt_index: 0
			})
			.collect();
		Ok(Prediction { raw: Vec::new(), results })
	}
}

/// Paints masked pixels with a color drawn from the supplied rng.
#[derive(Default)]
struct NoiseInpainter {
	fail_on: Option<usize>,
	calls: usize,
	first_draws: Vec<u64>,
	prompts: Vec<String>
}

impl Inpainter for NoiseInpainter {
	fn fill(&mut self, image: &RgbImage, mask: &Mask, prompt: &str, _device: ComputeDevice, rng: &mut StdRng) -> Result<RgbImage> {
		let call = self.calls;
		self.calls += 1;
		self.prompts.push(prompt.to_string());
		if self.fail_on == Some(call) {
			bail!("out of memory");
		}
		self.first_draws.push(rng.random());

		let mut out = image.clone();
		for (x, y, p) in out.enumerate_pixels_mut() {
			if mask.get(x, y) {
				*p = Rgb([rng.random(), rng.random(), rng.random()]);
			}
		}
		Ok(out)
	}
}

fn block(w: u32, h: u32, x0: u32, y0: u32, size: u32) -> Mask {
	let mut m = Mask::new(w, h);
	for y in y0..y0 + size {
		for x in x0..x0 + size {
			m.set(x, y, true);
		}
	}
	m
}

fn write_image(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
	let p = dir.join(name);
	let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 90]));
	imageio::save_image(&img, &p).unwrap();
	p
}

fn config(input: &Path, out: &Path) -> RunConfig {
	RunConfig::new(input, "dog", "a teddy bear on a bench", out).unwrap()
}

fn listing(dir: &Path) -> Vec<String> {
	let mut names: Vec<String> = std::fs::read_dir(dir)
		.unwrap()
		.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
		.collect();
	names.sort();
	names
}

#[test]
fn dog_example_layout() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "dog.png", 64, 48);
	let results = tmp.path().join("results");

	let mut cfg = config(&input, &results);
	cfg.dilate_kernel_size = Some(15);

	let mut seg = FixedSegmenter::new(vec![block(64, 48, 20, 20, 8)]);
	let mut fill = NoiseInpainter::default();
	let report = pipeline::run(&cfg, ComputeDevice::Cpu, &mut seg, &mut fill).unwrap();

	assert!(report.is_success());
	assert_eq!(report.output_dir, results.join("dog"));
	assert_eq!(
		listing(&results.join("dog")),
		vec!["filled_with_mask_0.png", "mask_0.png", "with_mask_0.png", "with_points.png"]
	);
	assert_eq!(seg.calls, vec![(input.clone(), vec!["dog".to_string()])]);
	assert_eq!(fill.prompts, vec!["a teddy bear on a bench".to_string()]);
}

#[test]
fn one_set_of_files_per_mask() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "street.jpg", 50, 40);
	let cfg = config(&input, tmp.path());

	let masks = vec![block(50, 40, 1, 1, 5), block(50, 40, 20, 10, 6), block(50, 40, 40, 30, 4)];
	let mut seg = FixedSegmenter::new(masks);
	let mut fill = NoiseInpainter::default();
	let report = pipeline::run(&cfg, ComputeDevice::Cpu, &mut seg, &mut fill).unwrap();

	let names = listing(&tmp.path().join("street"));
	let count = |prefix: &str| names.iter().filter(|n| n.starts_with(prefix)).count();
	assert_eq!(count("mask_"), 3);
	assert_eq!(count("with_mask_"), 3);
	assert_eq!(count("with_points"), 1);
	assert_eq!(count("filled_with_mask_"), 3);
	assert_eq!(report.masks, 3);
	assert_eq!(report.written.len(), 10);
}

#[test]
fn undilated_mask_is_saved_verbatim() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "cat.png", 30, 30);
	let cfg = config(&input, tmp.path());

	let mut m = Mask::new(30, 30);
	for (x, y) in [(3, 4), (4, 4), (10, 20), (29, 29)] {
		m.set(x, y, true);
	}
	let mut seg = FixedSegmenter::new(vec![m.clone()]);
	pipeline::run(&cfg, ComputeDevice::Cpu, &mut seg, &mut NoiseInpainter::default()).unwrap();

	let saved = image::open(tmp.path().join("cat/mask_0.png")).unwrap().to_luma8();
	assert_eq!(saved.as_raw(), m.as_gray().as_raw());
}

#[test]
fn dilated_mask_contains_original() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "cat.png", 30, 30);
	let mut cfg = config(&input, tmp.path());
	cfg.dilate_kernel_size = Some(5);

	let m = block(30, 30, 10, 10, 3);
	let mut seg = FixedSegmenter::new(vec![m.clone()]);
	pipeline::run(&cfg, ComputeDevice::Cpu, &mut seg, &mut NoiseInpainter::default()).unwrap();

	let saved = imageio::load_mask(&tmp.path().join("cat/mask_0.png")).unwrap();
	assert_eq!(saved.area(), 7 * 7);
	for y in 0..30 {
		for x in 0..30 {
			if m.get(x, y) {
				assert!(saved.get(x, y));
			}
		}
	}
}

#[test]
fn visualizations_match_image_size() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "wide.png", 123, 45);
	let cfg = config(&input, tmp.path());

	let mut seg = FixedSegmenter::new(vec![block(123, 45, 50, 10, 10)]);
	pipeline::run(&cfg, ComputeDevice::Cpu, &mut seg, &mut NoiseInpainter::default()).unwrap();

	for name in ["with_points.png", "with_mask_0.png", "filled_with_mask_0.png"] {
		let img = image::open(tmp.path().join("wide").join(name)).unwrap();
		assert_eq!((img.width(), img.height()), (123, 45), "{name}");
	}
	let points = imageio::load_image(&tmp.path().join("wide/with_points.png")).unwrap();
	let overlay = imageio::load_image(&tmp.path().join("wide/with_mask_0.png")).unwrap();
	assert_eq!(points.get_pixel(0, 0), overlay.get_pixel(0, 0));
	assert_ne!(points.get_pixel(55, 15), overlay.get_pixel(55, 15));
}

#[test]
fn seed_makes_fill_reproducible() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "dog.png", 40, 40);
	let masks = vec![block(40, 40, 2, 2, 6), block(40, 40, 20, 20, 6)];

	let mut outputs = Vec::new();
	for run in ["a", "b"] {
		let mut cfg = config(&input, &tmp.path().join(run));
		cfg.seed = Some(1234);
		let mut fill = NoiseInpainter::default();
		pipeline::run(&cfg, ComputeDevice::Cpu, &mut FixedSegmenter::new(masks.clone()), &mut fill).unwrap();

		// Every mask starts from the same seed.
		assert_eq!(fill.first_draws[0], fill.first_draws[1]);
		outputs.push(std::fs::read(tmp.path().join(run).join("dog/filled_with_mask_1.png")).unwrap());
	}
	assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn missing_input_creates_nothing() {
	let tmp = tempfile::tempdir().unwrap();
	let out = tmp.path().join("results");
	let cfg = config(&tmp.path().join("nope.png"), &out);

	let mut seg = FixedSegmenter::new(vec![block(10, 10, 0, 0, 2)]);
	let err = pipeline::run(&cfg, ComputeDevice::Cpu, &mut seg, &mut NoiseInpainter::default()).unwrap_err();

	assert!(matches!(err.downcast_ref::<FillError>(), Some(FillError::MissingImage(_))));
	assert!(!out.exists());
	assert!(seg.calls.is_empty());
}

#[test]
fn no_regions_writes_no_files() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "empty.png", 16, 16);
	let cfg = config(&input, tmp.path());

	let report = pipeline::run(&cfg, ComputeDevice::Cpu, &mut FixedSegmenter::new(Vec::new()), &mut NoiseInpainter::default()).unwrap();
	assert_eq!(report.masks, 0);
	assert!(listing(&tmp.path().join("empty")).is_empty());
}

#[test]
fn continue_policy_skips_failed_mask() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "dog.png", 40, 40);
	let mut cfg = config(&input, tmp.path());
	cfg.on_error = FailurePolicy::Continue;

	let masks = vec![block(40, 40, 0, 0, 4), block(40, 40, 10, 10, 4), block(40, 40, 30, 30, 4)];
	let mut fill = NoiseInpainter {
		fail_on: Some(1),
		..Default::default()
	};
	let report = pipeline::run(&cfg, ComputeDevice::Cpu, &mut FixedSegmenter::new(masks), &mut fill).unwrap();

	assert!(!report.is_success());
	assert_eq!(report.failures.len(), 1);
	assert_eq!(report.failures[0].index, 1);
	assert!(format!("{:#}", report.failures[0].error).contains("out of memory"));

	let dir = tmp.path().join("dog");
	assert!(dir.join("filled_with_mask_0.png").is_file());
	assert!(!dir.join("filled_with_mask_1.png").exists());
	assert!(dir.join("filled_with_mask_2.png").is_file());
}

#[test]
fn fail_fast_stops_at_first_error() {
	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "dog.png", 40, 40);
	let cfg = config(&input, tmp.path());

	let masks = vec![block(40, 40, 0, 0, 4), block(40, 40, 10, 10, 4), block(40, 40, 30, 30, 4)];
	let mut fill = NoiseInpainter {
		fail_on: Some(1),
		..Default::default()
	};
	let err = pipeline::run(&cfg, ComputeDevice::Cpu, &mut FixedSegmenter::new(masks), &mut fill).unwrap_err();

	assert!(format!("{err:#}").contains("out of memory"));
	assert_eq!(fill.calls, 2);
	let dir = tmp.path().join("dog");
	assert!(dir.join("filled_with_mask_0.png").is_file());
	assert!(!dir.join("filled_with_mask_2.png").exists());
	// Visualization pass finished before filling started.
	assert!(dir.join("with_mask_2.png").is_file());
}

#[test]
fn segmentation_error_is_fatal_even_when_continuing() {
	struct Broken;
	impl Segmenter for Broken {
		fn predict(&mut self, _: &Path, _: &[String], _: ComputeDevice) -> Result<Prediction> {
			bail!("model failed to load")
		}
	}

	let tmp = tempfile::tempdir().unwrap();
	let input = write_image(tmp.path(), "dog.png", 8, 8);
	let mut cfg = config(&input, tmp.path());
	cfg.on_error = FailurePolicy::Continue;

	let err = pipeline::run(&cfg, ComputeDevice::Cpu, &mut Broken, &mut NoiseInpainter::default()).unwrap_err();
	assert!(format!("{err:#}").contains("model failed to load"));
	assert!(!tmp.path().join("dog").exists());
}

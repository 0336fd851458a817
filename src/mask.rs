use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};

const ON: u8 = 255;
const OFF: u8 = 0;

/// Axis-aligned box in pixel coordinates. `width`/`height` are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
	pub x: u32,
	pub y: u32,
	pub width: u32,
	pub height: u32
}

impl BBox {
	pub fn center(&self) -> (u32, u32) {
		(self.x + self.width / 2, self.y + self.height / 2)
	}
}

/// Binary mask stored as 0/255 luma so it can be written as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
	img: GrayImage
}

impl Mask {
	pub fn new(width: u32, height: u32) -> Self {
		Mask { img: GrayImage::new(width, height) }
	}

	/// Binarize: a pixel is set iff its value is at least `threshold`.
	pub fn from_gray(gray: &GrayImage, threshold: u8) -> Self {
		let mut img = gray.clone();
		for p in img.pixels_mut() {
			p.0[0] = if p.0[0] >= threshold { ON } else { OFF };
		}
		Mask { img }
	}

	/// Binarize a probability map (values in `[0, 1]`, row-major, `width * height` long).
	pub fn from_probabilities(width: u32, height: u32, probs: &[f32], threshold: f32) -> Self {
		debug_assert_eq!(probs.len(), (width as usize) * (height as usize));
		let img = GrayImage::from_fn(width, height, |x, y| {
			let v = probs[(y as usize) * (width as usize) + x as usize];
			Luma([if v >= threshold { ON } else { OFF }])
		});
		Mask { img }
	}

	pub fn dimensions(&self) -> (u32, u32) {
		self.img.dimensions()
	}

	pub fn get(&self, x: u32, y: u32) -> bool {
		self.img.get_pixel(x, y).0[0] != OFF
	}

	pub fn set(&mut self, x: u32, y: u32, on: bool) {
		self.img.put_pixel(x, y, Luma([if on { ON } else { OFF }]));
	}

	pub fn as_gray(&self) -> &GrayImage {
		&self.img
	}

	pub fn area(&self) -> u64 {
		self.img.pixels().filter(|p| p.0[0] != OFF).count() as u64
	}

	pub fn is_empty(&self) -> bool {
		self.img.pixels().all(|p| p.0[0] == OFF)
	}

	pub fn bbox(&self) -> Option<BBox> {
		let (mut x0, mut y0) = (u32::MAX, u32::MAX);
		let (mut x1, mut y1) = (0u32, 0u32);
		for (x, y, p) in self.img.enumerate_pixels() {
			if p.0[0] == OFF {
				continue;
			}
			x0 = x0.min(x);
			y0 = y0.min(y);
			x1 = x1.max(x);
			y1 = y1.max(y);
		}
		if x0 == u32::MAX {
			return None;
		}
		Some(BBox {
			x: x0,
			y: y0,
			width: x1 - x0 + 1,
			height: y1 - y0 + 1
		})
	}

	/// Dilate with a `kernel_size` x `kernel_size` square structuring element.
	///
	/// Regions grow by `kernel_size / 2` pixels in every direction (Chebyshev distance), so even
	/// sizes behave like the next odd size. A size of 0 or 1 returns an identical mask.
	pub fn dilate(&self, kernel_size: u32) -> Mask {
		// Past the longer side every set pixel already reaches the whole image.
		let (w, h) = self.dimensions();
		let radius = (kernel_size / 2).min(w.max(h));
		if radius == 0 {
			return self.clone();
		}
		// imageproc takes the radius as u8; larger kernels are applied in passes.
		let mut img = self.img.clone();
		let mut left = radius;
		while left > 0 {
			let step = left.min(u8::MAX as u32);
			img = imageproc::morphology::dilate(&img, Norm::LInf, step as u8);
			left -= step;
		}
		Mask { img }
	}

	/// Split into 8-connected regions, dropping those with fewer than `min_area` pixels.
	pub fn regions(&self, min_area: u64) -> Vec<Mask> {
		let labels = connected_components(&self.img, Connectivity::Eight, Luma([OFF]));
		let count = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0) as usize;
		if count == 0 {
			return Vec::new();
		}

		let mut areas = vec![0u64; count + 1];
		for p in labels.pixels() {
			areas[p.0[0] as usize] += 1;
		}

		let (w, h) = self.dimensions();
		let mut out = Vec::new();
		for label in 1..=count {
			if areas[label] < min_area.max(1) {
				continue;
			}
			let img = GrayImage::from_fn(w, h, |x, y| {
				Luma([if labels.get_pixel(x, y).0[0] as usize == label { ON } else { OFF }])
			});
			out.push(Mask { img });
		}
		out
	}

	/// Nearest-neighbour resample; keeps the mask binary.
	pub fn resize(&self, width: u32, height: u32) -> Mask {
		if self.dimensions() == (width, height) {
			return self.clone();
		}
		let img = image::imageops::resize(&self.img, width, height, image::imageops::FilterType::Nearest);
		Mask { img }
	}

	pub fn crop(&self, b: BBox) -> Mask {
		let img = image::imageops::crop_imm(&self.img, b.x, b.y, b.width, b.height).to_image();
		Mask { img }
	}
}

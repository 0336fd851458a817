use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;
use rand::Rng;

use crate::mask::Mask;

/// Dots per inch used for figures.
pub const DEFAULT_DPI: f32 = 100.0;

/// Share of the figure taken by the axes (subplot margins); the saved canvas is the axes area.
const AXES_FRACTION: f32 = 0.77;

const OVERLAY_ALPHA: f32 = 0.6;

/// Default marker area in points squared.
pub const DEFAULT_MARKER_SIZE: f32 = 375.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FigureSize {
	pub width_in: f32,
	pub height_in: f32,
	pub dpi: f32
}

impl FigureSize {
	/// Size a figure so that its axes show the image at one pixel per image pixel.
	pub fn for_image(width: u32, height: u32, dpi: f32) -> Self {
		FigureSize {
			width_in: width as f32 / dpi / AXES_FRACTION,
			height_in: height as f32 / dpi / AXES_FRACTION,
			dpi
		}
	}

	pub fn canvas_pixels(&self) -> (u32, u32) {
		let w = (self.width_in * self.dpi * AXES_FRACTION).round().max(1.0) as u32;
		let h = (self.height_in * self.dpi * AXES_FRACTION).round().max(1.0) as u32;
		(w, h)
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskColor {
	/// Dodger blue, the overlay used for saved results.
	Fixed,
	Rgba([f32; 4])
}

impl MaskColor {
	pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
		MaskColor::Rgba([rng.random(), rng.random(), rng.random(), OVERLAY_ALPHA])
	}

	fn rgba(self) -> [f32; 4] {
		match self {
			MaskColor::Fixed => [30.0 / 255.0, 144.0 / 255.0, 1.0, OVERLAY_ALPHA],
			MaskColor::Rgba(c) => c
		}
	}
}

/// An image rendered onto a canvas with hidden axes.
pub struct Figure {
	canvas: RgbImage,
	size: FigureSize
}

impl Figure {
	pub fn show_image(img: &RgbImage, dpi: f32) -> Self {
		let size = FigureSize::for_image(img.width(), img.height(), dpi);
		let (w, h) = size.canvas_pixels();
		let canvas = if (w, h) == img.dimensions() {
			img.clone()
		} else {
			image::imageops::resize(img, w, h, image::imageops::FilterType::Triangle)
		};
		Figure { canvas, size }
	}

	pub fn canvas(&self) -> &RgbImage {
		&self.canvas
	}

	/// Alpha-blend the mask over the canvas.
	pub fn show_mask(&mut self, mask: &Mask, color: MaskColor) {
		let mask = mask.resize(self.canvas.width(), self.canvas.height());
		let [r, g, b, a] = color.rgba();
		let over = [r * 255.0, g * 255.0, b * 255.0];
		for (x, y, p) in self.canvas.enumerate_pixels_mut() {
			if !mask.get(x, y) {
				continue;
			}
			for c in 0..3 {
				let v = p.0[c] as f32 * (1.0 - a) + over[c] * a;
				p.0[c] = v.round().clamp(0.0, 255.0) as u8;
			}
		}
	}

	/// Draw star markers: green for positive labels (non-zero), red otherwise, outlined in white.
	/// `marker_size` is the marker area in points squared.
	pub fn show_points(&mut self, points: &[(f32, f32)], labels: &[u8], marker_size: f32) {
		let px_per_pt = self.size.dpi / 72.0;
		let outer = marker_size.sqrt() / 2.0 * px_per_pt;
		let edge = 1.25 * px_per_pt;

		for (&(x, y), &label) in points.iter().zip(labels) {
			let fill = if label != 0 { Rgb([0, 128, 0]) } else { Rgb([255, 0, 0]) };
			draw_polygon_mut(&mut self.canvas, &star(x, y, outer + edge), Rgb([255, 255, 255]));
			draw_polygon_mut(&mut self.canvas, &star(x, y, outer), fill);
		}
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		self.canvas
			.save(path)
			.with_context(|| format!("write figure: {}", path.display()))
	}
}

fn star(cx: f32, cy: f32, outer: f32) -> Vec<Point<i32>> {
	let inner = outer * 0.382;
	let mut pts: Vec<Point<i32>> = Vec::with_capacity(10);
	for i in 0..10 {
		let r = if i % 2 == 0 { outer } else { inner };
		let theta = -std::f32::consts::FRAC_PI_2 + i as f32 * std::f32::consts::PI / 5.0;
		let p = Point::new((cx + r * theta.cos()).round() as i32, (cy + r * theta.sin()).round() as i32);
		if pts.last() != Some(&p) && pts.first() != Some(&p) {
			pts.push(p);
		}
	}
	pts
}

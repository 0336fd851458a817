use image::RgbImage;
use image::imageops::FilterType;

use crate::mask::{BBox, Mask};

/// Side length the inpainting model works best at.
pub const WORK_SIZE: u32 = 512;

/// The UNet halves the latent (work size / 8) three times, so work sides must be multiples of 64.
const WORK_ALIGN: u32 = 64;

/// The crop of the image sent to the inpainting model, and the size it is resized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillWindow {
	pub region: BBox,
	pub work_width: u32,
	pub work_height: u32
}

impl FillWindow {
	/// Square window of side `max(mask bbox, target)` centered on the mask, clamped to the image.
	/// Returns `None` for an empty mask.
	pub fn around(mask: &Mask, target: u32) -> Option<Self> {
		let bbox = mask.bbox()?;
		let (img_w, img_h) = mask.dimensions();

		let side = bbox.width.max(bbox.height).max(target);
		let win_w = side.min(img_w);
		let win_h = side.min(img_h);

		let (cx, cy) = bbox.center();
		let x = cx.saturating_sub(win_w / 2).min(img_w - win_w);
		let y = cy.saturating_sub(win_h / 2).min(img_h - win_h);

		let scale = target as f64 / win_w.max(win_h) as f64;
		Some(FillWindow {
			region: BBox {
				x,
				y,
				width: win_w,
				height: win_h
			},
			work_width: work_side(win_w, scale),
			work_height: work_side(win_h, scale)
		})
	}

	/// Crop image and mask and resize both to the working size.
	pub fn extract(&self, img: &RgbImage, mask: &Mask) -> (RgbImage, Mask) {
		let r = self.region;
		let crop = image::imageops::crop_imm(img, r.x, r.y, r.width, r.height).to_image();
		let crop = image::imageops::resize(&crop, self.work_width, self.work_height, FilterType::Lanczos3);
		let m = mask.crop(r).resize(self.work_width, self.work_height);
		(crop, m)
	}

	/// Resize the model output back over the window and copy it into `img` wherever `mask` is set.
	/// Pixels outside the mask keep their original values.
	pub fn paste(&self, img: &RgbImage, mask: &Mask, filled: &RgbImage) -> RgbImage {
		let r = self.region;
		let filled = image::imageops::resize(filled, r.width, r.height, FilterType::Lanczos3);
		let mut out = img.clone();
		for y in 0..r.height {
			for x in 0..r.width {
				let (ix, iy) = (r.x + x, r.y + y);
				if mask.get(ix, iy) {
					out.put_pixel(ix, iy, *filled.get_pixel(x, y));
				}
			}
		}
		out
	}
}

fn work_side(len: u32, scale: f64) -> u32 {
	let v = (len as f64 * scale).round() as u32;
	((v + WORK_ALIGN / 2) / WORK_ALIGN * WORK_ALIGN).max(WORK_ALIGN)
}

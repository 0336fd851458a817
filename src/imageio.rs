use std::path::Path;

use anyhow::{Context, Result};
use image::RgbImage;

use crate::error::FillError;
use crate::mask::Mask;

/// Load an image as 8-bit RGB. Grayscale and alpha inputs are converted.
pub fn load_image(path: &Path) -> Result<RgbImage> {
	if !path.is_file() {
		return Err(FillError::MissingImage(path.to_path_buf()).into());
	}
	let img = image::open(path).with_context(|| format!("open image: {}", path.display()))?;
	Ok(img.to_rgb8())
}

pub fn save_image(img: &RgbImage, path: &Path) -> Result<()> {
	img.save(path).with_context(|| format!("write image: {}", path.display()))
}

/// Masks are written as single-channel PNGs with values 0 and 255.
pub fn save_mask(mask: &Mask, path: &Path) -> Result<()> {
	mask.as_gray()
		.save(path)
		.with_context(|| format!("write mask: {}", path.display()))
}

pub fn load_mask(path: &Path) -> Result<Mask> {
	let img = image::open(path).with_context(|| format!("open mask: {}", path.display()))?;
	Ok(Mask::from_gray(&img.to_luma8(), 128))
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgb;

	#[test]
	fn missing_image_is_typed_error() {
		let err = load_image(Path::new("/definitely/not/here.png")).unwrap_err();
		assert!(matches!(err.downcast_ref::<FillError>(), Some(FillError::MissingImage(_))));
	}

	#[test]
	fn mask_survives_png() {
		let dir = tempfile::tempdir().unwrap();
		let p = dir.path().join("m.png");

		let mut m = Mask::new(7, 5);
		m.set(3, 2, true);
		m.set(6, 4, true);
		save_mask(&m, &p).unwrap();

		assert_eq!(load_mask(&p).unwrap(), m);
	}

	#[test]
	fn rgb_image_keeps_pixels() {
		let dir = tempfile::tempdir().unwrap();
		let p = dir.path().join("i.png");

		let img = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
		save_image(&img, &p).unwrap();
		assert_eq!(load_image(&p).unwrap(), img);
	}
}

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::FillError;

const LOG_EVERY: Duration = Duration::from_secs(5);
const LFS_VERSION: &str = "version https://git-lfs.github.com/spec/";
const LFS_OID: &str = "oid sha256:";
/// LFS pointers are a few lines of text; anything longer is the file itself.
const POINTER_MAX: u64 = 1024;

/// Stream `url` into `dst`. When `sha256` is given, `dst` only appears if the body matches it.
pub fn fetch(url: &str, dst: &Path, sha256: Option<&str>) -> Result<()> {
	tracing::info!(%url, dst = %dst.display(), verified = sha256.is_some(), "downloading");
	let resp = ureq::get(url).call().with_context(|| format!("GET {url}"))?;
	let total = resp
		.headers()
		.get(ureq::http::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.parse::<u64>().ok());

	let mut body = resp.into_body().into_reader();
	let mut meter = Meter::new(url, total);
	let len = store_verified(&mut body, dst, sha256, |n| meter.advance(n)).with_context(|| format!("download {url}"))?;
	tracing::info!(%url, mib = mib(len), secs = meter.start.elapsed().as_secs_f64(), "downloaded");
	Ok(())
}

/// SHA-256 recorded by the Git LFS pointer served at `url`. `None` when the file there is not an
/// LFS pointer.
pub fn lfs_sha256(url: &str) -> Result<Option<String>> {
	let resp = ureq::get(url).call().with_context(|| format!("GET {url}"))?;
	let mut head = Vec::new();
	resp.into_body()
		.into_reader()
		.take(POINTER_MAX)
		.read_to_end(&mut head)
		.with_context(|| format!("read {url}"))?;
	Ok(std::str::from_utf8(&head).ok().and_then(parse_lfs_pointer))
}

/// Copy `src` into `dst` through a sibling `.part` file, hashing on the way. The part file is
/// removed on any failure, including a digest mismatch. Returns the number of bytes written.
fn store_verified(src: &mut impl Read, dst: &Path, sha256: Option<&str>, on_bytes: impl FnMut(u64)) -> Result<u64> {
	if let Some(parent) = dst.parent() {
		fs::create_dir_all(parent).map_err(|e| FillError::io(parent, e))?;
	}
	let part = part_path(dst);
	let file = File::create(&part).map_err(|e| FillError::io(&part, e))?;
	let mut out = BufWriter::new(file);

	let copied = copy_hashed(src, &mut out, on_bytes).and_then(|r| out.flush().map(|_| r));
	drop(out);
	let checked = copied
		.with_context(|| format!("write {}", part.display()))
		.and_then(|(len, got)| match sha256 {
			Some(expected) => check_sha256(expected, &got).map(|_| len).map_err(Into::into),
			None => Ok(len)
		});
	let len = match checked {
		Ok(len) => len,
		Err(e) => {
			let _ = fs::remove_file(&part);
			return Err(e);
		}
	};

	fs::rename(&part, dst).map_err(|e| FillError::io(dst, e))?;
	Ok(len)
}

fn copy_hashed(src: &mut impl Read, out: &mut impl Write, mut on_bytes: impl FnMut(u64)) -> io::Result<(u64, String)> {
	let mut hasher = Sha256::new();
	let mut buf = vec![0u8; 256 * 1024];
	let mut len = 0u64;
	loop {
		let n = match src.read(&mut buf) {
			Ok(0) => break,
			Ok(n) => n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e)
		};
		hasher.update(&buf[..n]);
		out.write_all(&buf[..n])?;
		len += n as u64;
		on_bytes(len);
	}
	Ok((len, hex::encode(hasher.finalize())))
}

fn check_sha256(expected: &str, got: &str) -> Result<(), FillError> {
	let expected = expected.trim().trim_start_matches("0x");
	if expected.eq_ignore_ascii_case(got) {
		Ok(())
	} else {
		Err(FillError::Model(format!("sha256 mismatch: expected {expected}, got {got}")))
	}
}

fn parse_lfs_pointer(text: &str) -> Option<String> {
	let mut lines = text.lines();
	if !lines.next()?.starts_with(LFS_VERSION) {
		return None;
	}
	let oid = lines.find_map(|l| l.strip_prefix(LFS_OID))?.trim();
	(oid.len() == 64 && oid.bytes().all(|b| b.is_ascii_hexdigit())).then(|| oid.to_ascii_lowercase())
}

fn part_path(dst: &Path) -> PathBuf {
	let mut name = dst.file_name().map(|s| s.to_os_string()).unwrap_or_default();
	name.push(".part");
	dst.with_file_name(name)
}

fn mib(bytes: u64) -> f64 {
	bytes as f64 / (1024.0 * 1024.0)
}

/// Rate-limited progress logging for one download.
struct Meter<'a> {
	url: &'a str,
	total: Option<u64>,
	start: Instant,
	last: Instant
}

impl<'a> Meter<'a> {
	fn new(url: &'a str, total: Option<u64>) -> Self {
		let now = Instant::now();
		Meter { url, total, start: now, last: now }
	}

	fn advance(&mut self, done: u64) {
		if self.last.elapsed() < LOG_EVERY {
			return;
		}
		self.last = Instant::now();
		let rate = mib(done) / self.start.elapsed().as_secs_f64().max(1e-3);
		match self.total {
			Some(t) if t > 0 => {
				let pct = done as f64 * 100.0 / t as f64;
				tracing::info!(url = self.url, mib = mib(done), of_mib = mib(t), pct = pct.round(), mib_per_s = rate, "download progress");
			}
			_ => tracing::info!(url = self.url, mib = mib(done), mib_per_s = rate, "download progress")
		}
	}
}

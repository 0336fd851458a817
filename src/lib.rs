//! Remove or replace an object in a photo: segment it with a text prompt, then repaint the
//! masked region with a diffusion inpainting model.

pub mod cli;
pub mod crop;
pub mod device;
pub mod download;
pub mod error;
pub mod imageio;
pub mod inpaint;
pub mod mask;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod segment;
pub mod tokenizer;
pub mod visualize;

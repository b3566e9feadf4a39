//! Single-image super-resolution GAN on libtorch.
//!
//! Tensors are channels-first (`[N, C, H, W]`) and pixel values live in
//! `[0, 255]`. A scale pair `(r0, r1)` is `(width factor, height factor)`.
pub mod config;
pub mod data;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod vgg;

pub use crate::{
    config::{Backbone, Mode, SrGanConfig, TrainConfig},
    error::{Error, Result},
    model::{SrGan, StepMetrics},
    vgg::VggFeatureExtractor,
};

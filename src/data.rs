//! Luminance patch pairs for training.
use crate::{
    error::{validation, Result},
    ops::{bicubic_rescale, crop_to_batch, rgb_to_gray},
};
use std::path::Path;
use tch::{data::Iter2, Device, Kind, Tensor};

/// Matched `(low-res, high-res)` patches in [0, 255].
#[derive(Debug)]
pub struct PatchDataset {
    lr: Tensor,
    hr: Tensor,
}

impl PatchDataset {
    /// Loads every image in `dir` at `patch_size * tiles` and folds the
    /// `tiles x tiles` grid of each one into separate patches.
    pub fn load_dir(
        dir: impl AsRef<Path>,
        patch_size: i64,
        tiles: i64,
        scale: (i64, i64),
    ) -> Result<Self> {
        let side = patch_size * tiles;
        let images = tch::vision::image::load_dir(dir, side, side)?;
        let patches = crop_to_batch(&images.to_kind(Kind::Float), (tiles, tiles))?;
        Self::from_rgb(&patches, scale)
    }

    /// Builds pairs from `[N, 3, H, W]` RGB high-res images.
    pub fn from_rgb(images: &Tensor, (r0, r1): (i64, i64)) -> Result<Self> {
        let hr = rgb_to_gray(&images.to_kind(Kind::Float))?.round();
        Self::from_luminance(hr, (r0, r1))
    }

    /// Builds pairs from `[N, 1, H, W]` luminance, downscaling with bicubic.
    pub fn from_luminance(hr: Tensor, (r0, r1): (i64, i64)) -> Result<Self> {
        let size = hr.size();
        if r0 < 1 || r1 < 1 || size.len() != 4 || size[2] % r1 != 0 || size[3] % r0 != 0 {
            return Err(validation(format!(
                "high-res {:?} is not a multiple of scale {:?}",
                size,
                (r0, r1)
            )));
        }
        let lr = bicubic_rescale(&hr, (1. / r0 as f64, 1. / r1 as f64))?
            .clamp(0., 255.)
            .round();
        Ok(Self { lr, hr })
    }

    pub fn len(&self) -> i64 {
        self.hr.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batches_per_epoch(&self, batch_size: i64) -> i64 {
        (self.len() + batch_size - 1) / batch_size
    }

    /// Shuffled mini-batches on `device`; the last one may be smaller.
    pub fn batches(&self, batch_size: i64, device: Device) -> Iter2 {
        let mut iter = Iter2::new(&self.lr, &self.hr, batch_size);
        iter.shuffle().to_device(device).return_smaller_last_batch();
        iter
    }
}

//! Typed model and training configuration.
use crate::error::{validation, Error, Result};
use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, str::FromStr};

/// Training objective of a model instance, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Pixel MSE only, generator optimizer only.
    WarmStart,
    /// MSE + adversarial + perceptual terms, two optimizers.
    Adversarial,
}

impl Mode {
    /// `init = true` selects the warm-start phase.
    pub fn from_init(init: bool) -> Self {
        if init {
            Self::WarmStart
        } else {
            Self::Adversarial
        }
    }
}

/// Perceptual backbone variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    Vgg16,
    Vgg19,
}

impl Backbone {
    /// Conv layers per block.
    pub fn block_depths(self) -> [i64; 5] {
        match self {
            Self::Vgg16 => [2, 2, 3, 3, 3],
            Self::Vgg19 => [2, 2, 4, 4, 4],
        }
    }
}

impl FromStr for Backbone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vgg16" => Ok(Self::Vgg16),
            "vgg19" => Ok(Self::Vgg19),
            _ => Err(validation(format!("unknown backbone {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrGanConfig {
    /// Residual block count.
    pub glayers: i64,
    /// Discriminator depth, must be even.
    pub dlayers: i64,
    /// `(block, conv)` of the perceptual layer, both 1-based.
    pub vgg_layer: (i64, i64),
    pub mode: Mode,
    /// Upsampling factor along width and height.
    pub scale: (i64, i64),
    /// Image channels of input and output, 1 or 3.
    pub channels: i64,
    pub backbone: Backbone,
}

impl Default for SrGanConfig {
    fn default() -> Self {
        Self {
            glayers: 16,
            dlayers: 8,
            vgg_layer: (2, 2),
            mode: Mode::WarmStart,
            scale: (4, 4),
            channels: 1,
            backbone: Backbone::Vgg19,
        }
    }
}

impl SrGanConfig {
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.glayers < 0 {
            return Err(validation(format!("glayers must be >= 0, got {}", self.glayers)));
        }
        if self.dlayers < 2 || self.dlayers % 2 != 0 {
            return Err(validation(format!(
                "dlayers must be a positive even number, got {}",
                self.dlayers
            )));
        }
        if self.scale.0 < 1 || self.scale.1 < 1 {
            return Err(validation(format!("scale must be >= 1, got {:?}", self.scale)));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(validation(format!(
                "channels must be 1 (luminance) or 3 (RGB), got {}",
                self.channels
            )));
        }
        let (block, conv) = self.vgg_layer;
        let depths = self.backbone.block_depths();
        if !(1..=5).contains(&block) || conv < 1 || conv > depths[block as usize - 1] {
            return Err(validation(format!(
                "vgg_layer {:?} does not exist in {:?}",
                self.vgg_layer, self.backbone
            )));
        }
        Ok(())
    }
}

/// Driver settings for the two training phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: SrGanConfig,
    pub batch_size: i64,
    /// High-resolution patch edge.
    pub patch_size: i64,
    /// Each loaded image is cut into `tiles x tiles` patches.
    pub tiles: i64,
    pub learning_rate: f64,
    pub decay_steps: i64,
    pub decay_rate: f64,
    pub init_epochs: u64,
    pub gan_epochs: u64,
    /// Steps between checkpoints and metric logs.
    pub save_every: i64,
    pub seed: Option<i64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: SrGanConfig::default(),
            batch_size: 64,
            patch_size: 96,
            tiles: 2,
            learning_rate: 1e-2,
            decay_steps: 1000,
            decay_rate: 0.96,
            init_epochs: 1,
            gan_epochs: 2,
            save_every: 1000,
            seed: None,
        }
    }
}

impl TrainConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let cfg: Self = serde_json::from_reader(reader)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.batch_size < 1 {
            return Err(validation("batch_size must be >= 1"));
        }
        let (sx, sy) = self.model.scale;
        if self.patch_size < 1 || self.patch_size % sx != 0 || self.patch_size % sy != 0 {
            return Err(validation(format!(
                "patch_size {} must be a positive multiple of scale {:?}",
                self.patch_size, self.model.scale
            )));
        }
        if self.tiles < 1 {
            return Err(validation("tiles must be >= 1"));
        }
        if self.save_every < 1 {
            return Err(validation("save_every must be >= 1"));
        }
        if self.decay_steps < 1 {
            return Err(validation("decay_steps must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(SrGanConfig::default().validate().is_ok());
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn odd_dlayers_rejected() {
        let cfg = SrGanConfig { dlayers: 7, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn channels_limited_to_gray_or_rgb() {
        for channels in [0, 2, 4] {
            let cfg = SrGanConfig { channels, ..Default::default() };
            assert!(matches!(cfg.validate(), Err(Error::Validation(_))), "{}", channels);
        }
        let cfg = SrGanConfig { channels: 3, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn vgg_layer_checked_against_backbone() {
        let cfg = SrGanConfig {
            vgg_layer: (3, 4),
            backbone: Backbone::Vgg16,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = SrGanConfig { backbone: Backbone::Vgg19, ..cfg };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn backbone_from_str() {
        assert_eq!("vgg16".parse::<Backbone>().unwrap(), Backbone::Vgg16);
        assert_eq!("vgg19".parse::<Backbone>().unwrap(), Backbone::Vgg19);
        assert!("resnet".parse::<Backbone>().is_err());
    }

    #[test]
    fn json_fills_defaults() {
        let cfg: TrainConfig =
            serde_json::from_str(r#"{"batch_size": 4, "model": {"mode": "adversarial"}}"#).unwrap();
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.model.mode, Mode::Adversarial);
        assert_eq!(cfg.model.glayers, 16);
        assert_eq!(cfg.patch_size, 96);
        assert_eq!(cfg.tiles, 2);
    }

    #[test]
    fn patch_must_divide_by_scale() {
        let cfg = TrainConfig {
            patch_size: 90,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mode_from_init_flag() {
        assert_eq!(Mode::from_init(true), Mode::WarmStart);
        assert_eq!(Mode::from_init(false), Mode::Adversarial);
    }
}

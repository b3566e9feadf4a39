//! SRGAN loss assembly and optimizer scheduling.
use crate::{
    config::{Mode, SrGanConfig},
    discriminator::{Discriminator, Logits},
    error::{shape, validation, Result},
    generator::Generator,
    metrics,
    vgg::VggFeatureExtractor,
};
use std::path::Path;
use tch::{nn, nn::OptimizerConfig as _, Device, Kind, Reduction, Tensor};
use tracing::{debug, info};

pub const GAN_WEIGHT: f64 = 1e-3;
pub const VGG_WEIGHT: f64 = 2e-6;
pub const DEFAULT_LEARNING_RATE: f64 = 1e-4;
pub const PIXEL_MAX: f64 = 255.;

const GENERATOR_FILE: &str = "generator.ot";
const DISCRIMINATOR_FILE: &str = "discriminator.ot";

pub fn mse_loss(x: &Tensor, y: &Tensor) -> Tensor {
    let diff = x - y;
    (&diff * &diff).mean(Kind::Float)
}

fn bce_with_logits(logit: &Tensor, real: bool) -> Tensor {
    let target = if real {
        logit.ones_like()
    } else {
        logit.zeros_like()
    };
    logit.binary_cross_entropy_with_logits::<Tensor>(&target, None, None, Reduction::Mean)
}

/// `base * rate^(step / decay_steps)`, not staircased.
pub fn exponential_decay(base: f64, step: i64, decay_steps: i64, rate: f64) -> f64 {
    base * rate.powf(step as f64 / decay_steps as f64)
}

/// Scalars reported for one batch. Losses are already weighted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub mse: f64,
    pub gan_loss: f64,
    pub vgg_loss: f64,
    pub d_loss: f64,
    pub psnr: f64,
    pub ssim: f64,
}

struct GeneratorTerms {
    mse: Tensor,
    gan: Tensor,
    vgg: Tensor,
}

impl GeneratorTerms {
    fn total(&self) -> Tensor {
        &self.mse + &self.gan + &self.vgg
    }
}

/// Generator output plus the fake-branch score in adversarial mode.
pub struct Output {
    pub sr: Tensor,
    pub fake: Option<Logits>,
}

/// One training phase of the SRGAN. The mode is fixed at construction.
pub struct SrGan<'a> {
    config: SrGanConfig,
    device: Device,
    vgg: &'a VggFeatureExtractor,
    generator_vs: nn::VarStore,
    generator: Generator,
    discriminator_vs: nn::VarStore,
    discriminator: Discriminator,
    opt_g: nn::Optimizer,
    opt_d: Option<nn::Optimizer>,
}

impl<'a> SrGan<'a> {
    pub fn new(config: &SrGanConfig, vgg: &'a VggFeatureExtractor, device: Device) -> Result<Self> {
        config.validate()?;
        if vgg.backbone() != config.backbone {
            return Err(validation(format!(
                "model expects {:?} features, extractor is {:?}",
                config.backbone,
                vgg.backbone()
            )));
        }
        let generator_vs = nn::VarStore::new(device);
        let generator = Generator::new(&generator_vs.root(), config);
        let mut discriminator_vs = nn::VarStore::new(device);
        let discriminator =
            Discriminator::new(&discriminator_vs.root(), config.channels, config.dlayers)?;
        let opt_g = nn::adam(0.9, 0.999, 0.).build(&generator_vs, DEFAULT_LEARNING_RATE)?;
        let opt_d = match config.mode {
            Mode::WarmStart => None,
            Mode::Adversarial => {
                Some(nn::adam(0.9, 0.999, 0.).build(&discriminator_vs, DEFAULT_LEARNING_RATE)?)
            }
        };
        discriminator_vs.freeze();
        info!(
            mode = ?config.mode,
            glayers = config.glayers,
            dlayers = config.dlayers,
            scale = ?config.scale,
            upsample = ?generator.upsample_mode(),
            "built srgan"
        );
        Ok(Self {
            config: config.clone(),
            device,
            vgg,
            generator_vs,
            generator,
            discriminator_vs,
            discriminator,
            opt_g,
            opt_d,
        })
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn config(&self) -> &SrGanConfig {
        &self.config
    }

    pub fn generator_store(&self) -> &nn::VarStore {
        &self.generator_vs
    }

    pub fn discriminator_store(&self) -> &nn::VarStore {
        &self.discriminator_vs
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.opt_g.set_lr(lr);
        if let Some(opt_d) = self.opt_d.as_mut() {
            opt_d.set_lr(lr);
        }
    }

    /// Generator output, with the discriminator's fake-branch score in
    /// adversarial mode.
    pub fn forward_t(&self, lr: &Tensor, train: bool) -> Output {
        let sr = lr.to_kind(Kind::Float).apply_t(&self.generator, train);
        let fake = match self.config.mode {
            Mode::WarmStart => None,
            Mode::Adversarial => Some(self.fake_logits(&sr, train)),
        };
        Output { sr, fake }
    }

    /// Generator output in inference mode.
    pub fn upscale(&self, lr: &Tensor) -> Tensor {
        tch::no_grad(|| {
            lr.to_device(self.device)
                .to_kind(Kind::Float)
                .apply_t(&self.generator, false)
        })
    }

    pub fn real_logits(&self, hr: &Tensor, train: bool) -> Logits {
        self.discriminator.evaluate(hr, train)
    }

    pub fn fake_logits(&self, sr: &Tensor, train: bool) -> Logits {
        self.discriminator.evaluate(sr, train)
    }

    /// One optimization step on a `(low-res, high-res)` batch.
    pub fn step(&mut self, lr: &Tensor, hr: &Tensor) -> Result<StepMetrics> {
        let (lr, hr) = self.check_pair(lr, hr)?;
        let sr = lr.apply_t(&self.generator, true);
        match self.config.mode {
            Mode::WarmStart => {
                let mse = mse_loss(&sr, &hr);
                self.opt_g.backward_step(&mse);
                tch::no_grad(|| self.measure(&sr, &hr, false))
            }
            Mode::Adversarial => {
                self.generator_vs.freeze();
                self.discriminator_vs.unfreeze();
                let d_loss = self.discriminator_update_loss(&sr, &hr);
                if let Some(opt_d) = self.opt_d.as_mut() {
                    opt_d.backward_step(&d_loss);
                }
                self.discriminator_vs.freeze();
                self.generator_vs.unfreeze();

                let terms = self.generator_terms(&sr, &hr, true)?;
                self.opt_g.backward_step(&terms.total());

                let sr = sr.detach();
                let metrics = StepMetrics {
                    mse: terms.mse.double_value(&[]),
                    gan_loss: terms.gan.double_value(&[]),
                    vgg_loss: terms.vgg.double_value(&[]),
                    d_loss: d_loss.double_value(&[]),
                    psnr: metrics::psnr(&sr, &hr, PIXEL_MAX)?,
                    ssim: metrics::ssim(&sr, &hr, PIXEL_MAX)?,
                };
                debug!(?metrics, "adversarial step");
                Ok(metrics)
            }
        }
    }

    /// Losses and metrics on a batch without updating anything.
    pub fn evaluate(&self, lr: &Tensor, hr: &Tensor) -> Result<StepMetrics> {
        let (lr, hr) = self.check_pair(lr, hr)?;
        tch::no_grad(|| {
            let sr = lr.apply_t(&self.generator, false);
            self.measure(&sr, &hr, false)
        })
    }

    fn generator_terms(&self, sr: &Tensor, hr: &Tensor, train: bool) -> Result<GeneratorTerms> {
        let mse = mse_loss(sr, hr);
        let fake = self.fake_logits(sr, train);
        let gan = bce_with_logits(&fake.logit, true) * GAN_WEIGHT;
        let layer = [self.config.vgg_layer];
        let hr_features = tch::no_grad(|| self.vgg.extract(hr, &layer, false))?;
        let sr_features = self.vgg.extract(sr, &layer, false)?;
        let vgg = hr_features
            .iter()
            .zip(&sr_features)
            .map(|(h, s)| mse_loss(h, s))
            .fold(Tensor::zeros(&[], (Kind::Float, self.device)), |acc, l| acc + l)
            * VGG_WEIGHT;
        Ok(GeneratorTerms { mse, gan, vgg })
    }

    fn discriminator_loss(&self, sr: &Tensor, hr: &Tensor, train: bool) -> Tensor {
        let real = self.real_logits(hr, train);
        let fake = self.fake_logits(sr, train);
        bce_with_logits(&real.logit, true) + bce_with_logits(&fake.logit, false)
    }

    /// Discriminator objective for its own update. The batch is detached, so
    /// none of this gradient reaches the generator store.
    fn discriminator_update_loss(&self, sr: &Tensor, hr: &Tensor) -> Tensor {
        self.discriminator_loss(&sr.detach(), hr, true)
    }

    fn measure(&self, sr: &Tensor, hr: &Tensor, train: bool) -> Result<StepMetrics> {
        let terms = self.generator_terms(sr, hr, train)?;
        let d_loss = self.discriminator_loss(sr, hr, train);
        Ok(StepMetrics {
            mse: terms.mse.double_value(&[]),
            gan_loss: terms.gan.double_value(&[]),
            vgg_loss: terms.vgg.double_value(&[]),
            d_loss: d_loss.double_value(&[]),
            psnr: metrics::psnr(sr, hr, PIXEL_MAX)?,
            ssim: metrics::ssim(sr, hr, PIXEL_MAX)?,
        })
    }

    fn check_pair(&self, lr: &Tensor, hr: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, c, h, w) = lr.size4()?;
        let (r0, r1) = self.config.scale;
        let expected = [n, self.config.channels, h * r1, w * r0];
        if c != self.config.channels || hr.size() != expected {
            return Err(shape(format!(
                "low-res {:?} and high-res {:?} do not match scale {:?} with {} channels",
                lr.size(),
                hr.size(),
                self.config.scale,
                self.config.channels
            )));
        }
        let float = |t: &Tensor| t.to_device(self.device).to_kind(Kind::Float);
        Ok((float(lr), float(hr)))
    }

    /// Writes `generator.ot` and `discriminator.ot` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.generator_vs.save(dir.join(GENERATOR_FILE))?;
        self.discriminator_vs.save(dir.join(DISCRIMINATOR_FILE))?;
        Ok(())
    }

    /// Restores the generator from `dir`, and the discriminator when its
    /// checkpoint exists.
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.generator_vs.load(dir.join(GENERATOR_FILE))?;
        let discriminator = dir.join(DISCRIMINATOR_FILE);
        if discriminator.is_file() {
            self.discriminator_vs.load(discriminator)?;
            self.discriminator_vs.freeze();
        }
        info!(dir = %dir.display(), "restored checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backbone;
    use std::collections::HashMap;

    fn vgg() -> VggFeatureExtractor {
        VggFeatureExtractor::new(Device::Cpu, Backbone::Vgg16, false, &[-1, -1, 3]).unwrap()
    }

    fn config(mode: Mode) -> SrGanConfig {
        SrGanConfig {
            glayers: 1,
            dlayers: 4,
            vgg_layer: (2, 2),
            mode,
            scale: (2, 2),
            channels: 1,
            backbone: Backbone::Vgg16,
        }
    }

    fn batch() -> (Tensor, Tensor) {
        let opts = (Kind::Float, Device::Cpu);
        let hr = Tensor::rand(&[2, 1, 16, 16], opts) * 255.;
        let lr = crate::ops::bicubic_rescale(&hr, (0.5, 0.5)).unwrap();
        (lr, hr)
    }

    fn snapshot(vs: &nn::VarStore) -> HashMap<String, Tensor> {
        vs.variables()
            .into_iter()
            .map(|(name, var)| (name, var.copy()))
            .collect()
    }

    fn changed(vs: &nn::VarStore, before: &HashMap<String, Tensor>) -> usize {
        vs.variables()
            .iter()
            .filter(|(name, var)| !var.equal(&before[*name]))
            .count()
    }

    #[test]
    fn warm_start_never_touches_discriminator() {
        let vgg = vgg();
        let mut model = SrGan::new(&config(Mode::WarmStart), &vgg, Device::Cpu).unwrap();
        let g_before = snapshot(model.generator_store());
        let d_before = snapshot(model.discriminator_store());
        let (lr, hr) = batch();
        let metrics = model.step(&lr, &hr).unwrap();
        assert!(metrics.mse.is_finite());
        assert!(metrics.d_loss.is_finite());
        assert!(changed(model.generator_store(), &g_before) > 0);
        assert_eq!(changed(model.discriminator_store(), &d_before), 0);
        assert!(model.forward_t(&lr, false).fake.is_none());
    }

    #[test]
    fn adversarial_updates_both_networks() {
        let vgg = vgg();
        let mut model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        let g_before = snapshot(model.generator_store());
        let d_before = snapshot(model.discriminator_store());
        let (lr, hr) = batch();
        let metrics = model.step(&lr, &hr).unwrap();
        assert!(metrics.gan_loss > 0.);
        assert!(metrics.vgg_loss >= 0.);
        assert!(metrics.d_loss > 0.);
        assert!(changed(model.generator_store(), &g_before) > 0);
        assert!(changed(model.discriminator_store(), &d_before) > 0);
        let out = model.forward_t(&lr, false);
        assert_eq!(out.sr.size(), [2, 1, 16, 16]);
        assert_eq!(out.fake.map(|f| f.logit.size()), Some(vec![2, 1]));
    }

    fn softplus_mean(xs: &Tensor) -> f64 {
        xs.softplus().mean(Kind::Float).double_value(&[])
    }

    fn assert_close(actual: f64, expected: f64) {
        let tol = 1e-4 * expected.abs().max(1e-6);
        assert!((actual - expected).abs() <= tol, "{} != {}", actual, expected);
    }

    #[test]
    fn adversarial_terms_follow_labels_and_weights() {
        let vgg = vgg();
        let model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        let (lr, hr) = batch();
        let metrics = model.evaluate(&lr, &hr).unwrap();

        let sr = model.upscale(&lr);
        let (real, fake) = tch::no_grad(|| {
            (model.real_logits(&hr, false), model.fake_logits(&sr, false))
        });
        // bce(x, 1) = softplus(-x), bce(x, 0) = softplus(x)
        assert_close(metrics.gan_loss, 1e-3 * softplus_mean(&fake.logit.neg()));
        assert_close(
            metrics.d_loss,
            softplus_mean(&real.logit.neg()) + softplus_mean(&fake.logit),
        );
    }

    #[test]
    fn perceptual_term_is_weighted_feature_mse() {
        let vgg = vgg();
        let model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        let (lr, hr) = batch();
        let metrics = model.evaluate(&lr, &hr).unwrap();

        let sr = model.upscale(&lr);
        let expected = tch::no_grad(|| {
            let h = vgg.extract(&hr, &[(2, 2)], false).unwrap().remove(0);
            let s = vgg.extract(&sr, &[(2, 2)], false).unwrap().remove(0);
            let diff = h - s;
            (&diff * &diff).mean(Kind::Float).double_value(&[]) * 2e-6
        });
        assert!(expected > 0.);
        assert_close(metrics.vgg_loss, expected);
    }

    #[test]
    fn discriminator_update_stops_at_generator_output() {
        let vgg = vgg();
        let mut model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        model.discriminator_vs.unfreeze();
        let (lr, hr) = batch();
        let grad_sum = |t: &Tensor| {
            let g = t.grad();
            if g.defined() {
                g.abs().sum(Kind::Float).double_value(&[])
            } else {
                0.
            }
        };

        let sr = lr.apply_t(&model.generator, true);
        model.discriminator_update_loss(&sr, &hr).backward();
        for (name, var) in model.generator_store().variables() {
            assert_eq!(grad_sum(&var), 0., "{} received a gradient", name);
        }
        let d_grads: f64 = model.discriminator_store().variables().values().map(grad_sum).sum();
        assert!(d_grads > 0.);

        // the same loss on the attached batch does reach the generator
        let sr = lr.apply_t(&model.generator, true);
        model.discriminator_loss(&sr, &hr, true).backward();
        let g_grads: f64 = model.generator_store().variables().values().map(grad_sum).sum();
        assert!(g_grads > 0.);
    }

    #[test]
    fn real_and_fake_branches_share_weights() {
        let vgg = vgg();
        let model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        let (_, hr) = batch();
        for &train in &[false, true] {
            let real = model.real_logits(&hr, train);
            let fake = model.fake_logits(&hr, train);
            assert!(real.logit.equal(&fake.logit));
        }
    }

    #[test]
    fn vgg_is_never_optimized() {
        let vgg = vgg();
        let before = snapshot(vgg.var_store());
        let mut model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        let (lr, hr) = batch();
        model.step(&lr, &hr).unwrap();
        assert_eq!(changed(vgg.var_store(), &before), 0);
    }

    #[test]
    fn evaluate_leaves_weights_alone() {
        let vgg = vgg();
        let model = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        let before = snapshot(model.generator_store());
        let (lr, hr) = batch();
        let metrics = model.evaluate(&lr, &hr).unwrap();
        assert!(metrics.psnr.is_finite());
        assert!(metrics.ssim <= 1.);
        assert_eq!(changed(model.generator_store(), &before), 0);
    }

    #[test]
    fn mismatched_pair_is_a_shape_error() {
        let vgg = vgg();
        let mut model = SrGan::new(&config(Mode::WarmStart), &vgg, Device::Cpu).unwrap();
        let (lr, _) = batch();
        let hr = Tensor::rand(&[2, 1, 12, 16], (Kind::Float, Device::Cpu));
        assert!(matches!(model.step(&lr, &hr), Err(crate::Error::Shape(_))));
    }

    #[test]
    fn odd_dlayers_fail_construction() {
        let vgg = vgg();
        let cfg = SrGanConfig {
            dlayers: 3,
            ..config(Mode::Adversarial)
        };
        assert!(matches!(
            SrGan::new(&cfg, &vgg, Device::Cpu),
            Err(crate::Error::Validation(_))
        ));
    }

    #[test]
    fn checkpoint_round_trip() {
        let vgg = vgg();
        let dir = std::env::temp_dir().join(format!("srgan-ckpt-{}", std::process::id()));
        let warm = SrGan::new(&config(Mode::WarmStart), &vgg, Device::Cpu).unwrap();
        warm.save(&dir).unwrap();
        let mut gan = SrGan::new(&config(Mode::Adversarial), &vgg, Device::Cpu).unwrap();
        gan.load(&dir).unwrap();
        let (lr, _) = batch();
        assert!(warm.upscale(&lr).equal(&gan.upscale(&lr)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn decay_schedule() {
        assert_eq!(exponential_decay(1e-2, 0, 1000, 0.96), 1e-2);
        assert!((exponential_decay(1e-2, 1000, 1000, 0.96) - 9.6e-3).abs() < 1e-12);
        assert!((exponential_decay(1e-2, 500, 1000, 0.96) - 1e-2 * 0.96f64.sqrt()).abs() < 1e-12);
    }
}

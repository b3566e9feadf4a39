use srgan::{
    data::PatchDataset, model::exponential_decay, Mode, Result, SrGan, TrainConfig,
    VggFeatureExtractor,
};
use std::path::{Path, PathBuf};
use tch::Device;
use tracing::info;

const INIT_DIR: &str = "init";
const GAN_DIR: &str = "gan";

pub fn train(
    dataset: PathBuf,
    model: PathBuf,
    vgg_weights: Option<PathBuf>,
    cfg: TrainConfig,
) -> Result<()> {
    cfg.validate()?;
    let device = Device::cuda_if_available();
    if let Some(seed) = cfg.seed {
        tch::manual_seed(seed);
    }
    let data = PatchDataset::load_dir(&dataset, cfg.patch_size, cfg.tiles, cfg.model.scale)?;
    info!(patches = data.len(), dataset = %dataset.display(), ?device, "loaded dataset");

    let mut vgg = VggFeatureExtractor::new(device, cfg.model.backbone, false, &[-1, -1, 3])?;
    match vgg_weights {
        Some(path) => vgg.load(path)?,
        None => tracing::warn!("no vgg weights given, perceptual loss uses random features"),
    }

    let init_dir = model.join(INIT_DIR);
    let mut warm = SrGan::new(&cfg.model.clone().with_mode(Mode::WarmStart), &vgg, device)?;
    run_phase(&mut warm, &data, &cfg, cfg.init_epochs, &init_dir, device)?;
    drop(warm);

    let mut gan = SrGan::new(&cfg.model.clone().with_mode(Mode::Adversarial), &vgg, device)?;
    gan.load(&init_dir)?;
    run_phase(&mut gan, &data, &cfg, cfg.gan_epochs, &model.join(GAN_DIR), device)?;
    Ok(())
}

fn run_phase(
    model: &mut SrGan,
    data: &PatchDataset,
    cfg: &TrainConfig,
    epochs: u64,
    dir: &Path,
    device: Device,
) -> Result<()> {
    let mode = model.mode();
    let total = epochs * data.batches_per_epoch(cfg.batch_size) as u64;
    info!(?mode, epochs, steps = total, "starting phase");
    let pb = indicatif::ProgressBar::new(total);
    let mut step = 0;
    for epoch in 0..epochs {
        for (lr, hr) in data.batches(cfg.batch_size, device) {
            model.set_learning_rate(exponential_decay(
                cfg.learning_rate,
                step,
                cfg.decay_steps,
                cfg.decay_rate,
            ));
            let metrics = model.step(&lr, &hr)?;
            pb.inc(1);
            if step % cfg.save_every == 0 {
                info!(
                    ?mode,
                    epoch,
                    step,
                    mse = metrics.mse,
                    gan = metrics.gan_loss,
                    vgg = metrics.vgg_loss,
                    d = metrics.d_loss,
                    psnr = metrics.psnr,
                    ssim = metrics.ssim,
                );
                model.save(dir)?;
            }
            step += 1;
        }
    }
    pb.finish();
    model.save(dir)?;
    info!(?mode, dir = %dir.display(), "phase finished");
    Ok(())
}

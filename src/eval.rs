use srgan::{
    generator::Generator,
    metrics::{psnr, ssim},
    model::PIXEL_MAX,
    ops::{bicubic_rescale, rgb_to_gray, shrink_mod_scale},
    Result, SrGanConfig,
};
use std::{fs::create_dir_all, path::PathBuf};
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

/// Upscales the luminance of `image` and writes it to `demo/eval.png`.
///
/// With `reference` set, `image` is treated as the ground truth: it is
/// downscaled first and the result is scored against it.
pub fn eval(
    gen_path: PathBuf,
    image: PathBuf,
    demo: PathBuf,
    cfg: SrGanConfig,
    reference: bool,
) -> Result<()> {
    cfg.validate()?;
    let device = Device::cuda_if_available();
    if !demo.is_dir() {
        create_dir_all(&demo)?;
    }

    let mut generator_vs = nn::VarStore::new(device);
    let generator = Generator::new(&generator_vs.root(), &cfg);
    generator_vs.load(&gen_path)?;
    generator_vs.freeze();
    info!(checkpoint = %gen_path.display(), "loaded generator");

    let rgb = tch::vision::image::load(&image)?
        .unsqueeze(0)
        .to_kind(Kind::Float);
    let gray = rgb_to_gray(&rgb)?.round().to_device(device);
    let (r0, r1) = cfg.scale;
    let (lr, hr) = if reference {
        let (_, _, h, w) = gray.size4()?;
        let (h, w) = shrink_mod_scale((h, w), cfg.scale);
        let hr = gray.narrow(2, 0, h).narrow(3, 0, w);
        let lr = bicubic_rescale(&hr, (1. / r0 as f64, 1. / r1 as f64))?
            .clamp(0., 255.)
            .round();
        (lr, Some(hr))
    } else {
        (gray, None)
    };
    let sr = tch::no_grad(|| lr.apply_t(&generator, false)).clamp(0., PIXEL_MAX);
    if let Some(hr) = hr {
        let (psnr, ssim) = (psnr(&sr, &hr, PIXEL_MAX)?, ssim(&sr, &hr, PIXEL_MAX)?);
        info!(psnr, ssim, "scored against reference");
    }
    let out: Tensor = sr
        .round()
        .to_kind(Kind::Uint8)
        .squeeze_dim(0)
        .repeat(&[3, 1, 1])
        .to_device(Device::Cpu);
    let path = demo.join("eval.png");
    tch::vision::image::save(&out, &path)?;
    info!(output = %path.display(), size = ?out.size(), "saved upscaled image");
    Ok(())
}

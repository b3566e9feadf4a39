//! Image quality metrics reported alongside the losses.
use crate::{
    error::{shape, Result},
    ops::{filter_valid, gaussian_kernel},
};
use tch::{Kind, Tensor};

const SSIM_WINDOW: i64 = 11;
const SSIM_SIGMA: f64 = 1.5;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

fn check_same(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.size() != b.size() || a.dim() != 4 {
        return Err(shape(format!(
            "metric inputs must be matching [N, C, H, W], got {:?} and {:?}",
            a.size(),
            b.size()
        )));
    }
    Ok(())
}

/// Peak signal-to-noise ratio in dB, averaged over the batch.
pub fn psnr(a: &Tensor, b: &Tensor, max_val: f64) -> Result<f64> {
    check_same(a, b)?;
    let diff = a.to_kind(Kind::Double) - b.to_kind(Kind::Double);
    let mse = (&diff * &diff).mean_dim(&[1, 2, 3], false, Kind::Double);
    let psnr = (mse.reciprocal() * (max_val * max_val)).log10() * 10.;
    Ok(psnr.mean(Kind::Double).double_value(&[]))
}

/// Structural similarity with a Gaussian window, averaged over the batch.
///
/// The window shrinks to the largest odd size that fits the image.
pub fn ssim(a: &Tensor, b: &Tensor, max_val: f64) -> Result<f64> {
    check_same(a, b)?;
    let size = a.size();
    let window = SSIM_WINDOW.min(size[2]).min(size[3]);
    let kernel = gaussian_kernel((window, window), SSIM_SIGMA)?.to_kind(Kind::Double);
    let a = a.to_kind(Kind::Double);
    let b = b.to_kind(Kind::Double);
    let c1 = (SSIM_K1 * max_val).powi(2);
    let c2 = (SSIM_K2 * max_val).powi(2);

    let mu_a = filter_valid(&a, &kernel)?;
    let mu_b = filter_valid(&b, &kernel)?;
    let sigma_aa = filter_valid(&(&a * &a), &kernel)? - &mu_a * &mu_a;
    let sigma_bb = filter_valid(&(&b * &b), &kernel)? - &mu_b * &mu_b;
    let sigma_ab = filter_valid(&(&a * &b), &kernel)? - &mu_a * &mu_b;

    let luminance = (&mu_a * &mu_b * 2. + c1) / (&mu_a * &mu_a + &mu_b * &mu_b + c1);
    let structure = (sigma_ab * 2. + c2) / (sigma_aa + sigma_bb + c2);
    let per_image = (luminance * structure).mean_dim(&[1, 2, 3], false, Kind::Double);
    Ok(per_image.mean(Kind::Double).double_value(&[]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn image(n: i64, h: i64, w: i64) -> Tensor {
        Tensor::rand(&[n, 1, h, w], (Kind::Float, Device::Cpu)) * 255.
    }

    #[test]
    fn psnr_of_known_error() {
        let a = Tensor::zeros(&[2, 1, 4, 4], (Kind::Float, Device::Cpu));
        let b = a.ones_like() * 2.55;
        // mse = 2.55^2, psnr = 20 log10(100)
        assert!((psnr(&a, &b, 255.).unwrap() - 40.).abs() < 1e-4);
    }

    #[test]
    fn psnr_of_identical_images_is_infinite() {
        let a = image(1, 8, 8);
        assert!(psnr(&a, &a, 255.).unwrap().is_infinite());
    }

    #[test]
    fn ssim_of_identical_images_is_one() {
        let a = image(2, 24, 20);
        assert!((ssim(&a, &a, 255.).unwrap() - 1.).abs() < 1e-6);
    }

    #[test]
    fn ssim_drops_with_noise() {
        let a = image(2, 24, 24);
        let noisy = &a + Tensor::randn(&[2, 1, 24, 24], (Kind::Float, Device::Cpu)) * 40.;
        let score = ssim(&a, &noisy, 255.).unwrap();
        assert!(score < 0.95, "{}", score);
    }

    #[test]
    fn ssim_fits_small_images() {
        let a = image(1, 6, 8);
        assert!((ssim(&a, &a, 255.).unwrap() - 1.).abs() < 1e-6);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        assert!(psnr(&image(1, 4, 4), &image(1, 4, 5), 255.).is_err());
        assert!(ssim(&image(1, 4, 4), &image(2, 4, 4), 255.).is_err());
    }
}

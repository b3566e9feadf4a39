//! Tensor primitives used by the networks and the data pipeline.
//!
//! Every image tensor is channels-first, `[N, C, H, W]`. Scale pairs are
//! `(r0, r1)`: `r0` acts on the width, `r1` on the height.
use crate::error::{shape, validation, Result};
use tch::{Device, Kind, Tensor};

/// Channel means subtracted before the VGG backbone, in BGR order.
pub const VGG_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

#[rustfmt::skip]
const YUV_TO_RGB: [f32; 9] = [
    1., 0., 1.139_883,
    1., -0.394_642_33, -0.580_621_85,
    1., 2.032_061_8, 0.,
];

const RGB_TO_GRAY: [f32; 3] = [0.2989, 0.587, 0.114];

/// Sub-pixel shift: `[N, C*r0*r1, H, W]` to `[N, C, H*r1, W*r0]`.
///
/// Input channel `(a * r0 + b) * C + c` lands on output pixel
/// `(h * r1 + a, w * r0 + b)` of channel `c`. Pure reshape and permute.
pub fn pixel_shift(xs: &Tensor, scale: (i64, i64), channels: i64) -> Result<Tensor> {
    let (_, c, _, _) = xs.size4()?;
    let (r0, r1) = scale;
    if channels < 1 || c != channels * r0 * r1 {
        return Err(shape(format!(
            "pixel_shift expects {}x{}x{} channels, got {}",
            channels, r0, r1, c
        )));
    }
    Ok(shift_packed(xs, scale, channels))
}

/// [`pixel_shift`] without the channel check, for layers whose filter count
/// is fixed at construction.
pub(crate) fn shift_packed(xs: &Tensor, (r0, r1): (i64, i64), channels: i64) -> Tensor {
    let size = xs.size();
    let (n, h, w) = (size[0], size[2], size[3]);
    xs.reshape(&[n, r1, r0, channels, h, w])
        .permute(&[0, 3, 4, 1, 5, 2])
        .reshape(&[n, channels, h * r1, w * r0])
}

/// Folds `r1` row tiles and `r0` column tiles into the batch axis.
pub fn crop_to_batch(xs: &Tensor, (r0, r1): (i64, i64)) -> Result<Tensor> {
    let (_, _, h, w) = xs.size4()?;
    if r0 < 1 || r1 < 1 || h % r1 != 0 || w % r0 != 0 {
        return Err(shape(format!(
            "cannot split {}x{} into {}x{} tiles",
            h, w, r1, r0
        )));
    }
    let xs = Tensor::cat(&xs.chunk(r1, 2), 0);
    Ok(Tensor::cat(&xs.chunk(r0, 3), 0))
}

/// Bicubic resize by `(sx, sy)`, output size rounded from the runtime shape.
pub fn bicubic_rescale(xs: &Tensor, (sx, sy): (f64, f64)) -> Result<Tensor> {
    let (_, _, h, w) = xs.size4()?;
    let oh = (h as f64 * sy).round() as i64;
    let ow = (w as f64 * sx).round() as i64;
    if oh < 1 || ow < 1 {
        return Err(validation(format!(
            "rescaling {}x{} by {:?} leaves an empty image",
            h,
            w,
            (sx, sy)
        )));
    }
    Ok(xs.upsample_bicubic2d(&[oh, ow], false, None::<f64>, None::<f64>))
}

/// Normalized 2-D Gaussian, `[kh, kw]`. Even sizes clip down to odd.
pub fn gaussian_kernel((kh, kw): (i64, i64), width: f64) -> Result<Tensor> {
    if kh < 1 || kw < 1 || width <= 0. {
        return Err(validation(format!(
            "bad gaussian kernel {}x{} with width {}",
            kh, kw, width
        )));
    }
    let odd = |k: i64| if k % 2 == 0 { k - 1 } else { k };
    let axis = |k: i64| Tensor::arange(k, (Kind::Double, Device::Cpu)) - (k / 2) as f64;
    let ys = axis(odd(kh)).view([-1, 1]);
    let xs = axis(odd(kw)).view([1, -1]);
    let kernel = ((&ys * &ys + &xs * &xs) / (-2. * width * width)).exp();
    Ok((&kernel / kernel.sum(Kind::Double)).to_kind(Kind::Float))
}

/// Filters each channel with the same 2-D kernel, same padding.
pub fn imfilter(xs: &Tensor, kernel: &Tensor) -> Result<Tensor> {
    let (kh, kw) = kernel_size(kernel)?;
    let (top, left) = ((kh - 1) / 2, (kw - 1) / 2);
    let padded = xs.constant_pad_nd(&[left, kw - 1 - left, top, kh - 1 - top]);
    filter_valid(&padded, kernel)
}

/// Per-channel filtering without padding.
pub(crate) fn filter_valid(xs: &Tensor, kernel: &Tensor) -> Result<Tensor> {
    let (_, c, _, _) = xs.size4()?;
    let (kh, kw) = kernel_size(kernel)?;
    let options = (xs.kind(), xs.device());
    // block-diagonal [C, C, kh, kw]: no cross-channel mixing
    let weight = Tensor::eye(c, options).view([c, c, 1, 1])
        * kernel.to_kind(options.0).to_device(options.1).view([1, 1, kh, kw]);
    Ok(xs.conv2d(&weight, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1))
}

fn kernel_size(kernel: &Tensor) -> Result<(i64, i64)> {
    match kernel.size().as_slice() {
        &[kh, kw] => Ok((kh, kw)),
        s => Err(shape(format!("filter kernel must be 2-D, got {:?}", s))),
    }
}

/// Divides every pixel by the RMS of its channel vector, then `* scale + bias`.
pub fn pixel_norm(xs: &Tensor, epsilon: f64, scale: f64, bias: f64) -> Tensor {
    let mean_square = (xs * xs).mean_dim(&[1], true, Kind::Float);
    xs * scale * (mean_square + epsilon).rsqrt() + bias
}

/// Clips `(h, w)` down to multiples of the scale.
pub fn shrink_mod_scale((h, w): (i64, i64), (r0, r1): (i64, i64)) -> (i64, i64) {
    (h - h % r1, w - w % r0)
}

pub fn yuv_to_rgb(xs: &Tensor) -> Result<Tensor> {
    mix_channels(xs, &YUV_TO_RGB, 3)
}

pub fn rgb_to_gray(xs: &Tensor) -> Result<Tensor> {
    mix_channels(xs, &RGB_TO_GRAY, 1)
}

fn mix_channels(xs: &Tensor, matrix: &[f32], c_out: i64) -> Result<Tensor> {
    let (_, c, _, _) = xs.size4()?;
    if c != 3 {
        return Err(shape(format!("expected 3 colour channels, got {}", c)));
    }
    let weight = Tensor::of_slice(matrix)
        .view([c_out, 3, 1, 1])
        .to_kind(xs.kind())
        .to_device(xs.device());
    Ok(xs.conv2d(&weight, None::<Tensor>, &[1, 1], &[0, 0], &[1, 1], 1))
}

/// Delta-orthogonal convolution initializer.
///
/// The centre tap of the `[out, in, k...]` kernel is an orthogonal matrix
/// scaled by `sqrt(gain)`, every other tap is zero, so the 2-norm of a signal
/// is preserved through a convolution at initialization.
#[derive(Debug, Clone, Copy)]
pub struct DeltaOrthogonal {
    pub gain: f64,
}

impl Default for DeltaOrthogonal {
    fn default() -> Self {
        Self { gain: 1. }
    }
}

impl DeltaOrthogonal {
    pub fn build(&self, dims: &[i64], device: Device) -> Result<Tensor> {
        if !(3..=5).contains(&dims.len()) {
            return Err(validation(format!(
                "delta orthogonal kernel must have rank 3 to 5, got {:?}",
                dims
            )));
        }
        let (c_out, c_in) = (dims[0], dims[1]);
        if c_in > c_out {
            return Err(validation(format!(
                "in filters ({}) cannot exceed out filters ({})",
                c_in, c_out
            )));
        }
        let a = Tensor::randn(&[c_out, c_out], (Kind::Float, device));
        let (q, r) = a.linalg_qr("reduced");
        // sign correction makes the factorization unique
        let q = q * r.diagonal(0, 0, 1).sign().view([1, -1]);
        let q = q.narrow(0, 0, c_in) * self.gain.sqrt();

        let weight = Tensor::zeros(dims, (Kind::Float, device));
        let mut centre = weight.shallow_clone();
        for k in &dims[2..] {
            centre = centre.select(2, (k - 1) / 2);
        }
        centre.copy_(&q.transpose(0, 1));
        Ok(weight)
    }
}

//! Layer constructors shared by the generator and the discriminator.
use tch::{nn, Tensor};

pub const LEAKY_SLOPE: f64 = 0.2;

/// Same-padded convolution with He-normal weights.
pub fn conv2d(p: nn::Path, c_in: i64, c_out: i64, ksize: i64, stride: i64) -> nn::Conv2D {
    let fan_in = (c_in * ksize * ksize) as f64;
    let cfg = nn::ConvConfig {
        stride,
        padding: ksize / 2,
        ws_init: nn::Init::Randn {
            mean: 0.,
            stdev: (2. / fan_in).sqrt(),
        },
        ..Default::default()
    };
    nn::conv2d(p, c_in, c_out, ksize, cfg)
}

/// Dense layer with N(0, 0.02) weights and zero bias.
pub fn dense(p: nn::Path, c_in: i64, c_out: i64) -> nn::Linear {
    let cfg = nn::LinearConfig {
        ws_init: nn::Init::Randn {
            mean: 0.,
            stdev: 0.02,
        },
        bs_init: Some(nn::Init::Const(0.)),
        ..Default::default()
    };
    nn::linear(p, c_in, c_out, cfg)
}

pub fn leaky_relu(v: f64) -> impl Fn(&Tensor) -> Tensor + Send + 'static {
    move |x| x.maximum(&(x * v))
}

/// Parametric ReLU with a learned per-channel slope.
#[derive(Debug)]
pub struct PRelu {
    alpha: Tensor,
}

impl PRelu {
    pub fn new(p: nn::Path, channels: i64) -> Self {
        let alpha = p.var("alpha", &[channels], nn::Init::Const(0.1));
        Self { alpha }
    }
}

impl nn::Module for PRelu {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let alpha = self.alpha.view([1, -1, 1, 1]);
        xs.relu() + alpha * (xs - xs.abs()) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::Module, Device, Kind};

    #[test]
    fn leaky_relu_scales_negatives() {
        let xs = Tensor::of_slice(&[-1f32, 0., 2.]);
        let ys = leaky_relu(LEAKY_SLOPE)(&xs);
        assert!(ys.allclose(&Tensor::of_slice(&[-0.2f32, 0., 2.]), 1e-6, 1e-6, false));
    }

    #[test]
    fn prelu_starts_at_point_one() {
        let vs = nn::VarStore::new(Device::Cpu);
        let prelu = PRelu::new(&vs.root() / "prelu", 2);
        let xs = Tensor::of_slice(&[-1f32, 3., -2., 4.]).view([1, 2, 2, 1]);
        let ys = prelu.forward(&xs);
        let expected = Tensor::of_slice(&[-0.1f32, 3., -0.2, 4.]).view([1, 2, 2, 1]);
        assert!(ys.allclose(&expected, 1e-6, 1e-6, false));
    }

    #[test]
    fn same_padding_keeps_size() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = conv2d(&vs.root() / "c", 1, 8, 9, 1);
        let ys = Tensor::randn(&[2, 1, 12, 10], (Kind::Float, Device::Cpu)).apply(&conv);
        assert_eq!(ys.size(), [2, 8, 12, 10]);
        let conv = conv2d(&vs.root() / "s", 1, 8, 3, 2);
        let ys = Tensor::randn(&[2, 1, 12, 11], (Kind::Float, Device::Cpu)).apply(&conv);
        assert_eq!(ys.size(), [2, 8, 6, 6]);
    }
}

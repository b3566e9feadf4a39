//! Residual generator with sub-pixel upsampling.
use crate::{config::SrGanConfig, layers::conv2d, ops::shift_packed};
use tch::{nn, Tensor};

pub const FEATURES: i64 = 64;
const EXPANDED: i64 = 256;

/// Upsampling path, chosen once from the scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsample {
    /// Scale (4, 4) as two 2x sub-pixel stages.
    FixedQuadruple,
    /// One sub-pixel stage of `(r0, r1)`.
    Generic(i64, i64),
}

impl Upsample {
    pub fn from_scale(scale: (i64, i64)) -> Self {
        match scale {
            (4, 4) => Self::FixedQuadruple,
            (r0, r1) => Self::Generic(r0, r1),
        }
    }

    /// Sub-pixel channel count fed to each shift stage.
    pub fn stage_channels(&self) -> Vec<i64> {
        match *self {
            Self::FixedQuadruple => vec![4, 4],
            Self::Generic(r0, r1) => vec![r0 * r1],
        }
    }

    fn build(&self, p: nn::Path) -> nn::SequentialT {
        let (stage1, stage2) = (&p / "stage1", &p / "stage2");
        match *self {
            Self::FixedQuadruple => nn::seq_t()
                .add(conv2d(&stage1 / "conv", EXPANDED, 4, 3, 1))
                .add_fn(Tensor::relu)
                .add_fn(|xs| shift_packed(xs, (2, 2), 1))
                .add(conv2d(&stage2 / "expand", 1, EXPANDED, 3, 1))
                .add(conv2d(&stage2 / "conv", EXPANDED, 4, 3, 1))
                .add_fn(Tensor::relu)
                .add_fn(|xs| shift_packed(xs, (2, 2), 1)),
            Self::Generic(r0, r1) => nn::seq_t()
                .add(conv2d(&stage1 / "conv", EXPANDED, r0 * r1, 3, 1))
                .add_fn(Tensor::relu)
                .add_fn(move |xs| shift_packed(xs, (r0, r1), 1)),
        }
    }
}

fn residual_block(p: nn::Path) -> impl nn::ModuleT {
    let conv1 = conv2d(&p / "conv1", FEATURES, FEATURES, 3, 1);
    let bn1 = nn::batch_norm2d(&p / "bn1", FEATURES, Default::default());
    let conv2 = conv2d(&p / "conv2", FEATURES, FEATURES, 3, 1);
    let bn2 = nn::batch_norm2d(&p / "bn2", FEATURES, Default::default());
    nn::func_t(move |xs, train| {
        let ys = xs
            .apply(&conv1)
            .apply_t(&bn1, train)
            .relu()
            .apply(&conv2)
            .apply_t(&bn2, train);
        xs + ys
    })
}

#[derive(Debug)]
pub struct Generator {
    shallow: nn::Conv2D,
    tower: nn::SequentialT,
    post_conv: nn::Conv2D,
    post_bn: nn::BatchNorm,
    expand: nn::Conv2D,
    upsample: nn::SequentialT,
    reconstruct: nn::Conv2D,
    mode: Upsample,
}

impl Generator {
    pub fn new(p: &nn::Path, config: &SrGanConfig) -> Self {
        let (tower_p, post) = (p / "tower", p / "post");
        let mut tower = nn::seq_t();
        for i in 0..config.glayers {
            tower = tower.add(residual_block(&tower_p / i));
        }
        let mode = Upsample::from_scale(config.scale);
        Self {
            shallow: conv2d(p / "shallow", config.channels, FEATURES, 9, 1),
            tower,
            post_conv: conv2d(&post / "conv", FEATURES, FEATURES, 3, 1),
            post_bn: nn::batch_norm2d(&post / "bn", FEATURES, Default::default()),
            expand: conv2d(p / "expand", FEATURES, EXPANDED, 3, 1),
            upsample: mode.build(p / "upsample"),
            reconstruct: conv2d(p / "reconstruct", 1, config.channels, 9, 1),
            mode,
        }
    }

    pub fn upsample_mode(&self) -> Upsample {
        self.mode
    }
}

impl nn::ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let shallow = xs.apply(&self.shallow).relu();
        let xs = shallow
            .apply_t(&self.tower, train)
            .apply(&self.post_conv)
            .apply_t(&self.post_bn, train)
            + &shallow;
        xs.apply(&self.expand)
            .apply_t(&self.upsample, train)
            .apply(&self.reconstruct)
    }
}

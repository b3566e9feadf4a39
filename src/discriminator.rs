//! Strided convolutional real/fake classifier.
use crate::{
    error::{validation, Result},
    layers::{conv2d, dense, leaky_relu, LEAKY_SLOPE},
};
use tch::{nn, Kind, Tensor};

const BASE_FILTERS: i64 = 64;
const HIDDEN: i64 = 1024;

/// Raw score and its sigmoid, both `[N, 1]`.
#[derive(Debug)]
pub struct Logits {
    pub logit: Tensor,
    pub probability: Tensor,
}

/// One weight set, evaluated on both real and generated batches.
#[derive(Debug)]
pub struct Discriminator {
    features: nn::SequentialT,
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Discriminator {
    /// Layer `i` of the `dlayers - 1` strided convs uses stride 2 on even `i`
    /// and doubles its channels on exactly those layers.
    pub fn new(p: &nn::Path, c_in: i64, dlayers: i64) -> Result<Self> {
        if dlayers < 2 || dlayers % 2 != 0 {
            return Err(validation(format!(
                "discriminator depth must be even, got {}",
                dlayers
            )));
        }
        let mut features = nn::seq_t()
            .add(conv2d(p / "conv0", c_in, BASE_FILTERS, 3, 1))
            .add_fn(leaky_relu(LEAKY_SLOPE));
        let mut filters = BASE_FILTERS;
        for i in 1..dlayers {
            let stride = if i % 2 == 0 { 2 } else { 1 };
            let c_out = filters * stride;
            features = features
                .add(conv2d(p / format!("conv{}", i), filters, c_out, 3, stride))
                .add(nn::batch_norm2d(p / format!("bn{}", i), c_out, Default::default()))
                .add_fn(leaky_relu(LEAKY_SLOPE));
            filters = c_out;
        }
        Ok(Self {
            features,
            fc1: dense(p / "fc1", filters, HIDDEN),
            fc2: dense(p / "fc2", HIDDEN, 1),
        })
    }

    /// Dense heads run per spatial position, the logit is their spatial mean.
    pub fn evaluate(&self, xs: &Tensor, train: bool) -> Logits {
        let leaky = leaky_relu(LEAKY_SLOPE);
        let ys = xs.apply_t(&self.features, train).permute(&[0, 2, 3, 1]);
        let logit = leaky(&ys.apply(&self.fc1))
            .apply(&self.fc2)
            .mean_dim(&[1, 2, 3], false, Kind::Float)
            .view([-1, 1]);
        let probability = logit.sigmoid();
        Logits { logit, probability }
    }
}

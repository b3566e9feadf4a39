//! Frozen VGG backbone used for the perceptual loss.
//!
//! Layers are registered as `block{b}_conv{c}` (1-based), followed by `fc1`,
//! `fc2` and `predictions` when the classification head is attached. The
//! weights are loaded once with [`VggFeatureExtractor::load`] and never
//! handed to an optimizer; gradients still flow through to the input.
use crate::{
    config::Backbone,
    error::{shape, validation, Result},
    ops::{yuv_to_rgb, VGG_MEAN},
};
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};
use tracing::debug;

const WIDTHS: [i64; 5] = [64, 128, 256, 512, 512];
const HEAD_SIZE: i64 = 224;
const CLASSES: i64 = 1000;

/// `(block, conv)` pair naming an activation point, both 1-based.
pub type LayerSelector = (i64, i64);

#[derive(Debug)]
struct Head {
    fc1: nn::Linear,
    fc2: nn::Linear,
    predictions: nn::Linear,
}

pub struct VggFeatureExtractor {
    vs: nn::VarStore,
    blocks: Vec<Vec<nn::Conv2D>>,
    head: Option<Head>,
    backbone: Backbone,
}

fn max_pool2d(xs: &Tensor) -> Tensor {
    xs.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false)
}

impl VggFeatureExtractor {
    /// `input_shape` describes the network input, trailing `[H, W, C]`; use
    /// `-1` for dynamic spatial sizes.
    pub fn new(
        device: Device,
        backbone: Backbone,
        include_top: bool,
        input_shape: &[i64],
    ) -> Result<Self> {
        if input_shape.len() < 3 {
            return Err(validation("input shape must be [H, W, 3]"));
        }
        let channels = input_shape[input_shape.len() - 1];
        if channels < 3 {
            return Err(validation(format!(
                "input shape must have 3 channels, got {}",
                channels
            )));
        }
        let mut vs = nn::VarStore::new(device);
        let root = vs.root();
        let conv_cfg = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };
        let mut c_in = 3;
        let blocks: Vec<Vec<nn::Conv2D>> = backbone
            .block_depths()
            .iter()
            .zip(WIDTHS.iter())
            .enumerate()
            .map(|(b, (&depth, &width))| {
                (1..=depth)
                    .map(|c| {
                        let name = format!("block{}_conv{}", b + 1, c);
                        let conv = nn::conv2d(&root / name, c_in, width, 3, conv_cfg);
                        c_in = width;
                        conv
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        let head = if include_top {
            let flat = WIDTHS[4] * (HEAD_SIZE / 32) * (HEAD_SIZE / 32);
            Some(Head {
                fc1: nn::linear(&root / "fc1", flat, 4096, Default::default()),
                fc2: nn::linear(&root / "fc2", 4096, 4096, Default::default()),
                predictions: nn::linear(&root / "predictions", 4096, CLASSES, Default::default()),
            })
        } else {
            None
        };
        vs.freeze();
        debug!(?backbone, include_top, "built perceptual backbone");
        Ok(Self {
            vs,
            blocks,
            head,
            backbone,
        })
    }

    /// Loads pretrained weights; the store stays frozen.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.vs.load(path)?;
        self.vs.freeze();
        Ok(())
    }

    pub fn backbone(&self) -> Backbone {
        self.backbone
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Activations at `selectors`, in order. An empty selector list returns
    /// the final output: the last pooled feature map, or class probabilities
    /// with the head attached.
    pub fn extract(
        &self,
        xs: &Tensor,
        selectors: &[LayerSelector],
        yuv_input: bool,
    ) -> Result<Vec<Tensor>> {
        for &(b, c) in selectors {
            let known = b >= 1 && c >= 1 && (b as usize) <= self.blocks.len()
                && (c as usize) <= self.blocks[b as usize - 1].len();
            if !known {
                return Err(validation(format!(
                    "block{}_conv{} does not exist in {:?}",
                    b, c, self.backbone
                )));
            }
        }
        let xs = self.preprocess(xs, yuv_input)?;
        if selectors.is_empty() {
            return Ok(vec![self.final_output(&xs)]);
        }

        let mut found: Vec<Option<Tensor>> = selectors.iter().map(|_| None).collect();
        let mut xs = xs;
        'blocks: for (b, block) in self.blocks.iter().enumerate() {
            if b > 0 {
                xs = max_pool2d(&xs);
            }
            for (c, conv) in block.iter().enumerate() {
                xs = xs.apply(conv).relu();
                let here = ((b + 1) as i64, (c + 1) as i64);
                for (slot, sel) in found.iter_mut().zip(selectors) {
                    if *sel == here {
                        *slot = Some(xs.shallow_clone());
                    }
                }
                if found.iter().all(Option::is_some) {
                    break 'blocks;
                }
            }
        }
        Ok(found.into_iter().flatten().collect())
    }

    fn preprocess(&self, xs: &Tensor, yuv_input: bool) -> Result<Tensor> {
        let mut xs = xs.to_kind(Kind::Float);
        if yuv_input {
            xs = yuv_to_rgb(&xs)?;
        }
        let (_, c, _, _) = xs.size4()?;
        match c {
            1 => xs = xs.repeat(&[1, 3, 1, 1]),
            3 => {}
            _ => return Err(shape(format!("expected 1 or 3 channels, got {}", c))),
        }
        if self.head.is_some() {
            xs = xs.upsample_bicubic2d(&[HEAD_SIZE, HEAD_SIZE], false, None::<f64>, None::<f64>);
        }
        let mean = Tensor::of_slice(&VGG_MEAN)
            .view([1, 3, 1, 1])
            .to_device(xs.device());
        // RGB -> BGR
        Ok(xs.flip(&[1]) - mean)
    }

    fn final_output(&self, xs: &Tensor) -> Tensor {
        let mut xs = xs.shallow_clone();
        for block in &self.blocks {
            for conv in block {
                xs = xs.apply(conv).relu();
            }
            xs = max_pool2d(&xs);
        }
        match &self.head {
            Some(head) => xs
                .flat_view()
                .apply(&head.fc1)
                .relu()
                .apply(&head.fc2)
                .relu()
                .apply(&head.predictions)
                .softmax(-1, Kind::Float),
            None => xs,
        }
    }
}

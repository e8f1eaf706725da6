use anyhow::Result;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Sigmoid,
    },
    prelude::*,
    tensor::{activation::silu, backend::Backend, module::adaptive_avg_pool2d, Tensor},
};

use crate::pretrained::{load_batch_norm, load_conv2d, load_pointwise_linear, TensorSource};

/// Output channels of the final 1x1 convolution.
pub const NUM_FEATURES: usize = 1280;

/// `(expand_ratio, channels, repeats, stride, kernel)` per stage.
const BLOCKS: [(usize, usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1, 3),
    (6, 24, 2, 2, 3),
    (6, 40, 2, 2, 5),
    (6, 80, 3, 2, 3),
    (6, 112, 3, 1, 5),
    (6, 192, 4, 2, 5),
    (6, 320, 1, 1, 3),
];

/// Spatial side of the feature map for an input side of `size`.
/// Every stride-2 layer maps `n` to `ceil(n / 2)`.
pub fn feature_map_size(size: usize) -> usize {
    let strided_stages = BLOCKS.iter().filter(|b| b.3 == 2).count();
    (0..=strided_stages).fold(size, |n, _| n.div_ceil(2))
}

/// Squeeze width is `in_channels / SE_REDUCTION`.
const SE_REDUCTION: usize = 4;

fn same_padding(kernel: usize) -> PaddingConfig2d {
    PaddingConfig2d::Explicit(kernel / 2, kernel / 2)
}

/// Squeeze-and-excitation gate. The squeeze width is a quarter of the
/// block's input channels, not of the expanded channels it gates.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    sigmoid: Sigmoid,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, reduced_channels: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(channels, reduced_channels).init(device),
            fc2: LinearConfig::new(reduced_channels, channels).init(device),
            sigmoid: Sigmoid::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = x.dims();

        let y = adaptive_avg_pool2d(x.clone(), [1, 1]).reshape([batch_size, channels]);
        let y = silu(self.fc1.forward(y));
        let y = self.sigmoid.forward(self.fc2.forward(y));

        x * y.reshape([batch_size, channels, 1, 1])
    }

    fn load_pretrained<S: TensorSource + ?Sized>(
        self,
        source: &S,
        prefix: &str,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Self {
            fc1: load_pointwise_linear(self.fc1, source, &format!("{prefix}.conv_reduce"), device)?,
            fc2: load_pointwise_linear(self.fc2, source, &format!("{prefix}.conv_expand"), device)?,
            sigmoid: self.sigmoid,
        })
    }
}

/// Convolution without bias followed by batch norm.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    fn new(config: Conv2dConfig, device: &B::Device) -> Self {
        let out_channels = config.channels[1];
        Self {
            conv: config.with_bias(false).init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn pointwise(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self::new(Conv2dConfig::new([in_channels, out_channels], [1, 1]), device)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }

    fn load_pretrained<S: TensorSource + ?Sized>(
        self,
        source: &S,
        conv_key: &str,
        bn_key: &str,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Self {
            conv: load_conv2d(self.conv, source, conv_key, device)?,
            bn: load_batch_norm(self.bn, source, bn_key, device)?,
        })
    }
}

#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    squeeze_excite: SqueezeExcite<B>,
    project: ConvBn<B>,
    use_residual: bool,
}

impl<B: Backend> MBConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel_size: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let expanded_channels = in_channels * expand_ratio;

        let expand = (expand_ratio != 1)
            .then(|| ConvBn::pointwise(in_channels, expanded_channels, device));

        let depthwise = ConvBn::new(
            Conv2dConfig::new([expanded_channels, expanded_channels], [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding(same_padding(kernel_size))
                .with_groups(expanded_channels),
            device,
        );

        let squeeze_excite =
            SqueezeExcite::new(expanded_channels, (in_channels / SE_REDUCTION).max(1), device);

        let project = ConvBn::pointwise(expanded_channels, out_channels, device);
        let use_residual = stride == 1 && in_channels == out_channels;

        Self {
            expand,
            depthwise,
            squeeze_excite,
            project,
            use_residual,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = self.use_residual.then(|| x.clone());

        let y = match &self.expand {
            Some(expand) => silu(expand.forward(x)),
            None => x,
        };
        let y = silu(self.depthwise.forward(y));
        let y = self.squeeze_excite.forward(y);

        // linear bottleneck: no activation after projection
        let y = self.project.forward(y);

        match identity {
            Some(id) => y + id,
            None => y,
        }
    }

    /// `prefix` is the checkpoint path of the block, e.g. `blocks.1.0`.
    /// Blocks without expansion name their layers one slot earlier.
    fn load_pretrained<S: TensorSource + ?Sized>(
        self,
        source: &S,
        prefix: &str,
        device: &B::Device,
    ) -> Result<Self> {
        let key = |name: &str| format!("{prefix}.{name}");
        let (expand, depthwise, project) = match self.expand {
            Some(expand) => (
                Some(expand.load_pretrained(source, &key("conv_pw"), &key("bn1"), device)?),
                self.depthwise.load_pretrained(source, &key("conv_dw"), &key("bn2"), device)?,
                self.project.load_pretrained(source, &key("conv_pwl"), &key("bn3"), device)?,
            ),
            None => (
                None,
                self.depthwise.load_pretrained(source, &key("conv_dw"), &key("bn1"), device)?,
                self.project.load_pretrained(source, &key("conv_pw"), &key("bn2"), device)?,
            ),
        };

        Ok(Self {
            expand,
            depthwise,
            squeeze_excite: self.squeeze_excite.load_pretrained(source, &key("se"), device)?,
            project,
            use_residual: self.use_residual,
        })
    }
}

/// EfficientNet-B0 without its classification top.
#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MBConv<B>>,
    head: ConvBn<B>,
}

impl<B: Backend> EfficientNetB0<B> {
    pub fn new(device: &B::Device) -> Self {
        let stem = ConvBn::new(
            Conv2dConfig::new([3, 32], [3, 3])
                .with_stride([2, 2])
                .with_padding(same_padding(3)),
            device,
        );

        let mut blocks = Vec::new();
        let mut in_channels = 32;

        for (expand, channels, repeats, stride, kernel) in BLOCKS {
            let out_channels = Self::round_channels(channels as f32, 1.0, 8);

            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MBConv::new(in_channels, out_channels, expand, kernel, stride, device));
                in_channels = out_channels;
            }
        }

        let head = ConvBn::pointwise(in_channels, NUM_FEATURES, device);

        Self { stem, blocks, head }
    }

    fn round_channels(channels: f32, width_multiplier: f32, divisor: usize) -> usize {
        let channels = channels * width_multiplier;
        let new_channels = (channels + divisor as f32 / 2.0).max(divisor as f32);
        ((new_channels as usize) / divisor) * divisor
    }

    /// Replaces every weight with the matching tensor from `source`, which
    /// follows timm's `efficientnet_b0` parameter names. Fails on the first
    /// missing or mis-shaped tensor.
    pub fn load_pretrained<S: TensorSource + ?Sized>(self, source: &S, device: &B::Device) -> Result<Self> {
        let stem = self.stem.load_pretrained(source, "conv_stem", "bn1", device)?;

        let stage_of_block = BLOCKS
            .iter()
            .enumerate()
            .flat_map(|(stage, block)| (0..block.2).map(move |index| (stage, index)));
        let blocks = self
            .blocks
            .into_iter()
            .zip(stage_of_block)
            .map(|(block, (stage, index))| {
                block.load_pretrained(source, &format!("blocks.{stage}.{index}"), device)
            })
            .collect::<Result<Vec<_>>>()?;

        let head = self.head.load_pretrained(source, "conv_head", "bn2", device)?;

        Ok(Self { stem, blocks, head })
    }

    /// `[batch, 3, h, w]` to `[batch, 1280, ceil(h/32), ceil(w/32)]`.
    pub fn forward_features(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = silu(self.stem.forward(x));

        for block in &self.blocks {
            x = block.forward(x);
        }

        silu(self.head.forward(x))
    }
}

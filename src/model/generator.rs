use burn::nn::conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig3d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the 3D embedding network.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub in_channels: usize,
    pub embedding_dim: usize,
    pub generator_dim: usize,
    #[config(default = 8)]
    pub num_groups: usize,
}

/// Conv3d + GroupNorm + ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, num_groups: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv3dConfig::new([in_channels, out_channels], [3, 3, 3])
                .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
                .init(device),
            norm: GroupNormConfig::new(num_groups, out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Two-level 3D encoder-decoder producing a per-voxel embedding vector.
///
/// Strided convolutions downsample, transposed convolutions upsample, skip
/// connections preserve spatial detail, and a 1x1x1 projection maps to the
/// embedding dimension. No output nonlinearity: embeddings are unbounded.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    stem: ConvBlock<B>,
    down1: Conv3d<B>,
    enc1: ConvBlock<B>,
    down2: Conv3d<B>,
    bottom: ConvBlock<B>,
    up1: ConvTranspose3d<B>,
    dec1: ConvBlock<B>,
    up2: ConvTranspose3d<B>,
    dec2: ConvBlock<B>,
    proj: Conv3d<B>,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let f = self.generator_dim;
        let groups = self.num_groups;

        Generator {
            stem: ConvBlock::new(self.in_channels, f, groups, device),
            down1: down_conv(f, f * 2, device),
            enc1: ConvBlock::new(f * 2, f * 2, groups, device),
            down2: down_conv(f * 2, f * 4, device),
            bottom: ConvBlock::new(f * 4, f * 4, groups, device),
            up1: up_conv(f * 4, f * 2, device),
            dec1: ConvBlock::new(f * 4, f * 2, groups, device),
            up2: up_conv(f * 2, f, device),
            dec2: ConvBlock::new(f * 2, f, groups, device),
            proj: Conv3dConfig::new([f, self.embedding_dim], [1, 1, 1]).init(device),
        }
    }
}

impl<B: Backend> Generator<B> {
    /// (N, C, D, H, W) input to (N, E, D, H, W) embeddings. Spatial dims
    /// must be divisible by 4 (two downsampling levels).
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let s0 = self.stem.forward(input);
        let s1 = self.enc1.forward(self.down1.forward(s0.clone()));
        let x = self.bottom.forward(self.down2.forward(s1.clone()));

        let x = self.up1.forward(x);
        let x = self.dec1.forward(Tensor::cat(vec![x, s1], 1));
        let x = self.up2.forward(x);
        let x = self.dec2.forward(Tensor::cat(vec![x, s0], 1));
        self.proj.forward(x)
    }
}

fn down_conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv3d<B> {
    Conv3dConfig::new([in_channels, out_channels], [4, 4, 4])
        .with_stride([2, 2, 2])
        .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
        .init(device)
}

fn up_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> ConvTranspose3d<B> {
    ConvTranspose3dConfig::new([in_channels, out_channels], [4, 4, 4])
        .with_stride([2, 2, 2])
        .with_padding([1, 1, 1])
        .init(device)
}

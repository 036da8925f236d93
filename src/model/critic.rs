use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Linear, LinearConfig, PaddingConfig3d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for the Wasserstein critic over single-channel masks.
#[derive(Config, Debug)]
pub struct CriticConfig {
    pub critic_dim: usize,
    pub patch_size: usize,
    #[config(default = 8)]
    pub num_groups: usize,
}

/// 3D conv critic scoring mask batches, one raw scalar per sample.
///
/// GroupNorm instead of batch statistics: the gradient penalty is computed
/// per sample and batch normalization would couple them.
#[derive(Module, Debug)]
pub struct Critic<B: Backend> {
    convs: Vec<Conv3d<B>>,
    norms: Vec<GroupNorm<B>>,
    fc: Linear<B>,
}

impl CriticConfig {
    /// Initialize the critic layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Critic<B> {
        let convs = vec![
            conv(1, self.critic_dim, device, 2),
            conv(self.critic_dim, self.critic_dim * 2, device, 2),
            conv(self.critic_dim * 2, self.critic_dim * 4, device, 1),
        ];
        let norms = vec![
            GroupNormConfig::new(self.num_groups, self.critic_dim * 2).init(device),
            GroupNormConfig::new(self.num_groups, self.critic_dim * 4).init(device),
        ];

        let mut size = self.patch_size;
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 1, 1);
        let flat_dim = size * size * size * self.critic_dim * 4;

        Critic {
            convs,
            norms,
            fc: LinearConfig::new(flat_dim, 1).init(device),
        }
    }
}

impl<B: Backend> Critic<B> {
    /// (N, 1, D, H, W) masks to (N, 1) scores. Must stay differentiable with
    /// respect to its input, which the gradient penalty relies on.
    pub fn forward(&self, masks: Tensor<B, 5>) -> Tensor<B, 2> {
        let mut x = leaky_relu(self.convs[0].forward(masks), 0.2);
        x = leaky_relu(self.norms[0].forward(self.convs[1].forward(x)), 0.2);
        x = leaky_relu(self.norms[1].forward(self.convs[2].forward(x)), 0.2);

        let [batch, channels, depth, height, width] = x.dims();
        let flat = x.reshape([batch, channels * depth * height * width]);
        self.fc.forward(flat)
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
    stride: usize,
) -> Conv3d<B> {
    Conv3dConfig::new([in_channels, out_channels], [4, 4, 4])
        .with_stride([stride, stride, stride])
        .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
        .init(device)
}

fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    #[test]
    fn one_score_per_sample() {
        let device = Default::default();
        let critic: Critic<TB> = CriticConfig::new(2, 8).with_num_groups(1).init(&device);
        let masks = Tensor::<TB, 5>::zeros([3, 1, 8, 8, 8], &device);
        assert_eq!(critic.forward(masks).dims(), [3, 1]);
    }
}

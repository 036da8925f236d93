pub mod critic;
pub mod generator;

pub use critic::{Critic, CriticConfig};
pub use generator::{Generator, GeneratorConfig};

use burn::prelude::*;

/// Hyperparameters for the embedding network and the critic.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub in_channels: usize,
    pub embedding_dim: usize,
    pub patch_size: usize,
    pub generator_dim: usize,
    pub critic_dim: usize,
    #[config(default = 8)]
    pub num_groups: usize,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.in_channels, self.embedding_dim, self.generator_dim)
            .with_num_groups(self.num_groups)
    }

    pub fn critic_config(&self) -> CriticConfig {
        CriticConfig::new(self.critic_dim, self.patch_size).with_num_groups(self.num_groups)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_critic<B: Backend>(&self, device: &B::Device) -> Critic<B> {
        self.critic_config().init(device)
    }
}

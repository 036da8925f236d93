#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
use burn::backend::{Autodiff, Wgpu};
use burn::config::Config;
use clap::Parser;
use embgan_burn::model::ModelConfig;
use embgan_burn::training::TrainerConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Adversarial training of a 3D embedding network with Burn")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut config = TrainerConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;

    embgan_burn::training::train::<AutodiffBackend>(&args.experiment_dir, config, device)?;
    Ok(())
}

// wgpu caps a single storage buffer; 3D conv im2col workspaces hit the cap
// quickly, so shrink the batch to fit instead of failing mid-epoch.
fn adjust_batch_size_for_wgpu(
    config: &mut TrainerConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes =
        estimate_max_conv_workspace_elems(&config.model).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "a single sample needs an estimated {per_sample_bytes} bytes of conv workspace, \
             more than the {max_storage_buffer_binding_size} byte storage buffer limit; \
             reduce patch_size or the model dims"
        ));
    }

    if config.batch_size > max_batch {
        println!(
            "estimated conv workspace per sample is {per_sample_bytes} bytes; lowering batch_size from {} to {max_batch}",
            config.batch_size
        );
        config.batch_size = max_batch;
    }

    Ok(())
}

/// Upper bound on the im2col workspace of any single conv in the generator
/// or critic, in elements per sample.
fn estimate_max_conv_workspace_elems(model: &ModelConfig) -> u64 {
    let mut max_elems = 0u64;
    let g = model.generator_dim as u64;

    // generator: 3x3x3 convs at full, half and quarter resolution
    let kernel_volume = 27u64;
    let full = model.patch_size as u64;
    let half = full / 2;
    let quarter = full / 4;
    let gen_layers = [
        (model.in_channels as u64, full),
        (g, full),
        (g, half),
        (2 * g, half),
        (2 * g, quarter),
        (4 * g, quarter),
        (4 * g, half), // decoder concat halves back to 4g inputs
        (2 * g, full),
    ];
    for (in_channels, size) in gen_layers {
        let elems = in_channels * size * size * size * kernel_volume;
        max_elems = max_elems.max(elems);
    }

    // critic: 4x4x4 strided convs on single-channel masks
    let d = model.critic_dim as u64;
    let kernel_volume = 64u64;
    let mut size = model.patch_size as u64;
    let mut in_channels = 1u64;
    for (out_channels, stride) in [(d, 2u64), (2 * d, 2), (4 * d, 1)] {
        size = conv_out(size, 4, stride, 1);
        let elems = in_channels * size * size * size * kernel_volume;
        max_elems = max_elems.max(elems);
        in_channels = out_channels;
    }

    max_elems
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}

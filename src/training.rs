use crate::data::{load_pickled_volumes, EmbBatch, VolumeBatcher, VolumeDataset, VolumeExample};
use crate::loss::{ContrastiveLoss, ContrastiveLossConfig, GaussianKernel, MeanInstanceIoU};
use crate::masks::extract_instance_masks;
use crate::model::{Critic, Generator, ModelConfig};
use crate::utils::{label_slices, volume_slices, FileMetricSink, MetricSink, RunningAverage};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::module::{AutodiffModule, Module};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MIN_LEARNING_RATE: f64 = 1e-6;
const PMAPS_THRESHOLD: f64 = 0.5;

/// Training configuration loaded from `config.json`.
#[derive(Config)]
pub struct TrainerConfig {
    pub model: ModelConfig,
    pub loss: ContrastiveLossConfig,
    pub data_dir: String,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub critic_learning_rate: f64,
    pub scheduler: GenLrSchedulerConfig,
    /// Weight of the gradient penalty in the critic cost.
    pub gp_lambda: f64,
    /// Weight of the adversarial term in the generator loss.
    pub gan_loss_weight: f64,
    /// Critic updates per generator update after warm-up.
    pub critic_iters: usize,
    pub optimizer_g: AdamConfig,
    pub optimizer_d: AdamConfig,
    #[config(default = false)]
    pub combine_masks: bool,
    #[config(default = 100)]
    pub max_num_epochs: usize,
    #[config(default = 100000)]
    pub max_num_iterations: usize,
    #[config(default = 2000)]
    pub validate_after_iters: usize,
    #[config(default = 500)]
    pub log_after_iters: usize,
    #[config(default = 1)]
    pub num_iterations: usize,
    #[config(default = 0)]
    pub num_epoch: usize,
    #[config(default = true)]
    pub eval_score_higher_is_better: bool,
    pub best_eval_score: Option<f64>,
    /// Warm-start the generator from a pretrained embedding checkpoint;
    /// critic and optimizers start fresh.
    pub pre_trained: Option<String>,
    #[config(default = false)]
    pub resume: bool,
    #[config(default = 42)]
    pub seed: u64,
}

/// Learning-rate schedule for the generator optimizer.
#[derive(Config, Debug)]
pub struct GenLrSchedulerConfig {
    /// Plateau mode consumes the validation score; otherwise the rate decays
    /// on a fixed interval of scheduler steps.
    #[config(default = true)]
    pub plateau: bool,
    #[config(default = 0.2)]
    pub factor: f64,
    #[config(default = 5)]
    pub patience: usize,
    #[config(default = 10)]
    pub step_every: usize,
}

impl GenLrSchedulerConfig {
    pub fn init(&self, learning_rate: f64, higher_is_better: bool) -> GenLrScheduler {
        GenLrScheduler {
            lr: learning_rate,
            plateau: self.plateau,
            factor: self.factor,
            patience: self.patience,
            step_every: self.step_every,
            higher_is_better,
            best: None,
            num_bad: 0,
            steps: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GenLrScheduler {
    lr: f64,
    plateau: bool,
    factor: f64,
    patience: usize,
    step_every: usize,
    higher_is_better: bool,
    best: Option<f64>,
    num_bad: usize,
    steps: usize,
}

impl GenLrScheduler {
    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Advance the schedule. Plateau mode reacts to the validation score,
    /// interval mode decays unconditionally every `step_every` steps.
    pub fn step(&mut self, eval_score: Option<f64>) -> f64 {
        self.steps += 1;
        if self.plateau {
            if let Some(score) = eval_score {
                let improved = match self.best {
                    None => true,
                    Some(best) => {
                        if self.higher_is_better {
                            score > best
                        } else {
                            score < best
                        }
                    }
                };
                if improved {
                    self.best = Some(score);
                    self.num_bad = 0;
                } else {
                    self.num_bad += 1;
                    if self.num_bad > self.patience {
                        self.lr *= self.factor;
                        self.num_bad = 0;
                    }
                }
            }
        } else if self.steps % self.step_every == 0 {
            self.lr *= self.factor;
        }
        self.lr
    }
}

/// Persisted training state, saved next to the weight records.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrainerState {
    pub epoch: usize,
    pub num_iterations: usize,
    pub gen_iterations: usize,
    pub best_eval_score: f64,
    pub eval_score_higher_is_better: bool,
    pub learning_rate: f64,
    pub device: String,
    pub max_num_epochs: usize,
    pub max_num_iterations: usize,
    pub validate_after_iters: usize,
    pub log_after_iters: usize,
}

type GenOptim<B> = OptimizerAdaptor<Adam, Generator<B>, B>;
type CriticOptim<B> = OptimizerAdaptor<Adam, Critic<B>, B>;
type GenOptimRecord<B> = <GenOptim<B> as Optimizer<Generator<B>, B>>::Record;

/// Critic updates per generator update; the critic is trained much more at
/// the beginning.
fn d_iters(gen_iterations: usize, critic_iters: usize) -> usize {
    if gen_iterations < 25 {
        100
    } else {
        critic_iters + 1
    }
}

/// Normal termination paths: the iteration cap is exceeded or the generator
/// learning rate fell through the floor.
fn stopping_criterion(num_iterations: usize, max_num_iterations: usize, lr: f64) -> bool {
    if max_num_iterations < num_iterations {
        info!("maximum number of iterations {max_num_iterations} exceeded");
        return true;
    }
    if lr < MIN_LEARNING_RATE {
        info!("learning rate below the minimum {MIN_LEARNING_RATE}");
        return true;
    }
    false
}

const GP_EPSILON: f64 = 1e-3;

/// WGAN-GP regularization term: the critic's slope along its direction of
/// steepest ascent at random interpolations between real and fake masks is
/// pushed towards 1.
///
/// Burn cannot differentiate through its own backward pass, so the input
/// gradient only supplies the direction; the slope itself is a finite
/// difference of two critic forwards along that direction, which matches
/// the gradient norm to first order in `GP_EPSILON` and keeps the critic's
/// parameters in the graph.
pub fn gradient_penalty<B: AutodiffBackend>(
    critic: &Critic<B>,
    real_masks: Tensor<B, 5>,
    fake_masks: Tensor<B, 5>,
    gp_lambda: f64,
) -> Tensor<B, 1> {
    let n_batch = real_masks.dims()[0];
    let device = real_masks.device();

    // one interpolation coefficient per sample, broadcast over the rest
    let alpha = Tensor::<B, 5>::random(
        [n_batch, 1, 1, 1, 1],
        Distribution::Uniform(0.0, 1.0),
        &device,
    );
    let interpolates = real_masks
        .mul(alpha.clone())
        .add(fake_masks.mul(alpha.neg().add_scalar(1.0)))
        .detach();

    // direction of steepest ascent, from a throwaway autodiff pass
    let tracked = interpolates.clone().require_grad();
    let grads = critic.forward(tracked.clone()).sum().backward();
    let gradient = tracked
        .grad(&grads)
        .expect("tracked interpolates are a leaf");
    let direction = Tensor::<B, 5>::from_inner(gradient).detach();

    let norms = direction
        .clone()
        .reshape([n_batch as i32, -1])
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .reshape([n_batch, 1, 1, 1, 1]);
    let unit = direction.div(norms.clamp_min(1e-12));

    let shifted = interpolates.clone().add(unit.mul_scalar(GP_EPSILON));
    let slope = critic
        .forward(shifted)
        .sub(critic.forward(interpolates))
        .div_scalar(GP_EPSILON);

    slope
        .sub_scalar(1.0)
        .powf_scalar(2.0)
        .mean()
        .mul_scalar(gp_lambda)
}

/// Adversarial trainer for the 3D embedding network.
///
/// Alternates generator and critic updates on an adaptive schedule, derives
/// real/fake instance masks from embedding clusters, and regularizes the
/// critic with a gradient penalty.
pub struct EmbeddingWganTrainer<B: AutodiffBackend> {
    generator: Generator<B>,
    critic: Critic<B>,
    g_optim: GenOptim<B>,
    d_optim: CriticOptim<B>,
    scheduler: GenLrScheduler,
    loss: ContrastiveLoss,
    eval: MeanInstanceIoU,
    dist_to_mask: GaussianKernel,
    sink: Box<dyn MetricSink>,
    train_loader: Arc<dyn DataLoader<B, EmbBatch<B>>>,
    val_loader: Arc<dyn DataLoader<B::InnerBackend, EmbBatch<B::InnerBackend>>>,
    checkpoint_dir: PathBuf,
    device: B::Device,
    gp_lambda: f64,
    gan_loss_weight: f64,
    critic_iters: usize,
    combine_masks: bool,
    critic_lr: f64,
    max_num_epochs: usize,
    max_num_iterations: usize,
    validate_after_iters: usize,
    log_after_iters: usize,
    num_iterations: usize,
    num_epoch: usize,
    gen_iterations: usize,
    eval_score_higher_is_better: bool,
    best_eval_score: f64,
}

impl<B: AutodiffBackend> EmbeddingWganTrainer<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &TrainerConfig,
        generator: Generator<B>,
        critic: Critic<B>,
        g_optim: GenOptim<B>,
        d_optim: CriticOptim<B>,
        scheduler: GenLrScheduler,
        sink: Box<dyn MetricSink>,
        train_loader: Arc<dyn DataLoader<B, EmbBatch<B>>>,
        val_loader: Arc<dyn DataLoader<B::InnerBackend, EmbBatch<B::InnerBackend>>>,
        checkpoint_dir: PathBuf,
        device: B::Device,
    ) -> Self {
        // explicit two-branch sentinel keyed on the comparison direction
        let best_eval_score = config.best_eval_score.unwrap_or(
            if config.eval_score_higher_is_better {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            },
        );

        Self {
            generator,
            critic,
            g_optim,
            d_optim,
            scheduler,
            loss: config.loss.init(),
            eval: MeanInstanceIoU::new(config.loss.delta_var),
            dist_to_mask: GaussianKernel::new(config.loss.delta_var, PMAPS_THRESHOLD),
            sink,
            train_loader,
            val_loader,
            checkpoint_dir,
            device,
            gp_lambda: config.gp_lambda,
            gan_loss_weight: config.gan_loss_weight,
            critic_iters: config.critic_iters,
            combine_masks: config.combine_masks,
            critic_lr: config.critic_learning_rate,
            max_num_epochs: config.max_num_epochs,
            max_num_iterations: config.max_num_iterations,
            validate_after_iters: config.validate_after_iters,
            log_after_iters: config.log_after_iters,
            num_iterations: config.num_iterations,
            num_epoch: config.num_epoch,
            gen_iterations: 1,
            eval_score_higher_is_better: config.eval_score_higher_is_better,
            best_eval_score,
        }
    }

    /// Run epochs until a stopping criterion fires or the epoch cap is hit.
    pub fn fit(&mut self) -> Result<()> {
        for _ in self.num_epoch..self.max_num_epochs {
            if self.train_epoch()? {
                info!("stopping criterion satisfied, finishing training");
                return Ok(());
            }
            self.num_epoch += 1;
        }
        info!(
            "reached maximum number of epochs: {}, finishing training",
            self.max_num_epochs
        );
        Ok(())
    }

    fn d_iters(&self) -> usize {
        d_iters(self.gen_iterations, self.critic_iters)
    }

    /// Train for one epoch. Returns true if training should terminate.
    fn train_epoch(&mut self) -> Result<bool> {
        let mut emb_losses = RunningAverage::new();
        let mut g_losses = RunningAverage::new();
        let mut d_losses = RunningAverage::new();
        let mut eval_scores = RunningAverage::new();
        let mut wasserstein = RunningAverage::new();

        let loader = self.train_loader.clone();
        let mut iterator = loader.iter();

        while let Some(batch) = iterator.next() {
            info!(
                "training iteration [{}/{}], epoch [{}/{}]",
                self.num_iterations,
                self.max_num_iterations,
                self.num_epoch,
                self.max_num_epochs - 1
            );

            let EmbBatch {
                input,
                target,
                weight: _,
            } = batch;
            let batch_size = input.dims()[0];

            // one generator forward pass per iteration, branch decided after
            let output = self.generator.forward(input.clone());
            let mut batch_masks = None;

            if self.num_iterations % self.d_iters() == 0 {
                // generator update; the critic is left frozen by stepping
                // only the generator's slice of the gradients
                let emb_loss = self.loss.forward(output.clone(), target.clone());
                emb_losses.update(emb_loss.clone().into_scalar().elem::<f64>(), batch_size);

                let Some((_, fake_masks)) = extract_instance_masks(
                    &output,
                    &target,
                    &self.dist_to_mask,
                    self.combine_masks,
                ) else {
                    // background-only patch
                    continue;
                };

                let g_score = self.critic.forward(fake_masks.clone()).mean();
                g_losses.update(
                    -g_score.clone().into_scalar().elem::<f64>(),
                    fake_masks.dims()[0],
                );

                // maximize the critic score: minimize emb_loss - w * D(fake)
                let combined = emb_loss.sub(g_score.mul_scalar(self.gan_loss_weight));
                let grads = combined.backward();
                let grads = GradientsParams::from_grads(grads, &self.generator);
                self.generator = self
                    .g_optim
                    .step(self.scheduler.lr(), self.generator.clone(), grads);

                self.gen_iterations += 1;
            } else {
                // critic update on detached embeddings
                let output = output.clone().detach();
                let Some((real_masks, fake_masks)) = extract_instance_masks(
                    &output,
                    &target,
                    &self.dist_to_mask,
                    self.combine_masks,
                ) else {
                    continue;
                };

                let d_real = self.critic.forward(real_masks.clone()).mean();
                let d_fake = self.critic.forward(fake_masks.clone()).mean();
                let gp = gradient_penalty(
                    &self.critic,
                    real_masks.clone(),
                    fake_masks.clone(),
                    self.gp_lambda,
                );

                let d_cost = d_fake.clone().sub(d_real.clone()).add(gp);
                let grads = d_cost.clone().backward();
                let grads = GradientsParams::from_grads(grads, &self.critic);
                self.critic = self.d_optim.step(self.critic_lr, self.critic.clone(), grads);

                let n_batch = 2 * fake_masks.dims()[0];
                d_losses.update(d_cost.into_scalar().elem::<f64>(), n_batch);
                wasserstein.update(d_real.sub(d_fake).into_scalar().elem::<f64>(), n_batch);
                batch_masks = Some((real_masks, fake_masks));
            }

            if self.num_iterations % self.validate_after_iters == 0 {
                let (_, eval_score) = self.validate()?;
                let lr = self.scheduler.step(Some(eval_score));
                self.sink
                    .scalar("g_learning_rate", lr, self.num_iterations)?;
                let is_best = self.is_best_eval_score(eval_score);
                self.save_checkpoint(is_best)?;
            }

            if self.num_iterations % self.log_after_iters == 0 {
                let eval_score = self.eval.forward(&output, &target);
                eval_scores.update(eval_score, batch_size);

                info!(
                    "training stats: embedding loss {:.5}, GAN loss {:.5}, critic loss {:.5}, eval score {:.5}",
                    emb_losses.avg(),
                    g_losses.avg(),
                    d_losses.avg(),
                    eval_scores.avg()
                );
                self.sink
                    .scalar("train_embedding_loss", emb_losses.avg(), self.num_iterations)?;
                self.sink
                    .scalar("train_gan_loss", g_losses.avg(), self.num_iterations)?;
                self.sink
                    .scalar("train_critic_loss", d_losses.avg(), self.num_iterations)?;
                self.sink.scalar(
                    "wasserstein_distance",
                    wasserstein.avg(),
                    self.num_iterations,
                )?;
                self.sink
                    .scalar("train_eval_score", eval_scores.avg(), self.num_iterations)?;
                self.sink
                    .scalar("g_learning_rate", self.scheduler.lr(), self.num_iterations)?;

                self.sink
                    .images("inputs", &volume_slices(&input)?, self.num_iterations)?;
                self.sink
                    .images("targets", &label_slices(&target)?, self.num_iterations)?;
                self.sink
                    .images("predictions", &volume_slices(&output)?, self.num_iterations)?;
                if let Some((real_masks, fake_masks)) = &batch_masks {
                    self.sink
                        .images("real_masks", &volume_slices(real_masks)?, self.num_iterations)?;
                    self.sink
                        .images("fake_masks", &volume_slices(fake_masks)?, self.num_iterations)?;
                }
            }

            if self.should_stop() {
                return Ok(true);
            }

            self.num_iterations += 1;
        }

        Ok(false)
    }

    fn should_stop(&self) -> bool {
        stopping_criterion(
            self.num_iterations,
            self.max_num_iterations,
            self.scheduler.lr(),
        )
    }

    /// Full pass over the validation loader with an inference-mode generator.
    /// Returns (mean validation loss, mean evaluation score).
    pub fn validate(&mut self) -> Result<(f64, f64)> {
        info!("validating...");
        let generator = self.generator.valid();

        let mut val_losses = RunningAverage::new();
        let mut val_scores = RunningAverage::new();

        let loader = self.val_loader.clone();
        let mut iterator = loader.iter();
        while let Some(batch) = iterator.next() {
            let batch_size = batch.input.dims()[0];
            let output = generator.forward(batch.input);

            let loss = self.loss.forward(output.clone(), batch.target.clone());
            val_losses.update(loss.into_scalar().elem::<f64>(), batch_size);
            val_scores.update(self.eval.forward(&output, &batch.target), batch_size);
        }

        self.sink
            .scalar("val_embedding_loss", val_losses.avg(), self.num_iterations)?;
        self.sink
            .scalar("val_eval_score", val_scores.avg(), self.num_iterations)?;
        info!(
            "validation finished: loss {:.5}, eval score {:.5}",
            val_losses.avg(),
            val_scores.avg()
        );
        Ok((val_losses.avg(), val_scores.avg()))
    }

    fn is_best_eval_score(&mut self, eval_score: f64) -> bool {
        let is_best = if self.eval_score_higher_is_better {
            eval_score > self.best_eval_score
        } else {
            eval_score < self.best_eval_score
        };
        if is_best {
            info!("saving new best evaluation metric: {eval_score}");
            self.best_eval_score = eval_score;
        }
        is_best
    }

    fn state(&self) -> TrainerState {
        TrainerState {
            epoch: self.num_epoch + 1,
            num_iterations: self.num_iterations,
            gen_iterations: self.gen_iterations,
            best_eval_score: self.best_eval_score,
            eval_score_higher_is_better: self.eval_score_higher_is_better,
            learning_rate: self.scheduler.lr(),
            device: format!("{:?}", self.device),
            max_num_epochs: self.max_num_epochs,
            max_num_iterations: self.max_num_iterations,
            validate_after_iters: self.validate_after_iters,
            log_after_iters: self.log_after_iters,
        }
    }

    /// Persist generator weights, generator-optimizer state and the trainer
    /// state; a best-marked copy is retained alongside.
    pub fn save_checkpoint(&self, is_best: bool) -> Result<()> {
        info!(
            "saving checkpoint to {} (best: {is_best})",
            self.checkpoint_dir.display()
        );
        self.write_checkpoint("last")?;
        if is_best {
            self.write_checkpoint("best")?;
        }
        Ok(())
    }

    fn write_checkpoint(&self, prefix: &str) -> Result<()> {
        let recorder = CompactRecorder::new();
        recorder
            .record(
                self.generator.clone().into_record(),
                self.checkpoint_dir.join(format!("{prefix}_generator")),
            )
            .map_err(|err| anyhow::anyhow!("failed to save generator weights: {err}"))?;
        recorder
            .record(
                self.g_optim.to_record(),
                self.checkpoint_dir.join(format!("{prefix}_g_optim")),
            )
            .map_err(|err| anyhow::anyhow!("failed to save optimizer state: {err}"))?;

        let state_path = self.checkpoint_dir.join(format!("{prefix}_state.json"));
        let state_json = serde_json::to_string_pretty(&self.state())
            .context("failed to serialize trainer state")?;
        std::fs::write(&state_path, state_json)
            .with_context(|| format!("failed to write {}", state_path.display()))?;
        Ok(())
    }

    /// Restore the most recent checkpoint. Missing or corrupt checkpoint
    /// files are fatal; there is no fallback to random initialization.
    pub fn resume_from_checkpoint(&mut self) -> Result<()> {
        let state_path = self.checkpoint_dir.join("last_state.json");
        let contents = std::fs::read_to_string(&state_path)
            .with_context(|| format!("failed to read {}", state_path.display()))?;
        let state: TrainerState =
            serde_json::from_str(&contents).context("failed to parse trainer state")?;

        let recorder = CompactRecorder::new();
        let gen_record = recorder
            .load(self.checkpoint_dir.join("last_generator"), &self.device)
            .map_err(|err| anyhow::anyhow!("failed to load generator weights: {err}"))?;
        self.generator = self.generator.clone().load_record(gen_record);

        let optim_record: GenOptimRecord<B> = recorder
            .load(self.checkpoint_dir.join("last_g_optim"), &self.device)
            .map_err(|err| anyhow::anyhow!("failed to load optimizer state: {err}"))?;
        self.g_optim = self.g_optim.clone().load_record(optim_record);

        self.num_epoch = state.epoch;
        self.num_iterations = state.num_iterations;
        self.gen_iterations = state.gen_iterations;
        self.best_eval_score = state.best_eval_score;
        self.eval_score_higher_is_better = state.eval_score_higher_is_better;
        self.scheduler.set_lr(state.learning_rate);
        self.max_num_epochs = state.max_num_epochs;
        self.max_num_iterations = state.max_num_iterations;
        self.validate_after_iters = state.validate_after_iters;
        self.log_after_iters = state.log_after_iters;

        info!(
            "checkpoint loaded: epoch {}, iteration {}, best eval score {}",
            state.epoch, state.num_iterations, state.best_eval_score
        );
        Ok(())
    }

    /// Warm-start the generator from a pretrained embedding checkpoint; the
    /// critic and both optimizers stay fresh.
    pub fn load_pretrained_generator(&mut self, path: &Path) -> Result<()> {
        info!("using pretrained embedding network: {}", path.display());
        let recorder = CompactRecorder::new();
        let record = recorder.load(path.to_path_buf(), &self.device).map_err(|err| {
            anyhow::anyhow!(
                "failed to load pretrained generator from {}: {err}",
                path.display()
            )
        })?;
        self.generator = self.generator.clone().load_record(record);
        Ok(())
    }
}

/// Build everything from the config and run the fit loop.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainerConfig,
    device: B::Device,
) -> Result<()> {
    let checkpoint_dir = experiment_dir.join("checkpoint");
    std::fs::create_dir_all(&checkpoint_dir)?;
    config.save(checkpoint_dir.join("config.json"))?;

    B::seed(config.seed);

    let data_dir = resolve_data_dir(experiment_dir, &config.data_dir);
    let train_path = data_dir.join("train.pkl");
    let val_path = data_dir.join("val.pkl");
    let train_examples = load_pickled_volumes(&train_path)
        .with_context(|| format!("failed to load {}", train_path.display()))?;
    let val_examples = load_pickled_volumes(&val_path)
        .with_context(|| format!("failed to load {}", val_path.display()))?;

    info!(
        "train patches -> {}, val patches -> {}",
        train_examples.len(),
        val_examples.len()
    );
    if train_examples.is_empty() {
        return Err(anyhow::anyhow!("no training patches found"));
    }

    let train_examples = train_examples.into_iter().map(Arc::new).collect::<Vec<_>>();
    let val_examples = val_examples.into_iter().map(Arc::new).collect::<Vec<_>>();

    let train_dataset = VolumeDataset::new(train_examples, config.batch_size, true);
    let val_dataset = VolumeDataset::new(val_examples, config.batch_size, false);

    let train_loader = DataLoaderBuilder::<B, Arc<VolumeExample>, EmbBatch<B>>::new(VolumeBatcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .set_device(device.clone())
        .build(train_dataset);
    let val_loader = DataLoaderBuilder::<
        B::InnerBackend,
        Arc<VolumeExample>,
        EmbBatch<B::InnerBackend>,
    >::new(VolumeBatcher)
    .batch_size(config.batch_size)
    .set_device(device.clone())
    .build(val_dataset);

    let generator = config.model.init_generator::<B>(&device);
    let critic = config.model.init_critic::<B>(&device);
    info!(
        "learnable parameters: G {}, D {}",
        generator.num_params(),
        critic.num_params()
    );

    let g_optim = config.optimizer_g.init();
    let d_optim = config.optimizer_d.init();
    let scheduler = config
        .scheduler
        .init(config.learning_rate, config.eval_score_higher_is_better);
    let sink = FileMetricSink::new(&checkpoint_dir.join("logs"))?;

    let mut trainer = EmbeddingWganTrainer::new(
        &config,
        generator,
        critic,
        g_optim,
        d_optim,
        scheduler,
        Box::new(sink),
        train_loader,
        val_loader,
        checkpoint_dir,
        device,
    );

    if let Some(pre_trained) = &config.pre_trained {
        trainer.load_pretrained_generator(Path::new(pre_trained))?;
    } else if config.resume {
        trainer.resume_from_checkpoint()?;
    }

    trainer.fit()
}

/// Resolve `data_dir` relative to the experiment directory if needed.
fn resolve_data_dir(experiment_dir: &Path, data_dir: &str) -> PathBuf {
    let candidate = PathBuf::from(data_dir);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CriticConfig;
    use crate::utils::NullMetricSink;
    use burn::backend::{Autodiff, NdArray};

    type TB = Autodiff<NdArray>;

    fn test_config() -> TrainerConfig {
        TrainerConfig::new(
            ModelConfig::new(1, 3, 8, 2, 2).with_num_groups(1),
            ContrastiveLossConfig::new(),
            "data".into(),
            1,
            1e-3,
            1e-3,
            GenLrSchedulerConfig::new(),
            10.0,
            0.1,
            2,
            AdamConfig::new(),
            AdamConfig::new(),
        )
        .with_validate_after_iters(1_000_000)
        .with_log_after_iters(1_000_000)
        .with_max_num_iterations(1000)
    }

    fn labeled_volume() -> VolumeExample {
        // left half instance 1, right half instance 2, thin background seam
        let mut labels = vec![0i64; 8 * 8 * 8];
        let mut raw = vec![0.0f32; 8 * 8 * 8];
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..8 {
                    let idx = (z * 8 + y) * 8 + x;
                    if x < 3 {
                        labels[idx] = 1;
                        raw[idx] = -1.0;
                    } else if x > 4 {
                        labels[idx] = 2;
                        raw[idx] = 1.0;
                    }
                }
            }
        }
        VolumeExample {
            shape: [8, 8, 8],
            raw,
            labels,
        }
    }

    fn background_volume() -> VolumeExample {
        VolumeExample {
            shape: [8, 8, 8],
            raw: vec![0.0; 8 * 8 * 8],
            labels: vec![0; 8 * 8 * 8],
        }
    }

    fn build_trainer(
        examples: Vec<VolumeExample>,
        config: &TrainerConfig,
        checkpoint_dir: &Path,
    ) -> EmbeddingWganTrainer<TB> {
        let device = Default::default();
        let examples = examples.into_iter().map(Arc::new).collect::<Vec<_>>();

        let train_loader =
            DataLoaderBuilder::<TB, Arc<VolumeExample>, EmbBatch<TB>>::new(VolumeBatcher)
                .batch_size(config.batch_size)
                .build(VolumeDataset::new(examples.clone(), config.batch_size, false));
        let val_loader =
            DataLoaderBuilder::<NdArray, Arc<VolumeExample>, EmbBatch<NdArray>>::new(VolumeBatcher)
                .batch_size(config.batch_size)
                .build(VolumeDataset::new(examples, config.batch_size, false));

        EmbeddingWganTrainer::new(
            config,
            config.model.init_generator::<TB>(&device),
            config.model.init_critic::<TB>(&device),
            config.optimizer_g.init(),
            config.optimizer_d.init(),
            config
                .scheduler
                .init(config.learning_rate, config.eval_score_higher_is_better),
            Box::new(NullMetricSink),
            train_loader,
            val_loader,
            checkpoint_dir.to_path_buf(),
            device,
        )
    }

    #[test]
    fn critic_warmup_schedule() {
        assert_eq!(d_iters(1, 2), 100);
        assert_eq!(d_iters(24, 2), 100);
        assert_eq!(d_iters(25, 2), 3);
        assert_eq!(d_iters(100, 5), 6);
    }

    #[test]
    fn stops_only_when_iteration_cap_is_exceeded() {
        assert!(!stopping_criterion(9, 10, 1e-3));
        assert!(!stopping_criterion(10, 10, 1e-3));
        assert!(stopping_criterion(11, 10, 1e-3));
    }

    #[test]
    fn stops_when_learning_rate_falls_through_the_floor() {
        assert!(!stopping_criterion(1, 10, 1e-6));
        assert!(stopping_criterion(1, 10, 9e-7));
    }

    #[test]
    fn plateau_scheduler_decays_after_patience() {
        let mut scheduler = GenLrSchedulerConfig::new()
            .with_factor(0.1)
            .with_patience(1)
            .init(1.0, true);
        scheduler.step(Some(0.5));
        assert_eq!(scheduler.lr(), 1.0);
        // two non-improving scores exhaust patience = 1
        scheduler.step(Some(0.4));
        scheduler.step(Some(0.4));
        assert!((scheduler.lr() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn interval_scheduler_ignores_scores() {
        let mut scheduler = GenLrSchedulerConfig::new()
            .with_plateau(false)
            .with_factor(0.5)
            .with_step_every(2)
            .init(1.0, true);
        scheduler.step(Some(0.9));
        assert_eq!(scheduler.lr(), 1.0);
        scheduler.step(None);
        assert!((scheduler.lr() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn gradient_penalty_is_deterministic_and_non_negative_for_equal_masks() {
        let device = Default::default();
        let critic: Critic<TB> = CriticConfig::new(2, 8).with_num_groups(1).init(&device);
        let masks = Tensor::<TB, 5>::random(
            [2, 1, 8, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );

        // real == fake: the interpolate equals both endpoints for any alpha
        let p1 = gradient_penalty(&critic, masks.clone(), masks.clone(), 10.0)
            .into_scalar()
            .elem::<f64>();
        let p2 = gradient_penalty(&critic, masks.clone(), masks, 10.0)
            .into_scalar()
            .elem::<f64>();
        assert!(p1 >= 0.0);
        assert!((p1 - p2).abs() < 1e-5, "penalty not deterministic: {p1} vs {p2}");
    }

    #[test]
    fn gradient_penalty_reaches_critic_parameters() {
        let device = Default::default();
        let critic: Critic<TB> = CriticConfig::new(2, 8).with_num_groups(1).init(&device);
        let real = Tensor::<TB, 5>::random(
            [2, 1, 8, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let fake = Tensor::<TB, 5>::random(
            [2, 1, 8, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );

        let gp = gradient_penalty(&critic, real, fake, 10.0);
        let grads = gp.backward();
        let grads = GradientsParams::from_grads(grads, &critic);
        assert!(
            grads.len() > 0,
            "penalty must contribute gradients to the critic"
        );
    }

    #[test]
    fn background_only_batches_do_not_advance_the_iteration_counter() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let mut trainer = build_trainer(
            vec![labeled_volume(), background_volume()],
            &config,
            dir.path(),
        );

        assert_eq!(trainer.num_iterations, 1);
        let terminated = trainer.train_epoch().unwrap();
        assert!(!terminated);
        // the labeled batch runs a critic update and advances the counter by
        // exactly 1; the background-only batch is skipped
        assert_eq!(trainer.num_iterations, 2);
        assert_eq!(trainer.gen_iterations, 1);
    }

    #[test]
    fn generator_branch_steps_weights_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let mut trainer = build_trainer(vec![labeled_volume()], &config, dir.path());
        trainer.gen_iterations = 25;
        // critic_iters + 1 lands the next iteration on the generator branch
        trainer.num_iterations = 3;

        let device = Default::default();
        let input = Tensor::<TB, 5>::random(
            [1, 1, 8, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let before = trainer
            .generator
            .forward(input.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        let terminated = trainer.train_epoch().unwrap();
        assert!(!terminated);
        assert_eq!(trainer.num_iterations, 4);
        assert_eq!(trainer.gen_iterations, 26);

        let after = trainer
            .generator
            .forward(input)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_ne!(before, after, "generator weights did not move");
    }

    #[test]
    fn checkpoint_roundtrip_restores_state_and_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let mut saved = build_trainer(vec![labeled_volume()], &config, dir.path());
        saved.num_iterations = 77;
        saved.num_epoch = 3;
        saved.gen_iterations = 30;
        saved.best_eval_score = 0.5;
        saved.save_checkpoint(true).unwrap();
        assert!(dir.path().join("best_generator.mpk").exists());

        let mut restored = build_trainer(vec![labeled_volume()], &config, dir.path());
        restored.resume_from_checkpoint().unwrap();
        assert_eq!(restored.num_iterations, 77);
        assert_eq!(restored.num_epoch, 4);
        assert_eq!(restored.gen_iterations, 30);
        assert_eq!(restored.best_eval_score, 0.5);

        // bit-exact weight restoration: identical outputs on the same input
        let device = Default::default();
        let input = Tensor::<TB, 5>::random(
            [1, 1, 8, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let out_saved = saved.generator.forward(input.clone()).into_data();
        let out_restored = restored.generator.forward(input).into_data();
        assert_eq!(
            out_saved.to_vec::<f32>().unwrap(),
            out_restored.to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn resume_without_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let mut trainer = build_trainer(vec![labeled_volume()], &config, dir.path());
        assert!(trainer.resume_from_checkpoint().is_err());
    }
}

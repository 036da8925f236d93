use burn::prelude::*;

/// Hyperparameters of the discriminative (push/pull) embedding loss.
#[derive(Config, Debug)]
pub struct ContrastiveLossConfig {
    /// Pull-force margin: voxels closer than this to their cluster mean are not penalized.
    #[config(default = 0.5)]
    pub delta_var: f64,
    /// Push-force margin between cluster means.
    #[config(default = 2.0)]
    pub delta_dist: f64,
    #[config(default = 1.0)]
    pub alpha: f64,
    #[config(default = 1.0)]
    pub beta: f64,
    #[config(default = 0.001)]
    pub gamma: f64,
}

impl ContrastiveLossConfig {
    pub fn init(&self) -> ContrastiveLoss {
        ContrastiveLoss {
            delta_var: self.delta_var,
            delta_dist: self.delta_dist,
            alpha: self.alpha,
            beta: self.beta,
            gamma: self.gamma,
        }
    }
}

/// Discriminative contrastive loss over per-voxel embeddings: pulls voxels
/// towards their instance mean, pushes means apart, and regularizes the
/// means towards the origin.
#[derive(Clone, Debug)]
pub struct ContrastiveLoss {
    pub delta_var: f64,
    pub delta_dist: f64,
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl ContrastiveLoss {
    /// Mean loss over the batch. Background (label 0) counts as a cluster.
    pub fn forward<B: Backend>(
        &self,
        embeddings: Tensor<B, 5>,
        target: Tensor<B, 4, Int>,
    ) -> Tensor<B, 1> {
        let [batch, emb_dim, depth, height, width] = embeddings.dims();
        let voxels = depth * height * width;

        let mut per_sample = Vec::with_capacity(batch);
        for b in 0..batch {
            let emb = embeddings
                .clone()
                .slice_dim(0, b..b + 1)
                .reshape([emb_dim, voxels]);
            let tar = target.clone().slice_dim(0, b..b + 1).reshape([voxels]);

            let labels = unique_labels(&tar);
            let one_hot = one_hot_labels(&tar, &labels);
            let means = compute_cluster_means(emb.clone(), one_hot.clone());

            per_sample.push(self.sample_loss(emb, one_hot, means));
        }

        Tensor::stack::<2>(per_sample, 0).mean()
    }

    fn sample_loss<B: Backend>(
        &self,
        emb: Tensor<B, 2>,
        one_hot: Tensor<B, 2>,
        means: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let [c, _] = means.dims();
        let device = emb.device();
        let counts = one_hot.clone().sum_dim(1).clamp_min(1.0);

        // Pull: hinged distance of each voxel to its own cluster mean.
        let assigned = one_hot.clone().transpose().matmul(means.clone());
        let dist = emb
            .transpose()
            .sub(assigned)
            .powf_scalar(2.0)
            .sum_dim(1)
            .sqrt();
        let hinged = dist.sub_scalar(self.delta_var).clamp_min(0.0).powf_scalar(2.0);
        let variance_term = one_hot.matmul(hinged).div(counts).mean();

        // Push: hinged pairwise distances between cluster means.
        let distance_term = if c > 1 {
            let a = means.clone().unsqueeze_dim::<3>(1);
            let b = means.clone().unsqueeze_dim::<3>(0);
            let pairwise = a.sub(b).powf_scalar(2.0).sum_dim(2).sqrt().reshape([c, c]);
            let hinge = pairwise
                .neg()
                .add_scalar(2.0 * self.delta_dist)
                .clamp_min(0.0)
                .powf_scalar(2.0);
            let off_diag = Tensor::<B, 2>::ones([c, c], &device) - Tensor::eye(c, &device);
            hinge
                .mul(off_diag)
                .sum()
                .div_scalar((c * (c - 1)) as f64)
        } else {
            Tensor::zeros([1], &device)
        };

        let regularization = means.powf_scalar(2.0).sum_dim(1).sqrt().mean();

        variance_term
            .mul_scalar(self.alpha)
            .add(distance_term.mul_scalar(self.beta))
            .add(regularization.mul_scalar(self.gamma))
    }
}

/// One mean embedding per cluster: (C, N) one-hot membership against (E, N)
/// embeddings gives (C, E) means, rows ordered like the one-hot rows.
pub fn compute_cluster_means<B: Backend>(
    emb: Tensor<B, 2>,
    one_hot: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let counts = one_hot.clone().sum_dim(1).clamp_min(1.0);
    one_hot.matmul(emb.transpose()).div(counts)
}

/// Distinct label values in ascending order.
pub fn unique_labels<B: Backend>(target_flat: &Tensor<B, 1, Int>) -> Vec<i64> {
    let mut labels = target_flat
        .to_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .expect("failed to read label data");
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// (C, N) float membership indicator, one row per label in `labels` order.
pub fn one_hot_labels<B: Backend>(target_flat: &Tensor<B, 1, Int>, labels: &[i64]) -> Tensor<B, 2> {
    let rows = labels
        .iter()
        .map(|&label| target_flat.clone().equal_elem(label).float())
        .collect::<Vec<_>>();
    Tensor::stack::<2>(rows, 0)
}

/// Monotonically decreasing distance-to-probability map,
/// `p = exp(-d^2 / two_sigma)`, parameterized so that `p(delta_var) = threshold`.
#[derive(Clone, Debug)]
pub struct GaussianKernel {
    two_sigma: f64,
}

impl GaussianKernel {
    pub fn new(delta_var: f64, pmaps_threshold: f64) -> Self {
        Self {
            two_sigma: delta_var * delta_var / (-pmaps_threshold.ln()),
        }
    }

    pub fn forward<B: Backend, const D: usize>(&self, dist: Tensor<B, D>) -> Tensor<B, D> {
        dist.powf_scalar(2.0).neg().div_scalar(self.two_sigma).exp()
    }
}

/// Mean per-instance IoU of thresholded instance probability maps. Under the
/// Gaussian kernel with threshold 0.5, `pmap > 0.5` is exactly
/// `distance-to-mean < delta_var`, so the metric thresholds distances directly.
#[derive(Clone, Debug)]
pub struct MeanInstanceIoU {
    delta_var: f64,
}

impl MeanInstanceIoU {
    pub fn new(delta_var: f64) -> Self {
        Self { delta_var }
    }

    pub fn forward<B: Backend>(&self, embeddings: &Tensor<B, 5>, target: &Tensor<B, 4, Int>) -> f64 {
        let [batch, emb_dim, depth, height, width] = embeddings.dims();
        let voxels = depth * height * width;

        let mut total = 0.0;
        let mut instances = 0usize;
        for b in 0..batch {
            let emb = embeddings
                .clone()
                .slice_dim(0, b..b + 1)
                .reshape([emb_dim, voxels]);
            let tar = target.clone().slice_dim(0, b..b + 1).reshape([voxels]);

            let labels = unique_labels(&tar);
            let one_hot = one_hot_labels(&tar, &labels);
            let means = compute_cluster_means(emb.clone(), one_hot.clone());

            for (idx, &label) in labels.iter().enumerate() {
                if label == 0 {
                    continue;
                }
                let mean = means.clone().slice_dim(0, idx..idx + 1);
                let dist = emb
                    .clone()
                    .transpose()
                    .sub(mean)
                    .powf_scalar(2.0)
                    .sum_dim(1)
                    .sqrt()
                    .reshape([voxels]);
                let pred = dist.lower_elem(self.delta_var).float();
                let truth = one_hot.clone().slice_dim(0, idx..idx + 1).reshape([voxels]);

                let intersection = pred.clone().mul(truth.clone()).sum().into_scalar().elem::<f64>();
                let union = pred.sum().into_scalar().elem::<f64>()
                    + truth.sum().into_scalar().elem::<f64>()
                    - intersection;
                if union > 0.0 {
                    total += intersection / union;
                    instances += 1;
                }
            }
        }

        if instances == 0 {
            0.0
        } else {
            total / instances as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type TB = burn::backend::NdArray;

    #[test]
    fn cluster_means_average_member_voxels() {
        let device = Default::default();
        // two voxels in cluster 0 (values 1, 3), one in cluster 1 (value 5)
        let emb = Tensor::<TB, 2>::from_data(TensorData::new(vec![1.0f32, 3.0, 5.0], [1, 3]), &device);
        let one_hot = Tensor::<TB, 2>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 0.0, 0.0, 0.0, 1.0], [2, 3]),
            &device,
        );
        let means = compute_cluster_means(emb, one_hot);
        let values = means.to_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![2.0, 5.0]);
    }

    #[test]
    fn unique_labels_are_sorted_and_deduplicated() {
        let device = Default::default();
        let target = Tensor::<TB, 1, Int>::from_data(TensorData::new(vec![2i64, 0, 1, 2, 0], [5]), &device);
        assert_eq!(unique_labels(&target), vec![0, 1, 2]);
    }

    #[test]
    fn gaussian_kernel_hits_threshold_at_delta_var() {
        let device = Default::default();
        let kernel = GaussianKernel::new(0.5, 0.5);
        let dist = Tensor::<TB, 1>::from_data(TensorData::new(vec![0.0f32, 0.5, 2.0], [3]), &device);
        let pmap = kernel.forward(dist).to_data().to_vec::<f32>().unwrap();
        assert!((pmap[0] - 1.0).abs() < 1e-6);
        assert!((pmap[1] - 0.5).abs() < 1e-5);
        assert!(pmap[2] < pmap[1]);
    }

    #[test]
    fn tight_clusters_yield_small_loss() {
        let device = Default::default();
        let loss = ContrastiveLossConfig::new().init();

        // two well-separated constant clusters over four voxels
        let emb = Tensor::<TB, 5>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 5.0, 5.0], [1, 1, 1, 1, 4]),
            &device,
        );
        let target = Tensor::<TB, 4, Int>::from_data(
            TensorData::new(vec![0i64, 0, 1, 1], [1, 1, 1, 4]),
            &device,
        );
        let value = loss.forward(emb, target).into_scalar().elem::<f64>();
        // variance term is zero, push margin satisfied, only the tiny regularizer remains
        assert!(value < 0.01, "loss was {value}");
    }

    #[test]
    fn perfect_separation_gives_unit_iou() {
        let device = Default::default();
        let metric = MeanInstanceIoU::new(0.5);
        let emb = Tensor::<TB, 5>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 5.0, 5.0], [1, 1, 1, 1, 4]),
            &device,
        );
        let target = Tensor::<TB, 4, Int>::from_data(
            TensorData::new(vec![0i64, 0, 1, 1], [1, 1, 1, 4]),
            &device,
        );
        assert!((metric.forward(&emb, &target) - 1.0).abs() < 1e-6);
    }
}

use crate::loss::{compute_cluster_means, one_hot_labels, unique_labels, GaussianKernel};
use burn::prelude::*;
use burn::tensor::Distribution;

const MASK_NOISE_SIGMA: f64 = 0.05;

/// Mean embedding per distinct label of one sample, ordered by ascending
/// label id. Label 0 (background) always occupies row 0 when present;
/// a background-only sample yields a single row.
pub fn extract_cluster_means<B: Backend>(
    emb: &Tensor<B, 4>,
    target: &Tensor<B, 3, Int>,
) -> (Vec<i64>, Tensor<B, 2>) {
    let [emb_dim, depth, height, width] = emb.dims();
    let voxels = depth * height * width;

    let emb_flat = emb.clone().reshape([emb_dim, voxels]);
    let target_flat = target.clone().reshape([voxels]);

    let labels = unique_labels(&target_flat);
    let one_hot = one_hot_labels(&target_flat, &labels);
    let means = compute_cluster_means(emb_flat, one_hot);
    (labels, means)
}

/// Derive real and fake instance masks for a batch of embeddings.
///
/// Fake masks are per-instance probability maps obtained from the distance
/// of each voxel to the instance's cluster mean; real masks are the binary
/// instance indicators, noised so the critic cannot separate discrete from
/// continuous values trivially. With `combine_masks` every sample
/// contributes a single union pair, otherwise one pair per instance
/// (variable count per sample, flattened into one batch dimension).
///
/// Returns `None` when no sample in the batch contains a foreground
/// instance; callers skip the adversarial terms for that batch.
pub fn extract_instance_masks<B: Backend>(
    embeddings: &Tensor<B, 5>,
    target: &Tensor<B, 4, Int>,
    dist_to_mask: &GaussianKernel,
    combine_masks: bool,
) -> Option<(Tensor<B, 5>, Tensor<B, 5>)> {
    let [batch, emb_dim, depth, height, width] = embeddings.dims();

    let mut real_masks = Vec::new();
    let mut fake_masks = Vec::new();

    for b in 0..batch {
        let emb = embeddings
            .clone()
            .slice_dim(0, b..b + 1)
            .reshape([emb_dim, depth, height, width]);
        let tar = target
            .clone()
            .slice_dim(0, b..b + 1)
            .reshape([depth, height, width]);

        let (labels, means) = extract_cluster_means(&emb, &tar);

        let mut rms = Vec::new();
        let mut fms = Vec::new();
        let num_clusters = means.dims()[0];
        for i in 0..num_clusters {
            if i == 0 {
                // ignore 0-label
                continue;
            }
            assert!(
                labels.contains(&(i as i64)),
                "cluster index {i} has no voxels in the target; instance labels must be consecutive"
            );

            // broadcast the mean over the spatial dims, then collapse the
            // embedding axis into a Frobenius distance map
            let mean = means
                .clone()
                .slice_dim(0, i..i + 1)
                .reshape([emb_dim, 1, 1, 1]);
            let dist_to_mean = emb.clone().sub(mean).powf_scalar(2.0).sum_dim(0).sqrt();
            fms.push(dist_to_mask.forward(dist_to_mean));

            let inst_mask = tar.clone().equal_elem(i as i64).float().unsqueeze::<4>();
            rms.push(add_noise(inst_mask).clamp(0.0, 1.0));
        }

        if combine_masks && !fms.is_empty() {
            // summed probability maps may exceed 1 where instances overlap;
            // left unclamped on purpose
            let fake_mask = fms
                .into_iter()
                .reduce(|acc, fm| acc.add(fm))
                .expect("at least one fake mask");
            let real_mask = tar.greater_elem(0).float().unsqueeze::<4>();
            real_masks.push(add_noise(real_mask).clamp(0.0, 1.0));
            fake_masks.push(fake_mask);
        } else {
            real_masks.extend(rms);
            fake_masks.extend(fms);
        }
    }

    if real_masks.is_empty() {
        return None;
    }

    Some((
        Tensor::stack::<5>(real_masks, 0),
        Tensor::stack::<5>(fake_masks, 0),
    ))
}

fn add_noise<B: Backend>(mask: Tensor<B, 4>) -> Tensor<B, 4> {
    let noise = Tensor::random(
        mask.shape(),
        Distribution::Normal(0.0, MASK_NOISE_SIGMA),
        &mask.device(),
    );
    mask.add(noise)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type TB = burn::backend::NdArray;

    fn kernel() -> GaussianKernel {
        GaussianKernel::new(0.5, 0.5)
    }

    fn sample(labels: Vec<i64>) -> (Tensor<TB, 5>, Tensor<TB, 4, Int>) {
        let device = Default::default();
        let n = labels.len();
        let emb_values: Vec<f32> = labels.iter().map(|&l| l as f32 * 3.0).collect();
        let emb = Tensor::from_data(TensorData::new(emb_values, [1, 1, 1, 1, n]), &device);
        let target = Tensor::from_data(TensorData::new(labels, [1, 1, 1, n]), &device);
        (emb, target)
    }

    #[test]
    fn background_only_sample_yields_single_mean_and_no_masks() {
        let (emb, target) = sample(vec![0, 0, 0, 0]);

        let emb_s = emb.clone().slice_dim(0, 0..1).reshape([1, 1, 1, 4]);
        let tar_s = target.clone().slice_dim(0, 0..1).reshape([1, 1, 4]);
        let (labels, means) = extract_cluster_means(&emb_s, &tar_s);
        assert_eq!(labels, vec![0]);
        assert_eq!(means.dims(), [1, 1]);

        assert!(extract_instance_masks(&emb, &target, &kernel(), false).is_none());
        assert!(extract_instance_masks(&emb, &target, &kernel(), true).is_none());
    }

    #[test]
    fn one_mask_pair_per_instance_when_not_combined() {
        let (emb, target) = sample(vec![0, 1, 1, 2]);
        let (real, fake) = extract_instance_masks(&emb, &target, &kernel(), false).unwrap();
        assert_eq!(real.dims(), [2, 1, 1, 1, 4]);
        assert_eq!(fake.dims(), [2, 1, 1, 1, 4]);

        // fake masks are probabilities
        let fake_values = fake.to_data().to_vec::<f32>().unwrap();
        assert!(fake_values.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // real masks are noised but clamped
        let real_values = real.to_data().to_vec::<f32>().unwrap();
        assert!(real_values.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn combined_fake_mask_is_the_unclamped_channel_sum() {
        let (emb, target) = sample(vec![0, 1, 1, 2]);
        let (real, fake) = extract_instance_masks(&emb, &target, &kernel(), true).unwrap();
        assert_eq!(real.dims(), [1, 1, 1, 1, 4]);
        assert_eq!(fake.dims(), [1, 1, 1, 1, 4]);

        let (_, separate) = extract_instance_masks(&emb, &target, &kernel(), false).unwrap();
        let summed = separate.sum_dim(0).reshape([1, 1, 1, 1, 4]);
        let combined = fake.to_data().to_vec::<f32>().unwrap();
        let expected = summed.to_data().to_vec::<f32>().unwrap();
        for (c, e) in combined.iter().zip(expected.iter()) {
            assert!((c - e).abs() < 1e-6);
        }
    }

    #[test]
    fn batch_with_mixed_samples_flattens_ragged_counts() {
        let device = Default::default();
        // sample 0: two instances, sample 1: background only
        let emb = Tensor::<TB, 5>::from_data(
            TensorData::new(
                vec![0.0f32, 3.0, 3.0, 6.0, 0.0, 0.0, 0.0, 0.0],
                [2, 1, 1, 1, 4],
            ),
            &device,
        );
        let target = Tensor::<TB, 4, Int>::from_data(
            TensorData::new(vec![0i64, 1, 1, 2, 0, 0, 0, 0], [2, 1, 1, 4]),
            &device,
        );
        let (real, fake) = extract_instance_masks(&emb, &target, &kernel(), false).unwrap();
        assert_eq!(real.dims()[0], 2);
        assert_eq!(fake.dims()[0], 2);
    }

    #[test]
    #[should_panic(expected = "consecutive")]
    fn non_consecutive_instance_labels_abort() {
        let (emb, target) = sample(vec![0, 2, 2, 2]);
        extract_instance_masks(&emb, &target, &kernel(), false);
    }
}

use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use serde::Deserialize;
use serde_pickle::{DeOptions, Deserializer, Error as PickleError};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// A raw/label volume pair loaded from the pickle stream.
#[derive(Debug, Clone)]
pub struct VolumeExample {
    pub shape: [usize; 3],
    pub raw: Vec<f32>,
    pub labels: Vec<i64>,
}

/// (shape, raw_f32_le_bytes, label_i32_le_bytes) tuple stored in the pickle stream.
#[derive(Debug, Deserialize)]
struct PickledVolume(Vec<u64>, Vec<u8>, Vec<u8>);

/// A batch split into network input and integer instance labels. The loader
/// may attach per-sample weights (3-tuple batches); this trainer accepts and
/// ignores them.
#[derive(Clone, Debug)]
pub struct EmbBatch<B: Backend> {
    pub input: Tensor<B, 5>,
    pub target: Tensor<B, 4, Int>,
    pub weight: Option<Tensor<B, 5>>,
}

/// Load a pickle stream of (shape, raw_bytes, label_bytes) volume tuples.
pub fn load_pickled_volumes(path: &Path) -> Result<Vec<VolumeExample>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut de = Deserializer::new(BufReader::new(file), DeOptions::default());
    let mut examples = Vec::new();

    loop {
        de.reset_memo();
        match PickledVolume::deserialize(&mut de) {
            Ok(volume) => examples.push(decode_volume(volume)?),
            Err(PickleError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "failed to decode pickle stream at {}: {err}",
                    path.display()
                ));
            }
        }
    }

    Ok(examples)
}

fn decode_volume(volume: PickledVolume) -> Result<VolumeExample> {
    let PickledVolume(shape, raw_bytes, label_bytes) = volume;
    if shape.len() != 3 {
        return Err(anyhow::anyhow!(
            "expected a 3D volume shape, got {shape:?}"
        ));
    }
    let shape = [shape[0] as usize, shape[1] as usize, shape[2] as usize];
    let voxels = shape[0] * shape[1] * shape[2];

    if raw_bytes.len() != voxels * 4 {
        return Err(anyhow::anyhow!(
            "raw buffer holds {} bytes, expected {} for shape {shape:?}",
            raw_bytes.len(),
            voxels * 4
        ));
    }
    if label_bytes.len() != voxels * 4 {
        return Err(anyhow::anyhow!(
            "label buffer holds {} bytes, expected {} for shape {shape:?}",
            label_bytes.len(),
            voxels * 4
        ));
    }

    let raw = raw_bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let labels = label_bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
        .collect();

    Ok(VolumeExample { shape, raw, labels })
}

/// Dataset over shared volume examples, optionally wrapped so that every
/// epoch yields a whole number of batches.
#[derive(Clone)]
pub struct VolumeDataset {
    examples: Vec<Arc<VolumeExample>>,
    len: usize,
}

impl VolumeDataset {
    pub fn new(examples: Vec<Arc<VolumeExample>>, batch_size: usize, wrap: bool) -> Self {
        let len = if wrap && !examples.is_empty() {
            let batches = (examples.len() + batch_size - 1) / batch_size;
            batches * batch_size
        } else {
            examples.len()
        };
        Self { examples, len }
    }
}

impl Dataset<Arc<VolumeExample>> for VolumeDataset {
    fn get(&self, index: usize) -> Option<Arc<VolumeExample>> {
        if self.examples.is_empty() {
            return None;
        }
        let idx = if self.len == self.examples.len() {
            index
        } else {
            index % self.examples.len()
        };
        self.examples.get(idx).cloned()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Assembles (N, 1, D, H, W) inputs and (N, D, H, W) label maps.
#[derive(Clone, Debug, Default)]
pub struct VolumeBatcher;

impl<B: Backend> Batcher<B, Arc<VolumeExample>, EmbBatch<B>> for VolumeBatcher {
    fn batch(&self, items: Vec<Arc<VolumeExample>>, device: &B::Device) -> EmbBatch<B> {
        let batch_size = items.len();
        let shape = items
            .first()
            .map(|ex| ex.shape)
            .expect("empty batch of volumes");
        let voxels = shape[0] * shape[1] * shape[2];

        let mut raw = Vec::with_capacity(batch_size * voxels);
        let mut labels = Vec::with_capacity(batch_size * voxels);
        for item in &items {
            assert_eq!(item.shape, shape, "mixed patch shapes in one batch");
            raw.extend_from_slice(&item.raw);
            labels.extend_from_slice(&item.labels);
        }

        let input = Tensor::<B, 5>::from_data(
            TensorData::new(raw, [batch_size, 1, shape[0], shape[1], shape[2]]),
            device,
        );
        let target = Tensor::<B, 4, Int>::from_data(
            TensorData::new(labels, [batch_size, shape[0], shape[1], shape[2]]),
            device,
        );

        EmbBatch {
            input,
            target,
            weight: None,
        }
    }
}

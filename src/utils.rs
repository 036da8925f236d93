use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GenericImage, GrayImage, Luma};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Running average weighted by batch size, used for every logged statistic.
#[derive(Debug, Default, Clone)]
pub struct RunningAverage {
    count: usize,
    sum: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.count += n;
        self.sum += value * n as f64;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Sink for named scalars and image batches, owned by the trainer.
pub trait MetricSink {
    fn scalar(&mut self, name: &str, value: f64, iteration: usize) -> Result<()>;
    fn images(&mut self, name: &str, images: &[GrayImage], iteration: usize) -> Result<()>;
}

/// File-backed sink: a CSV scalar log plus PNG slice grids.
pub struct FileMetricSink {
    image_dir: PathBuf,
    scalars: BufWriter<File>,
}

impl FileMetricSink {
    pub fn new(log_dir: &Path) -> Result<Self> {
        let image_dir = log_dir.join("images");
        std::fs::create_dir_all(&image_dir)
            .with_context(|| format!("failed to create {}", image_dir.display()))?;

        let scalar_path = log_dir.join("scalars.csv");
        let write_header = !scalar_path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&scalar_path)
            .with_context(|| format!("failed to open {}", scalar_path.display()))?;
        let mut scalars = BufWriter::new(file);
        if write_header {
            writeln!(scalars, "iteration,name,value")?;
        }

        Ok(Self { image_dir, scalars })
    }
}

impl MetricSink for FileMetricSink {
    fn scalar(&mut self, name: &str, value: f64, iteration: usize) -> Result<()> {
        writeln!(self.scalars, "{iteration},{name},{value}")?;
        self.scalars.flush()?;
        Ok(())
    }

    fn images(&mut self, name: &str, images: &[GrayImage], iteration: usize) -> Result<()> {
        if images.is_empty() {
            return Ok(());
        }
        let grid = merge_images(images, images.len(), 1)?;
        let path = self.image_dir.join(format!("{name}_{iteration:06}.png"));
        grid.save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        Ok(())
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn scalar(&mut self, _name: &str, _value: f64, _iteration: usize) -> Result<()> {
        Ok(())
    }

    fn images(&mut self, _name: &str, _images: &[GrayImage], _iteration: usize) -> Result<()> {
        Ok(())
    }
}

/// Render the mid-depth slice of the first channel of each sample in a
/// (N, C, D, H, W) tensor as a min-max normalized grayscale image.
pub fn volume_slices<B: Backend>(tensor: &Tensor<B, 5>) -> Result<Vec<GrayImage>> {
    let [batch, channels, depth, height, width] = tensor.dims();
    let values = tensor
        .to_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data: {err:?}"))?;

    let hw = height * width;
    let mut images = Vec::with_capacity(batch);
    for b in 0..batch {
        let base = ((b * channels) * depth + depth / 2) * hw;
        images.push(slice_to_image(&values[base..base + hw], height, width));
    }
    Ok(images)
}

/// Render the mid-depth slice of each label map in a (N, D, H, W) tensor.
pub fn label_slices<B: Backend>(target: &Tensor<B, 4, Int>) -> Result<Vec<GrayImage>> {
    let [batch, depth, height, width] = target.dims();
    let values = target
        .to_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read label data: {err:?}"))?;

    let hw = height * width;
    let mut images = Vec::with_capacity(batch);
    for b in 0..batch {
        let base = (b * depth + depth / 2) * hw;
        images.push(slice_to_image(&values[base..base + hw], height, width));
    }
    Ok(images)
}

fn slice_to_image(values: &[f32], height: usize, width: usize) -> GrayImage {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = if max > min { max - min } else { 1.0 };

    let mut img = GrayImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let v = (values[y * width + x] - min) / range;
            img.put_pixel(x as u32, y as u32, Luma([(v.clamp(0.0, 1.0) * 255.0) as u8]));
        }
    }
    img
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[GrayImage], rows: usize, cols: usize) -> Result<GrayImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = GrayImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_weights_by_batch_size() {
        let mut avg = RunningAverage::new();
        avg.update(1.0, 1);
        avg.update(4.0, 3);
        assert!((avg.avg() - 3.25).abs() < 1e-12);
    }

    #[test]
    fn empty_running_average_is_zero() {
        assert_eq!(RunningAverage::new().avg(), 0.0);
    }

    #[test]
    fn merge_images_builds_column_grid() {
        let images = vec![GrayImage::new(4, 4), GrayImage::new(4, 4)];
        let grid = merge_images(&images, 2, 1).unwrap();
        assert_eq!(grid.dimensions(), (4, 8));
    }
}

//! VGG全画面分類器の学習

use anyhow::{Context, Result};
use burn::{
    data::dataloader::{batcher::Batcher, DataLoaderBuilder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, LearningStrategy, TrainOutput, TrainStep, ValidStep,
    },
};
use burn_autodiff::Autodiff;
use burn_dataset::Dataset;
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::classifier::preprocess::to_chw_f32;
use crate::ml::builder::{build_model, model_to_bytes, CLASS_LABELS};
use crate::ml::network::TrafficLightNet;
use crate::model::{save_model_with_metadata, AppConfig, DeviceType, ModelMetadata};

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "png" || ext == "jpg" || ext == "jpeg"
        })
        .unwrap_or(false)
}

/// 学習データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct LightDataset {
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    class_names: Vec<String>,
}

impl LightDataset {
    /// `class_labels` の順にクラスIDを割り当ててディレクトリから読み込む
    ///
    /// 各クラスは `data_dir/<ラベル>/` 配下の画像。存在しないクラスは飛ばします。
    pub fn from_directory(data_dir: &Path, class_labels: &[&str]) -> Result<Self> {
        let mut samples = Vec::new();

        for (class_id, class_name) in class_labels.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            if !class_dir.is_dir() {
                warn!("クラスディレクトリが存在しません: {}", class_dir.display());
                continue;
            }

            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&class_dir)
                .with_context(|| format!("Failed to read {:?}", class_dir))?
            {
                let path = entry?.path();
                if path.is_file() && is_image_file(&path) {
                    paths.push(path);
                }
            }
            // read_dirの順序はOS依存なので固定する
            paths.sort();

            info!("  クラス '{}': {} 枚", class_name, paths.len());
            samples.extend(paths.into_iter().map(|p| (p, class_id)));
        }

        if samples.is_empty() {
            anyhow::bail!("No training samples found in {}", data_dir.display());
        }

        Ok(Self {
            samples,
            class_names: class_labels.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, id) in &self.samples {
            counts[*id] += 1;
        }
        counts
    }

    /// シャッフルして学習用と検証用に分割
    pub fn split(self, train_ratio: f32, seed: u64) -> (Self, Self) {
        let mut samples = self.samples;
        let mut rng = StdRng::seed_from_u64(seed);
        samples.shuffle(&mut rng);

        let train_len = ((samples.len() as f32 * train_ratio.clamp(0.0, 1.0)) as usize)
            .min(samples.len());
        let valid_samples = samples.split_off(train_len);

        (
            Self {
                samples,
                class_names: self.class_names.clone(),
            },
            Self {
                samples: valid_samples,
                class_names: self.class_names,
            },
        )
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct LightItem {
    pub path: PathBuf,
    pub label: usize,
}

impl Dataset<LightItem> for LightDataset {
    fn get(&self, index: usize) -> Option<LightItem> {
        let (path, label) = self.samples.get(index)?;
        Some(LightItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct LightBatcher<B: Backend> {
    device: B::Device,
    /// (行, 列)
    image_shape: (usize, usize),
}

impl<B: Backend> LightBatcher<B> {
    pub fn new(device: B::Device, image_shape: (usize, usize)) -> Self {
        Self {
            device,
            image_shape,
        }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LightBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, LightItem, LightBatch<B>> for LightBatcher<B> {
    fn batch(&self, items: Vec<LightItem>, _device: &B::Device) -> LightBatch<B> {
        let (rows, cols) = self.image_shape;
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * rows * cols);
        let mut targets = Vec::with_capacity(batch_size);

        for item in items {
            match image::open(&item.path) {
                Ok(img) => all_pixels.extend(to_chw_f32(&img.to_rgb8(), self.image_shape)),
                Err(e) => {
                    // 読めない画像はゼロで埋める
                    warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * rows * cols));
                }
            }
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, rows, cols]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        LightBatch { images, targets }
    }
}

impl<B: AutodiffBackend> TrainStep<LightBatch<B>, ClassificationOutput<B>> for TrafficLightNet<B> {
    fn step(&self, batch: LightBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

impl<B: Backend> ValidStep<LightBatch<B>, ClassificationOutput<B>> for TrafficLightNet<B> {
    fn step(&self, batch: LightBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 学習ログ・チェックポイントの一時置き場（実行ごとに別ディレクトリ、drop時に削除）
fn artifact_dir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("tl_detector_training")
        .tempdir()
        .context("Failed to create training artifact directory")
}

fn fit<B: AutodiffBackend>(
    config: &AppConfig,
    train_set: LightDataset,
    valid_set: LightDataset,
    device: B::Device,
) -> Result<TrafficLightNet<B::InnerBackend>> {
    let settings = &config.training;
    let built = build_model::<B>(&config.vgg, &device, false)?;

    let dataloader_train = DataLoaderBuilder::new(LightBatcher::<B>::new(
        device.clone(),
        built.image_shape,
    ))
    .batch_size(settings.batch_size)
    .shuffle(settings.seed)
    .num_workers(settings.num_workers)
    .build(train_set);

    let dataloader_valid = DataLoaderBuilder::new(LightBatcher::<B::InnerBackend>::new(
        device.clone(),
        built.image_shape,
    ))
    .batch_size(settings.batch_size)
    .num_workers(settings.num_workers)
    .build(valid_set);

    let artifact_dir = artifact_dir()?;
    let artifact_dir_str = artifact_dir.path().to_string_lossy().to_string();

    info!(
        "エポック数: {}, バッチサイズ: {}, 学習率: {}",
        settings.num_epochs, settings.batch_size, settings.learning_rate
    );

    let learner = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(settings.num_epochs)
        .summary()
        .build(built.model, built.optimizer.init(), settings.learning_rate);

    let trained = learner.fit(dataloader_train, dataloader_valid);

    Ok(trained.model)
}

/// モデル学習を実行し、チェックポイント（.tar.gz）のパスを返す
///
/// 事前学習済みバックボーンは `prepare_artifacts` で事前に用意しておくこと。
pub fn train(config: &AppConfig, data_dir: &Path, output: &Path) -> Result<PathBuf> {
    info!("学習データを読み込みます: {}", data_dir.display());
    let dataset = LightDataset::from_directory(data_dir, &CLASS_LABELS)?;
    let class_names = dataset.class_names().to_vec();

    let (train_set, valid_set) =
        dataset.split(config.training.train_ratio, config.training.seed);
    info!("学習データ: {} 枚", train_set.len());
    info!("検証データ: {} 枚", valid_set.len());
    if train_set.is_empty() || valid_set.is_empty() {
        anyhow::bail!(
            "not enough samples to split with train_ratio {}",
            config.training.train_ratio
        );
    }

    let model_bytes = match config.device_type {
        DeviceType::Wgpu => {
            let model =
                fit::<Autodiff<Wgpu>>(config, train_set, valid_set, WgpuDevice::default())?;
            model_to_bytes(model)?
        }
        DeviceType::Cpu => {
            let model = fit::<Autodiff<NdArray>>(config, train_set, valid_set, NdArrayDevice::Cpu)?;
            model_to_bytes(model)?
        }
    };

    let vgg = &config.vgg;
    let metadata = ModelMetadata::new(
        class_names,
        vgg.image_shape,
        vgg.dense_units,
        vgg.base_channels,
        vgg.fc_channels,
        config.training.num_epochs as u32,
    );

    let path = save_model_with_metadata(output, &metadata, &model_bytes)?;
    info!("学習完了: {} に保存しました", path.display());
    Ok(path)
}

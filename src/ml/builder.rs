//! 学習・推論で共通のモデル構築
//!
//! 1. 事前学習済みVGG16バックボーンを（必要ならダウンロードして）読み込む
//! 2. 分類ヘッドを接続し、バックボーンを固定する
//! 3. 損失（交差エントロピー）とオプティマイザ（Adam）を用意する
//! 4. 推論時は学習済みチェックポイントを（必要ならダウンロードして）復元する

use anyhow::{Context, Result};
use burn::{
    module::Module,
    optim::AdamConfig,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::fetch::Fetcher;
use crate::ml::backbone::Vgg16Backbone;
use crate::ml::network::{TrafficLightNet, TrafficLightNetConfig};
use crate::model::{load_model_with_metadata, model_storage, ModelMetadata, VggSettings};

/// 出力クラスのラベル（インデックス順）
pub const CLASS_LABELS: [&str; 4] = ["red", "yellow", "green", "unknown"];

/// data_dir 内の事前学習済みバックボーン
pub const BACKBONE_FILE: &str = "vgg/backbone.bin";

type ModelRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// 構築済みモデル一式
pub struct BuiltModel<B: Backend> {
    pub num_classes: usize,
    /// (行, 列)
    pub image_shape: (usize, usize),
    pub config: TrafficLightNetConfig,
    pub model: TrafficLightNet<B>,
    /// 追加した全結合層のみを更新するオプティマイザ設定
    pub optimizer: AdamConfig,
}

/// 事前学習済みバックボーンのパス
pub fn backbone_path(settings: &VggSettings) -> PathBuf {
    settings.data_dir.join(BACKBONE_FILE)
}

/// 事前学習済みバックボーンが無ければ取得・展開する
pub async fn maybe_download_pretrained_vgg(
    fetcher: &Fetcher,
    settings: &VggSettings,
) -> Result<PathBuf> {
    let path = backbone_path(settings);
    if path.is_file() {
        return Ok(path);
    }

    let url = settings.pretrained_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!(
            "pretrained backbone not found at {:?} and no pretrained_url is configured",
            path
        )
    })?;

    info!("事前学習済みVGGをダウンロードします: {}", url);
    fetcher.ensure_archive(url, &settings.data_dir, &path).await?;
    Ok(path)
}

/// 学習済みチェックポイントが無ければサーバから取得する
pub async fn maybe_download_checkpoint(fetcher: &Fetcher, settings: &VggSettings) -> Result<PathBuf> {
    let path = model_storage::checkpoint_path(&settings.checkpoint_path);
    if path.is_file() {
        return Ok(path);
    }

    let server = settings.checkpoint_server.as_deref().ok_or_else(|| {
        anyhow::anyhow!(
            "checkpoint not found at {:?} and no checkpoint_server is configured",
            path
        )
    })?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid checkpoint path {:?}", path))?;
    let local_dir = path.parent().unwrap_or_else(|| Path::new("."));

    info!("モデルの重みを取得します: {}", path.display());
    fetcher
        .ensure_files_from_server(server, local_dir, &[file_name])
        .await?;
    Ok(path)
}

/// `build_model` に必要なファイルを揃える
pub async fn prepare_artifacts(
    fetcher: &Fetcher,
    settings: &VggSettings,
    load_trained_weights: bool,
) -> Result<()> {
    if load_trained_weights {
        // チェックポイントにはバックボーンの重みも含まれる
        maybe_download_checkpoint(fetcher, settings).await?;
    } else {
        maybe_download_pretrained_vgg(fetcher, settings).await?;
    }
    Ok(())
}

/// バックボーンの重みをファイルに保存
pub fn save_backbone<B: Backend>(backbone: &Vgg16Backbone<B>, path: &Path) -> Result<()> {
    let bytes = ModelRecorder::default()
        .record(backbone.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("バックボーンの記録エラー: {:?}", e))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// バックボーンの重みを読み込む
pub fn load_backbone<B: Backend>(
    backbone: Vgg16Backbone<B>,
    path: &Path,
    device: &B::Device,
) -> Result<Vgg16Backbone<B>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let record = ModelRecorder::default()
        .load(bytes, device)
        .map_err(|e| anyhow::anyhow!("バックボーン重みの読み込みエラー: {:?}", e))?;
    Ok(backbone.load_record(record))
}

/// モデル全体の重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: TrafficLightNet<B>) -> Result<Vec<u8>> {
    ModelRecorder::default()
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデルの記録エラー: {:?}", e))
}

/// チェックポイントからモデルを復元
pub fn restore_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(TrafficLightNet<B>, ModelMetadata)> {
    info!("モデルの重みを読み込みます: {}", path.display());
    let (metadata, binary) = load_model_with_metadata(path)?;
    if metadata.num_classes() != CLASS_LABELS.len() {
        anyhow::bail!(
            "checkpoint {:?} has {} classes {:?}, expected {:?}",
            path,
            metadata.num_classes(),
            metadata.class_labels,
            CLASS_LABELS
        );
    }
    let config = TrafficLightNetConfig::from_metadata(&metadata);
    let model = config.init::<B>(device)?;

    let record = ModelRecorder::default()
        .load(binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((model.load_record(record), metadata))
}

/// モデルを構築
///
/// `load_trained_weights` がtrueならチェックポイントから全重みを復元し、
/// falseなら事前学習済みバックボーンに新しい分類ヘッドを接続します。
/// どちらの場合もバックボーンは固定されます。
pub fn build_model<B: Backend>(
    settings: &VggSettings,
    device: &B::Device,
    load_trained_weights: bool,
) -> Result<BuiltModel<B>> {
    let (config, model) = if load_trained_weights {
        let path = model_storage::checkpoint_path(&settings.checkpoint_path);
        let (model, metadata) = restore_checkpoint::<B>(&path, device)?;
        (TrafficLightNetConfig::from_metadata(&metadata), model)
    } else {
        let path = backbone_path(settings);
        if !path.is_file() {
            anyhow::bail!("pretrained backbone not found at {:?}", path);
        }
        let config = TrafficLightNetConfig::from_settings(settings);
        let model = config.init::<B>(device)?;
        let backbone = load_backbone(model.backbone().clone(), &path, device)?;
        (config, model.with_backbone(backbone))
    };

    let model = model.freeze_backbone();
    info!(
        "モデル構築完了: {} クラス, 入力 {}x{}, パラメータ数 {:.2}M",
        config.num_classes,
        config.image_rows,
        config.image_cols,
        model.num_params() as f64 / 1_000_000.0
    );

    Ok(BuiltModel {
        num_classes: config.num_classes,
        image_shape: config.image_shape(),
        optimizer: AdamConfig::new(),
        model,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::BackboneConfig;
    use crate::model::save_model_with_metadata;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small_settings(dir: &Path) -> VggSettings {
        VggSettings {
            data_dir: dir.join("data"),
            checkpoint_path: dir.join("runs").join("model.tar.gz"),
            image_shape: (64, 64),
            dense_units: 8,
            base_channels: 2,
            fc_channels: 4,
            ..VggSettings::default()
        }
    }

    #[test]
    fn test_build_requires_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let settings = small_settings(dir.path());
        let result = build_model::<TestBackend>(&settings, &Default::default(), false);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_prepare_without_urls_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = small_settings(dir.path());
        let fetcher = Fetcher::new();
        assert!(prepare_artifacts(&fetcher, &settings, false).await.is_err());
        assert!(prepare_artifacts(&fetcher, &settings, true).await.is_err());
    }

    #[test]
    fn test_checkpoint_round_trip_restores_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let config = TrafficLightNetConfig::new(
            BackboneConfig::new().with_base_channels(2).with_fc_channels(4),
        )
        .with_image_rows(32)
        .with_image_cols(64)
        .with_dense_units(8);
        let model = config.init::<TestBackend>(&device).unwrap();

        let images = burn::tensor::Tensor::<TestBackend, 4>::ones([1, 3, 32, 64], &device);
        let expected = model.predict(images.clone()).into_data().to_vec::<f32>().unwrap();

        let metadata = ModelMetadata::new(
            CLASS_LABELS.iter().map(|s| s.to_string()).collect(),
            (32, 64),
            8,
            2,
            4,
            1,
        );
        let path = save_model_with_metadata(
            &dir.path().join("model"),
            &metadata,
            &model_to_bytes(model).unwrap(),
        )
        .unwrap();

        let settings = VggSettings {
            checkpoint_path: path,
            ..VggSettings::default()
        };
        let built = build_model::<TestBackend>(&settings, &device, true).unwrap();
        assert_eq!(built.num_classes, 4);
        assert_eq!(built.image_shape, (32, 64));

        let restored = built.model.predict(images).into_data().to_vec::<f32>().unwrap();
        for (a, b) in expected.iter().zip(restored.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_restore_rejects_other_class_count() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let config = TrafficLightNetConfig::new(
            BackboneConfig::new().with_base_channels(2).with_fc_channels(4),
        )
        .with_num_classes(3)
        .with_image_rows(32)
        .with_image_cols(32)
        .with_dense_units(4);
        let model = config.init::<TestBackend>(&device).unwrap();

        let metadata = ModelMetadata::new(
            vec!["red".into(), "yellow".into(), "green".into()],
            (32, 32),
            4,
            2,
            4,
            1,
        );
        let path = save_model_with_metadata(
            &dir.path().join("three"),
            &metadata,
            &model_to_bytes(model).unwrap(),
        )
        .unwrap();

        assert!(restore_checkpoint::<TestBackend>(&path, &device).is_err());
    }

    #[test]
    fn test_build_with_pretrained_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let mut settings = small_settings(dir.path());
        settings.image_shape = (32, 32);

        // 事前学習済みバックボーンの代わりに乱数初期化したものを配置
        let config = TrafficLightNetConfig::from_settings(&settings);
        let backbone = config.backbone.init::<TestBackend>(&device);
        save_backbone(&backbone, &backbone_path(&settings)).unwrap();

        let built = build_model::<TestBackend>(&settings, &device, false).unwrap();
        assert_eq!(built.image_shape, (32, 32));
        assert_eq!(built.num_classes, 4);
    }
}

//! 信号機の色判定
//!
//! 設定に応じて Faster R-CNN（フローズングラフ）または VGG 全画面分類器を使います。

pub mod frcnn;
pub mod light;
pub mod preprocess;

pub use frcnn::FrcnnClassifier;
pub use light::TrafficLight;

use anyhow::{Context, Result};
use image::RgbImage;
use tracing::info;

use crate::fetch::Fetcher;
use crate::model::{AppConfig, ClassifierKind};

#[cfg(feature = "ml")]
use crate::ml::{builder::prepare_artifacts, VggClassifier};

/// 分類器に必要なファイルを揃える（無いものだけダウンロード）
pub async fn prepare(fetcher: &Fetcher, config: &AppConfig) -> Result<()> {
    std::fs::create_dir_all(&config.model_dir)
        .with_context(|| format!("Failed to create model directory: {:?}", config.model_dir))?;

    match config.classifier {
        ClassifierKind::Frcnn => {
            fetcher
                .ensure_file(config.frcnn_model_url(), &config.frcnn_model_path())
                .await?;
        }
        #[cfg(feature = "ml")]
        ClassifierKind::Vgg => {
            prepare_artifacts(fetcher, &config.vgg, true).await?;
        }
        #[cfg(not(feature = "ml"))]
        ClassifierKind::Vgg => {
            anyhow::bail!("VGG classifier requires the `ml` feature");
        }
    }
    Ok(())
}

/// 信号機分類器
pub enum TlClassifier {
    Frcnn(FrcnnClassifier),
    #[cfg(feature = "ml")]
    Vgg(VggClassifier),
}

impl TlClassifier {
    /// 設定に従って分類器を開く
    pub async fn open(config: &AppConfig) -> Result<Self> {
        prepare(&Fetcher::new(), config).await?;

        let classifier = match config.classifier {
            ClassifierKind::Frcnn => {
                let path = config.frcnn_model_path();
                info!("フローズングラフを読み込みます: {}", path.display());
                Self::Frcnn(FrcnnClassifier::load(&path, &config.frcnn)?)
            }
            #[cfg(feature = "ml")]
            ClassifierKind::Vgg => Self::Vgg(VggClassifier::load(&config.vgg, &config.device_type)?),
            #[cfg(not(feature = "ml"))]
            ClassifierKind::Vgg => anyhow::bail!("VGG classifier requires the `ml` feature"),
        };

        info!("分類器の準備完了: {}", classifier.kind());
        Ok(classifier)
    }

    pub fn kind(&self) -> ClassifierKind {
        match self {
            Self::Frcnn(_) => ClassifierKind::Frcnn,
            #[cfg(feature = "ml")]
            Self::Vgg(_) => ClassifierKind::Vgg,
        }
    }

    /// 画像中の信号機の色を判定
    pub fn get_classification(&mut self, frame: &RgbImage) -> Result<TrafficLight> {
        match self {
            Self::Frcnn(classifier) => classifier.classify(frame),
            #[cfg(feature = "ml")]
            Self::Vgg(classifier) => classifier.classify(frame),
        }
    }

    /// bgr8 の生バッファから判定（カメラトピックのまま渡す場合）
    pub fn get_classification_bgr(
        &mut self,
        width: u32,
        height: u32,
        bgr: &[u8],
    ) -> Result<TrafficLight> {
        let frame = preprocess::rgb_from_bgr(width, height, bgr)?;
        self.get_classification(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_vgg_without_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.classifier = ClassifierKind::Vgg;
        config.model_dir = dir.path().join("models");
        config.vgg.data_dir = dir.path().join("data");
        config.vgg.checkpoint_path = dir.path().join("runs").join("model.tar.gz");

        assert!(TlClassifier::open(&config).await.is_err());
        // モデルディレクトリは先に作られる
        assert!(config.model_dir.is_dir());
    }

    #[cfg(feature = "ml")]
    #[test]
    fn test_bgr_dispatch_to_vgg() {
        use crate::ml::{BackboneConfig, TrafficLightNetConfig};
        use burn_ndarray::NdArray;

        let model = TrafficLightNetConfig::new(
            BackboneConfig::new().with_base_channels(2).with_fc_channels(4),
        )
        .with_image_rows(32)
        .with_image_cols(32)
        .with_dense_units(4)
        .init::<NdArray>(&Default::default())
        .unwrap();

        let mut classifier = TlClassifier::Vgg(VggClassifier::from_ndarray(model, (32, 32)));
        assert_eq!(classifier.kind(), ClassifierKind::Vgg);

        let bgr = vec![0u8; 8 * 6 * 3];
        assert!(classifier.get_classification_bgr(8, 6, &bgr).is_ok());
        // バッファ長が合わない場合はエラー
        assert!(classifier.get_classification_bgr(8, 6, &bgr[..10]).is_err());
    }
}

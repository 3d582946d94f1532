//! 信号機分類ネットワーク
//!
//! VGG16バックボーンのfc7出力を平坦化し、全結合層を2つ追加して
//! クラスごとのロジットを出力します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::ml::backbone::{BackboneConfig, Vgg16Backbone, DOWNSAMPLE};
use crate::ml::builder::CLASS_LABELS;
use crate::model::{ModelMetadata, VggSettings};

/// モデル設定
#[derive(Config, Debug)]
pub struct TrafficLightNetConfig {
    /// バックボーン設定
    pub backbone: BackboneConfig,
    /// 分類クラス数（赤・黄・青・不明）
    #[config(default = 4)]
    pub num_classes: usize,
    /// 入力画像の高さ（32の倍数）
    #[config(default = 288)]
    pub image_rows: usize,
    /// 入力画像の幅（32の倍数）
    #[config(default = 384)]
    pub image_cols: usize,
    /// 追加する全結合層のユニット数
    #[config(default = 128)]
    pub dense_units: usize,
}

impl TrafficLightNetConfig {
    /// アプリケーション設定から作成（クラス数は `CLASS_LABELS` に従う）
    pub fn from_settings(settings: &VggSettings) -> Self {
        let backbone = BackboneConfig::new()
            .with_base_channels(settings.base_channels)
            .with_fc_channels(settings.fc_channels)
            .with_dropout(settings.dropout);

        Self::new(backbone)
            .with_num_classes(CLASS_LABELS.len())
            .with_image_rows(settings.image_shape.0)
            .with_image_cols(settings.image_shape.1)
            .with_dense_units(settings.dense_units)
    }

    /// チェックポイントのメタデータから作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        let backbone = BackboneConfig::new()
            .with_base_channels(metadata.base_channels)
            .with_fc_channels(metadata.fc_channels);

        Self::new(backbone)
            .with_num_classes(metadata.num_classes())
            .with_image_rows(metadata.image_rows)
            .with_image_cols(metadata.image_cols)
            .with_dense_units(metadata.dense_units)
    }

    /// 入力形状 (行, 列)
    pub fn image_shape(&self) -> (usize, usize) {
        (self.image_rows, self.image_cols)
    }

    /// fc7出力の空間サイズ (行, 列)
    pub fn final_grid(&self) -> Result<(usize, usize)> {
        let (rows, cols) = self.image_shape();
        if rows == 0 || cols == 0 || rows % DOWNSAMPLE != 0 || cols % DOWNSAMPLE != 0 {
            anyhow::bail!(
                "image shape {}x{} must be non-zero multiples of {}",
                rows,
                cols,
                DOWNSAMPLE
            );
        }
        Ok((rows / DOWNSAMPLE, cols / DOWNSAMPLE))
    }

    /// 平坦化後の特徴次元
    pub fn flat_features(&self) -> Result<usize> {
        let (rows, cols) = self.final_grid()?;
        Ok(rows * cols * self.backbone.fc_channels)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<TrafficLightNet<B>> {
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be positive");
        }
        let flat = self.flat_features()?;

        Ok(TrafficLightNet {
            backbone: self.backbone.init(device),
            dense: LinearConfig::new(flat, self.dense_units).init(device),
            final_layer: LinearConfig::new(self.dense_units, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 全画面の信号機分類用CNNモデル
///
/// # アーキテクチャ
/// - VGG16バックボーン（fc7まで）
/// - Flatten
/// - FC: d -> dense_units + ReLU
/// - FC: dense_units -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct TrafficLightNet<B: Backend> {
    backbone: Vgg16Backbone<B>,
    dense: Linear<B>,
    final_layer: Linear<B>,
    activation: Relu,
}

impl<B: Backend> TrafficLightNet<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, rows, cols]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let features = self.backbone.forward(images);
        let [_, c, h, w] = features.layer7_out.dims();
        let x = features.layer7_out.reshape([batch_size, c * h * w]);

        let x = self.activation.forward(self.dense.forward(x));
        self.final_layer.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    pub fn backbone(&self) -> &Vgg16Backbone<B> {
        &self.backbone
    }

    /// バックボーンを差し替える（事前学習済み重みの適用）
    pub fn with_backbone(mut self, backbone: Vgg16Backbone<B>) -> Self {
        self.backbone = backbone;
        self
    }

    /// バックボーンの勾配を止め、追加した全結合層だけを学習対象にする
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }
}

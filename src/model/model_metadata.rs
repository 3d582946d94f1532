//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルの重みと一緒に保存され、推論時にネットワーク形状を
//! 復元するために使用します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（出力インデックス順）
    /// 例: ["red", "yellow", "green", "unknown"]
    pub class_labels: Vec<String>,

    /// ネットワーク入力の高さ（行数）
    pub image_rows: usize,

    /// ネットワーク入力の幅（列数）
    pub image_cols: usize,

    /// 追加した全結合層のユニット数
    pub dense_units: usize,

    /// バックボーンの基本チャネル数（VGG16は64）
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,

    /// fc6/fc7のチャネル数（VGG16は4096）
    #[serde(default = "default_fc_channels")]
    pub fc_channels: usize,

    /// 学習エポック数
    pub num_epochs: u32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

fn default_base_channels() -> usize {
    64
}

fn default_fc_channels() -> usize {
    4096
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_labels: Vec<String>,
        image_shape: (usize, usize),
        dense_units: usize,
        base_channels: usize,
        fc_channels: usize,
        num_epochs: u32,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            image_rows: image_shape.0,
            image_cols: image_shape.1,
            dense_units,
            base_channels,
            fc_channels,
            num_epochs,
            trained_at,
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// 入力形状 (行, 列)
    pub fn image_shape(&self) -> (usize, usize) {
        (self.image_rows, self.image_cols)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backbone_sizes_default_for_older_metadata() {
        let json = r#"{
            "class_labels": ["red", "yellow", "green", "unknown"],
            "image_rows": 288,
            "image_cols": 384,
            "dense_units": 128,
            "num_epochs": 10,
            "trained_at": "2018-09-01T00:00:00+00:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();
        assert_eq!(metadata.num_classes(), 4);
        assert_eq!(metadata.image_shape(), (288, 384));
        assert_eq!(metadata.base_channels, 64);
        assert_eq!(metadata.fc_channels, 4096);
    }

    #[test]
    fn test_new_records_timestamp() {
        let metadata = ModelMetadata::new(vec!["red".into()], (64, 96), 16, 4, 8, 1);
        assert!(!metadata.trained_at.is_empty());
        assert_eq!(metadata.image_cols, 96);
    }
}

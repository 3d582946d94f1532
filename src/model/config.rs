//! アプリケーション設定管理モジュール
//!
//! 分類器の種類、モデルファイルの取得元、計算デバイス、学習設定などを
//! JSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// 実行時分類器の種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClassifierKind {
    /// Faster R-CNN 物体検出（フローズングラフ）。通常はこちらを使用
    #[serde(rename = "FRCNN")]
    Frcnn,
    /// VGGベースの全画面分類器（シミュレータ画像向け）
    #[serde(rename = "VGG")]
    Vgg,
}

impl Default for ClassifierKind {
    fn default() -> Self {
        ClassifierKind::Frcnn
    }
}

impl FromStr for ClassifierKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FRCNN" => Ok(ClassifierKind::Frcnn),
            "VGG" => Ok(ClassifierKind::Vgg),
            other => anyhow::bail!("unknown classifier choice {:?} (expected FRCNN or VGG)", other),
        }
    }
}

impl std::fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassifierKind::Frcnn => write!(f, "FRCNN"),
            ClassifierKind::Vgg => write!(f, "VGG"),
        }
    }
}

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// Faster R-CNN 分類器の設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrcnnSettings {
    /// シミュレータ用モデルのファイル名
    pub sim_file: String,
    /// シミュレータ用モデルの取得元
    pub sim_url: String,
    /// 実車（サイト）用モデルのファイル名
    pub site_file: String,
    /// 実車（サイト）用モデルの取得元
    pub site_url: String,
    /// このスコアを超えた検出のみ採用
    pub detection_threshold: f32,
    /// 推論前の縮小上限（幅）
    pub max_width: u32,
    /// 推論前の縮小上限（高さ）
    pub max_height: u32,
}

impl Default for FrcnnSettings {
    fn default() -> Self {
        Self {
            sim_file: "faster_rcnn_sim.pb".to_string(),
            sim_url: "https://www.dropbox.com/s/z90tivpw0cz9r8c/faster_rcnn_sim.pb?dl=1".to_string(),
            site_file: "faster_rcnn_real.pb".to_string(),
            site_url: "https://www.dropbox.com/s/xswxwsrojqi3z54/faster_rcnn_real.pb?dl=1".to_string(),
            detection_threshold: 0.5,
            max_width: 640,
            max_height: 480,
        }
    }
}

/// VGG全画面分類器（とその学習）の設定
///
/// 分類クラス数は設定できません（`ml::builder::CLASS_LABELS` で固定）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VggSettings {
    /// 事前学習済みバックボーンの保存先
    pub data_dir: PathBuf,
    /// 事前学習済みバックボーン（tar.gz）の取得元。未設定ならローカルのみ
    #[serde(default)]
    pub pretrained_url: Option<String>,
    /// 学習済みチェックポイント（tar.gz）のパス
    pub checkpoint_path: PathBuf,
    /// チェックポイントの取得元フォルダURL。未設定ならローカルのみ
    #[serde(default)]
    pub checkpoint_server: Option<String>,
    /// ネットワーク入力の形状 (行, 列) = (高さ, 幅)。どちらも32の倍数
    pub image_shape: (usize, usize),
    /// 追加する全結合層のユニット数
    pub dense_units: usize,
    /// バックボーンblock1のチャネル数（VGG16は64）
    #[serde(default = "default_base_channels")]
    pub base_channels: usize,
    /// バックボーンfc6/fc7のチャネル数（VGG16は4096）
    #[serde(default = "default_fc_channels")]
    pub fc_channels: usize,
    /// ドロップアウト率（推論時は無効）
    pub dropout: f64,
}

fn default_base_channels() -> usize {
    64
}

fn default_fc_channels() -> usize {
    4096
}

impl Default for VggSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pretrained_url: None,
            checkpoint_path: PathBuf::from(
                "./runs/14_both_full_frames_model_saved/both_full_frame_model.tar.gz",
            ),
            checkpoint_server: None,
            // 800x600 の全画面をGPUメモリに収まるよう縮小
            image_shape: (9 * 32, 12 * 32),
            dense_units: 128,
            base_channels: default_base_channels(),
            fc_channels: default_fc_channels(),
            dropout: 0.5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f32,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 4,
            num_workers: 1,
            learning_rate: 1e-4,
            seed: 42,
            train_ratio: 0.8,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 使用する分類器
    pub classifier: ClassifierKind,
    /// 実車画像用のモデルを使う場合はtrue
    pub is_site: bool,
    /// フローズングラフの保存先
    pub model_dir: PathBuf,
    /// 計算デバイスの種類（VGGのみ）
    pub device_type: DeviceType,
    /// Faster R-CNN 設定
    #[serde(default)]
    pub frcnn: FrcnnSettings,
    /// VGG設定
    #[serde(default)]
    pub vgg: VggSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::default(),
            is_site: false,
            model_dir: PathBuf::from("models"),
            device_type: DeviceType::default(),
            frcnn: FrcnnSettings::default(),
            vgg: VggSettings::default(),
            training: TrainingSettings::default(),
        }
    }
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("tl_detector.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_at<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default() -> Self {
        Self::load_or_default_at(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// is_site に応じたフローズングラフのファイル名
    pub fn frcnn_model_file(&self) -> &str {
        if self.is_site {
            &self.frcnn.site_file
        } else {
            &self.frcnn.sim_file
        }
    }

    /// is_site に応じたフローズングラフの取得元
    pub fn frcnn_model_url(&self) -> &str {
        if self.is_site {
            &self.frcnn.site_url
        } else {
            &self.frcnn.sim_url
        }
    }

    /// フローズングラフのフルパス
    pub fn frcnn_model_path(&self) -> PathBuf {
        self.model_dir.join(self.frcnn_model_file())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        info!("=== 設定 ===");
        info!("分類器: {}", self.classifier);
        info!("実車モード: {}", self.is_site);
        info!("計算デバイス: {}", self.device_type);
        match self.classifier {
            ClassifierKind::Frcnn => {
                info!("モデル: {}", self.frcnn_model_path().display());
                info!("検出しきい値: {}", self.frcnn.detection_threshold);
            }
            ClassifierKind::Vgg => {
                info!("チェックポイント: {}", self.vgg.checkpoint_path.display());
                info!("入力形状: {}x{}", self.vgg.image_shape.0, self.vgg.image_shape.1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.classifier, ClassifierKind::Frcnn);
        assert!(!config.is_site);
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.vgg.image_shape, (288, 384));
        assert_eq!(config.frcnn.detection_threshold, 0.5);
    }

    #[test]
    fn test_site_selects_real_model() {
        let mut config = AppConfig::default();
        assert_eq!(config.frcnn_model_file(), "faster_rcnn_sim.pb");
        assert!(config.frcnn_model_url().contains("faster_rcnn_sim.pb"));

        config.is_site = true;
        assert_eq!(config.frcnn_model_file(), "faster_rcnn_real.pb");
        assert!(config.frcnn_model_url().contains("faster_rcnn_real.pb"));
        assert_eq!(
            config.frcnn_model_path(),
            PathBuf::from("models").join("faster_rcnn_real.pb")
        );
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = AppConfig::default();
        config.classifier = ClassifierKind::Vgg;
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"VGG\""));
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.classifier, ClassifierKind::Vgg);
        assert_eq!(config.vgg.image_shape, deserialized.vgg.image_shape);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"classifier":"FRCNN","is_site":true,"model_dir":"m","device_type":"Cpu"}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!(config.is_site);
        assert_eq!(config.training.batch_size, 4);
        assert!(config.vgg.pretrained_url.is_none());
    }

    #[test]
    fn test_classifier_kind_from_str() {
        assert_eq!("frcnn".parse::<ClassifierKind>().unwrap(), ClassifierKind::Frcnn);
        assert_eq!(" VGG ".parse::<ClassifierKind>().unwrap(), ClassifierKind::Vgg);
        assert!("yolo".parse::<ClassifierKind>().is_err());
    }

    #[test]
    fn test_load_or_default_with_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let config = AppConfig::load_or_default_at(&path);
        assert_eq!(config.classifier, ClassifierKind::Frcnn);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.device_type = DeviceType::Cpu;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.device_type, DeviceType::Cpu);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}

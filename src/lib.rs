//! 信号機認識パイプライン
//!
//! - 実行時分類器: カメラ画像から信号機の状態（赤・黄・青・不明）を返す
//! - モデル構築: VGG16バックボーン + 独自分類ヘッドのCNNを組み立てて学習する
//!
//! 両者はファイル（フローズングラフ、学習済み重み）のみで受け渡しされます。

pub mod classifier;
pub mod fetch;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

pub use classifier::{TlClassifier, TrafficLight};
pub use model::{AppConfig, ClassifierKind, DeviceType};

/// tracingの購読者を初期化（バイナリ用）
///
/// `RUST_LOG` が未設定の場合は `info` レベルで出力します。
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

//! 信号機分類器のコマンドラインツール

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use tl_detector_lib::classifier::{prepare, TlClassifier};
use tl_detector_lib::fetch::Fetcher;
use tl_detector_lib::model::{load_metadata, print_metadata_info};
use tl_detector_lib::{init_tracing, AppConfig, ClassifierKind, DeviceType};

#[derive(Parser)]
#[command(name = "tl_detector")]
#[command(about = "信号機の状態分類ツール", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 設定ファイル（JSON）
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// 分類器の種類（FRCNN / VGG）。設定ファイルより優先
    #[arg(long, global = true)]
    classifier: Option<ClassifierKind>,

    /// 実車用モデルを使う
    #[arg(long, global = true)]
    site: bool,

    /// CPU (NdArray) バックエンドを使う
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 画像ファイルを分類して信号機の状態を表示
    Classify {
        /// 画像ファイル（png/jpg）
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// 選択中の分類器に必要なモデルファイルを取得
    Fetch {
        /// 学習用の事前学習済みVGGバックボーンも取得
        #[arg(long)]
        pretrained: bool,
    },

    /// ラベル付き画像フォルダでVGG分類器を学習
    Train {
        /// red/, yellow/, green/, unknown/ を含むフォルダ
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// チェックポイントの出力先（.tar.gz）
        #[arg(long)]
        output: Option<PathBuf>,

        /// エポック数
        #[arg(long)]
        epochs: Option<usize>,

        /// バッチサイズ
        #[arg(long)]
        batch_size: Option<usize>,

        /// 学習率
        #[arg(long)]
        learning_rate: Option<f64>,
    },

    /// 学習済みチェックポイントのメタデータを表示
    Inspect {
        checkpoint: PathBuf,
    },
}

impl Cli {
    fn load_config(&self) -> AppConfig {
        let path = self.config.clone().unwrap_or_else(AppConfig::default_path);
        let mut config = AppConfig::load_or_default_at(path);

        if let Some(kind) = self.classifier {
            config.classifier = kind;
        }
        if self.site {
            config.is_site = true;
        }
        if self.cpu {
            config.device_type = DeviceType::Cpu;
        }
        config
    }
}

async fn classify(config: &AppConfig, images: &[PathBuf]) -> Result<()> {
    let mut classifier = TlClassifier::open(config).await?;

    for path in images {
        let frame = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                error!("画像読み込み失敗 {}: {}", path.display(), e);
                continue;
            }
        };
        let state = classifier.get_classification(&frame)?;
        println!("{}\t{}\t{}", path.display(), state, state.as_u8());
    }
    Ok(())
}

async fn fetch(config: &AppConfig, pretrained: bool) -> Result<()> {
    let fetcher = Fetcher::new();
    prepare(&fetcher, config).await?;

    if pretrained {
        #[cfg(feature = "ml")]
        tl_detector_lib::ml::builder::maybe_download_pretrained_vgg(&fetcher, &config.vgg).await?;
        #[cfg(not(feature = "ml"))]
        anyhow::bail!("pretrained backbone requires the `ml` feature");
    }
    Ok(())
}

#[cfg(feature = "ml")]
async fn train(config: AppConfig, data_dir: PathBuf, output: PathBuf) -> Result<()> {
    tl_detector_lib::ml::prepare_artifacts(&Fetcher::new(), &config.vgg, false).await?;

    // 学習は重いのでブロッキングスレッドで実行
    let path = tokio::task::spawn_blocking(move || {
        tl_detector_lib::ml::train(&config, &data_dir, &output)
    })
    .await
    .context("training task panicked")??;

    println!("{}", path.display());
    Ok(())
}

#[cfg(not(feature = "ml"))]
async fn train(_config: AppConfig, _data_dir: PathBuf, _output: PathBuf) -> Result<()> {
    anyhow::bail!("training requires the `ml` feature")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = cli.load_config();

    match cli.command {
        Commands::Classify { images } => {
            config.display();
            classify(&config, &images).await?;
        }
        Commands::Fetch { pretrained } => {
            fetch(&config, pretrained).await?;
            info!("モデルファイルの準備が完了しました");
        }
        Commands::Train {
            data_dir,
            output,
            epochs,
            batch_size,
            learning_rate,
        } => {
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            let data_dir = data_dir.unwrap_or_else(|| config.vgg.data_dir.join("training"));
            let output = output.unwrap_or_else(|| config.vgg.checkpoint_path.clone());
            train(config, data_dir, output).await?;
        }
        Commands::Inspect { checkpoint } => {
            let metadata = load_metadata(&checkpoint)?;
            print_metadata_info(&metadata);
        }
    }

    Ok(())
}

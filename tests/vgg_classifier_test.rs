//! VGG分類器の結合テスト: サーバからチェックポイントを取得して判定する
#![cfg(feature = "ml")]

use axum::{routing::get, Router};
use burn_ndarray::NdArray;
use image::RgbImage;
use tl_detector_lib::ml::builder::model_to_bytes;
use tl_detector_lib::ml::{BackboneConfig, TrafficLightNetConfig, CLASS_LABELS};
use tl_detector_lib::model::{load_metadata, save_model_with_metadata, ModelMetadata};
use tl_detector_lib::{AppConfig, ClassifierKind, DeviceType, TlClassifier};
use tokio::net::TcpListener;

fn small_checkpoint(dir: &std::path::Path) -> Vec<u8> {
    let model = TrafficLightNetConfig::new(
        BackboneConfig::new().with_base_channels(2).with_fc_channels(4),
    )
    .with_image_rows(32)
    .with_image_cols(64)
    .with_dense_units(8)
    .init::<NdArray>(&Default::default())
    .unwrap();

    let metadata = ModelMetadata::new(
        CLASS_LABELS.iter().map(|s| s.to_string()).collect(),
        (32, 64),
        8,
        2,
        4,
        1,
    );
    let path = save_model_with_metadata(
        &dir.join("served"),
        &metadata,
        &model_to_bytes(model).unwrap(),
    )
    .unwrap();
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn test_open_downloads_checkpoint_and_classifies() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = small_checkpoint(dir.path());

    let app = Router::new().route("/runs/model.tar.gz", get(move || async move { checkpoint }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = AppConfig::default();
    config.classifier = ClassifierKind::Vgg;
    config.device_type = DeviceType::Cpu;
    config.model_dir = dir.path().join("models");
    config.vgg.checkpoint_path = dir.path().join("local").join("model.tar.gz");
    config.vgg.checkpoint_server = Some(format!("http://{}/runs", addr));

    let mut classifier = TlClassifier::open(&config).await.unwrap();
    assert_eq!(classifier.kind(), ClassifierKind::Vgg);

    let metadata = load_metadata(&config.vgg.checkpoint_path).unwrap();
    assert_eq!(metadata.image_shape(), (32, 64));

    let frame = RgbImage::from_pixel(640, 480, image::Rgb([200, 30, 30]));
    let state = classifier.get_classification(&frame).unwrap();
    assert!([0u8, 1, 2, 4].contains(&state.as_u8()));
}

//! VGG全画面分類器による推論

use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::{Wgpu, WgpuDevice};
use image::RgbImage;
use tracing::debug;

use crate::classifier::light::TrafficLight;
use crate::classifier::preprocess::to_chw_f32;
use crate::ml::builder::build_model;
use crate::ml::network::TrafficLightNet;
use crate::model::{DeviceType, VggSettings};

/// 確率ベクトルから最も確からしいクラスと信号機の状態を得る
pub fn state_from_softmax(probs: &[f32]) -> (usize, TrafficLight) {
    let class_idx = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(3);
    (class_idx, TrafficLight::from_class_index(class_idx))
}

/// スコアのデバッグ表記（例: `R0.91_Y0.03_G0.04_U0.02`）
pub fn format_scores(probs: &[f32]) -> String {
    const PREFIX: [&str; 4] = ["R", "Y", "G", "U"];
    probs
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}{:.2}", PREFIX.get(i).copied().unwrap_or("C"), p))
        .collect::<Vec<_>>()
        .join("_")
}

fn run_model<B: Backend>(
    model: &TrafficLightNet<B>,
    device: &B::Device,
    data: Vec<f32>,
    shape: (usize, usize),
) -> Result<Vec<f32>> {
    let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 3, shape.0, shape.1]);
    model
        .predict(tensor)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))
}

/// バックエンドごとのモデル
pub enum VggEngine {
    Wgpu {
        model: TrafficLightNet<Wgpu>,
        device: WgpuDevice,
    },
    NdArray {
        model: TrafficLightNet<NdArray>,
        device: NdArrayDevice,
    },
}

/// VGG全画面分類器
pub struct VggClassifier {
    engine: VggEngine,
    image_shape: (usize, usize),
    image_counter: u64,
}

impl VggClassifier {
    /// 学習済みチェックポイントから分類器を作成
    ///
    /// チェックポイントは事前に `prepare_artifacts` で取得しておくこと。
    pub fn load(settings: &VggSettings, device_type: &DeviceType) -> Result<Self> {
        let (engine, image_shape) = match device_type {
            DeviceType::Wgpu => {
                let device = WgpuDevice::default();
                let built = build_model::<Wgpu>(settings, &device, true)?;
                (
                    VggEngine::Wgpu {
                        model: built.model,
                        device,
                    },
                    built.image_shape,
                )
            }
            DeviceType::Cpu => {
                let device = NdArrayDevice::Cpu;
                let built = build_model::<NdArray>(settings, &device, true)?;
                (
                    VggEngine::NdArray {
                        model: built.model,
                        device,
                    },
                    built.image_shape,
                )
            }
        };

        Ok(Self {
            engine,
            image_shape,
            image_counter: 0,
        })
    }

    /// 既存のCPUモデルから作成
    pub fn from_ndarray(model: TrafficLightNet<NdArray>, image_shape: (usize, usize)) -> Self {
        Self {
            engine: VggEngine::NdArray {
                model,
                device: NdArrayDevice::Cpu,
            },
            image_shape,
            image_counter: 0,
        }
    }

    /// 入力形状 (行, 列)
    pub fn image_shape(&self) -> (usize, usize) {
        self.image_shape
    }

    /// クラスごとの確率
    pub fn probabilities(&self, frame: &RgbImage) -> Result<Vec<f32>> {
        // 先に縮小してから以降の処理を軽くする
        let data = to_chw_f32(frame, self.image_shape);
        match &self.engine {
            VggEngine::Wgpu { model, device } => run_model(model, device, data, self.image_shape),
            VggEngine::NdArray { model, device } => run_model(model, device, data, self.image_shape),
        }
    }

    /// 画像中の信号機の色を判定
    pub fn classify(&mut self, frame: &RgbImage) -> Result<TrafficLight> {
        let probs = self.probabilities(frame)?;
        let (class_idx, state) = state_from_softmax(&probs);

        debug!(
            "image run_{}_{}_{} classed:{}",
            self.image_counter,
            class_idx,
            format_scores(&probs),
            state
        );
        self.image_counter += 1;

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::BackboneConfig;
    use crate::ml::network::TrafficLightNetConfig;

    #[test]
    fn test_state_from_softmax() {
        assert_eq!(state_from_softmax(&[0.7, 0.1, 0.1, 0.1]), (0, TrafficLight::Red));
        assert_eq!(state_from_softmax(&[0.1, 0.1, 0.7, 0.1]), (2, TrafficLight::Green));
        // 不明クラス（3）はROSの UNKNOWN (4) に対応
        let (idx, state) = state_from_softmax(&[0.1, 0.1, 0.1, 0.7]);
        assert_eq!(idx, 3);
        assert_eq!(state.as_u8(), 4);
        assert_eq!(state_from_softmax(&[]).1, TrafficLight::Unknown);
    }

    #[test]
    fn test_format_scores() {
        assert_eq!(
            format_scores(&[0.91, 0.03, 0.04, 0.02]),
            "R0.91_Y0.03_G0.04_U0.02"
        );
    }

    #[test]
    fn test_classify_any_frame_size() {
        let device = NdArrayDevice::Cpu;
        let model = TrafficLightNetConfig::new(
            BackboneConfig::new().with_base_channels(2).with_fc_channels(4),
        )
        .with_image_rows(32)
        .with_image_cols(64)
        .with_dense_units(8)
        .init::<NdArray>(&device)
        .unwrap();

        let mut classifier = VggClassifier::from_ndarray(model, (32, 64));
        let frame = RgbImage::new(800, 600);
        let probs = classifier.probabilities(&frame).unwrap();
        assert_eq!(probs.len(), 4);

        let state = classifier.classify(&frame).unwrap();
        assert_ne!(state.as_u8(), 3);
        assert_eq!(classifier.image_counter, 1);
    }
}

//! Faster R-CNN（フローズングラフ）による信号機検出
//!
//! TensorFlow Object Detection API形式の `.pb` をTensorFlowセッションで実行し、
//! 検出結果の最高スコアとそのクラスから信号機の状態を決定します。

use anyhow::{Context, Result};
use image::RgbImage;
use std::path::Path;
use std::time::Instant;
use tensorflow::{
    Graph, ImportGraphDefOptions, Operation, Session, SessionOptions, SessionRunArgs, Tensor,
};
use tracing::{debug, info};

use crate::classifier::light::TrafficLight;
use crate::classifier::preprocess::fit_within;
use crate::model::FrcnnSettings;

const INPUT_NAME: &str = "image_tensor";
const OUTPUT_NAMES: [&str; 4] = [
    "detection_boxes",
    "detection_scores",
    "detection_classes",
    "num_detections",
];

fn tf_error(context: &str, status: tensorflow::Status) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", context, status)
}

/// 最高スコアの検出（NaNは無視）
fn top_detection(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// 1フレーム分の検出結果（有効件数分のみ）
#[derive(Debug, Clone, Default)]
pub struct Detections {
    /// [ymin, xmin, ymax, xmax]（0〜1の正規化座標）
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub classes: Vec<f32>,
}

impl Detections {
    /// 最高スコアの検出枠
    pub fn top_box(&self) -> Option<[f32; 4]> {
        top_detection(&self.scores).and_then(|(i, _)| self.boxes.get(i).copied())
    }
}

/// 検出結果から信号機の状態を決定
///
/// 最高スコアがしきい値を超えた場合のみ、そのクラス（1: 赤, 2: 黄, それ以外: 青）
/// を採用します。戻り値の2番目は最高スコアです。
pub fn state_from_detections(
    scores: &[f32],
    classes: &[f32],
    threshold: f32,
) -> (TrafficLight, Option<f32>) {
    let Some((index, top_score)) = top_detection(scores) else {
        return (TrafficLight::Unknown, None);
    };

    if top_score <= threshold {
        return (TrafficLight::Unknown, Some(top_score));
    }

    let state = match classes.get(index).map(|c| c.round() as i64) {
        Some(1) => TrafficLight::Red,
        Some(2) => TrafficLight::Yellow,
        _ => TrafficLight::Green,
    };
    (state, Some(top_score))
}

/// Faster R-CNN 分類器
pub struct FrcnnClassifier {
    _graph: Graph,
    session: Session,
    input: Operation,
    // OUTPUT_NAMES と同じ順
    outputs: Vec<Operation>,
    threshold: f32,
    max_width: u32,
    max_height: u32,
}

impl FrcnnClassifier {
    /// フローズングラフを読み込み、セッションを作成
    pub fn load(path: &Path, settings: &FrcnnSettings) -> Result<Self> {
        info!("グラフを読み込みます: {}", path.display());

        let proto =
            std::fs::read(path).with_context(|| format!("Failed to read frozen graph {:?}", path))?;

        let mut graph = Graph::new();
        graph
            .import_graph_def(&proto, &ImportGraphDefOptions::new())
            .map_err(|e| tf_error(&format!("Failed to import frozen graph {:?}", path), e))?;

        let input = graph
            .operation_by_name_required(INPUT_NAME)
            .map_err(|e| tf_error("frozen graph has no image_tensor input", e))?;
        let outputs = OUTPUT_NAMES
            .iter()
            .map(|name| {
                graph
                    .operation_by_name_required(name)
                    .map_err(|e| tf_error(&format!("frozen graph is missing {}", name), e))
            })
            .collect::<Result<Vec<_>>>()?;

        let session = Session::new(&SessionOptions::new(), &graph)
            .map_err(|e| tf_error("Failed to create session", e))?;

        Ok(Self {
            _graph: graph,
            session,
            input,
            outputs,
            threshold: settings.detection_threshold,
            max_width: settings.max_width,
            max_height: settings.max_height,
        })
    }

    /// 検出を実行（入力は上限サイズまで縮小される）
    pub fn detect(&self, frame: &RgbImage) -> Result<Detections> {
        let image = fit_within(frame, self.max_width, self.max_height);
        let (width, height) = image.dimensions();

        // [1, 高さ, 幅, 3] のuint8
        let input = Tensor::<u8>::new(&[1, height as u64, width as u64, 3])
            .with_values(image.as_raw())
            .map_err(|e| tf_error("Failed to build image tensor", e))?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.input, 0, &input);
        let tokens: Vec<_> = self
            .outputs
            .iter()
            .map(|op| args.request_fetch(op, 0))
            .collect();

        self.session
            .run(&mut args)
            .map_err(|e| tf_error("detection graph run failed", e))?;

        let mut fetched = Vec::with_capacity(tokens.len());
        for (token, name) in tokens.into_iter().zip(OUTPUT_NAMES) {
            let tensor: Tensor<f32> = args
                .fetch(token)
                .map_err(|e| tf_error(&format!("Failed to fetch {}", name), e))?;
            fetched.push(tensor);
        }

        let (boxes, scores, classes) = (&fetched[0][..], &fetched[1][..], &fetched[2][..]);
        let num = fetched[3]
            .first()
            .map(|n| n.max(0.0) as usize)
            .unwrap_or(scores.len());
        let num = num.min(scores.len()).min(classes.len()).min(boxes.len() / 4);

        Ok(Detections {
            boxes: boxes
                .chunks_exact(4)
                .take(num)
                .map(|b| [b[0], b[1], b[2], b[3]])
                .collect(),
            scores: scores[..num].to_vec(),
            classes: classes[..num].to_vec(),
        })
    }

    /// 画像中の信号機の色を判定
    pub fn classify(&self, frame: &RgbImage) -> Result<TrafficLight> {
        let tic = Instant::now();
        let detections = self.detect(frame)?;
        debug!(
            "Time spent on classification={:.2}",
            tic.elapsed().as_secs_f64()
        );

        let (state, top_score) =
            state_from_detections(&detections.scores, &detections.classes, self.threshold);
        match (state, top_score) {
            (TrafficLight::Unknown, _) => debug!("Traffic state: OFF"),
            (state, Some(score)) => debug!(
                "Traffic state: {}, score={:.2}, box={:?}",
                state,
                score * 100.0,
                detections.top_box()
            ),
            (state, None) => debug!("Traffic state: {}", state),
        }
        Ok(state)
    }
}

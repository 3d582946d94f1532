//! カメラ画像の前処理

use anyhow::Result;
use image::{imageops::FilterType, RgbImage};

/// ROSの `bgr8` バッファからRGB画像を作成
pub fn rgb_from_bgr(width: u32, height: u32, bgr: &[u8]) -> Result<RgbImage> {
    let expected = width as usize * height as usize * 3;
    if bgr.len() != expected {
        anyhow::bail!(
            "invalid bgr8 buffer: expected {} bytes for {}x{}, got {}",
            expected,
            width,
            height,
            bgr.len()
        );
    }

    let mut rgb = Vec::with_capacity(expected);
    for px in bgr.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| anyhow::anyhow!("failed to build {}x{} image", width, height))
}

/// アスペクト比を保ったまま `max_w` x `max_h` に収まるサイズ
///
/// 拡大はしません（既に収まっていればそのまま）。
pub fn thumbnail_dims(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width <= max_w && height <= max_h {
        return (width, height);
    }

    let scale = f64::min(max_w as f64 / width as f64, max_h as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).clamp(1, max_w);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max_h);
    (w, h)
}

/// 上限に収まるよう縮小（検出器用）
pub fn fit_within(image: &RgbImage, max_w: u32, max_h: u32) -> RgbImage {
    let (w, h) = thumbnail_dims(image.width(), image.height(), max_w, max_h);
    if (w, h) == image.dimensions() {
        return image.clone();
    }
    image::imageops::resize(image, w, h, FilterType::Lanczos3)
}

/// (行, 列) の形状に変形し、CHW順のf32配列を返す（分類器用）
///
/// 画素値は0〜255のまま渡します（バックボーンの学習時と同じ）。
pub fn to_chw_f32(image: &RgbImage, shape: (usize, usize)) -> Vec<f32> {
    let (rows, cols) = shape;
    let resized;
    let image = if image.dimensions() == (cols as u32, rows as u32) {
        image
    } else {
        resized = image::imageops::resize(image, cols as u32, rows as u32, FilterType::Triangle);
        &resized
    };

    let mut data = Vec::with_capacity(3 * rows * cols);
    for channel in 0..3 {
        for y in 0..rows as u32 {
            for x in 0..cols as u32 {
                data.push(image.get_pixel(x, y)[channel] as f32);
            }
        }
    }
    data
}

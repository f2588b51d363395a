//! データ拡張
//!
//! 回転・平行移動（バイリニア補間、範囲外は最近傍の端の画素で埋める）、左右反転、
//! 明るさ変更を行います。乱数はシード付きで、同じシードなら同じ画像になります。

use image::{imageops, Rgb, RgbImage};
use rand::Rng;

use crate::model::config::AugmentationSettings;

/// 1枚分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    /// 回転角（度）
    pub rotation_deg: f64,
    /// 縦方向シフト（画素）
    pub shift_rows: f64,
    /// 横方向シフト（画素）
    pub shift_cols: f64,
    pub flip_horizontal: bool,
    /// 明るさ係数
    pub brightness: f64,
}

impl TransformParams {
    /// 何もしない変換
    pub fn identity() -> Self {
        Self {
            rotation_deg: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            flip_horizontal: false,
            brightness: 1.0,
        }
    }

    fn has_affine(&self) -> bool {
        self.rotation_deg != 0.0 || self.shift_rows != 0.0 || self.shift_cols != 0.0
    }
}

/// 画像拡張器
#[derive(Debug, Clone)]
pub struct Augmenter {
    settings: AugmentationSettings,
}

fn symmetric<R: Rng>(rng: &mut R, range: f64) -> f64 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AugmentationSettings {
        &self.settings
    }

    /// 変換パラメータを乱数で決める
    ///
    /// シフト量が1未満のときは画像サイズに対する割合として扱います。
    pub fn sample_params<R: Rng>(&self, rng: &mut R, height: u32, width: u32) -> TransformParams {
        let s = &self.settings;
        let rotation_deg = symmetric(rng, s.rotation_range);

        let mut shift_rows = symmetric(rng, s.height_shift_range);
        if s.height_shift_range < 1.0 {
            shift_rows *= height as f64;
        }
        let mut shift_cols = symmetric(rng, s.width_shift_range);
        if s.width_shift_range < 1.0 {
            shift_cols *= width as f64;
        }

        let flip_horizontal = s.horizontal_flip && rng.gen::<f64>() < 0.5;

        let (lo, hi) = s.brightness_range;
        let brightness = if hi > lo { rng.gen_range(lo..hi) } else { lo };

        TransformParams {
            rotation_deg,
            shift_rows,
            shift_cols,
            flip_horizontal,
            brightness,
        }
    }

    /// 乱数でパラメータを決めて変換
    pub fn augment<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample_params(rng, img.height(), img.width());
        apply_transform(img, &params)
    }
}

/// 変換を適用（アフィン変換 → 左右反転 → 明るさ）
pub fn apply_transform(img: &RgbImage, params: &TransformParams) -> RgbImage {
    let mut out = if params.has_affine() {
        affine(img, params)
    } else {
        img.clone()
    };

    if params.flip_horizontal {
        imageops::flip_horizontal_in_place(&mut out);
    }

    if params.brightness != 1.0 {
        adjust_brightness(&mut out, params.brightness);
    }

    out
}

/// 出力画素 (r, c) に対応する入力座標を回転中心まわりの逆写像で求めてサンプリング
fn affine(img: &RgbImage, params: &TransformParams) -> RgbImage {
    let (width, height) = img.dimensions();
    let theta = params.rotation_deg.to_radians();
    let (sin, cos) = theta.sin_cos();
    let center_r = height as f64 / 2.0 + 0.5;
    let center_c = width as f64 / 2.0 + 0.5;

    let mut out = RgbImage::new(width, height);
    for r in 0..height {
        for c in 0..width {
            let dr = r as f64 - center_r + params.shift_rows;
            let dc = c as f64 - center_c + params.shift_cols;
            let src_r = cos * dr - sin * dc + center_r;
            let src_c = sin * dr + cos * dc + center_c;
            out.put_pixel(c, r, sample_bilinear(img, src_r, src_c));
        }
    }
    out
}

/// バイリニア補間（範囲外は端の画素）
fn sample_bilinear(img: &RgbImage, row: f64, col: f64) -> Rgb<u8> {
    let max_r = (img.height() - 1) as f64;
    let max_c = (img.width() - 1) as f64;
    let row = row.clamp(0.0, max_r);
    let col = col.clamp(0.0, max_c);

    let r0 = row.floor();
    let c0 = col.floor();
    let r1 = (r0 + 1.0).min(max_r);
    let c1 = (c0 + 1.0).min(max_c);
    let fr = row - r0;
    let fc = col - c0;

    let px = |r: f64, c: f64| img.get_pixel(c as u32, r as u32);
    let (p00, p01, p10, p11) = (px(r0, c0), px(r0, c1), px(r1, c0), px(r1, c1));

    let mut result = [0u8; 3];
    for ch in 0..3 {
        let top = p00[ch] as f64 * (1.0 - fc) + p01[ch] as f64 * fc;
        let bottom = p10[ch] as f64 * (1.0 - fc) + p11[ch] as f64 * fc;
        let value = top * (1.0 - fr) + bottom * fr;
        result[ch] = value.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(result)
}

/// 明るさ係数を掛ける（255で飽和）
fn adjust_brightness(img: &mut RgbImage, factor: f64) {
    for pixel in img.pixels_mut() {
        for ch in 0..3 {
            pixel[ch] = (pixel[ch] as f64 * factor).clamp(0.0, 255.0) as u8;
        }
    }
}

//! 量子化パラメータと固定小数点演算
//!
//! 実数の再スケール係数は int32 の仮数とシフト量で表し、推論時は整数演算だけで計算します。

use serde::{Deserialize, Serialize};

use crate::error::FreshnessError;

pub const INT8_MIN: i32 = -128;
pub const INT8_MAX: i32 = 127;
/// 重みは対称量子化のため -127..=127
pub const WEIGHT_MAX: i32 = 127;
/// 範囲が退化したアクティベーションに使う最小幅
const MIN_ACTIVATION_RANGE: f32 = 1e-3;

/// スケールとゼロ点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    /// 入力画像（uint8 の生の画素値）
    pub fn input_uint8() -> Self {
        Self::new(1.0 / 255.0, 0)
    }

    /// 入力画像を int8 にしたもの
    pub fn input_int8() -> Self {
        Self::new(1.0 / 255.0, -128)
    }

    /// softmax の出力（int8）
    pub fn softmax_int8() -> Self {
        Self::new(1.0 / 256.0, -128)
    }

    /// softmax の出力（uint8）
    pub fn softmax_uint8() -> Self {
        Self::new(1.0 / 256.0, 0)
    }

    pub fn quantize(&self, value: f32) -> i32 {
        ((value / self.scale).round() as i32 + self.zero_point).clamp(INT8_MIN, INT8_MAX)
    }

    pub fn dequantize(&self, value: i32) -> f32 {
        (value - self.zero_point) as f32 * self.scale
    }

    /// 実数の区間 [lo, hi] に対応する量子化値の区間（int8 に収まるよう切り詰め）
    pub fn clamp_bounds(&self, lo: Option<f32>, hi: Option<f32>) -> (i32, i32) {
        let min = lo
            .map(|v| (self.zero_point + (v / self.scale).round() as i32).max(INT8_MIN))
            .unwrap_or(INT8_MIN);
        let max = hi
            .map(|v| (self.zero_point + (v / self.scale).round() as i32).min(INT8_MAX))
            .unwrap_or(INT8_MAX);
        (min, max)
    }
}

/// キャリブレーションで観測した値域
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObserver {
    pub min: f32,
    pub max: f32,
}

impl Default for RangeObserver {
    fn default() -> Self {
        Self {
            min: f32::INFINITY,
            max: f32::NEG_INFINITY,
        }
    }
}

impl RangeObserver {
    pub fn observe(&mut self, min: f32, max: f32) {
        // NaN は有限判定で弾くため伝播させる
        if min.is_nan() || max.is_nan() {
            self.min = f32::NAN;
            self.max = f32::NAN;
            return;
        }
        self.min = self.min.min(min);
        self.max = self.max.max(max);
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// 非対称 int8 のアクティベーション量子化パラメータ
///
/// 0 が正確に表現できるよう範囲を 0 を含むように広げます。
pub fn activation_params(name: &str, range: RangeObserver) -> Result<QuantParams, FreshnessError> {
    if !range.min.is_finite() || !range.max.is_finite() {
        return Err(FreshnessError::UnsupportedOperation {
            op: name.to_string(),
            reason: format!("activation range [{}, {}] is not finite", range.min, range.max),
        });
    }

    let min = range.min.min(0.0);
    let mut max = range.max.max(0.0);
    if max - min < MIN_ACTIVATION_RANGE {
        max = min + MIN_ACTIVATION_RANGE;
    }

    let scale = (max - min) / (INT8_MAX - INT8_MIN) as f32;
    let zero_point = (INT8_MIN as f32 - min / scale).round() as i32;
    Ok(QuantParams::new(scale, zero_point.clamp(INT8_MIN, INT8_MAX)))
}

/// 出力チャネルごとの対称 int8 量子化
///
/// # 引数
/// - `weights`: 出力チャネルごとに連続した重み [channels * per_channel]
///
/// # 戻り値
/// - (量子化済み重み, チャネルごとのスケール)
pub fn quantize_per_channel(
    name: &str,
    weights: &[f32],
    channels: usize,
) -> Result<(Vec<i8>, Vec<f32>), FreshnessError> {
    if channels == 0 || weights.len() % channels != 0 {
        return Err(FreshnessError::UnsupportedOperation {
            op: name.to_string(),
            reason: format!("{} weights cannot be split into {} channels", weights.len(), channels),
        });
    }
    if let Some(bad) = weights.iter().find(|w| !w.is_finite()) {
        return Err(FreshnessError::UnsupportedOperation {
            op: name.to_string(),
            reason: format!("non-finite weight {}", bad),
        });
    }

    let per_channel = weights.len() / channels;
    let mut quantized = Vec::with_capacity(weights.len());
    let mut scales = Vec::with_capacity(channels);
    for chunk in weights.chunks(per_channel) {
        let max_abs = chunk.iter().fold(0.0f32, |m, w| m.max(w.abs()));
        let scale = if max_abs > 0.0 {
            max_abs / WEIGHT_MAX as f32
        } else {
            1.0
        };
        quantized.extend(
            chunk
                .iter()
                .map(|w| (w / scale).round().clamp(-WEIGHT_MAX as f32, WEIGHT_MAX as f32) as i8),
        );
        scales.push(scale);
    }
    Ok((quantized, scales))
}

/// バイアスを int32 に量子化（スケールは 入力スケール × 重みスケール）
pub fn quantize_bias(
    name: &str,
    bias: &[f32],
    input_scale: f32,
    weight_scales: &[f32],
) -> Result<Vec<i32>, FreshnessError> {
    bias.iter()
        .zip(weight_scales)
        .map(|(&b, &ws)| {
            let q = (b as f64 / (input_scale as f64 * ws as f64)).round();
            if !q.is_finite() || q < i32::MIN as f64 || q > i32::MAX as f64 {
                return Err(FreshnessError::UnsupportedOperation {
                    op: name.to_string(),
                    reason: format!("bias {} does not fit in int32 at scale {}", b, input_scale * ws),
                });
            }
            Ok(q as i32)
        })
        .collect()
}

/// 実数の倍率を (Q31 の仮数, 2のべき指数) に分解する
///
/// real ≈ multiplier / 2^31 × 2^shift
pub fn quantize_multiplier(real: f64) -> Result<(i32, i32), FreshnessError> {
    if !real.is_finite() || real < 0.0 {
        return Err(FreshnessError::UnsupportedOperation {
            op: "rescale".to_string(),
            reason: format!("multiplier {} is not a finite non-negative number", real),
        });
    }
    if real == 0.0 {
        return Ok((0, 0));
    }

    let (fraction, mut shift) = frexp(real);
    let mut q = (fraction * (1i64 << 31) as f64).round() as i64;
    if q == 1i64 << 31 {
        q /= 2;
        shift += 1;
    }
    if shift < -31 {
        shift = 0;
        q = 0;
    }
    if shift > 30 {
        return Err(FreshnessError::UnsupportedOperation {
            op: "rescale".to_string(),
            reason: format!("multiplier {} (fraction {}) is too large", real, fraction),
        });
    }
    Ok((q as i32, shift))
}

/// x = fraction × 2^exp, fraction ∈ [0.5, 1)
fn frexp(x: f64) -> (f64, i32) {
    let mut exp = x.log2().floor() as i32 + 1;
    let mut fraction = x / 2f64.powi(exp);
    if fraction >= 1.0 {
        fraction /= 2.0;
        exp += 1;
    } else if fraction < 0.5 {
        fraction *= 2.0;
        exp -= 1;
    }
    (fraction, exp)
}

/// (a × b × 2) の上位32ビットを丸めて返す
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge = if ab >= 0 { 1i64 << 30 } else { 1 - (1i64 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// 2^exponent で割って最近接に丸める（0.5 は 0 から遠い方）
pub fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    debug_assert!((0..=31).contains(&exponent));
    let mask = ((1i64 << exponent) - 1) as i32;
    let remainder = x & mask;
    let threshold = (mask >> 1) + i32::from(x < 0);
    (x >> exponent) + i32::from(remainder > threshold)
}

/// x × (multiplier / 2^31) × 2^shift
pub fn multiply_by_quantized_multiplier(x: i32, multiplier: i32, shift: i32) -> i32 {
    let left_shift = shift.max(0);
    let right_shift = (-shift).max(0);
    let shifted = (x as i64) << left_shift;
    let shifted = shifted.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    rounding_divide_by_pot(
        saturating_rounding_doubling_high_mul(shifted, multiplier),
        right_shift,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(x: i32, real: f64) -> i32 {
        let (m, s) = quantize_multiplier(real).unwrap();
        multiply_by_quantized_multiplier(x, m, s)
    }

    #[test]
    fn test_quantize_multiplier_one() {
        assert_eq!(quantize_multiplier(1.0).unwrap(), (1 << 30, 1));
        assert_eq!(apply(37, 1.0), 37);
        assert_eq!(apply(-37, 1.0), -37);
    }

    #[test]
    fn test_multiplier_within_one_lsb() {
        for &real in &[0.0003, 0.0123, 0.25, 0.5, 0.731, 1.7, 3.9, 17.5] {
            for &x in &[-100000, -1234, -1, 0, 1, 77, 5000, 123456] {
                let expected = x as f64 * real;
                let got = apply(x, real) as f64;
                assert!(
                    (got - expected).abs() <= 1.0,
                    "x={} real={} got={} expected={}",
                    x,
                    real,
                    got,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_rounding_divide_by_pot() {
        assert_eq!(rounding_divide_by_pot(5, 1), 3);
        assert_eq!(rounding_divide_by_pot(-5, 1), -3);
        assert_eq!(rounding_divide_by_pot(4, 1), 2);
        assert_eq!(rounding_divide_by_pot(7, 2), 2);
        assert_eq!(rounding_divide_by_pot(-7, 2), -2);
    }

    #[test]
    fn test_srdhm_saturates() {
        assert_eq!(saturating_rounding_doubling_high_mul(i32::MIN, i32::MIN), i32::MAX);
        assert_eq!(saturating_rounding_doubling_high_mul(1 << 30, 1 << 30), 1 << 29);
    }

    #[test]
    fn test_invalid_multiplier() {
        assert!(quantize_multiplier(f64::NAN).is_err());
        assert!(quantize_multiplier(-1.0).is_err());
        assert!(quantize_multiplier(1e12).is_err());
        assert_eq!(quantize_multiplier(0.0).unwrap(), (0, 0));
    }

    #[test]
    fn test_activation_params_relu6() {
        let mut range = RangeObserver::default();
        range.observe(0.0, 6.0);
        let p = activation_params("relu6", range).unwrap();
        assert!((p.scale - 6.0 / 255.0).abs() < 1e-7);
        assert_eq!(p.zero_point, -128);
        assert_eq!(p.quantize(0.0), -128);
        assert_eq!(p.quantize(6.0), 127);
        assert_eq!(p.clamp_bounds(Some(0.0), Some(6.0)), (-128, 127));
    }

    #[test]
    fn test_activation_params_include_zero() {
        let mut range = RangeObserver::default();
        range.observe(2.0, 4.0);
        let p = activation_params("x", range).unwrap();
        // 0 を含むよう [0, 4] に広がる
        assert_eq!(p.zero_point, -128);
        assert!((p.dequantize(p.quantize(0.0))).abs() < 1e-6);

        let mut range = RangeObserver::default();
        range.observe(-3.0, 1.0);
        let p = activation_params("x", range).unwrap();
        assert!((p.dequantize(p.quantize(-3.0)) + 3.0).abs() <= p.scale);
        assert!((p.dequantize(p.quantize(1.0)) - 1.0).abs() <= p.scale);
    }

    #[test]
    fn test_activation_params_rejects_non_finite() {
        let mut range = RangeObserver::default();
        range.observe(f32::NAN, 1.0);
        assert!(activation_params("x", range).is_err());
        assert!(activation_params("x", RangeObserver::default()).is_err());
    }

    #[test]
    fn test_degenerate_range_widened() {
        let mut range = RangeObserver::default();
        range.observe(0.0, 0.0);
        let p = activation_params("dead", range).unwrap();
        assert!(p.scale > 0.0);
        assert_eq!(p.quantize(0.0), p.zero_point);
    }

    #[test]
    fn test_quantize_per_channel() {
        let weights = [1.0, -1.0, 0.1, 0.0, 0.0, 0.0, 2.0, 1.6, -2.0];
        let (q, scales) = quantize_per_channel("conv", &weights, 3).unwrap();
        assert_eq!(&q[0..3], &[127, -127, 13]);
        assert_eq!(&q[3..6], &[0, 0, 0]);
        assert_eq!(&q[6..9], &[127, 102, -127]);
        assert!((scales[0] - 1.0 / 127.0).abs() < 1e-9);
        assert_eq!(scales[1], 1.0);
    }

    #[test]
    fn test_quantize_per_channel_rejects_nan() {
        let err = quantize_per_channel("conv", &[1.0, f32::NAN], 1).unwrap_err();
        assert!(matches!(err, FreshnessError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_quantize_bias() {
        let q = quantize_bias("fc", &[0.5, -0.25], 0.5, &[0.01, 0.02]).unwrap();
        assert_eq!(q, vec![100, -25]);
    }
}

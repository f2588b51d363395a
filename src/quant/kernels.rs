//! 整数演算カーネル（NHWC、バッチサイズ1）
//!
//! アクティベーションは量子化値をそのまま i32 で保持します。
//! 累積は i32、再スケールは固定小数点の乗算とシフトのみで行います。

use crate::quant::artifact::{Padding, Rescale};

/// 畳み込みの形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_height: usize,
    pub in_width: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: Padding,
}

impl ConvGeometry {
    pub fn out_height(&self) -> usize {
        (self.in_height + self.padding.top + self.padding.bottom - self.kernel) / self.stride + 1
    }

    pub fn out_width(&self) -> usize {
        (self.in_width + self.padding.left + self.padding.right - self.kernel) / self.stride + 1
    }

    /// 出力位置 `o` に対するカーネル位置 `k` の入力座標（範囲外は None）
    fn input_coord(&self, o: usize, k: usize, pad_before: usize, limit: usize) -> Option<usize> {
        (o * self.stride + k)
            .checked_sub(pad_before)
            .filter(|&i| i < limit)
    }
}

/// 出力側の量子化（ゼロ点と活性化のクランプ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputStage {
    pub zero_point: i32,
    pub min: i32,
    pub max: i32,
}

impl OutputStage {
    fn finish(&self, acc: i32, rescale: &Rescale) -> i32 {
        (rescale.apply(acc) + self.zero_point).clamp(self.min, self.max)
    }
}

/// 通常の畳み込み
///
/// - `filter`: [out_channels, kernel, kernel, in_channels]
/// - ゼロパディング部分は加算しない（入力ゼロ点と同値）
pub fn conv2d(
    input: &[i32],
    input_zero_point: i32,
    filter: &[i8],
    bias: &[i32],
    geometry: &ConvGeometry,
    rescale: &[Rescale],
    output: &OutputStage,
) -> Vec<i32> {
    let g = geometry;
    let (out_h, out_w) = (g.out_height(), g.out_width());
    let mut result = Vec::with_capacity(out_h * out_w * g.out_channels);

    for oy in 0..out_h {
        for ox in 0..out_w {
            for oc in 0..g.out_channels {
                let mut acc = bias[oc];
                for ky in 0..g.kernel {
                    let Some(iy) = g.input_coord(oy, ky, g.padding.top, g.in_height) else {
                        continue;
                    };
                    for kx in 0..g.kernel {
                        let Some(ix) = g.input_coord(ox, kx, g.padding.left, g.in_width) else {
                            continue;
                        };
                        let in_base = (iy * g.in_width + ix) * g.in_channels;
                        let f_base = ((oc * g.kernel + ky) * g.kernel + kx) * g.in_channels;
                        for ic in 0..g.in_channels {
                            acc += (input[in_base + ic] - input_zero_point) * filter[f_base + ic] as i32;
                        }
                    }
                }
                result.push(output.finish(acc, &rescale[oc]));
            }
        }
    }
    result
}

/// depthwise 畳み込み（チャネル倍率1）
///
/// - `filter`: [kernel, kernel, channels]
pub fn depthwise_conv2d(
    input: &[i32],
    input_zero_point: i32,
    filter: &[i8],
    bias: &[i32],
    geometry: &ConvGeometry,
    rescale: &[Rescale],
    output: &OutputStage,
) -> Vec<i32> {
    let g = geometry;
    let channels = g.in_channels;
    let (out_h, out_w) = (g.out_height(), g.out_width());
    let mut result = Vec::with_capacity(out_h * out_w * channels);

    for oy in 0..out_h {
        for ox in 0..out_w {
            for c in 0..channels {
                let mut acc = bias[c];
                for ky in 0..g.kernel {
                    let Some(iy) = g.input_coord(oy, ky, g.padding.top, g.in_height) else {
                        continue;
                    };
                    for kx in 0..g.kernel {
                        let Some(ix) = g.input_coord(ox, kx, g.padding.left, g.in_width) else {
                            continue;
                        };
                        let x = input[(iy * g.in_width + ix) * channels + c] - input_zero_point;
                        acc += x * filter[(ky * g.kernel + kx) * channels + c] as i32;
                    }
                }
                result.push(output.finish(acc, &rescale[c]));
            }
        }
    }
    result
}

/// 加算の量子化パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddParams {
    pub input1_zero_point: i32,
    pub input2_zero_point: i32,
    pub left_shift: i32,
    pub input1_rescale: Rescale,
    pub input2_rescale: Rescale,
    pub output_rescale: Rescale,
}

/// 要素ごとの加算
///
/// 両入力を共通スケール（2 × 大きい方）に揃えてから足し、出力スケールへ戻します。
pub fn add(lhs: &[i32], rhs: &[i32], params: &AddParams, output: &OutputStage) -> Vec<i32> {
    lhs.iter()
        .zip(rhs)
        .map(|(&a, &b)| {
            let a = params
                .input1_rescale
                .apply((a - params.input1_zero_point) << params.left_shift);
            let b = params
                .input2_rescale
                .apply((b - params.input2_zero_point) << params.left_shift);
            output.finish(a + b, &params.output_rescale)
        })
        .collect()
}

/// 空間方向の平均 [1, H, W, C] → [1, C]
///
/// `rescale` には 入力スケール / (H × W × 出力スケール) を渡します。
pub fn mean(
    input: &[i32],
    input_zero_point: i32,
    channels: usize,
    rescale: &Rescale,
    output: &OutputStage,
) -> Vec<i32> {
    let mut sums = vec![0i32; channels];
    for pixel in input.chunks_exact(channels) {
        for (sum, &x) in sums.iter_mut().zip(pixel) {
            *sum += x - input_zero_point;
        }
    }
    sums.into_iter().map(|s| output.finish(s, rescale)).collect()
}

/// 全結合
///
/// - `filter`: [out_features, in_features]
pub fn fully_connected(
    input: &[i32],
    input_zero_point: i32,
    filter: &[i8],
    bias: &[i32],
    rescale: &[Rescale],
    output: &OutputStage,
) -> Vec<i32> {
    let in_features = input.len();
    bias.iter()
        .zip(filter.chunks_exact(in_features))
        .zip(rescale)
        .map(|((&b, row), r)| {
            let acc = row
                .iter()
                .zip(input)
                .fold(b, |acc, (&w, &x)| acc + (x - input_zero_point) * w as i32);
            output.finish(acc, r)
        })
        .collect()
}

/// softmax（1行）
///
/// `table[d]` は exp(-d × 入力スケール) × 2^16 の丸め値。
/// 出力はスケール 1/256、ゼロ点 `output.zero_point`。
pub fn softmax(input: &[i32], table: &[i32], output: &OutputStage) -> Vec<i32> {
    let Some(&max) = input.iter().max() else {
        return Vec::new();
    };
    let exps: Vec<i64> = input
        .iter()
        .map(|&x| {
            let d = (max - x).clamp(0, table.len() as i32 - 1) as usize;
            table[d] as i64
        })
        .collect();
    let sum: i64 = exps.iter().sum::<i64>().max(1);

    exps.iter()
        .map(|&e| {
            let q = (e * 256 + sum / 2) / sum;
            (q as i32 + output.zero_point).clamp(output.min, output.max)
        })
        .collect()
}

/// 量子化パラメータの付け替え
pub fn requantize(input: &[i32], input_zero_point: i32, rescale: &Rescale, output: &OutputStage) -> Vec<i32> {
    input
        .iter()
        .map(|&x| output.finish(x - input_zero_point, rescale))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::params::QuantParams;

    const INT8: OutputStage = OutputStage {
        zero_point: 0,
        min: -128,
        max: 127,
    };

    fn unit() -> Rescale {
        Rescale::from_real(1.0).unwrap()
    }

    #[test]
    fn test_conv2d_identity_kernel() {
        // 1x1 の恒等畳み込み（2チャネル入れ替え）
        let geometry = ConvGeometry {
            in_height: 2,
            in_width: 2,
            in_channels: 2,
            out_channels: 2,
            kernel: 1,
            stride: 1,
            padding: Padding::symmetric(0),
        };
        let input = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let filter = [0, 1, 1, 0];
        let out = conv2d(&input, 0, &filter, &[0, 0], &geometry, &[unit(), unit()], &INT8);
        assert_eq!(out, vec![2, 1, 4, 3, 6, 5, 8, 7]);
    }

    #[test]
    fn test_conv2d_padding_skips_border() {
        // 3x3 全1カーネル、パディング1：角は4画素、中央は9画素の和
        let geometry = ConvGeometry {
            in_height: 3,
            in_width: 3,
            in_channels: 1,
            out_channels: 1,
            kernel: 3,
            stride: 1,
            padding: Padding::symmetric(1),
        };
        let input = vec![11; 9];
        let out = conv2d(&input, 10, &[1; 9], &[0], &geometry, &[unit()], &INT8);
        assert_eq!(out[0], 4);
        assert_eq!(out[1], 6);
        assert_eq!(out[4], 9);
    }

    #[test]
    fn test_conv2d_stride_and_bias() {
        let geometry = ConvGeometry {
            in_height: 4,
            in_width: 4,
            in_channels: 1,
            out_channels: 1,
            kernel: 3,
            stride: 2,
            padding: Padding::symmetric(1),
        };
        assert_eq!(geometry.out_height(), 2);
        let input: Vec<i32> = (0..16).collect();
        let out = conv2d(&input, 0, &[0, 0, 0, 0, 1, 0, 0, 0, 0], &[5], &geometry, &[unit()], &INT8);
        // 中央の重みのみ → 入力 (0,0),(0,2),(2,0),(2,2) + バイアス
        assert_eq!(out, vec![5, 7, 13, 15]);
    }

    #[test]
    fn test_conv2d_bottom_right_padding() {
        // ストライド2・偶数入力の "same"（下と右にだけ1画素）
        let geometry = ConvGeometry {
            in_height: 4,
            in_width: 4,
            in_channels: 1,
            out_channels: 1,
            kernel: 3,
            stride: 2,
            padding: Padding {
                top: 0,
                bottom: 1,
                left: 0,
                right: 1,
            },
        };
        assert_eq!((geometry.out_height(), geometry.out_width()), (2, 2));
        let input: Vec<i32> = (0..16).collect();
        let out = conv2d(&input, 0, &[0, 0, 0, 0, 1, 0, 0, 0, 0], &[5], &geometry, &[unit()], &INT8);
        // 中央の重み → 入力 (1,1),(1,3),(3,1),(3,3) + バイアス
        assert_eq!(out, vec![10, 12, 18, 20]);

        // 右下のタップは最後の行・列で範囲外
        let out = conv2d(&input, 0, &[0, 0, 0, 0, 0, 0, 0, 0, 1], &[0], &geometry, &[unit()], &INT8);
        assert_eq!(out, vec![10, 0, 0, 0]);
    }

    #[test]
    fn test_depthwise_matches_per_channel_conv() {
        let geometry = ConvGeometry {
            in_height: 3,
            in_width: 3,
            in_channels: 2,
            out_channels: 2,
            kernel: 3,
            stride: 1,
            padding: Padding::symmetric(1),
        };
        let input: Vec<i32> = (0..18).map(|v| v - 9).collect();
        let mut filter = vec![0i8; 18];
        // チャネル0: 左隣、チャネル1: 右下
        filter[(1 * 3) * 2] = 1;
        filter[(2 * 3 + 2) * 2 + 1] = 2;
        let out = depthwise_conv2d(&input, 0, &filter, &[0, 1], &geometry, &[unit(), unit()], &INT8);

        // 中央画素 (1,1)
        let center = (1 * 3 + 1) * 2;
        assert_eq!(out[center], input[(1 * 3) * 2]);
        assert_eq!(out[center + 1], 2 * input[(2 * 3 + 2) * 2 + 1] + 1);
        // 右下画素のチャネル1は範囲外参照のためバイアスのみ
        assert_eq!(out[(2 * 3 + 2) * 2 + 1], 1);
    }

    #[test]
    fn test_add_matches_float() {
        let p1 = QuantParams::new(0.05, -3);
        let p2 = QuantParams::new(0.02, 10);
        let po = QuantParams::new(0.08, 1);
        let twice_max = 2.0 * 0.05f64;
        let params = AddParams {
            input1_zero_point: p1.zero_point,
            input2_zero_point: p2.zero_point,
            left_shift: 20,
            input1_rescale: Rescale::from_real(0.05 / twice_max).unwrap(),
            input2_rescale: Rescale::from_real(0.02 / twice_max).unwrap(),
            output_rescale: Rescale::from_real(twice_max / ((1 << 20) as f64 * 0.08)).unwrap(),
        };
        let stage = OutputStage {
            zero_point: po.zero_point,
            min: -128,
            max: 127,
        };

        let lhs = vec![-100, -3, 0, 50, 120];
        let rhs = vec![90, -128, 10, 127, -50];
        let out = add(&lhs, &rhs, &params, &stage);
        for i in 0..lhs.len() {
            let expected = p1.dequantize(lhs[i]) + p2.dequantize(rhs[i]);
            assert!((po.dequantize(out[i]) - expected).abs() <= po.scale, "index {}", i);
        }
    }

    #[test]
    fn test_mean() {
        // 2x2 画素、1チャネル、入力と出力のスケールが同じ
        let input = vec![4, 6, 8, 10];
        let rescale = Rescale::from_real(1.0 / 4.0).unwrap();
        let out = mean(&input, 2, 1, &rescale, &INT8);
        assert_eq!(out, vec![5]);
    }

    #[test]
    fn test_fully_connected_and_clamp() {
        let input = vec![1, 2, 3];
        let filter = [1, 1, 1, -1, -1, -1];
        let relu = OutputStage {
            zero_point: 0,
            min: 0,
            max: 127,
        };
        let out = fully_connected(&input, 0, &filter, &[1, 0], &[unit(), unit()], &relu);
        assert_eq!(out, vec![7, 0]);
    }

    #[test]
    fn test_softmax_distribution() {
        let scale = 0.1f64;
        let table: Vec<i32> = (0..256)
            .map(|d| ((-(d as f64) * scale).exp() * 65536.0).round() as i32)
            .collect();
        let stage = OutputStage {
            zero_point: -128,
            min: -128,
            max: 127,
        };
        let input = vec![10, 0, -20];
        let out = softmax(&input, &table, &stage);

        let logits: Vec<f64> = input.iter().map(|&x| x as f64 * scale).collect();
        let denom: f64 = logits.iter().map(|l| l.exp()).sum();
        for (q, l) in out.iter().zip(&logits) {
            let p = (q + 128) as f64 / 256.0;
            assert!((p - l.exp() / denom).abs() < 2.0 / 256.0);
        }
    }

    #[test]
    fn test_softmax_single_class_saturates() {
        let table = vec![65536; 256];
        let stage = OutputStage {
            zero_point: -128,
            min: -128,
            max: 127,
        };
        assert_eq!(softmax(&[3], &table, &stage), vec![127]);
    }

    #[test]
    fn test_requantize_uint8_to_int8() {
        let stage = OutputStage {
            zero_point: -128,
            min: -128,
            max: 127,
        };
        let out = requantize(&[0, 1, 128, 255], 0, &unit(), &stage);
        assert_eq!(out, vec![-128, -127, 0, 127]);
    }
}

//! 浮動小数点モデルから整数演算グラフへの変換
//!
//! バッチ正規化を直前の畳み込みに畳み込み、重み・バイアス・アクティベーションを量子化して
//! FRQ8 の演算子列を組み立てます。

use anyhow::{anyhow, Result};
use burn::{
    nn::Linear,
    tensor::{backend::Backend, Tensor},
};
use tracing::debug;

use crate::error::FreshnessError;
use crate::ml::backbone::{BackboneSpec, ConvBn, ConvSpec};
use crate::ml::ml_model::FreshnessClassifier;
use crate::quant::artifact::{
    ArtifactBuilder, DType, Operator, Padding, QuantizedModel, Rescale, SOFTMAX_TABLE_LEN,
};
use crate::quant::calibration::CalibrationRanges;
use crate::quant::params::{
    activation_params, quantize_bias, quantize_per_channel, QuantParams, RangeObserver, INT8_MAX, INT8_MIN,
};

/// 加算時に入力を左シフトするビット数
const ADD_LEFT_SHIFT: i32 = 20;
/// softmax の指数テーブルの固定小数点ビット数
const SOFTMAX_TABLE_BITS: i32 = 16;

/// グラフ上のアクティベーション
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub id: usize,
    pub shape: Vec<usize>,
    pub params: QuantParams,
}

fn to_vec<B: Backend, const D: usize>(name: &str, tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("{}: failed to read weights: {:?}", name, e))
}

fn rescales(name: &str, reals: impl Iterator<Item = f64>) -> Result<Vec<Rescale>> {
    reals
        .map(|real| {
            Rescale::from_real(real).map_err(|e| match e {
                FreshnessError::UnsupportedOperation { reason, .. } => FreshnessError::UnsupportedOperation {
                    op: name.to_string(),
                    reason,
                },
                other => other,
            })
        })
        .collect::<Result<_, _>>()
        .map_err(Into::into)
}

/// 整数演算グラフの組み立て
#[derive(Debug, Default)]
pub struct GraphBuilder {
    builder: ArtifactBuilder,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// uint8 入力 [1, size, size, 3] と、それを int8 に変換した最初のアクティベーション
    ///
    /// # 戻り値
    /// - (uint8 入力, int8 入力)
    pub fn input(&mut self, image_size: usize) -> Result<(Activation, Activation)> {
        let shape = vec![1, image_size, image_size, 3];
        let raw = QuantParams::input_uint8();
        let id = self
            .builder
            .add_activation("input", shape.clone(), DType::Uint8, raw);
        let input = Activation { id, shape, params: raw };
        let int8 = self.requantize("input_int8", &input, DType::Int8, QuantParams::input_int8())?;
        Ok((input, int8))
    }

    /// 畳み込み + バッチ正規化 (+ ReLU6)
    pub fn conv<B: Backend>(
        &mut self,
        input: &Activation,
        spec: &ConvSpec,
        layer: &ConvBn<B>,
        range: RangeObserver,
    ) -> Result<Activation> {
        let name = spec.name.as_str();
        let [_, height, width, channels] = input.shape[..] else {
            return Err(anyhow!("{}: expected a rank-4 input, got {:?}", name, input.shape));
        };
        if channels != spec.in_channels {
            return Err(anyhow!(
                "{}: expected {} input channels, got {}",
                name,
                spec.in_channels,
                channels
            ));
        }

        // バッチ正規化を畳み込みの重みとバイアスに畳み込む
        let (bn_scale, bn_shift) = layer.norm.affine();
        let bn_scale = to_vec(name, bn_scale)?;
        let bn_shift = to_vec(name, bn_shift)?;
        let weights = to_vec(name, layer.conv.weight.val())?;
        let conv_bias = match &layer.conv.bias {
            Some(bias) => to_vec(name, bias.val())?,
            None => vec![0.0; spec.out_channels],
        };
        let out_channels = spec.out_channels;
        let per_channel = weights.len() / out_channels;
        let folded: Vec<f32> = weights
            .chunks(per_channel)
            .zip(&bn_scale)
            .flat_map(|(chunk, &s)| chunk.iter().map(move |w| w * s))
            .collect();
        let folded_bias: Vec<f32> = bn_shift
            .iter()
            .zip(&bn_scale)
            .zip(&conv_bias)
            .map(|((&shift, &scale), &b)| shift + scale * b)
            .collect();

        let (quantized, weight_scales) = quantize_per_channel(name, &folded, out_channels)?;

        // burn の [OC, IC/g, K, K] を NHWC 向けの並びに変換
        let k = spec.kernel;
        let (filter, filter_shape) = if spec.depthwise {
            let mut filter = vec![0i8; quantized.len()];
            for c in 0..out_channels {
                for ky in 0..k {
                    for kx in 0..k {
                        filter[(ky * k + kx) * out_channels + c] = quantized[(c * k + ky) * k + kx];
                    }
                }
            }
            (filter, vec![1, k, k, out_channels])
        } else {
            let in_channels = spec.in_channels;
            let mut filter = vec![0i8; quantized.len()];
            for oc in 0..out_channels {
                for ic in 0..in_channels {
                    for ky in 0..k {
                        for kx in 0..k {
                            filter[((oc * k + ky) * k + kx) * in_channels + ic] =
                                quantized[((oc * in_channels + ic) * k + ky) * k + kx];
                        }
                    }
                }
            }
            (filter, vec![out_channels, k, k, in_channels])
        };

        let input_scale = input.params.scale;
        let bias = quantize_bias(name, &folded_bias, input_scale, &weight_scales)?;
        let bias_scales: Vec<f32> = weight_scales.iter().map(|s| s * input_scale).collect();

        let params = activation_params(name, range)?;
        let rescale = rescales(
            name,
            weight_scales
                .iter()
                .map(|&ws| input_scale as f64 * ws as f64 / params.scale as f64),
        )?;
        let (activation_min, activation_max) = if spec.relu6 {
            params.clamp_bounds(Some(0.0), Some(6.0))
        } else {
            (INT8_MIN, INT8_MAX)
        };

        let filter_id = self
            .builder
            .add_weights(format!("{}/filter", name), filter_shape, &filter, weight_scales);
        let bias_id = self
            .builder
            .add_bias(format!("{}/bias", name), &bias, bias_scales);
        let shape = vec![1, spec.output_size(height), spec.output_size(width), out_channels];
        let (pad_top, pad_bottom) = spec.padding(height);
        let (pad_left, pad_right) = spec.padding(width);
        let output = self
            .builder
            .add_activation(name, shape.clone(), DType::Int8, params);

        self.builder.push_operator(Operator::Conv2d {
            input: input.id,
            filter: filter_id,
            bias: bias_id,
            output,
            stride: spec.stride,
            padding: Padding {
                top: pad_top,
                bottom: pad_bottom,
                left: pad_left,
                right: pad_right,
            },
            depthwise: spec.depthwise,
            rescale,
            activation_min,
            activation_max,
        });
        debug!("{}: scale={:.6} zero_point={}", name, params.scale, params.zero_point);

        Ok(Activation {
            id: output,
            shape,
            params,
        })
    }

    /// 残差接続の加算
    pub fn add(&mut self, name: &str, lhs: &Activation, rhs: &Activation, range: RangeObserver) -> Result<Activation> {
        if lhs.shape != rhs.shape {
            return Err(anyhow!(
                "{}: shape mismatch {:?} vs {:?}",
                name,
                lhs.shape,
                rhs.shape
            ));
        }
        let params = activation_params(name, range)?;
        let twice_max_scale = 2.0 * lhs.params.scale.max(rhs.params.scale) as f64;
        let [input1_rescale, input2_rescale, output_rescale]: [Rescale; 3] = rescales(
            name,
            [
                lhs.params.scale as f64 / twice_max_scale,
                rhs.params.scale as f64 / twice_max_scale,
                twice_max_scale / ((1i64 << ADD_LEFT_SHIFT) as f64 * params.scale as f64),
            ]
            .into_iter(),
        )?
        .try_into()
        .map_err(|_| anyhow!("{}: rescale count mismatch", name))?;

        let output = self
            .builder
            .add_activation(name, lhs.shape.clone(), DType::Int8, params);
        self.builder.push_operator(Operator::Add {
            input1: lhs.id,
            input2: rhs.id,
            output,
            left_shift: ADD_LEFT_SHIFT,
            input1_rescale,
            input2_rescale,
            output_rescale,
            activation_min: INT8_MIN,
            activation_max: INT8_MAX,
        });
        Ok(Activation {
            id: output,
            shape: lhs.shape.clone(),
            params,
        })
    }

    /// グローバル平均プーリング
    pub fn mean(&mut self, name: &str, input: &Activation, range: RangeObserver) -> Result<Activation> {
        let [_, height, width, channels] = input.shape[..] else {
            return Err(anyhow!("{}: expected a rank-4 input, got {:?}", name, input.shape));
        };
        let params = activation_params(name, range)?;
        let count = (height * width) as f64;
        let rescale = rescales(
            name,
            std::iter::once(input.params.scale as f64 / (count * params.scale as f64)),
        )?[0];

        let shape = vec![1, channels];
        let output = self
            .builder
            .add_activation(name, shape.clone(), DType::Int8, params);
        self.builder.push_operator(Operator::Mean {
            input: input.id,
            output,
            rescale,
        });
        Ok(Activation { id: output, shape, params })
    }

    /// 全結合（`relu` の場合は出力を 0 以上にクランプ）
    pub fn dense<B: Backend>(
        &mut self,
        name: &str,
        input: &Activation,
        layer: &Linear<B>,
        range: RangeObserver,
        relu: bool,
    ) -> Result<Activation> {
        let [in_features, out_features] = layer.weight.val().dims();
        if input.shape != [1, in_features] {
            return Err(anyhow!(
                "{}: expected input [1, {}], got {:?}",
                name,
                in_features,
                input.shape
            ));
        }

        // burn の重みは [in, out]。出力ごとに連続するよう転置する
        let weights = to_vec(name, layer.weight.val())?;
        let mut transposed = vec![0.0f32; weights.len()];
        for i in 0..in_features {
            for o in 0..out_features {
                transposed[o * in_features + i] = weights[i * out_features + o];
            }
        }
        let bias = match &layer.bias {
            Some(bias) => to_vec(name, bias.val())?,
            None => vec![0.0; out_features],
        };

        let (filter, weight_scales) = quantize_per_channel(name, &transposed, out_features)?;
        let input_scale = input.params.scale;
        let bias = quantize_bias(name, &bias, input_scale, &weight_scales)?;
        let bias_scales: Vec<f32> = weight_scales.iter().map(|s| s * input_scale).collect();

        let params = activation_params(name, range)?;
        let rescale = rescales(
            name,
            weight_scales
                .iter()
                .map(|&ws| input_scale as f64 * ws as f64 / params.scale as f64),
        )?;
        let (activation_min, activation_max) = if relu {
            params.clamp_bounds(Some(0.0), None)
        } else {
            (INT8_MIN, INT8_MAX)
        };

        let filter_id = self.builder.add_weights(
            format!("{}/filter", name),
            vec![out_features, in_features],
            &filter,
            weight_scales,
        );
        let bias_id = self
            .builder
            .add_bias(format!("{}/bias", name), &bias, bias_scales);
        let shape = vec![1, out_features];
        let output = self
            .builder
            .add_activation(name, shape.clone(), DType::Int8, params);
        self.builder.push_operator(Operator::FullyConnected {
            input: input.id,
            filter: filter_id,
            bias: bias_id,
            output,
            rescale,
            activation_min,
            activation_max,
        });
        Ok(Activation { id: output, shape, params })
    }

    /// softmax（出力はスケール 1/256、ゼロ点 -128）
    pub fn softmax(&mut self, name: &str, input: &Activation) -> Result<Activation> {
        let scale = input.params.scale as f64;
        let table: Vec<i32> = (0..SOFTMAX_TABLE_LEN)
            .map(|d| ((-(d as f64) * scale).exp() * (1i64 << SOFTMAX_TABLE_BITS) as f64).round() as i32)
            .collect();
        let table = self.builder.add_buffer_i32(&table);

        let params = QuantParams::softmax_int8();
        let output = self
            .builder
            .add_activation(name, input.shape.clone(), DType::Int8, params);
        self.builder.push_operator(Operator::Softmax {
            input: input.id,
            output,
            table,
        });
        Ok(Activation {
            id: output,
            shape: input.shape.clone(),
            params,
        })
    }

    /// 量子化パラメータと型の付け替え
    pub fn requantize(&mut self, name: &str, input: &Activation, dtype: DType, params: QuantParams) -> Result<Activation> {
        let rescale = rescales(
            name,
            std::iter::once(input.params.scale as f64 / params.scale as f64),
        )?[0];
        let output = self
            .builder
            .add_activation(name, input.shape.clone(), dtype, params);
        self.builder.push_operator(Operator::Requantize {
            input: input.id,
            output,
            rescale,
        });
        Ok(Activation {
            id: output,
            shape: input.shape.clone(),
            params,
        })
    }

    pub fn finish(self, input: &Activation, output: &Activation, class_count: usize) -> Result<QuantizedModel> {
        self.builder.finish(input.id, output.id, class_count)
    }
}

/// 分類モデル全体を整数演算グラフに変換
///
/// 演算の並び: 入力の int8 化 → バックボーン（畳み込み・残差加算）→ 平均 →
/// 全結合(ReLU) → 全結合 → softmax → uint8 化
pub fn lower_model<B: Backend>(
    model: &FreshnessClassifier<B>,
    spec: &BackboneSpec,
    image_size: usize,
    ranges: &CalibrationRanges,
) -> Result<QuantizedModel> {
    let backbone = &model.backbone;
    if backbone.blocks.len() != spec.blocks.len() {
        return Err(anyhow!(
            "backbone has {} blocks but the structure lists {}",
            backbone.blocks.len(),
            spec.blocks.len()
        ));
    }

    let mut taps = ranges.taps.iter().copied();
    let mut next_range = |name: &str| {
        taps.next().ok_or_else(|| FreshnessError::UnsupportedOperation {
            op: name.to_string(),
            reason: "no calibration range recorded".to_string(),
        })
    };

    let mut graph = GraphBuilder::new();
    let (input, mut x) = graph.input(image_size)?;

    x = graph.conv(&x, &spec.stem, &backbone.stem, next_range(&spec.stem.name)?)?;

    for (block_spec, block) in spec.blocks.iter().zip(&backbone.blocks) {
        let block_input = x.clone();
        match (&block_spec.expand, &block.expand) {
            (Some(expand_spec), Some(expand)) => {
                x = graph.conv(&x, expand_spec, expand, next_range(&expand_spec.name)?)?;
            }
            (None, None) => {}
            _ => {
                return Err(anyhow!(
                    "block {}: expansion layer does not match the structure",
                    block_spec.id
                ))
            }
        }
        x = graph.conv(
            &x,
            &block_spec.depthwise,
            &block.depthwise,
            next_range(&block_spec.depthwise.name)?,
        )?;
        x = graph.conv(
            &x,
            &block_spec.project,
            &block.project,
            next_range(&block_spec.project.name)?,
        )?;
        if block_spec.residual {
            let name = format!("block_{}_add", block_spec.id);
            let range = next_range(&name)?;
            x = graph.add(&name, &x, &block_input, range)?;
        }
    }

    x = graph.conv(&x, &spec.last, &backbone.last, next_range(&spec.last.name)?)?;
    if taps.next().is_some() {
        return Err(anyhow!(
            "calibration recorded {} ranges but the structure has fewer quantization points",
            ranges.taps.len()
        ));
    }

    let pooled = graph.mean("global_average_pooling2d", &x, ranges.pooled)?;
    let hidden = graph.dense("dense", &pooled, &model.head.hidden, ranges.hidden, true)?;
    let logits = graph.dense("dense_1", &hidden, &model.head.output, ranges.logits, false)?;
    let probabilities = graph.softmax("softmax", &logits)?;
    let output = graph.requantize(
        "output",
        &probabilities,
        DType::Uint8,
        QuantParams::softmax_uint8(),
    )?;

    let [_, class_count] = output.shape[..] else {
        return Err(anyhow!("unexpected output shape {:?}", output.shape));
    };
    graph.finish(&input, &output, class_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::{relu6, MobileNetV2};
    use crate::quant::interpreter::Interpreter;
    use burn::module::Param;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn pixels(size: usize) -> Vec<u8> {
        (0..size * size * 3).map(|i| ((i * 37) % 256) as u8).collect()
    }

    /// NHWC の uint8 画素を NCHW の [0,1] 浮動小数点に変換
    fn to_float_nchw(pixels: &[u8], size: usize) -> Vec<f32> {
        let mut out = vec![0.0; pixels.len()];
        for y in 0..size {
            for x in 0..size {
                for c in 0..3 {
                    out[(c * size + y) * size + x] = pixels[(y * size + x) * 3 + c] as f32 / 255.0;
                }
            }
        }
        out
    }

    fn observed(values: &[f32]) -> RangeObserver {
        let mut range = RangeObserver::default();
        for &v in values {
            range.observe(v, v);
        }
        range
    }

    #[test]
    fn test_stem_conv_matches_float() {
        let device = Default::default();
        let spec = BackboneSpec::new(0.35);
        let mut backbone = MobileNetV2::<TestBackend>::new(&spec, &device);
        let channels = spec.stem.out_channels;

        // 恒等でないバッチ正規化
        let series = |f: fn(usize) -> f32| -> Vec<f32> { (0..channels).map(f).collect() };
        let stem = &mut backbone.stem.norm;
        stem.gamma = Param::from_tensor(Tensor::from_floats(series(|i| 0.6 + 0.03 * i as f32).as_slice(), &device));
        stem.beta = Param::from_tensor(Tensor::from_floats(series(|i| 0.05 * i as f32 - 0.3).as_slice(), &device));
        stem.moving_mean = Param::from_tensor(Tensor::from_floats(series(|i| 0.01 * i as f32).as_slice(), &device));
        stem.moving_var = Param::from_tensor(Tensor::from_floats(series(|i| 0.5 + 0.1 * i as f32).as_slice(), &device));

        let size = 32;
        let image = pixels(size);
        let float_input =
            Tensor::<TestBackend, 1>::from_floats(to_float_nchw(&image, size).as_slice(), &device)
                .reshape([1, 3, size, size]);
        let reference = relu6(backbone.stem.forward(float_input));
        let [_, _, out_h, out_w] = reference.dims();
        let reference: Vec<f32> = reference.into_data().to_vec().unwrap();

        let mut graph = GraphBuilder::new();
        let (input, int8) = graph.input(size).unwrap();
        let out = graph
            .conv(&int8, &spec.stem, &backbone.stem, observed(&reference))
            .unwrap();
        assert_eq!(out.shape, vec![1, out_h, out_w, channels]);
        let scale = out.params.scale;
        let model = graph.finish(&input, &out, 0).unwrap();

        let interpreter = Interpreter::from_model(model).unwrap();
        let raw: Vec<i32> = image.iter().map(|&p| p as i32).collect();
        let result = interpreter.invoke_raw(&raw).unwrap();

        let tolerance = 3.0 * scale + 0.03;
        for y in 0..out_h {
            for x in 0..out_w {
                for c in 0..channels {
                    let q = result[(y * out_w + x) * channels + c];
                    let got = out.params.dequantize(q);
                    let expected = reference[(c * out_h + y) * out_w + x];
                    assert!(
                        (got - expected).abs() <= tolerance,
                        "({}, {}, {}): {} vs {}",
                        y,
                        x,
                        c,
                        got,
                        expected
                    );
                }
            }
        }
    }

    #[test]
    fn test_dense_matches_float() {
        let device = Default::default();
        let layer = burn::nn::LinearConfig::new(8, 3).init::<TestBackend>(&device);
        let values: Vec<f32> = (0..8).map(|i| i as f32 * 0.25).collect();
        let reference: Vec<f32> = layer
            .forward(Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([1, 8]))
            .into_data()
            .to_vec()
            .unwrap();

        let mut graph = GraphBuilder::new();
        let in_params = activation_params("in", observed(&values)).unwrap();
        let input_id = graph
            .builder
            .add_activation("in", vec![1, 8], DType::Int8, in_params);
        let input = Activation {
            id: input_id,
            shape: vec![1, 8],
            params: in_params,
        };
        let out = graph
            .dense("fc", &input, &layer, observed(&reference), false)
            .unwrap();
        let params = out.params;
        let model = graph.finish(&input, &out, 3).unwrap();

        let interpreter = Interpreter::from_model(model).unwrap();
        let raw: Vec<i32> = values.iter().map(|&v| in_params.quantize(v)).collect();
        let result = interpreter.invoke_raw(&raw).unwrap();
        for (q, expected) in result.iter().zip(&reference) {
            assert!((params.dequantize(*q) - expected).abs() <= 3.0 * params.scale + 0.02);
        }
    }

    #[test]
    fn test_softmax_table() {
        let mut graph = GraphBuilder::new();
        let logits = Activation {
            id: graph
                .builder
                .add_activation("logits", vec![1, 2], DType::Int8, QuantParams::new(0.1, 0)),
            shape: vec![1, 2],
            params: QuantParams::new(0.1, 0),
        };
        let out = graph.softmax("softmax", &logits).unwrap();
        let model = graph.finish(&logits, &out, 2).unwrap();
        let table = model.buffer_i32(0).unwrap();
        assert_eq!(table.len(), SOFTMAX_TABLE_LEN);
        assert_eq!(table[0], 1 << 16);
        assert!(table.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_non_finite_range_is_unsupported() {
        let device = Default::default();
        let spec = BackboneSpec::new(0.35);
        let backbone = MobileNetV2::<TestBackend>::new(&spec, &device);
        let mut graph = GraphBuilder::new();
        let (_, int8) = graph.input(32).unwrap();

        let err = graph
            .conv(&int8, &spec.stem, &backbone.stem, RangeObserver::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FreshnessError>(),
            Some(FreshnessError::UnsupportedOperation { .. })
        ));
    }
}

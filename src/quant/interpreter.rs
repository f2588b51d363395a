//! 整数演算のみで量子化モデルを実行するインタプリタ

use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::error::FreshnessError;
use crate::quant::artifact::{DType, Operator, QuantizedModel, Rescale, TensorInfo};
use crate::quant::kernels::{self, AddParams, ConvGeometry, OutputStage};
use crate::quant::params::QuantParams;

fn invalid(message: impl Into<String>) -> anyhow::Error {
    FreshnessError::InvalidArtifact(message.into()).into()
}

/// 定数を展開し形状を検証済みの演算子
#[derive(Debug, Clone)]
enum Step {
    Requantize {
        input: usize,
        output: usize,
        input_zero_point: i32,
        rescale: Rescale,
        stage: OutputStage,
    },
    Conv {
        input: usize,
        output: usize,
        input_zero_point: i32,
        depthwise: bool,
        geometry: ConvGeometry,
        filter: Vec<i8>,
        bias: Vec<i32>,
        rescale: Vec<Rescale>,
        stage: OutputStage,
    },
    Add {
        input1: usize,
        input2: usize,
        output: usize,
        params: AddParams,
        stage: OutputStage,
    },
    Mean {
        input: usize,
        output: usize,
        input_zero_point: i32,
        channels: usize,
        rescale: Rescale,
        stage: OutputStage,
    },
    FullyConnected {
        input: usize,
        output: usize,
        input_zero_point: i32,
        filter: Vec<i8>,
        bias: Vec<i32>,
        rescale: Vec<Rescale>,
        stage: OutputStage,
    },
    Softmax {
        input: usize,
        output: usize,
        table: Vec<i32>,
        stage: OutputStage,
    },
}

/// 量子化モデルのインタプリタ
#[derive(Debug, Clone)]
pub struct Interpreter {
    model: QuantizedModel,
    steps: Vec<Step>,
}

fn activation_params(tensor: &TensorInfo) -> Result<QuantParams> {
    tensor
        .quant_params()
        .ok_or_else(|| invalid(format!("tensor {} needs per-tensor quantization", tensor.name)))
}

fn output_stage(tensor: &TensorInfo, bounds: Option<(i32, i32)>) -> Result<OutputStage> {
    let params = activation_params(tensor)?;
    let (lo, hi) = tensor.dtype.range();
    let (min, max) = bounds.map_or((lo, hi), |(min, max)| (min.max(lo), max.min(hi)));
    if min > max {
        return Err(invalid(format!("tensor {} has an empty activation range", tensor.name)));
    }
    Ok(OutputStage {
        zero_point: params.zero_point,
        min,
        max,
    })
}

fn expect_shape(tensor: &TensorInfo, expected: &[usize]) -> Result<()> {
    if tensor.shape != expected {
        return Err(invalid(format!(
            "tensor {} has shape {:?}, expected {:?}",
            tensor.name, tensor.shape, expected
        )));
    }
    Ok(())
}

fn expect_len<T>(what: &str, values: &[T], expected: usize) -> Result<()> {
    if values.len() != expected {
        return Err(invalid(format!("{} has {} entries, expected {}", what, values.len(), expected)));
    }
    Ok(())
}

impl Interpreter {
    /// ファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_model(QuantizedModel::load(path)?)
    }

    /// 演算子ごとに形状を検証し、定数を展開する
    pub fn from_model(model: QuantizedModel) -> Result<Self> {
        model.validate()?;
        let steps = model
            .header
            .operators
            .iter()
            .map(|op| Self::prepare(&model, op))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "量子化モデル: テンソル {} / 演算子 {}",
            model.header.tensors.len(),
            steps.len()
        );
        Ok(Self { model, steps })
    }

    fn prepare(model: &QuantizedModel, op: &Operator) -> Result<Step> {
        match op {
            Operator::Requantize {
                input,
                output,
                rescale,
            } => {
                let (i, o) = (model.tensor(*input)?, model.tensor(*output)?);
                expect_shape(o, &i.shape)?;
                Ok(Step::Requantize {
                    input: *input,
                    output: *output,
                    input_zero_point: activation_params(i)?.zero_point,
                    rescale: *rescale,
                    stage: output_stage(o, None)?,
                })
            }
            Operator::Conv2d {
                input,
                filter,
                bias,
                output,
                stride,
                padding,
                depthwise,
                rescale,
                activation_min,
                activation_max,
            } => {
                let (i, f, o) = (model.tensor(*input)?, model.tensor(*filter)?, model.tensor(*output)?);
                let [1, in_height, in_width, in_channels] = i.shape[..] else {
                    return Err(invalid(format!("conv input {} must be [1, H, W, C]", i.name)));
                };
                let [filter_out, kernel, kernel_w, filter_in] = f.shape[..] else {
                    return Err(invalid(format!("conv filter {} must be rank 4", f.name)));
                };
                let out_channels = if *depthwise { filter_in } else { filter_out };
                let valid_filter = kernel == kernel_w
                    && if *depthwise {
                        filter_out == 1 && filter_in == in_channels
                    } else {
                        filter_in == in_channels
                    };
                if !valid_filter
                    || *stride == 0
                    || in_height + padding.top + padding.bottom < kernel
                    || in_width + padding.left + padding.right < kernel
                {
                    return Err(invalid(format!("conv filter {} does not fit input {}", f.name, i.name)));
                }
                let geometry = ConvGeometry {
                    in_height,
                    in_width,
                    in_channels,
                    out_channels,
                    kernel,
                    stride: *stride,
                    padding: *padding,
                };
                expect_shape(
                    o,
                    &[1, geometry.out_height(), geometry.out_width(), out_channels],
                )?;

                let filter = model.constant_i8(*filter)?;
                let bias = model.constant_i32(*bias)?;
                expect_len(&format!("{} bias", f.name), &bias, out_channels)?;
                expect_len(&format!("{} rescale", f.name), rescale, out_channels)?;
                Ok(Step::Conv {
                    input: *input,
                    output: *output,
                    input_zero_point: activation_params(i)?.zero_point,
                    depthwise: *depthwise,
                    geometry,
                    filter,
                    bias,
                    rescale: rescale.clone(),
                    stage: output_stage(o, Some((*activation_min, *activation_max)))?,
                })
            }
            Operator::Add {
                input1,
                input2,
                output,
                left_shift,
                input1_rescale,
                input2_rescale,
                output_rescale,
                activation_min,
                activation_max,
            } => {
                let (a, b, o) = (model.tensor(*input1)?, model.tensor(*input2)?, model.tensor(*output)?);
                expect_shape(b, &a.shape)?;
                expect_shape(o, &a.shape)?;
                if !(0..=22).contains(left_shift) {
                    return Err(invalid(format!("add {} has left shift {}", o.name, left_shift)));
                }
                Ok(Step::Add {
                    input1: *input1,
                    input2: *input2,
                    output: *output,
                    params: AddParams {
                        input1_zero_point: activation_params(a)?.zero_point,
                        input2_zero_point: activation_params(b)?.zero_point,
                        left_shift: *left_shift,
                        input1_rescale: *input1_rescale,
                        input2_rescale: *input2_rescale,
                        output_rescale: *output_rescale,
                    },
                    stage: output_stage(o, Some((*activation_min, *activation_max)))?,
                })
            }
            Operator::Mean {
                input,
                output,
                rescale,
            } => {
                let (i, o) = (model.tensor(*input)?, model.tensor(*output)?);
                let [1, _, _, channels] = i.shape[..] else {
                    return Err(invalid(format!("mean input {} must be [1, H, W, C]", i.name)));
                };
                expect_shape(o, &[1, channels])?;
                Ok(Step::Mean {
                    input: *input,
                    output: *output,
                    input_zero_point: activation_params(i)?.zero_point,
                    channels,
                    rescale: *rescale,
                    stage: output_stage(o, None)?,
                })
            }
            Operator::FullyConnected {
                input,
                filter,
                bias,
                output,
                rescale,
                activation_min,
                activation_max,
            } => {
                let (i, f, o) = (model.tensor(*input)?, model.tensor(*filter)?, model.tensor(*output)?);
                let [1, in_features] = i.shape[..] else {
                    return Err(invalid(format!("fully connected input {} must be [1, N]", i.name)));
                };
                let out_features = f.shape.first().copied().unwrap_or(0);
                expect_shape(f, &[out_features, in_features])?;
                expect_shape(o, &[1, out_features])?;

                let filter = model.constant_i8(*filter)?;
                let bias = model.constant_i32(*bias)?;
                expect_len(&format!("{} bias", f.name), &bias, out_features)?;
                expect_len(&format!("{} rescale", f.name), rescale, out_features)?;
                Ok(Step::FullyConnected {
                    input: *input,
                    output: *output,
                    input_zero_point: activation_params(i)?.zero_point,
                    filter,
                    bias,
                    rescale: rescale.clone(),
                    stage: output_stage(o, Some((*activation_min, *activation_max)))?,
                })
            }
            Operator::Softmax {
                input,
                output,
                table,
            } => {
                let (i, o) = (model.tensor(*input)?, model.tensor(*output)?);
                expect_shape(o, &i.shape)?;
                Ok(Step::Softmax {
                    input: *input,
                    output: *output,
                    table: model.buffer_i32(*table)?,
                    stage: output_stage(o, None)?,
                })
            }
        }
    }

    pub fn model(&self) -> &QuantizedModel {
        &self.model
    }

    /// 入力テンソルの形状 [1, H, W, 3]
    pub fn input_shape(&self) -> Result<&[usize]> {
        Ok(&self.model.input_tensor()?.shape)
    }

    /// 出力テンソルの量子化パラメータ
    pub fn output_params(&self) -> Result<QuantParams> {
        activation_params(self.model.output_tensor()?)
    }

    pub fn class_count(&self) -> usize {
        self.model.header.class_count
    }

    /// uint8 の入力画像で実行し、uint8 の出力を返す
    pub fn invoke(&self, input: &[u8]) -> Result<Vec<u8>> {
        let (input_tensor, output_tensor) = (self.model.input_tensor()?, self.model.output_tensor()?);
        if input_tensor.dtype != DType::Uint8 || output_tensor.dtype != DType::Uint8 {
            return Err(invalid("uint8 input and output tensors are required"));
        }
        let raw: Vec<i32> = input.iter().map(|&v| i32::from(v)).collect();
        Ok(self
            .invoke_raw(&raw)?
            .into_iter()
            .map(|v| v.clamp(0, 255) as u8)
            .collect())
    }

    /// 量子化値（i32 表現）のまま実行
    pub fn invoke_raw(&self, input: &[i32]) -> Result<Vec<i32>> {
        let header = &self.model.header;
        let input_id = header.inputs[0];
        let expected = header.tensors[input_id].num_elements();
        if input.len() != expected {
            return Err(invalid(format!(
                "input has {} values, expected {}",
                input.len(),
                expected
            )));
        }

        let mut values: Vec<Option<Vec<i32>>> = vec![None; header.tensors.len()];
        values[input_id] = Some(input.to_vec());

        for step in &self.steps {
            let read = |id: usize| -> Result<&Vec<i32>> {
                values[id]
                    .as_ref()
                    .ok_or_else(|| invalid(format!("tensor {} is read before it is written", header.tensors[id].name)))
            };
            let (output, result) = match step {
                Step::Requantize {
                    input,
                    output,
                    input_zero_point,
                    rescale,
                    stage,
                } => (
                    *output,
                    kernels::requantize(read(*input)?, *input_zero_point, rescale, stage),
                ),
                Step::Conv {
                    input,
                    output,
                    input_zero_point,
                    depthwise,
                    geometry,
                    filter,
                    bias,
                    rescale,
                    stage,
                } => {
                    let x = read(*input)?;
                    let result = if *depthwise {
                        kernels::depthwise_conv2d(x, *input_zero_point, filter, bias, geometry, rescale, stage)
                    } else {
                        kernels::conv2d(x, *input_zero_point, filter, bias, geometry, rescale, stage)
                    };
                    (*output, result)
                }
                Step::Add {
                    input1,
                    input2,
                    output,
                    params,
                    stage,
                } => (
                    *output,
                    kernels::add(read(*input1)?, read(*input2)?, params, stage),
                ),
                Step::Mean {
                    input,
                    output,
                    input_zero_point,
                    channels,
                    rescale,
                    stage,
                } => (
                    *output,
                    kernels::mean(read(*input)?, *input_zero_point, *channels, rescale, stage),
                ),
                Step::FullyConnected {
                    input,
                    output,
                    input_zero_point,
                    filter,
                    bias,
                    rescale,
                    stage,
                } => (
                    *output,
                    kernels::fully_connected(read(*input)?, *input_zero_point, filter, bias, rescale, stage),
                ),
                Step::Softmax {
                    input,
                    output,
                    table,
                    stage,
                } => (*output, kernels::softmax(read(*input)?, table, stage)),
            };
            values[output] = Some(result);
        }

        let output_id = header.outputs[0];
        values[output_id]
            .take()
            .ok_or_else(|| invalid("output tensor is never written"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::artifact::ArtifactBuilder;

    /// uint8 入力 → int8 → 全結合 → uint8 出力
    fn fc_model() -> QuantizedModel {
        let mut b = ArtifactBuilder::new();
        let input = b.add_activation("input", vec![1, 3], DType::Uint8, QuantParams::new(1.0, 0));
        let x = b.add_activation("x", vec![1, 3], DType::Int8, QuantParams::new(1.0, -128));
        let filter = b.add_weights("fc/filter", vec![2, 3], &[1, 0, 0, 0, 1, 1], vec![1.0, 1.0]);
        let bias = b.add_bias("fc/bias", &[0, -10], vec![1.0, 1.0]);
        let y = b.add_activation("y", vec![1, 2], DType::Int8, QuantParams::new(1.0, 0));
        let output = b.add_activation("output", vec![1, 2], DType::Uint8, QuantParams::new(1.0, 0));
        let unit = Rescale::from_real(1.0).unwrap();
        b.push_operator(Operator::Requantize {
            input,
            output: x,
            rescale: unit,
        });
        b.push_operator(Operator::FullyConnected {
            input: x,
            filter,
            bias,
            output: y,
            rescale: vec![unit; 2],
            activation_min: 0,
            activation_max: 127,
        });
        b.push_operator(Operator::Requantize {
            input: y,
            output,
            rescale: unit,
        });
        b.finish(input, output, 2).unwrap()
    }

    #[test]
    fn test_invoke_uint8() {
        let interpreter = Interpreter::from_model(fc_model()).unwrap();
        assert_eq!(interpreter.input_shape().unwrap(), &[1, 3]);
        assert_eq!(interpreter.class_count(), 2);
        // y0 = 5, y1 = 7 + 2 - 10 = -1 → ReLU で 0
        assert_eq!(interpreter.invoke(&[5, 7, 2]).unwrap(), vec![5, 0]);
        assert_eq!(interpreter.invoke(&[200, 100, 100]).unwrap(), vec![127, 127]);
    }

    #[test]
    fn test_wrong_input_length() {
        let interpreter = Interpreter::from_model(fc_model()).unwrap();
        assert!(interpreter.invoke(&[1, 2]).is_err());
    }

    #[test]
    fn test_rejects_shape_mismatch() {
        let mut model = fc_model();
        model.header.tensors[4].shape = vec![1, 3];
        let err = Interpreter::from_model(model).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FreshnessError>(),
            Some(FreshnessError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn test_rejects_corrupt_rescale() {
        let mut model = fc_model();
        if let Operator::Requantize { rescale, .. } = &mut model.header.operators[0] {
            rescale.shift = -40;
        }
        let err = Interpreter::from_model(model).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FreshnessError>(),
            Some(FreshnessError::InvalidArtifact(_))
        ));
    }

    #[test]
    fn test_rejects_unwritten_tensor() {
        let mut model = fc_model();
        // 最初の変換を除くと全結合の入力が未定義になる
        model.header.operators.remove(0);
        let interpreter = Interpreter::from_model(model).unwrap();
        assert!(interpreter.invoke(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.frq8");
        fc_model().save(&path).unwrap();
        let interpreter = Interpreter::load(&path).unwrap();
        assert_eq!(interpreter.output_params().unwrap(), QuantParams::new(1.0, 0));
    }
}

//! 量子化モデルファイル（FRQ8形式）
//!
//! ファイル構成（リトルエンディアン）:
//! - `b"FRQ8"`                 - マジック
//! - `u32`                     - 形式バージョン
//! - `u64`                     - ヘッダ長
//! - JSON ヘッダ                - テンソル・演算子・バッファの一覧
//! - 16バイト境界までゼロ埋め
//! - データ部                   - 重み・バイアス・テーブル（各バッファ16バイト境界）

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::FreshnessError;
use crate::model::model_storage::write_atomically;
use crate::quant::params::QuantParams;

pub const MAGIC: &[u8; 4] = b"FRQ8";
pub const FORMAT_VERSION: u32 = 1;
const ALIGNMENT: usize = 16;
const PREAMBLE_LEN: usize = 4 + 4 + 8;

/// softmax 用指数テーブルの要素数（int8 の差分 0..=255）
pub const SOFTMAX_TABLE_LEN: usize = 256;

/// 再スケールの指数の範囲（右シフトは最大31ビット）
const MIN_RESCALE_SHIFT: i32 = -31;
const MAX_RESCALE_SHIFT: i32 = 30;

/// 要素型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Int8,
    Int32,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::Uint8 | DType::Int8 => 1,
            DType::Int32 => 4,
        }
    }

    /// 表現できる値の範囲
    pub fn range(self) -> (i32, i32) {
        match self {
            DType::Uint8 => (0, 255),
            DType::Int8 => (-128, 127),
            DType::Int32 => (i32::MIN, i32::MAX),
        }
    }
}

/// テンソルの情報
///
/// 量子化パラメータはテンソル単位なら1要素、チャネル単位ならチャネル数分です。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    /// 定数テンソルのデータ（アクティベーションは None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<usize>,
}

impl TensorInfo {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// テンソル単位の量子化パラメータ
    pub fn quant_params(&self) -> Option<QuantParams> {
        match (self.scales.as_slice(), self.zero_points.as_slice()) {
            ([scale], [zero_point]) => Some(QuantParams::new(*scale, *zero_point)),
            _ => None,
        }
    }
}

/// データ部の1区画
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub dtype: DType,
    /// データ部先頭からのバイトオフセット
    pub offset: usize,
    /// 要素数
    pub count: usize,
}

impl BufferInfo {
    pub fn byte_len(&self) -> usize {
        self.count * self.dtype.size()
    }
}

/// 固定小数点の再スケール係数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rescale {
    pub multiplier: i32,
    pub shift: i32,
}

impl Rescale {
    pub fn from_real(real: f64) -> Result<Self, FreshnessError> {
        let (multiplier, shift) = crate::quant::params::quantize_multiplier(real)?;
        Ok(Self { multiplier, shift })
    }

    pub fn apply(&self, x: i32) -> i32 {
        crate::quant::params::multiply_by_quantized_multiplier(x, self.multiplier, self.shift)
    }

    /// `from_real` が返しうる範囲か
    pub fn is_valid(&self) -> bool {
        self.multiplier >= 0 && (MIN_RESCALE_SHIFT..=MAX_RESCALE_SHIFT).contains(&self.shift)
    }
}

/// 畳み込みのゼロパディング（画素数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Padding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding {
    pub fn symmetric(p: usize) -> Self {
        Self {
            top: p,
            bottom: p,
            left: p,
            right: p,
        }
    }
}

/// 整数演算子
///
/// テンソルはすべて NHWC（全結合の入出力は [1, N]）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operator {
    /// ゼロ点・スケールの付け替え（型変換を含む）
    Requantize {
        input: usize,
        output: usize,
        rescale: Rescale,
    },
    /// 畳み込み（depthwise の場合 filter は [1, K, K, C]、通常は [OC, K, K, IC]）
    Conv2d {
        input: usize,
        filter: usize,
        bias: usize,
        output: usize,
        stride: usize,
        padding: Padding,
        depthwise: bool,
        rescale: Vec<Rescale>,
        activation_min: i32,
        activation_max: i32,
    },
    /// 要素ごとの加算（残差接続）
    Add {
        input1: usize,
        input2: usize,
        output: usize,
        left_shift: i32,
        input1_rescale: Rescale,
        input2_rescale: Rescale,
        output_rescale: Rescale,
        activation_min: i32,
        activation_max: i32,
    },
    /// 空間方向の平均（グローバル平均プーリング）
    Mean {
        input: usize,
        output: usize,
        rescale: Rescale,
    },
    /// 全結合（filter は [OUT, IN]）
    FullyConnected {
        input: usize,
        filter: usize,
        bias: usize,
        output: usize,
        rescale: Vec<Rescale>,
        activation_min: i32,
        activation_max: i32,
    },
    /// softmax（指数は int32 テーブル参照、Q16）
    Softmax {
        input: usize,
        output: usize,
        table: usize,
    },
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Requantize { .. } => "requantize",
            Operator::Conv2d { depthwise: true, .. } => "depthwise_conv2d",
            Operator::Conv2d { .. } => "conv2d",
            Operator::Add { .. } => "add",
            Operator::Mean { .. } => "mean",
            Operator::FullyConnected { .. } => "fully_connected",
            Operator::Softmax { .. } => "softmax",
        }
    }

    /// 演算子が持つ再スケール
    pub fn rescales(&self) -> Vec<&Rescale> {
        match self {
            Operator::Requantize { rescale, .. } | Operator::Mean { rescale, .. } => vec![rescale],
            Operator::Conv2d { rescale, .. } | Operator::FullyConnected { rescale, .. } => {
                rescale.iter().collect()
            }
            Operator::Add {
                input1_rescale,
                input2_rescale,
                output_rescale,
                ..
            } => vec![input1_rescale, input2_rescale, output_rescale],
            Operator::Softmax { .. } => Vec::new(),
        }
    }

    /// 参照するテンソル（入力側, 出力）
    pub fn tensors(&self) -> (Vec<usize>, usize) {
        match self {
            Operator::Requantize { input, output, .. }
            | Operator::Mean { input, output, .. }
            | Operator::Softmax { input, output, .. } => (vec![*input], *output),
            Operator::Conv2d {
                input,
                filter,
                bias,
                output,
                ..
            }
            | Operator::FullyConnected {
                input,
                filter,
                bias,
                output,
                ..
            } => (vec![*input, *filter, *bias], *output),
            Operator::Add {
                input1,
                input2,
                output,
                ..
            } => (vec![*input1, *input2], *output),
        }
    }
}

/// JSON ヘッダ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub tensors: Vec<TensorInfo>,
    pub operators: Vec<Operator>,
    pub buffers: Vec<BufferInfo>,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub class_count: usize,
}

/// 量子化モデル（ヘッダ + データ部）
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedModel {
    pub header: ArtifactHeader,
    pub data: Vec<u8>,
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    FreshnessError::InvalidArtifact(message.into()).into()
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

impl QuantizedModel {
    /// バイト列へ書き出す
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)?;
        let data_start = padded_len(PREAMBLE_LEN + header.len());

        let mut bytes = Vec::with_capacity(data_start + self.data.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(header.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.resize(data_start, 0);
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    /// バイト列から読み込んで検証
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE_LEN || &bytes[0..4] != MAGIC {
            return Err(invalid("missing FRQ8 magic"));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            return Err(invalid(format!("unsupported format version {}", version)));
        }

        let mut header_len = [0u8; 8];
        header_len.copy_from_slice(&bytes[8..16]);
        let header_len = usize::try_from(u64::from_le_bytes(header_len))
            .map_err(|_| invalid("header length overflows"))?;
        let header_end = PREAMBLE_LEN
            .checked_add(header_len)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| invalid("header extends past end of file"))?;

        let header: ArtifactHeader = serde_json::from_slice(&bytes[PREAMBLE_LEN..header_end])
            .map_err(|e| invalid(format!("malformed header: {}", e)))?;

        let data_start = padded_len(header_end);
        if data_start > bytes.len() {
            return Err(invalid("data section missing"));
        }

        let model = Self {
            header,
            data: bytes[data_start..].to_vec(),
        };
        model.validate()?;
        Ok(model)
    }

    /// ファイルに保存（一時ファイル経由）
    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.to_bytes()?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read quantized model: {:?}", path))?;
        Self::from_bytes(&bytes)
    }

    /// バッファ範囲・テンソル参照の整合性チェック
    pub fn validate(&self) -> Result<()> {
        let h = &self.header;

        for (id, buffer) in h.buffers.iter().enumerate() {
            if buffer.offset % ALIGNMENT != 0 {
                return Err(invalid(format!("buffer {} is not 16-byte aligned", id)));
            }
            let end = buffer.offset.checked_add(buffer.byte_len());
            if end.map_or(true, |end| end > self.data.len()) {
                return Err(invalid(format!("buffer {} exceeds the data section", id)));
            }
        }

        for (id, tensor) in h.tensors.iter().enumerate() {
            if tensor.scales.is_empty() || tensor.scales.len() != tensor.zero_points.len() {
                return Err(invalid(format!(
                    "tensor {} ({}) has mismatched quantization parameters",
                    id, tensor.name
                )));
            }
            if tensor.scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
                return Err(invalid(format!("tensor {} ({}) has an invalid scale", id, tensor.name)));
            }
            if let Some(buffer_id) = tensor.buffer {
                let buffer = h
                    .buffers
                    .get(buffer_id)
                    .ok_or_else(|| invalid(format!("tensor {} references missing buffer {}", id, buffer_id)))?;
                if buffer.dtype != tensor.dtype || buffer.count != tensor.num_elements() {
                    return Err(invalid(format!(
                        "tensor {} ({}) does not match buffer {}",
                        id, tensor.name, buffer_id
                    )));
                }
            }
        }

        let tensor_exists = |id: usize| id < h.tensors.len();
        for (index, op) in h.operators.iter().enumerate() {
            let (inputs, output) = op.tensors();
            if !inputs.iter().chain(std::iter::once(&output)).all(|&id| tensor_exists(id)) {
                return Err(invalid(format!(
                    "operator {} ({}) references a missing tensor",
                    index,
                    op.name()
                )));
            }
            if h.tensors[output].buffer.is_some() {
                return Err(invalid(format!(
                    "operator {} ({}) writes into a constant tensor",
                    index,
                    op.name()
                )));
            }
            if let Some(r) = op.rescales().into_iter().find(|r| !r.is_valid()) {
                return Err(invalid(format!(
                    "operator {} ({}) has an out-of-range rescale (multiplier {}, shift {})",
                    index,
                    op.name(),
                    r.multiplier,
                    r.shift
                )));
            }
            if let Operator::Softmax { table, .. } = op {
                match h.buffers.get(*table) {
                    Some(b) if b.dtype == DType::Int32 && b.count == SOFTMAX_TABLE_LEN => {}
                    _ => return Err(invalid(format!("operator {} has an invalid softmax table", index))),
                }
            }
        }

        if h.inputs.len() != 1 || h.outputs.len() != 1 {
            return Err(invalid("exactly one input and one output tensor are required"));
        }
        if !h.inputs.iter().chain(&h.outputs).all(|&id| tensor_exists(id)) {
            return Err(invalid("input/output references a missing tensor"));
        }
        Ok(())
    }

    pub fn tensor(&self, id: usize) -> Result<&TensorInfo> {
        self.header
            .tensors
            .get(id)
            .ok_or_else(|| invalid(format!("missing tensor {}", id)))
    }

    pub fn input_tensor(&self) -> Result<&TensorInfo> {
        let id = self.header.inputs.first().copied().unwrap_or(usize::MAX);
        self.tensor(id)
    }

    pub fn output_tensor(&self) -> Result<&TensorInfo> {
        let id = self.header.outputs.first().copied().unwrap_or(usize::MAX);
        self.tensor(id)
    }

    fn buffer_bytes(&self, id: usize, dtype: DType) -> Result<&[u8]> {
        let buffer = self
            .header
            .buffers
            .get(id)
            .ok_or_else(|| invalid(format!("missing buffer {}", id)))?;
        if buffer.dtype != dtype {
            return Err(invalid(format!(
                "buffer {} holds {:?}, expected {:?}",
                id, buffer.dtype, dtype
            )));
        }
        self.data
            .get(buffer.offset..buffer.offset + buffer.byte_len())
            .ok_or_else(|| invalid(format!("buffer {} exceeds the data section", id)))
    }

    pub fn buffer_i8(&self, id: usize) -> Result<Vec<i8>> {
        Ok(self
            .buffer_bytes(id, DType::Int8)?
            .iter()
            .map(|&b| b as i8)
            .collect())
    }

    pub fn buffer_i32(&self, id: usize) -> Result<Vec<i32>> {
        Ok(self
            .buffer_bytes(id, DType::Int32)?
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// 定数テンソルの int8 データ
    pub fn constant_i8(&self, tensor: usize) -> Result<Vec<i8>> {
        let info = self.tensor(tensor)?;
        let buffer = info
            .buffer
            .ok_or_else(|| invalid(format!("tensor {} ({}) has no data", tensor, info.name)))?;
        self.buffer_i8(buffer)
    }

    /// 定数テンソルの int32 データ
    pub fn constant_i32(&self, tensor: usize) -> Result<Vec<i32>> {
        let info = self.tensor(tensor)?;
        let buffer = info
            .buffer
            .ok_or_else(|| invalid(format!("tensor {} ({}) has no data", tensor, info.name)))?;
        self.buffer_i32(buffer)
    }
}

/// 量子化モデルの組み立て
#[derive(Debug, Default)]
pub struct ArtifactBuilder {
    tensors: Vec<TensorInfo>,
    operators: Vec<Operator>,
    buffers: Vec<BufferInfo>,
    data: Vec<u8>,
}

impl ArtifactBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_buffer(&mut self, dtype: DType, count: usize, bytes: &[u8]) -> usize {
        let offset = padded_len(self.data.len());
        self.data.resize(offset, 0);
        self.data.extend_from_slice(bytes);
        self.buffers.push(BufferInfo {
            dtype,
            offset,
            count,
        });
        self.buffers.len() - 1
    }

    pub fn add_buffer_i8(&mut self, values: &[i8]) -> usize {
        let bytes: Vec<u8> = values.iter().map(|&v| v as u8).collect();
        self.push_buffer(DType::Int8, values.len(), &bytes)
    }

    pub fn add_buffer_i32(&mut self, values: &[i32]) -> usize {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.push_buffer(DType::Int32, values.len(), &bytes)
    }

    /// アクティベーション（テンソル単位の量子化）を追加
    pub fn add_activation(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        dtype: DType,
        params: QuantParams,
    ) -> usize {
        self.tensors.push(TensorInfo {
            name: name.into(),
            shape,
            dtype,
            scales: vec![params.scale],
            zero_points: vec![params.zero_point],
            buffer: None,
        });
        self.tensors.len() - 1
    }

    /// チャネル単位で量子化した int8 の定数テンソルを追加
    pub fn add_weights(&mut self, name: impl Into<String>, shape: Vec<usize>, values: &[i8], scales: Vec<f32>) -> usize {
        let buffer = self.add_buffer_i8(values);
        let zero_points = vec![0; scales.len()];
        self.tensors.push(TensorInfo {
            name: name.into(),
            shape,
            dtype: DType::Int8,
            scales,
            zero_points,
            buffer: Some(buffer),
        });
        self.tensors.len() - 1
    }

    /// int32 バイアスを追加（スケールは 入力スケール × 重みスケール）
    pub fn add_bias(&mut self, name: impl Into<String>, values: &[i32], scales: Vec<f32>) -> usize {
        let buffer = self.add_buffer_i32(values);
        let zero_points = vec![0; scales.len()];
        self.tensors.push(TensorInfo {
            name: name.into(),
            shape: vec![values.len()],
            dtype: DType::Int32,
            scales,
            zero_points,
            buffer: Some(buffer),
        });
        self.tensors.len() - 1
    }

    pub fn push_operator(&mut self, op: Operator) {
        self.operators.push(op);
    }

    pub fn tensor(&self, id: usize) -> Option<&TensorInfo> {
        self.tensors.get(id)
    }

    /// 入出力を指定して完成させる（整合性チェック付き）
    pub fn finish(self, input: usize, output: usize, class_count: usize) -> Result<QuantizedModel> {
        let model = QuantizedModel {
            header: ArtifactHeader {
                tensors: self.tensors,
                operators: self.operators,
                buffers: self.buffers,
                inputs: vec![input],
                outputs: vec![output],
                class_count,
            },
            data: self.data,
        };
        model.validate()?;
        Ok(model)
    }
}

//! MobileNetV2 特徴抽出器（バックボーン）
//!
//! 事前学習済みの重みを読み込んで転移学習に使います。
//! 層の数え方は参照実装（Keras版MobileNetV2）の層一覧に合わせてあり、
//! 「末尾N層のみ学習」の境界が同じ位置になります。

use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

/// バッチ正規化のepsilon
pub const BN_EPSILON: f64 = 1e-3;

/// 逆残差ブロックの設定 (展開率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// チャネル数を divisor の倍数に丸める（10%以上小さくならないように調整）
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut rounded = (((value + d / 2.0) as usize) / divisor) * divisor;
    rounded = rounded.max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded += divisor;
    }
    rounded
}

/// TensorFlow の "same" パディング（前, 後）
///
/// 出力サイズは `ceil(input / stride)`。合計が奇数のときは後ろ側が1多くなります。
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = input.div_ceil(stride.max(1));
    let total = (output.saturating_sub(1) * stride + kernel).saturating_sub(input);
    (total / 2, total - total / 2)
}

/// 畳み込み1層分の構造
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvSpec {
    /// 層名（例: "block_3_expand"）
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    /// depthwise畳み込み（groups = チャネル数）
    pub depthwise: bool,
    /// 出力にReLU6を適用するか
    pub relu6: bool,
}

impl ConvSpec {
    fn new(name: String, in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self {
            name,
            in_channels,
            out_channels,
            kernel,
            stride,
            depthwise: false,
            relu6: true,
        }
    }

    fn depthwise(name: String, channels: usize, stride: usize) -> Self {
        Self {
            depthwise: true,
            ..Self::new(name, channels, channels, 3, stride)
        }
    }

    fn linear(mut self) -> Self {
        self.relu6 = false;
        self
    }

    /// 入力サイズ `input` の軸に対するパディング（前, 後）
    pub fn padding(&self, input: usize) -> (usize, usize) {
        same_padding(input, self.kernel, self.stride)
    }

    pub fn groups(&self) -> usize {
        if self.depthwise {
            self.in_channels
        } else {
            1
        }
    }

    /// 出力の空間サイズ
    pub fn output_size(&self, input: usize) -> usize {
        input.div_ceil(self.stride)
    }

    fn init<B: Backend>(&self, device: &B::Device) -> ConvBn<B> {
        ConvBn {
            conv: Conv2dConfig::new([self.in_channels, self.out_channels], [self.kernel, self.kernel])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Valid)
                .with_groups(self.groups())
                .with_bias(false)
                .init(device),
            norm: FrozenBatchNorm::new(self.out_channels, device),
        }
    }
}

/// 逆残差ブロック1つ分の構造
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub id: usize,
    pub expand: Option<ConvSpec>,
    pub depthwise: ConvSpec,
    pub project: ConvSpec,
    /// 入力を出力に足すか（stride 1 かつ 入出力チャネルが同じ）
    pub residual: bool,
}

/// Keras版の層一覧における層の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Input,
    Conv,
    BatchNorm,
    Activation,
    ZeroPadding,
    Add,
    Pooling,
}

/// 層一覧の1要素
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub name: String,
    pub kind: LayerKind,
}

/// バックボーン全体の構造
///
/// モジュールの生成・凍結範囲の計算・量子化時の層の走査はすべてこの構造に従います。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneSpec {
    pub stem: ConvSpec,
    pub blocks: Vec<BlockSpec>,
    pub last: ConvSpec,
}

impl BackboneSpec {
    /// 幅係数 alpha から構造を計算
    pub fn new(alpha: f64) -> Self {
        let stem_channels = make_divisible(STEM_CHANNELS as f64 * alpha, 8);
        let stem = ConvSpec::new("Conv1".to_string(), 3, stem_channels, 3, 2);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        let mut block_id = 0;
        for &(expansion, channels, repeats, first_stride) in INVERTED_RESIDUAL_SETTINGS.iter() {
            let out_channels = make_divisible(((channels as f64) * alpha).floor(), 8);
            for i in 0..repeats {
                let stride = if i == 0 { first_stride } else { 1 };
                let prefix = if block_id == 0 {
                    "expanded_conv".to_string()
                } else {
                    format!("block_{}", block_id)
                };
                let hidden = in_channels * expansion;
                let expand = (expansion != 1).then(|| {
                    ConvSpec::new(format!("{}_expand", prefix), in_channels, hidden, 1, 1)
                });
                blocks.push(BlockSpec {
                    id: block_id,
                    expand,
                    depthwise: ConvSpec::depthwise(format!("{}_depthwise", prefix), hidden, stride),
                    project: ConvSpec::new(format!("{}_project", prefix), hidden, out_channels, 1, 1)
                        .linear(),
                    residual: stride == 1 && in_channels == out_channels,
                });
                in_channels = out_channels;
                block_id += 1;
            }
        }

        let last_channels = if alpha > 1.0 {
            make_divisible(LAST_CHANNELS as f64 * alpha, 8)
        } else {
            LAST_CHANNELS
        };
        let last = ConvSpec::new("Conv_1".to_string(), in_channels, last_channels, 1, 1);

        Self { stem, blocks, last }
    }

    /// 出力特徴の次元
    pub fn output_channels(&self) -> usize {
        self.last.out_channels
    }

    /// 前向き計算の順に並べた畳み込み層
    pub fn conv_specs(&self) -> Vec<&ConvSpec> {
        let mut specs = vec![&self.stem];
        for block in &self.blocks {
            if let Some(expand) = &block.expand {
                specs.push(expand);
            }
            specs.push(&block.depthwise);
            specs.push(&block.project);
        }
        specs.push(&self.last);
        specs
    }

    /// Keras版と同じ並びの層一覧（入力層とプーリング層を含む）
    pub fn layers(&self) -> Vec<LayerEntry> {
        fn push(layers: &mut Vec<LayerEntry>, name: String, kind: LayerKind) {
            layers.push(LayerEntry { name, kind });
        }
        fn push_conv(layers: &mut Vec<LayerEntry>, conv: &str, bn: String, relu: Option<String>) {
            push(layers, conv.to_string(), LayerKind::Conv);
            push(layers, bn, LayerKind::BatchNorm);
            if let Some(relu) = relu {
                push(layers, relu, LayerKind::Activation);
            }
        }

        let mut layers = Vec::new();
        push(&mut layers, "input".to_string(), LayerKind::Input);
        push_conv(
            &mut layers,
            &self.stem.name,
            "bn_Conv1".to_string(),
            Some("Conv1_relu".to_string()),
        );

        for block in &self.blocks {
            if let Some(expand) = &block.expand {
                push_conv(
                    &mut layers,
                    &expand.name,
                    format!("{}_BN", expand.name),
                    Some(format!("{}_relu", expand.name)),
                );
            }
            if block.depthwise.stride == 2 {
                push(&mut layers, format!("block_{}_pad", block.id), LayerKind::ZeroPadding);
            }
            let dw = &block.depthwise.name;
            push_conv(&mut layers, dw, format!("{}_BN", dw), Some(format!("{}_relu", dw)));
            let pj = &block.project.name;
            push_conv(&mut layers, pj, format!("{}_BN", pj), None);
            if block.residual {
                push(&mut layers, format!("block_{}_add", block.id), LayerKind::Add);
            }
        }

        push_conv(
            &mut layers,
            &self.last.name,
            "Conv_1_bn".to_string(),
            Some("out_relu".to_string()),
        );
        push(
            &mut layers,
            "global_average_pooling2d".to_string(),
            LayerKind::Pooling,
        );
        layers
    }

    /// 各畳み込み層の層一覧上の位置（直後がそのバッチ正規化層）
    pub fn conv_layer_positions(&self) -> Vec<usize> {
        self.layers()
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.kind == LayerKind::Conv)
            .map(|(i, _)| i)
            .collect()
    }

    /// 末尾 `trainable_layers` 層を学習対象にしたときの最初の学習対象層の位置
    pub fn freeze_boundary(&self, trainable_layers: usize) -> usize {
        self.layers().len().saturating_sub(trainable_layers)
    }

    /// 指定サイズの入力に対する最終特徴マップの空間サイズ
    pub fn feature_map_size(&self, image_size: usize) -> usize {
        self.conv_specs()
            .iter()
            .fold(image_size, |size, spec| spec.output_size(size))
    }
}

/// 推論モード固定のバッチ正規化
///
/// 移動平均・分散は常に固定で、学習対象になるのはスケールとシフトのみです。
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
    pub moving_mean: Param<Tensor<B, 1>>,
    pub moving_var: Param<Tensor<B, 1>>,
}

impl<B: Backend> FrozenBatchNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([channels], device)),
            beta: Param::from_tensor(Tensor::zeros([channels], device)),
            moving_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            moving_var: Param::from_tensor(Tensor::ones([channels], device)),
        }
    }

    /// 推論時のアフィン係数 (scale, shift)
    ///
    /// y = x * scale + shift
    pub fn affine(&self) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let mean = self.moving_mean.val().detach();
        let var = self.moving_var.val().detach();
        let scale = self.gamma.val() / var.add_scalar(BN_EPSILON).sqrt();
        let shift = self.beta.val() - mean * scale.clone();
        (scale, shift)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();
        let (scale, shift) = self.affine();
        x * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }
}

/// 畳み込み + バッチ正規化
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: FrozenBatchNorm<B>,
}

impl<B: Backend> ConvBn<B> {
    /// "same" パディングを入力に足してから畳み込む
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let [kernel_h, kernel_w] = self.conv.kernel_size;
        let [stride_h, stride_w] = self.conv.stride;
        let (top, bottom) = same_padding(height, kernel_h, stride_h);
        let (left, right) = same_padding(width, kernel_w, stride_w);
        let x = if top + bottom + left + right > 0 {
            x.pad((left, right, top, bottom), 0.0)
        } else {
            x
        };
        self.norm.forward(self.conv.forward(x))
    }
}

pub fn relu6<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clamp(0.0, 6.0)
}

/// 逆残差ブロック
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBn<B>>,
    pub depthwise: ConvBn<B>,
    pub project: ConvBn<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn forward_observed<F>(&self, input: Tensor<B, 4>, observe: &mut F) -> Tensor<B, 4>
    where
        F: FnMut(&Tensor<B, 4>),
    {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = relu6(expand.forward(x));
            observe(&x);
        }
        x = relu6(self.depthwise.forward(x));
        observe(&x);
        x = self.project.forward(x);
        observe(&x);

        // stride 1 かつ 入出力チャネルが同じブロックだけ形状が一致する
        if x.dims() == input.dims() {
            x = x + input;
            observe(&x);
        }
        x
    }
}

/// MobileNetV2 バックボーン（全結合層なし、グローバル平均プーリング付き）
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub stem: ConvBn<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub last: ConvBn<B>,
}

impl<B: Backend> MobileNetV2<B> {
    /// 構造からモジュールを生成（重みはランダム初期化）
    pub fn new(spec: &BackboneSpec, device: &B::Device) -> Self {
        Self {
            stem: spec.stem.init(device),
            blocks: spec
                .blocks
                .iter()
                .map(|block| InvertedResidual {
                    expand: block.expand.as_ref().map(|e| e.init(device)),
                    depthwise: block.depthwise.init(device),
                    project: block.project.init(device),
                })
                .collect(),
            last: spec.last.init(device),
        }
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]、値域 [0, 1]
    ///
    /// # 戻り値
    /// - プーリング後の特徴 [batch_size, channels]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_observed(images, &mut |_| {})
    }

    /// 量子化対象の中間出力をすべて記録しながら順伝播
    ///
    /// 記録順は `BackboneSpec` の走査順（stem, 各ブロックの expand/depthwise/project/add, last）です。
    pub fn forward_with_taps(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Vec<Tensor<B, 4>>) {
        let mut taps = Vec::new();
        let pooled = self.forward_observed(images, &mut |t: &Tensor<B, 4>| taps.push(t.clone()));
        (pooled, taps)
    }

    fn forward_observed<F>(&self, images: Tensor<B, 4>, observe: &mut F) -> Tensor<B, 2>
    where
        F: FnMut(&Tensor<B, 4>),
    {
        // 入力は [0,1]。参照モデルと同じく [-1,1] へのスケーリングは行わない
        let mut x = relu6(self.stem.forward(images));
        observe(&x);

        for block in &self.blocks {
            x = block.forward_observed(x, observe);
        }

        x = relu6(self.last.forward(x));
        observe(&x);

        let [batch_size, channels, _, _] = x.dims();
        x.mean_dim(3).mean_dim(2).reshape([batch_size, channels])
    }

    /// 前向き計算の順に並べた畳み込み + バッチ正規化
    pub fn conv_bns(&self) -> Vec<&ConvBn<B>> {
        let mut layers = vec![&self.stem];
        for block in &self.blocks {
            if let Some(expand) = &block.expand {
                layers.push(expand);
            }
            layers.push(&block.depthwise);
            layers.push(&block.project);
        }
        layers.push(&self.last);
        layers
    }

    /// 層一覧上で `boundary` 以降にある学習対象パラメータを取り出す
    ///
    /// 取り出したモジュールはパラメータIDを共有するため、勾配の抽出に使えます。
    pub fn tail(&self, spec: &BackboneSpec, boundary: usize) -> BackboneTail<B> {
        let mut convs = Vec::new();
        let mut norms = Vec::new();
        for (layer, position) in self.conv_bns().into_iter().zip(spec.conv_layer_positions()) {
            if position >= boundary {
                convs.push(layer.conv.clone());
            }
            if position + 1 >= boundary {
                norms.push(layer.norm.clone());
            }
        }
        BackboneTail { convs, norms }
    }
}

/// 微調整フェーズで学習対象になるバックボーン末尾の層
#[derive(Module, Debug)]
pub struct BackboneTail<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
    pub norms: Vec<FrozenBatchNorm<B>>,
}

impl<B: Backend> BackboneTail<B> {
    pub fn num_layers(&self) -> usize {
        self.convs.len() + self.norms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(32.0 * 0.35, 8), 16);
        assert_eq!(make_divisible(11.0, 8), 16);
        assert_eq!(make_divisible(1280.0 * 1.4, 8), 1792);
    }

    #[test]
    fn test_layer_list_matches_reference_numbering() {
        let spec = BackboneSpec::new(1.0);
        let layers = spec.layers();
        assert_eq!(layers.len(), 155);
        assert_eq!(spec.blocks.len(), 17);
        assert_eq!(spec.conv_specs().len(), 52);

        // 末尾50層を学習対象にすると block_11 の project BN から
        let boundary = spec.freeze_boundary(50);
        assert_eq!(boundary, 105);
        assert_eq!(layers[boundary].name, "block_11_project_BN");
        assert_eq!(layers[boundary - 1].name, "block_11_project");
    }

    #[test]
    fn test_layer_count_independent_of_alpha() {
        assert_eq!(BackboneSpec::new(0.35).layers().len(), 155);
        assert_eq!(BackboneSpec::new(0.35).output_channels(), 1280);
    }

    #[test]
    fn test_residual_blocks() {
        let spec = BackboneSpec::new(1.0);
        let residual: Vec<usize> = spec.blocks.iter().filter(|b| b.residual).map(|b| b.id).collect();
        assert_eq!(residual, vec![2, 4, 5, 7, 8, 9, 11, 12, 14, 15]);
    }

    #[test]
    fn test_feature_map_size() {
        let spec = BackboneSpec::new(1.0);
        assert_eq!(spec.feature_map_size(224), 7);
        assert_eq!(spec.feature_map_size(32), 1);
    }

    #[test]
    fn test_same_padding() {
        // ストライド2・偶数入力は右下だけに1画素（Keras の correct_pad と同じ）
        assert_eq!(same_padding(32, 3, 2), (0, 1));
        assert_eq!(same_padding(33, 3, 2), (1, 1));
        assert_eq!(same_padding(32, 3, 1), (1, 1));
        assert_eq!(same_padding(32, 1, 1), (0, 0));
        assert_eq!(same_padding(1, 3, 2), (1, 1));
    }

    #[test]
    fn test_strided_conv_pads_bottom_right() {
        let device = Default::default();
        let mut layer = ConvSpec::new("strided".to_string(), 1, 1, 3, 2).init::<TestBackend>(&device);
        // 左上のタップだけ 1
        let mut weights = [0.0f32; 9];
        weights[0] = 1.0;
        layer.conv.weight =
            Param::from_tensor(Tensor::<TestBackend, 1>::from_floats(weights.as_slice(), &device).reshape([1, 1, 3, 3]));

        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let x = Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &device).reshape([1, 1, 4, 4]);
        let y = layer.forward(x);
        assert_eq!(y.dims(), [1, 1, 2, 2]);

        // 上・左にパディングが無いので出力 (oy, ox) は入力 (2oy, 2ox)
        let bn_scale = 1.0 / (1.0 + BN_EPSILON as f32).sqrt();
        let out = y.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        for (o, expected) in out.iter().zip([0.0, 2.0, 8.0, 10.0]) {
            assert!((o - expected * bn_scale).abs() < 1e-4, "{} vs {}", o, expected);
        }
    }

    #[test]
    fn test_forward_shapes_and_taps() {
        let device = Default::default();
        let spec = BackboneSpec::new(0.35);
        let backbone = MobileNetV2::<TestBackend>::new(&spec, &device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let (pooled, taps) = backbone.forward_with_taps(images);
        assert_eq!(pooled.dims(), [2, 1280]);

        // stem + 各ブロック(expand?, depthwise, project, add?) + last
        let expected = 1
            + spec
                .blocks
                .iter()
                .map(|b| 2 + usize::from(b.expand.is_some()) + usize::from(b.residual))
                .sum::<usize>()
            + 1;
        assert_eq!(taps.len(), expected);
    }

    #[test]
    fn test_tail_selection() {
        let device = Default::default();
        let spec = BackboneSpec::new(0.35);
        let backbone = MobileNetV2::<TestBackend>::new(&spec, &device);

        let boundary = spec.freeze_boundary(50);
        let tail = backbone.tail(&spec, boundary);
        // block_11 の project BN + block_12..16 (各3畳み込み) + Conv_1
        assert_eq!(tail.convs.len(), 5 * 3 + 1);
        assert_eq!(tail.norms.len(), 1 + 5 * 3 + 1);

        let everything = backbone.tail(&spec, 0);
        assert_eq!(everything.num_layers(), 2 * spec.conv_specs().len());
    }

    #[test]
    fn test_frozen_batch_norm_identity_at_init() {
        let device = Default::default();
        let norm = FrozenBatchNorm::<TestBackend>::new(4, &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let y: Vec<f32> = norm.forward(x).into_data().to_vec().unwrap();
        let expected = 1.0 / (1.0f32 + BN_EPSILON as f32).sqrt();
        assert!(y.iter().all(|v| (v - expected).abs() < 1e-6));
    }
}

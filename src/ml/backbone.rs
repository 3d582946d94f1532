//! VGG16バックボーン
//!
//! 畳み込み層はすべてSAMEパディング・ストライド1なので画素数は変わらず、
//! プーリング（2x2, ストライド2）ごとに縦横が半分になります。
//!
//! | 層        | 内容                          | 出力 (288x384入力時) |
//! |-----------|-------------------------------|----------------------|
//! | block1    | conv3x3 64 ×2 + pool          | 144x192x64           |
//! | block2    | conv3x3 128 ×2 + pool         | 72x96x128            |
//! | block3    | conv3x3 256 ×3 + pool         | 36x48x256  → layer3  |
//! | block4    | conv3x3 512 ×3 + pool         | 18x24x512  → layer4  |
//! | block5    | conv3x3 512 ×3 + pool         | 9x12x512             |
//! | fc6       | conv7x7 4096 + dropout        | 9x12x4096            |
//! | fc7       | conv1x1 4096 + dropout        | 9x12x4096  → layer7  |

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// 全プーリングを通した後の縮小率
pub const DOWNSAMPLE: usize = 32;

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// block1のチャネル数（以降 ×2, ×4, ×8, ×8）
    #[config(default = 64)]
    pub base_channels: usize,
    /// fc6/fc7のチャネル数
    #[config(default = 4096)]
    pub fc_channels: usize,
    /// fc6/fc7後のドロップアウト率（= 1 - keep_prob）
    #[config(default = 0.5)]
    pub dropout: f64,
}

fn conv_block<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    layers: usize,
    device: &B::Device,
) -> ConvBlock<B> {
    let convs = (0..layers)
        .map(|i| {
            let input = if i == 0 { in_channels } else { out_channels };
            Conv2dConfig::new([input, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        })
        .collect();

    ConvBlock {
        convs,
        pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        activation: Relu::new(),
    }
}

impl BackboneConfig {
    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16Backbone<B> {
        let c = self.base_channels;

        Vgg16Backbone {
            block1: conv_block(3, c, 2, device),
            block2: conv_block(c, c * 2, 2, device),
            block3: conv_block(c * 2, c * 4, 3, device),
            block4: conv_block(c * 4, c * 8, 3, device),
            block5: conv_block(c * 8, c * 8, 3, device),
            fc6: Conv2dConfig::new([c * 8, self.fc_channels], [7, 7])
                .with_padding(PaddingConfig2d::Same)
                .init(device),
            fc7: Conv2dConfig::new([self.fc_channels, self.fc_channels], [1, 1]).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

/// 畳み込み数層 + 最大プーリング
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self
            .convs
            .iter()
            .fold(x, |x, conv| self.activation.forward(conv.forward(x)));
        self.pool.forward(x)
    }
}

/// 分類ヘッドを接続するための中間特徴
#[derive(Debug, Clone)]
pub struct VggFeatures<B: Backend> {
    /// pool3出力
    pub layer3_out: Tensor<B, 4>,
    /// pool4出力
    pub layer4_out: Tensor<B, 4>,
    /// fc7出力（ドロップアウト後）
    pub layer7_out: Tensor<B, 4>,
}

/// VGG16（全結合層を畳み込みに置き換えたFCN版）
#[derive(Module, Debug)]
pub struct Vgg16Backbone<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    block4: ConvBlock<B>,
    block5: ConvBlock<B>,
    fc6: Conv2d<B>,
    fc7: Conv2d<B>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> Vgg16Backbone<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, rows, cols]
    pub fn forward(&self, images: Tensor<B, 4>) -> VggFeatures<B> {
        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let layer3_out = self.block3.forward(x);
        let layer4_out = self.block4.forward(layer3_out.clone());
        let x = self.block5.forward(layer4_out.clone());

        let x = self.activation.forward(self.fc6.forward(x));
        let x = self.dropout.forward(x);
        let x = self.activation.forward(self.fc7.forward(x));
        let layer7_out = self.dropout.forward(x);

        VggFeatures {
            layer3_out,
            layer4_out,
            layer7_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_feature_shapes() {
        let device = Default::default();
        let backbone = BackboneConfig::new()
            .with_base_channels(2)
            .with_fc_channels(8)
            .init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 96], &device);
        let features = backbone.forward(images);

        assert_eq!(features.layer3_out.dims(), [1, 8, 8, 12]);
        assert_eq!(features.layer4_out.dims(), [1, 16, 4, 6]);
        assert_eq!(features.layer7_out.dims(), [1, 8, 2, 3]);
    }
}

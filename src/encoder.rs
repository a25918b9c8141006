//! 编码器
//!
//! 四种编码器共享同一接口 `encode(tokens, lengths) -> (summary, memory_bank)`：
//!
//! | 类型 | summary | memory bank |
//! |------|---------|-------------|
//! | mean | `Pair(mean, mean)`，按层数复制 | 嵌入 |
//! | rnn | 最终隐状态 | 每步输出 |
//! | cnn | `Single(映射后的嵌入)` | 卷积输出 |
//! | transformer | `Single(嵌入)` | 最后一层输出 |

use ndarray::{Array3, Axis};
use rand::rngs::StdRng;

use crate::config::{EncoderType, ModelOptions};
use crate::conv::StackedCnn;
use crate::embedding::Embeddings;
use crate::error::{ModelError, Result};
use crate::layers::Linear;
use crate::rnn::{Rnn, RnnHidden};
use crate::transformer::TransformerEncoder;

/// 编码器摘要状态，用于初始化解码器
///
/// 形状为 `[layers * directions, batch, dim]`（cnn / transformer 为 `[len, batch, dim]`）。
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderSummary {
    Single(Array3<f32>),
    /// LSTM 的 (h, c)，或 mean 编码器的 (mean, mean)
    Pair(Array3<f32>, Array3<f32>),
}

impl EncoderSummary {
    pub fn tensors(&self) -> Vec<&Array3<f32>> {
        match self {
            EncoderSummary::Single(h) => vec![h],
            EncoderSummary::Pair(h, c) => vec![h, c],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.tensors()[0].len_of(Axis(1))
    }
}

impl From<RnnHidden> for EncoderSummary {
    fn from(hidden: RnnHidden) -> Self {
        match hidden {
            RnnHidden::Lstm(h, c) => EncoderSummary::Pair(h, c),
            RnnHidden::Gru(h) => EncoderSummary::Single(h),
        }
    }
}

/// 对嵌入在时间维取平均，没有循环结构
#[derive(Debug, Clone)]
pub struct MeanEncoder {
    num_layers: usize,
    embeddings: Embeddings,
}

impl MeanEncoder {
    pub fn new(num_layers: usize, embeddings: Embeddings) -> Self {
        Self { num_layers, embeddings }
    }

    fn encode(&mut self, tokens: &Array3<usize>) -> (EncoderSummary, Array3<f32>) {
        let emb = self.embeddings.forward(tokens, None);
        let (len, batch, dim) = emb.dim();
        assert!(len > 0, "cannot take the mean of an empty sequence");

        let mean = emb.sum_axis(Axis(0)) / len as f32;
        let broadcast = Array3::from_shape_fn((self.num_layers, batch, dim), |(_, b, k)| mean[[b, k]]);
        (EncoderSummary::Pair(broadcast.clone(), broadcast), emb)
    }
}

/// 循环网络编码器
#[derive(Debug, Clone)]
pub struct RnnEncoder {
    embeddings: Embeddings,
    rnn: Rnn,
}

impl RnnEncoder {
    pub fn new(opts: &ModelOptions, embeddings: Embeddings, rng: &mut StdRng) -> Result<Self> {
        let directions = opts.num_directions();
        if opts.rnn_size % directions != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "rnn_size {} is not divisible by the number of directions {}",
                opts.rnn_size, directions
            )));
        }
        let rnn = Rnn::new(
            opts.rnn_type,
            embeddings.embedding_dim(),
            opts.rnn_size / directions,
            opts.enc_layers,
            opts.bidirectional,
            opts.dropout,
            rng,
        );
        Ok(Self { embeddings, rnn })
    }

    pub fn num_directions(&self) -> usize {
        self.rnn.num_directions()
    }

    fn encode(&mut self, tokens: &Array3<usize>, lengths: Option<&[usize]>) -> (EncoderSummary, Array3<f32>) {
        let emb = self.embeddings.forward(tokens, None);
        let (outputs, hidden) = self.rnn.forward(&emb, lengths, None);
        (hidden.into(), outputs)
    }

    fn set_training(&mut self, training: bool) {
        self.embeddings.set_training(training);
        self.rnn.set_training(training);
    }
}

/// 门控卷积编码器
#[derive(Debug, Clone)]
pub struct CnnEncoder {
    embeddings: Embeddings,
    /// 嵌入维度 → 隐藏维度
    linear: Linear,
    cnn: StackedCnn,
}

impl CnnEncoder {
    pub fn new(opts: &ModelOptions, embeddings: Embeddings, rng: &mut StdRng) -> Self {
        let linear = Linear::new(embeddings.embedding_dim(), opts.rnn_size, true, rng);
        let cnn = StackedCnn::new(opts.enc_layers, opts.rnn_size, opts.cnn_kernel_width, opts.dropout, rng);
        Self { embeddings, linear, cnn }
    }

    fn encode(&mut self, tokens: &Array3<usize>) -> (EncoderSummary, Array3<f32>) {
        let emb = self.embeddings.forward(tokens, None);
        let remap = self.linear.forward_seq(&emb);
        let out = self.cnn.forward(&remap);
        (EncoderSummary::Single(remap), out)
    }

    fn set_training(&mut self, training: bool) {
        self.embeddings.set_training(training);
        self.cnn.set_training(training);
    }
}

/// 编码器
#[derive(Debug, Clone)]
pub enum Encoder {
    Mean(MeanEncoder),
    Rnn(RnnEncoder),
    Cnn(CnnEncoder),
    Transformer(TransformerEncoder),
}

impl Encoder {
    /// 根据配置构建编码器
    pub fn new(opts: &ModelOptions, embeddings: Embeddings, rng: &mut StdRng) -> Result<Self> {
        let encoder = match opts.encoder_type {
            EncoderType::Mean => Encoder::Mean(MeanEncoder::new(opts.enc_layers, embeddings)),
            EncoderType::Rnn => Encoder::Rnn(RnnEncoder::new(opts, embeddings, rng)?),
            EncoderType::Cnn => Encoder::Cnn(CnnEncoder::new(opts, embeddings, rng)),
            EncoderType::Transformer => {
                if opts.heads == 0 || opts.rnn_size % opts.heads != 0 {
                    return Err(ModelError::InvalidConfig(format!(
                        "rnn_size {} must be divisible by heads {}",
                        opts.rnn_size, opts.heads
                    )));
                }
                Encoder::Transformer(TransformerEncoder::new(
                    opts.enc_layers,
                    opts.rnn_size,
                    opts.heads,
                    opts.transformer_ff,
                    opts.dropout,
                    embeddings,
                    rng,
                ))
            }
        };
        Ok(encoder)
    }

    pub fn encoder_type(&self) -> EncoderType {
        match self {
            Encoder::Mean(_) => EncoderType::Mean,
            Encoder::Rnn(_) => EncoderType::Rnn,
            Encoder::Cnn(_) => EncoderType::Cnn,
            Encoder::Transformer(_) => EncoderType::Transformer,
        }
    }

    /// 双向 RNN 编码器的方向数，其余为 1
    pub fn num_directions(&self) -> usize {
        match self {
            Encoder::Rnn(rnn) => rnn.num_directions(),
            _ => 1,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        match self {
            Encoder::Mean(enc) => enc.embeddings.set_training(training),
            Encoder::Rnn(enc) => enc.set_training(training),
            Encoder::Cnn(enc) => enc.set_training(training),
            Encoder::Transformer(enc) => enc.set_training(training),
        }
    }

    /// 编码
    ///
    /// # 参数
    /// - `tokens`: [len, batch, n_feat]
    /// - `lengths`: 每个样本的有效长度（仅 rnn 编码器用于 pack）
    ///
    /// # 返回
    /// - 摘要状态
    /// - memory bank [len, batch, dim]
    pub fn encode(&mut self, tokens: &Array3<usize>, lengths: Option<&[usize]>) -> (EncoderSummary, Array3<f32>) {
        let (_, batch, _) = tokens.dim();
        if let Some(l) = lengths {
            assert_eq!(l.len(), batch, "lengths batch size does not match tokens");
        }

        match self {
            Encoder::Mean(enc) => enc.encode(tokens),
            Encoder::Rnn(enc) => enc.encode(tokens, lengths),
            Encoder::Cnn(enc) => enc.encode(tokens),
            Encoder::Transformer(enc) => {
                let (emb, out) = enc.forward(tokens);
                (EncoderSummary::Single(emb), out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{configs, RnnType};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn build(opts: &ModelOptions) -> Encoder {
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let embeddings = Embeddings::new(
            opts.src_vocab_size,
            &opts.src_feat_vocab_sizes,
            opts.word_vec_size,
            opts.padding_idx,
            opts.position_encoding,
            opts.dropout,
            &mut rng,
        );
        Encoder::new(opts, embeddings, &mut rng).unwrap()
    }

    fn tokens(len: usize, batch: usize) -> Array3<usize> {
        Array3::from_shape_fn((len, batch, 1), |(t, b, _)| 2 + (t * 3 + b) % 15)
    }

    #[test]
    fn test_memory_bank_shapes() {
        for encoder_type in [EncoderType::Mean, EncoderType::Rnn, EncoderType::Cnn, EncoderType::Transformer] {
            let opts = ModelOptions {
                encoder_type,
                cnn_kernel_width: 3,
                ..configs::tiny()
            };
            let mut encoder = build(&opts);

            let (summary, bank) = encoder.encode(&tokens(6, 3), Some(&[6, 5, 4]));

            assert_eq!(bank.shape(), &[6, 3, 8], "{:?}", encoder_type);
            assert_eq!(summary.batch_size(), 3);
            assert_eq!(encoder.encoder_type(), encoder_type);
        }
    }

    #[test]
    fn test_mean_summary_is_embedding_mean() {
        let opts = ModelOptions {
            encoder_type: EncoderType::Mean,
            enc_layers: 2,
            ..configs::tiny()
        };
        let mut encoder = build(&opts);
        let toks = Array3::from_shape_vec((5, 1, 1), vec![3, 4, 5, 6, 7]).unwrap();

        let (summary, bank) = encoder.encode(&toks, None);

        let EncoderSummary::Pair(h, c) = summary else {
            panic!("mean encoder must return a pair");
        };
        assert_eq!(h.shape(), &[2, 1, 8]);
        assert_eq!(h, c);
        for layer in 0..2 {
            for k in 0..8 {
                let expected = (0..5).map(|t| bank[[t, 0, k]]).sum::<f32>() / 5.0;
                assert_abs_diff_eq!(h[[layer, 0, k]], expected, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_bidirectional_rnn_summary() {
        let opts = ModelOptions {
            bidirectional: true,
            enc_layers: 2,
            rnn_type: RnnType::Gru,
            ..configs::tiny()
        };
        let mut encoder = build(&opts);

        let (summary, bank) = encoder.encode(&tokens(4, 2), None);

        // 每个方向 hidden = rnn_size / 2
        assert_eq!(bank.shape(), &[4, 2, 8]);
        match summary {
            EncoderSummary::Single(h) => assert_eq!(h.shape(), &[4, 2, 4]),
            other => panic!("GRU summary must be single, got {:?}", other),
        }
        assert_eq!(encoder.num_directions(), 2);
    }

    #[test]
    fn test_rnn_size_must_split_across_directions() {
        let opts = ModelOptions {
            bidirectional: true,
            rnn_size: 7,
            ..configs::tiny()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let embeddings = Embeddings::new(20, &[], 8, 1, false, 0.0, &mut rng);

        let err = Encoder::new(&opts, embeddings, &mut rng).unwrap_err();

        assert!(matches!(err, ModelError::InvalidConfig(_)));
    }

    #[test]
    #[should_panic(expected = "lengths batch size does not match tokens")]
    fn test_lengths_batch_mismatch() {
        let mut encoder = build(&configs::tiny());
        encoder.encode(&tokens(3, 2), Some(&[3]));
    }
}

//! Transformer Encoder
//!
//! pre-norm 结构，每层包含两个子层：
//! 1. Multi-Head Self-Attention（屏蔽源端 padding）
//! 2. Position-wise Feed-Forward Network（自带 pre-norm 和残差）
//!
//! ```text
//! x → x + Dropout(SelfAttn(LayerNorm(x))) → FFN → ... → LayerNorm → output
//! ```

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::Rng;

use crate::embedding::Embeddings;
use crate::layers::{Dropout, LayerNorm, PositionwiseFeedForward};
use crate::multi_head_attention::MultiHeadedAttention;
use crate::tensor::padding_mask;

/// 单个 Transformer Encoder 层
///
/// 输入输出为 batch-first：[batch, len, d_model]
#[derive(Debug, Clone)]
pub struct TransformerEncoderLayer {
    self_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl TransformerEncoderLayer {
    pub fn new(d_model: usize, heads: usize, d_ff: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            self_attn: MultiHeadedAttention::new(heads, d_model, dropout, rng),
            feed_forward: PositionwiseFeedForward::new(d_model, d_ff, dropout, rng),
            layer_norm: LayerNorm::new(d_model, None),
            dropout: Dropout::new(dropout, rng.gen()),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.dropout.set_training(training);
    }

    /// # 参数
    /// - `x`: [batch, len, d_model]
    /// - `mask`: [batch, len, len]，`true` 为屏蔽
    pub fn forward(&mut self, x: &Array3<f32>, mask: &Array3<bool>) -> Array3<f32> {
        let input_norm = self.layer_norm.forward_seq(x);
        let (context, _) = self
            .self_attn
            .forward(&input_norm, &input_norm, &input_norm, Some(mask));
        let out = self.dropout.forward(&context) + x;
        self.feed_forward.forward_seq(&out)
    }
}

/// 完整的 Transformer Encoder
///
/// ```text
/// tokens → Embeddings → [Encoder Layer × N] → LayerNorm → memory bank
/// ```
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    embeddings: Embeddings,
    layers: Vec<TransformerEncoderLayer>,
    layer_norm: LayerNorm,
}

impl TransformerEncoder {
    pub fn new(
        num_layers: usize,
        d_model: usize,
        heads: usize,
        d_ff: usize,
        dropout: f32,
        embeddings: Embeddings,
        rng: &mut StdRng,
    ) -> Self {
        assert_eq!(d_model % heads, 0, "d_model must be divisible by n_heads");
        assert_eq!(
            embeddings.embedding_dim(),
            d_model,
            "transformer embeddings must have d_model dimensions"
        );

        let layers = (0..num_layers)
            .map(|_| TransformerEncoderLayer::new(d_model, heads, d_ff, dropout, rng))
            .collect();

        Self {
            embeddings,
            layers,
            layer_norm: LayerNorm::new(d_model, None),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.embeddings.set_training(training);
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `tokens`: [len, batch, n_feat]
    ///
    /// # 返回
    /// - 嵌入 [len, batch, d_model]
    /// - 输出 [len, batch, d_model]
    pub fn forward(&mut self, tokens: &Array3<usize>) -> (Array3<f32>, Array3<f32>) {
        let emb = self.embeddings.forward(tokens, None);
        let (len, batch, _) = emb.dim();

        let pad = padding_mask(tokens, self.embeddings.word_padding_idx());
        let mask = Array3::from_shape_fn((batch, len, len), |(b, _, j)| pad[[b, j]]);

        let mut out = emb.view().permuted_axes([1, 0, 2]).to_owned();
        for layer in &mut self.layers {
            out = layer.forward(&out, &mask);
        }
        let out = self.layer_norm.forward_seq(&out);

        (emb, out.permuted_axes([1, 0, 2]).as_standard_layout().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn encoder(seed: u64) -> TransformerEncoder {
        let mut rng = StdRng::seed_from_u64(seed);
        let embeddings = Embeddings::new(20, &[], 8, 1, true, 0.0, &mut rng);
        TransformerEncoder::new(2, 8, 2, 16, 0.0, embeddings, &mut rng)
    }

    fn tokens(ids: &[&[usize]]) -> Array3<usize> {
        Array3::from_shape_fn((ids[0].len(), ids.len(), 1), |(t, b, _)| ids[b][t])
    }

    #[test]
    fn test_encoder_shapes() {
        let mut enc = encoder(0);

        let (emb, out) = enc.forward(&tokens(&[&[2, 3, 4, 5, 6], &[7, 8, 9, 1, 1]]));

        assert_eq!(emb.shape(), &[5, 2, 8]);
        assert_eq!(out.shape(), &[5, 2, 8]);
        assert_eq!(enc.num_layers(), 2);
    }

    #[test]
    fn test_padding_does_not_leak_into_real_positions() {
        let mut enc = encoder(1);

        let (_, padded) = enc.forward(&tokens(&[&[4, 5, 6, 1, 1]]));
        let (_, short) = enc.forward(&tokens(&[&[4, 5, 6]]));

        for t in 0..3 {
            for k in 0..8 {
                assert!((padded[[t, 0, k]] - short[[t, 0, k]]).abs() < 1e-4);
            }
        }
    }

    #[test]
    #[should_panic(expected = "d_model must be divisible by n_heads")]
    fn test_invalid_heads() {
        let mut rng = StdRng::seed_from_u64(0);
        let embeddings = Embeddings::new(10, &[], 6, 1, false, 0.0, &mut rng);
        TransformerEncoder::new(1, 6, 4, 8, 0.0, embeddings, &mut rng);
    }
}

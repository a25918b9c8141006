//! 嵌入层和位置编码
//!
//! 把 `[len, batch, n_feat]` 的 token id 批次映射为 `[len, batch, dim]` 的向量。
//! slot 0 是词 id，其余 slot 是可选的词特征，各自查表后求和。

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::Rng;

use crate::layers::Dropout;
use crate::tensor::TensorExt;

/// 单张查找表
#[derive(Debug, Clone)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, dim]
    weights: Array2<f32>,
}

impl Embedding {
    /// 创建新的嵌入表，`padding_idx` 对应的行为零向量
    pub fn new(vocab_size: usize, dim: usize, padding_idx: Option<usize>, rng: &mut StdRng) -> Self {
        let mut weights = Array2::<f32>::random_xavier((vocab_size, dim), rng);
        if let Some(pad) = padding_idx.filter(|&p| p < vocab_size) {
            weights.row_mut(pad).fill(0.0);
        }
        Self { weights }
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    fn lookup(&self, id: usize) -> ndarray::ArrayView1<'_, f32> {
        assert!(
            id < self.vocab_size(),
            "token id {} out of vocabulary of size {}",
            id,
            self.vocab_size()
        );
        self.weights.row(id)
    }
}

/// 正弦位置编码
///
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/dim))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/dim))
/// ```
///
/// 按需计算，没有最大长度限制。
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    dim: usize,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(dim: usize, dropout: f32, seed: u64) -> Self {
        Self {
            dim,
            dropout: Dropout::new(dropout, seed),
        }
    }

    /// 单个位置的编码值
    pub fn value(&self, pos: usize, k: usize) -> f32 {
        let i = (k / 2) * 2;
        let div_term = (-(i as f32) * (10000f32.ln() / self.dim as f32)).exp();
        let angle = pos as f32 * div_term;
        if k % 2 == 0 {
            angle.sin()
        } else {
            angle.cos()
        }
    }

    /// `emb * √dim + PE[offset + t]`，然后 dropout
    pub fn forward(&mut self, emb: &Array3<f32>, offset: usize) -> Array3<f32> {
        let scale = (self.dim as f32).sqrt();
        let encoded =
            Array3::from_shape_fn(emb.dim(), |(t, b, k)| emb[[t, b, k]] * scale + self.value(offset + t, k));
        self.dropout.forward(&encoded)
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }
}

/// 词嵌入 + 特征嵌入 + 可选位置编码
#[derive(Debug, Clone)]
pub struct Embeddings {
    word: Embedding,
    features: Vec<Embedding>,
    padding_idx: usize,
    position_encoding: Option<PositionalEncoding>,
}

impl Embeddings {
    /// # 参数
    /// - `vocab_size`: 词表大小
    /// - `feat_vocab_sizes`: 每个额外特征 slot 的词表大小
    /// - `dim`: 嵌入维度
    /// - `padding_idx`: padding token id
    /// - `position_encoding`: 是否加入位置编码
    pub fn new(
        vocab_size: usize,
        feat_vocab_sizes: &[usize],
        dim: usize,
        padding_idx: usize,
        position_encoding: bool,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        let word = Embedding::new(vocab_size, dim, Some(padding_idx), rng);
        let features = feat_vocab_sizes
            .iter()
            .map(|&size| Embedding::new(size, dim, Some(padding_idx), rng))
            .collect();
        let position_encoding = position_encoding.then(|| PositionalEncoding::new(dim, dropout, rng.gen()));

        Self {
            word,
            features,
            padding_idx,
            position_encoding,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.word.dim()
    }

    pub fn word_padding_idx(&self) -> usize {
        self.padding_idx
    }

    pub fn set_training(&mut self, training: bool) {
        if let Some(pe) = &mut self.position_encoding {
            pe.set_training(training);
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `tokens`: [len, batch, n_feat]
    /// - `step`: 增量解码时当前第一个 token 的绝对位置，用于偏移位置编码
    ///
    /// # 返回
    /// - [len, batch, dim]
    pub fn forward(&mut self, tokens: &Array3<usize>, step: Option<usize>) -> Array3<f32> {
        let (len, batch, n_feat) = tokens.dim();
        assert_eq!(
            n_feat,
            1 + self.features.len(),
            "expected {} feature slots, got {}",
            1 + self.features.len(),
            n_feat
        );

        let dim = self.embedding_dim();
        let mut emb = Array3::zeros((len, batch, dim));
        for t in 0..len {
            for b in 0..batch {
                let mut row = emb.slice_mut(ndarray::s![t, b, ..]);
                row += &self.word.lookup(tokens[[t, b, 0]]);
                for (slot, table) in self.features.iter().enumerate() {
                    row += &table.lookup(tokens[[t, b, slot + 1]]);
                }
            }
        }

        match &mut self.position_encoding {
            Some(pe) => pe.forward(&emb, step.unwrap_or(0)),
            None => emb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tokens(ids: &[[usize; 2]]) -> Array3<usize> {
        Array3::from_shape_fn((ids.len(), 2, 1), |(t, b, _)| ids[t][b])
    }

    #[test]
    fn test_embedding_shape_and_padding_row() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut emb = Embeddings::new(10, &[], 6, 1, false, 0.0, &mut rng);

        let out = emb.forward(&tokens(&[[2, 1], [3, 1], [4, 5]]), None);

        assert_eq!(out.shape(), &[3, 2, 6]);
        assert!(out.slice(ndarray::s![0, 1, ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_feature_slots_are_summed() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut emb = Embeddings::new(10, &[4], 3, 1, false, 0.0, &mut rng);
        let toks = Array3::from_shape_vec((1, 1, 2), vec![2, 3]).unwrap();

        let out = emb.forward(&toks, None);

        let expected = &emb.word.weights.row(2) + &emb.features[0].weights.row(3);
        for k in 0..3 {
            assert!((out[[0, 0, k]] - expected[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_positional_encoding_first_position() {
        let pe = PositionalEncoding::new(4, 0.0, 0);

        // sin(0) = 0, cos(0) = 1
        assert!(pe.value(0, 0).abs() < 1e-6);
        assert!((pe.value(0, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_step_offsets_position_encoding() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut emb = Embeddings::new(10, &[], 4, 1, true, 0.0, &mut rng);
        let full = emb.forward(&tokens(&[[2, 3], [4, 5], [6, 7]]), None);
        let third = emb.forward(&tokens(&[[6, 7]]), Some(2));

        for b in 0..2 {
            for k in 0..4 {
                assert!((full[[2, b, k]] - third[[0, b, k]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    #[should_panic(expected = "out of vocabulary")]
    fn test_unknown_id_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut emb = Embeddings::new(5, &[], 2, 1, false, 0.0, &mut rng);
        emb.forward(&tokens(&[[9, 2]]), None);
    }
}

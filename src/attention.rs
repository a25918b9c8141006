//! Global Attention
//!
//! RNN 解码器使用的全局注意力：对解码器每个位置的 query，与 memory bank
//! 的所有源端位置打分，掩码后 softmax 得到对齐权重，加权求和得到 context，
//! 再与 query 拼接映射回隐藏维度。
//!
//! ```text
//! a_t = softmax(score(h_t, h_s))
//! c_t = Σ a_t[s] · h_s
//! h̃_t = tanh(W_out [c_t; h_t])
//! ```
//!
//! copy attention 与它结构完全相同，只是参数独立。

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;

use crate::config::GlobalAttnType;
use crate::layers::Linear;
use crate::tensor::{sequence_mask, TensorExt};

/// 打分函数及其参数
#[derive(Debug, Clone)]
enum Scorer {
    Dot,
    General {
        linear_in: Linear,
    },
    Mlp {
        /// W_c（作用于 memory）
        linear_context: Linear,
        /// W_q（作用于 query）
        linear_query: Linear,
        v: Linear,
    },
}

/// 全局注意力层
#[derive(Debug, Clone)]
pub struct GlobalAttention {
    dim: usize,
    scorer: Scorer,
    /// [c; h_t] → dim
    linear_out: Linear,
    /// coverage → dim
    linear_cover: Option<Linear>,
}

impl GlobalAttention {
    /// # 参数
    /// - `dim`: query 与 memory 的维度
    /// - `coverage`: 是否把 coverage 向量作为额外输入
    /// - `attn_type`: 打分方式
    pub fn new(dim: usize, coverage: bool, attn_type: GlobalAttnType, rng: &mut StdRng) -> Self {
        let scorer = match attn_type {
            GlobalAttnType::Dot => Scorer::Dot,
            GlobalAttnType::General => Scorer::General {
                linear_in: Linear::new(dim, dim, false, rng),
            },
            GlobalAttnType::Mlp => Scorer::Mlp {
                linear_context: Linear::new(dim, dim, false, rng),
                linear_query: Linear::new(dim, dim, true, rng),
                v: Linear::new(dim, 1, false, rng),
            },
        };
        Self {
            dim,
            scorer,
            linear_out: Linear::new(dim * 2, dim, attn_type == GlobalAttnType::Mlp, rng),
            linear_cover: coverage.then(|| Linear::new(1, dim, false, rng)),
        }
    }

    pub fn attn_type(&self) -> GlobalAttnType {
        match self.scorer {
            Scorer::Dot => GlobalAttnType::Dot,
            Scorer::General { .. } => GlobalAttnType::General,
            Scorer::Mlp { .. } => GlobalAttnType::Mlp,
        }
    }

    /// 单个样本的打分
    ///
    /// - `h_t`: [tgt_len, dim]
    /// - `h_s`: [src_len, dim]
    ///
    /// 返回: [tgt_len, src_len]
    pub fn score(&self, h_t: ArrayView2<'_, f32>, h_s: ArrayView2<'_, f32>) -> Array2<f32> {
        match &self.scorer {
            Scorer::Dot => h_t.dot(&h_s.t()),
            Scorer::General { linear_in } => linear_in.forward(&h_t.to_owned()).dot(&h_s.t()),
            Scorer::Mlp {
                linear_context,
                linear_query,
                v,
            } => {
                let wq = linear_query.forward(&h_t.to_owned());
                let uh = linear_context.forward(&h_s.to_owned());
                let (tgt_len, src_len) = (wq.nrows(), uh.nrows());

                let mut scores = Array2::zeros((tgt_len, src_len));
                for i in 0..tgt_len {
                    let hidden = (&uh + &wq.row(i)).tanh();
                    scores.row_mut(i).assign(&v.forward(&hidden).column(0));
                }
                scores
            }
        }
    }

    /// 整段前向传播
    ///
    /// # 参数
    /// - `source`: query [tgt_len, batch, dim]
    /// - `memory_bank`: [src_len, batch, dim]
    /// - `memory_lengths`: 源端有效长度，超出部分不参与归一化
    /// - `coverage`: [batch, src_len]
    ///
    /// # 返回
    /// - attention 输出 [tgt_len, batch, dim]
    /// - 对齐权重 [tgt_len, batch, src_len]
    pub fn forward(
        &self,
        source: &Array3<f32>,
        memory_bank: &Array3<f32>,
        memory_lengths: Option<&[usize]>,
        coverage: Option<&Array2<f32>>,
    ) -> (Array3<f32>, Array3<f32>) {
        let (tgt_len, batch, dim) = source.dim();
        let (src_len, batch_, dim_) = memory_bank.dim();
        assert_eq!(batch, batch_, "query and memory bank batch sizes differ");
        assert_eq!(dim, dim_, "query and memory bank dimensions differ");
        assert_eq!(dim, self.dim, "attention built for dim {}, got {}", self.dim, dim);

        let memory_bank = match (coverage, &self.linear_cover) {
            (Some(cov), Some(linear_cover)) => {
                assert_eq!(cov.dim(), (batch, src_len), "coverage must be [batch, src_len]");
                let mut covered = memory_bank.clone();
                for b in 0..batch {
                    let cover = cov.row(b).insert_axis(Axis(1)).to_owned();
                    let proj = linear_cover.forward(&cover);
                    let mut slot = covered.slice_mut(s![.., b, ..]);
                    slot += &proj;
                    slot.mapv_inplace(f32::tanh);
                }
                covered
            }
            _ => memory_bank.clone(),
        };

        let mask = memory_lengths.map(|lengths| {
            assert_eq!(lengths.len(), batch, "memory_lengths batch size mismatch");
            sequence_mask(lengths, src_len)
        });

        let mut attn_h = Array3::zeros((tgt_len, batch, dim));
        let mut align = Array3::zeros((tgt_len, batch, src_len));

        for b in 0..batch {
            let h_t = source.slice(s![.., b, ..]);
            let h_s = memory_bank.slice(s![.., b, ..]);

            let scores = self.score(h_t, h_s);
            let row_mask = mask
                .as_ref()
                .map(|m| Array2::from_shape_fn((tgt_len, src_len), |(_, j)| m[[b, j]]));
            let weights = scores.masked_softmax(row_mask.as_ref());

            let context = weights.dot(&h_s);
            let concat = context.concat(&h_t.to_owned(), 1);
            let out = self.linear_out.forward(&concat).tanh();

            attn_h.slice_mut(s![.., b, ..]).assign(&out);
            align.slice_mut(s![.., b, ..]).assign(&weights);
        }

        (attn_h, align)
    }

    /// 单步前向传播
    ///
    /// - `source`: [batch, dim]
    ///
    /// 返回: ([batch, dim], [batch, src_len])
    pub fn forward_step(
        &self,
        source: &Array2<f32>,
        memory_bank: &Array3<f32>,
        memory_lengths: Option<&[usize]>,
        coverage: Option<&Array2<f32>>,
    ) -> (Array2<f32>, Array2<f32>) {
        let query = source.clone().insert_axis(Axis(0));
        let (attn_h, align) = self.forward(&query, memory_bank, memory_lengths, coverage);
        (
            attn_h.index_axis(Axis(0), 0).to_owned(),
            align.index_axis(Axis(0), 0).to_owned(),
        )
    }
}

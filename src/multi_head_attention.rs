//! Multi-Head Scaled Dot-Product Attention
//!
//! Transformer 的核心组件：把 query / key / value 投影到 `head_count` 个子空间，
//! 每个头独立做缩放点积注意力，最后拼接并投影回模型维度。
//!
//! ```text
//! Attention(Q, K, V) = softmax(QK^T / √d_k) V
//! ```
//!
//! 张量布局为 batch-first：`[batch, len, dim]`，每个头的 key / value 为
//! `[batch, heads, len, dim_per_head]`。
//!
//! 增量解码时支持两种缓存：
//! - `self`：本步新投影的 key / value 追加到缓存末尾，缓存单调增长；
//! - `context`：memory bank 的 key / value 只投影一次，之后每步复用。

use ndarray::{s, Array3, Array4, Axis, Ix4};
use rand::rngs::StdRng;
use rand::Rng;

use crate::autograd::{TensorOp, Var};
use crate::layers::{Dropout, Linear};
use crate::tensor::TensorExt;

/// 一组 key / value 缓存
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvCache {
    /// [batch, heads, len, dim_per_head]
    pub keys: Option<Var<Ix4>>,
    /// [batch, heads, len, dim_per_head]
    pub values: Option<Var<Ix4>>,
}

impl KvCache {
    /// 已缓存的位置数
    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.data.len_of(Axis(2)))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 对每个已缓存张量应用变换
    pub fn map_tensors<F>(&mut self, mut f: F)
    where
        F: FnMut(&Var<Ix4>) -> Var<Ix4>,
    {
        for slot in [&mut self.keys, &mut self.values] {
            if let Some(v) = slot.as_ref() {
                *slot = Some(f(v));
            }
        }
    }

    pub fn detach(&mut self) {
        for v in [&mut self.keys, &mut self.values].into_iter().flatten() {
            v.detach();
        }
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Var<Ix4>> {
        self.keys.iter().chain(self.values.iter())
    }
}

/// Multi-Head Attention 层
#[derive(Debug, Clone)]
pub struct MultiHeadedAttention {
    head_count: usize,
    model_dim: usize,
    dim_per_head: usize,
    linear_keys: Linear,
    linear_values: Linear,
    linear_query: Linear,
    final_linear: Linear,
    dropout: Dropout,
}

impl MultiHeadedAttention {
    /// # 参数
    /// - `head_count`: 注意力头数
    /// - `model_dim`: 模型维度，必须能被头数整除
    pub fn new(head_count: usize, model_dim: usize, dropout: f32, rng: &mut StdRng) -> Self {
        assert!(head_count > 0, "head_count must be positive");
        assert_eq!(
            model_dim % head_count,
            0,
            "model_dim must be divisible by head_count"
        );

        Self {
            head_count,
            model_dim,
            dim_per_head: model_dim / head_count,
            linear_keys: Linear::new(model_dim, model_dim, true, rng),
            linear_values: Linear::new(model_dim, model_dim, true, rng),
            linear_query: Linear::new(model_dim, model_dim, true, rng),
            final_linear: Linear::new(model_dim, model_dim, true, rng),
            dropout: Dropout::new(dropout, rng.gen()),
        }
    }

    pub fn head_count(&self) -> usize {
        self.head_count
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// 不使用缓存的前向传播
    ///
    /// # 参数
    /// - `key`, `value`: [batch, k_len, dim]
    /// - `query`: [batch, q_len, dim]
    /// - `mask`: [batch, q_len, k_len]，`true` 为屏蔽
    ///
    /// # 返回
    /// - 输出 [batch, q_len, dim]
    /// - 第一个头的注意力权重 [batch, q_len, k_len]
    pub fn forward(
        &mut self,
        key: &Array3<f32>,
        value: &Array3<f32>,
        query: &Array3<f32>,
        mask: Option<&Array3<bool>>,
    ) -> (Array3<f32>, Array3<f32>) {
        let k = self.shape(&self.project(&self.linear_keys, key));
        let v = self.shape(&self.project(&self.linear_values, value));
        self.attend(query, &k, &v, mask)
    }

    /// `self` 缓存模式：key / value 由 `query` 投影后追加到缓存
    ///
    /// `mask` 的 key 维度覆盖缓存中已有的位置加上本次新增的位置。
    pub fn forward_self_cached(
        &mut self,
        query: &Array3<f32>,
        mask: Option<&Array3<bool>>,
        cache: &mut KvCache,
    ) -> (Array3<f32>, Array3<f32>) {
        let requires_grad = self.dropout.is_training();
        let new_k = self.shape(&self.project(&self.linear_keys, query));
        let new_v = self.shape(&self.project(&self.linear_values, query));

        let (k, v) = match (&cache.keys, &cache.values) {
            (Some(old_k), Some(old_v)) => (
                append_positions(&old_k.data, &new_k),
                append_positions(&old_v.data, &new_v),
            ),
            _ => (new_k, new_v),
        };

        let out = self.attend(query, &k, &v, mask);
        cache.keys = Some(Var::computed(k, TensorOp::Projection, requires_grad));
        cache.values = Some(Var::computed(v, TensorOp::Projection, requires_grad));
        out
    }

    /// `context` 缓存模式：memory bank 的 key / value 只在缓存为空时投影一次
    pub fn forward_context_cached(
        &mut self,
        memory_bank: &Array3<f32>,
        query: &Array3<f32>,
        mask: Option<&Array3<bool>>,
        cache: &mut KvCache,
    ) -> (Array3<f32>, Array3<f32>) {
        let (k, v) = match (&cache.keys, &cache.values) {
            (Some(k), Some(v)) => (k.data.clone(), v.data.clone()),
            _ => {
                let requires_grad = self.dropout.is_training();
                let k = self.shape(&self.project(&self.linear_keys, memory_bank));
                let v = self.shape(&self.project(&self.linear_values, memory_bank));
                cache.keys = Some(Var::computed(k.clone(), TensorOp::Projection, requires_grad));
                cache.values = Some(Var::computed(v.clone(), TensorOp::Projection, requires_grad));
                (k, v)
            }
        };
        self.attend(query, &k, &v, mask)
    }

    fn project(&self, linear: &Linear, x: &Array3<f32>) -> Array3<f32> {
        let dim = x.len_of(Axis(2));
        assert_eq!(dim, self.model_dim, "expected model dim {}, got {}", self.model_dim, dim);
        linear.forward_seq(x)
    }

    /// [batch, len, dim] → [batch, heads, len, dim_per_head]
    fn shape(&self, x: &Array3<f32>) -> Array4<f32> {
        let (batch, len, _) = x.dim();
        let dh = self.dim_per_head;
        Array4::from_shape_fn((batch, self.head_count, len, dh), |(b, h, t, d)| x[[b, t, h * dh + d]])
    }

    /// [batch, heads, len, dim_per_head] → [batch, len, dim]
    fn unshape(&self, x: &Array4<f32>) -> Array3<f32> {
        let (batch, _, len, dh) = x.dim();
        Array3::from_shape_fn((batch, len, self.model_dim), |(b, t, k)| x[[b, k / dh, t, k % dh]])
    }

    /// 缩放点积注意力，`query` 尚未投影
    fn attend(
        &mut self,
        query: &Array3<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
        mask: Option<&Array3<bool>>,
    ) -> (Array3<f32>, Array3<f32>) {
        let (batch, q_len, _) = query.dim();
        let k_len = k.len_of(Axis(2));
        assert_eq!(k.len_of(Axis(0)), batch, "key and query batch sizes differ");
        if let Some(m) = mask {
            assert_eq!(m.dim(), (batch, q_len, k_len), "attention mask shape mismatch");
        }

        let scale = (self.dim_per_head as f32).sqrt();
        let q = self.shape(&self.project(&self.linear_query, query)) / scale;

        let mut context = Array4::zeros((batch, self.head_count, q_len, self.dim_per_head));
        let mut top_attn = Array3::zeros((batch, q_len, k_len));

        for b in 0..batch {
            let head_mask = mask.map(|m| m.index_axis(Axis(0), b).to_owned());
            for h in 0..self.head_count {
                let scores = q.slice(s![b, h, .., ..]).dot(&k.slice(s![b, h, .., ..]).t());
                let attn = scores.masked_softmax(head_mask.as_ref());
                if h == 0 {
                    top_attn.index_axis_mut(Axis(0), b).assign(&attn);
                }
                let drop_attn = self.dropout.forward(&attn);
                context
                    .slice_mut(s![b, h, .., ..])
                    .assign(&drop_attn.dot(&v.slice(s![b, h, .., ..])));
            }
        }

        let output = self.project(&self.final_linear, &self.unshape(&context));
        (output, top_attn)
    }
}

/// 沿位置维（axis 2）追加
fn append_positions(old: &Array4<f32>, new: &Array4<f32>) -> Array4<f32> {
    ndarray::concatenate(Axis(2), &[old.view(), new.view()])
        .expect("cached and new keys must share batch and head layout")
}

//! Average Attention Network
//!
//! 用累积平均代替 decoder 的 self-attention：位置 i 的输出是前 i+1 个输入的平均，
//! 经过 FFN 后与原输入做门控融合。
//!
//! ```text
//! avg_i  = (1 / (i+1)) Σ_{j≤i} x_j
//! a_i    = FFN(avg_i)
//! [i, f] = W_g [x_i; a_i]
//! out_i  = σ(i) ⊙ x_i + σ(f) ⊙ a_i
//! ```
//!
//! 增量解码时只需保存上一步的平均值：`avg_t = (x_t + t · avg_{t-1}) / (t + 1)`。

use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;

use crate::autograd::{TensorOp, Var};
use crate::layers::{Linear, PositionwiseFeedForward};
use crate::tensor::sigmoid;

/// 增量解码缓存
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageCache {
    /// 上一步的累积平均 [batch, 1, dim]
    pub prev_g: Option<Var>,
    /// 已处理的位置数
    pub steps: usize,
}

impl AverageCache {
    pub fn detach(&mut self) {
        if let Some(g) = &mut self.prev_g {
            g.detach();
        }
    }
}

#[derive(Debug, Clone)]
pub struct AverageAttention {
    model_dim: usize,
    average_layer: PositionwiseFeedForward,
    gating_layer: Linear,
}

impl AverageAttention {
    pub fn new(model_dim: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            model_dim,
            average_layer: PositionwiseFeedForward::new(model_dim, model_dim, dropout, rng),
            gating_layer: Linear::new(model_dim * 2, model_dim * 2, true, rng),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.average_layer.set_training(training);
    }

    /// 累积平均矩阵 [len, len]：下三角，第 i 行为 1/(i+1)
    pub fn cumulative_average_mask(len: usize) -> Array2<f32> {
        Array2::from_shape_fn((len, len), |(i, j)| if j <= i { 1.0 / (i + 1) as f32 } else { 0.0 })
    }

    /// 整段前向传播
    ///
    /// 输入 [batch, len, dim]，返回 (门控输出, 平均输出)，形状相同。
    pub fn forward(&mut self, inputs: &Array3<f32>) -> (Array3<f32>, Array3<f32>) {
        let (batch, len, dim) = inputs.dim();
        assert_eq!(dim, self.model_dim, "expected model dim {}, got {}", self.model_dim, dim);

        let mask = Self::cumulative_average_mask(len);
        let mut average = Array3::zeros((batch, len, dim));
        for b in 0..batch {
            average
                .index_axis_mut(Axis(0), b)
                .assign(&mask.dot(&inputs.index_axis(Axis(0), b)));
        }

        self.gate(inputs, average)
    }

    /// 增量前向传播，输入 [batch, len, dim]，逐位置更新缓存
    pub fn forward_cached(&mut self, inputs: &Array3<f32>, cache: &mut AverageCache) -> (Array3<f32>, Array3<f32>) {
        let (batch, len, dim) = inputs.dim();
        assert_eq!(dim, self.model_dim, "expected model dim {}, got {}", self.model_dim, dim);
        let requires_grad = self.average_layer.is_training();

        let mut average = Array3::zeros((batch, len, dim));
        for t in 0..len {
            let x = inputs.slice(s![.., t..t + 1, ..]);
            let step = cache.steps as f32;
            let g = match &cache.prev_g {
                Some(prev) => {
                    assert_eq!(prev.data.dim(), (batch, 1, dim), "average cache batch mismatch");
                    (&x + &(&prev.data * step)) / (step + 1.0)
                }
                None => x.to_owned(),
            };
            average.slice_mut(s![.., t..t + 1, ..]).assign(&g);
            cache.prev_g = Some(Var::computed(g, TensorOp::Attention, requires_grad));
            cache.steps += 1;
        }

        self.gate(inputs, average)
    }

    fn gate(&mut self, inputs: &Array3<f32>, average: Array3<f32>) -> (Array3<f32>, Array3<f32>) {
        let average = self.average_layer.forward_seq(&average);
        let joined = ndarray::concatenate(Axis(2), &[inputs.view(), average.view()])
            .expect("inputs and averages share batch and length");
        let gates = self.gating_layer.forward_seq(&joined);

        let dim = self.model_dim;
        let input_gate = gates.slice(s![.., .., ..dim]).mapv(sigmoid);
        let forget_gate = gates.slice(s![.., .., dim..]).mapv(sigmoid);
        let output = &input_gate * inputs + &forget_gate * &average;
        (output, average)
    }

    pub fn param_count(&self) -> usize {
        self.average_layer.param_count() + self.gating_layer.param_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn input(batch: usize, len: usize, dim: usize) -> Array3<f32> {
        Array3::from_shape_fn((batch, len, dim), |(b, t, k)| ((b * 7 + t * 3 + k) % 5) as f32 * 0.3 - 0.5)
    }

    #[test]
    fn test_cumulative_average_mask() {
        let mask = AverageAttention::cumulative_average_mask(3);

        assert_abs_diff_eq!(mask[[0, 0]], 1.0);
        assert_abs_diff_eq!(mask[[1, 0]], 0.5);
        assert_abs_diff_eq!(mask[[2, 2]], 1.0 / 3.0);
        assert_eq!(mask[[0, 1]], 0.0);
        for i in 0..3 {
            assert_abs_diff_eq!(mask.row(i).sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_incremental_matches_full() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut attn = AverageAttention::new(4, 0.0, &mut rng);
        let x = input(2, 5, 4);

        let (full, full_avg) = attn.forward(&x);

        let mut cache = AverageCache::default();
        for t in 0..5 {
            let (out, avg) = attn.forward_cached(&x.slice(s![.., t..t + 1, ..]).to_owned(), &mut cache);
            for b in 0..2 {
                for k in 0..4 {
                    assert_abs_diff_eq!(out[[b, 0, k]], full[[b, t, k]], epsilon = 1e-5);
                    assert_abs_diff_eq!(avg[[b, 0, k]], full_avg[[b, t, k]], epsilon = 1e-5);
                }
            }
        }
        assert_eq!(cache.steps, 5);
    }

    #[test]
    fn test_cache_detach() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut attn = AverageAttention::new(4, 0.0, &mut rng);
        attn.set_training(true);
        let mut cache = AverageCache::default();

        attn.forward_cached(&input(1, 1, 4), &mut cache);
        assert!(!cache.prev_g.as_ref().map_or(true, |g| g.is_leaf()));

        cache.detach();
        assert!(cache.prev_g.as_ref().map_or(false, |g| g.is_leaf()));
    }
}

//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现 Seq2Seq 所需的张量操作。
//!
//! 约定：序列张量统一为 time-major 的 `[len, batch, dim]`，
//! 单步张量为 `[batch, dim]`，掩码中 `true` 表示该位置被屏蔽。

use ndarray::{Array2, Array3, Axis, Zip};
use num_traits::Float;
use rand::Rng;

/// 被屏蔽的 logit 在 softmax 之前被替换成的大负数
pub const MASK_FILL: f32 = -1e18;

/// 张量扩展 trait
pub trait TensorExt<T> {
    /// 创建随机张量（Xavier 初始化，使用调用方提供的随机源）
    fn random_xavier<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<T>;

    /// 矩阵乘法
    fn matmul(&self, other: &Array2<T>) -> Array2<T>;

    /// 沿指定维度拼接
    fn concat(&self, other: &Array2<T>, axis: usize) -> Array2<T>;

    /// 应用 softmax
    fn softmax(&self, axis: usize) -> Array2<T>;

    /// 带掩码的行 softmax
    ///
    /// 被屏蔽位置先填充 [`MASK_FILL`] 再归一化，而不是归一化后置零，
    /// 这样每一行仍然是合法的概率分布。整行都被屏蔽时结果退化为均匀分布。
    fn masked_softmax(&self, mask: Option<&Array2<bool>>) -> Array2<T>;

    /// 层归一化
    fn layer_norm(&self, gamma: &Array2<T>, beta: &Array2<T>, eps: T) -> Array2<T>;

    /// ReLU 激活函数
    fn relu(&self) -> Array2<T>;

    /// Sigmoid 激活函数
    fn sigmoid(&self) -> Array2<T>;

    /// Tanh 激活函数
    fn tanh(&self) -> Array2<T>;
}

/// 为 f32 实现张量扩展
impl TensorExt<f32> for Array2<f32> {
    fn random_xavier<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
        let limit = (6.0 / (shape.0 + shape.1).max(1) as f32).sqrt();

        Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..=limit))
    }

    fn matmul(&self, other: &Array2<f32>) -> Array2<f32> {
        self.dot(other)
    }

    fn concat(&self, other: &Array2<f32>, axis: usize) -> Array2<f32> {
        ndarray::concatenate(Axis(axis), &[self.view(), other.view()])
            .expect("Concatenate dimension mismatch")
    }

    fn softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(axis));

        let exp = (self - &max_view).mapv(f32::exp);
        let sum = exp.sum_axis(Axis(axis));
        let sum_view = sum.insert_axis(Axis(axis));

        exp / sum_view
    }

    fn masked_softmax(&self, mask: Option<&Array2<bool>>) -> Array2<f32> {
        match mask {
            None => self.softmax(1),
            Some(m) => {
                assert_eq!(self.dim(), m.dim(), "mask shape must match scores shape");
                let mut scores = self.clone();
                Zip::from(&mut scores).and(m).for_each(|s, &masked| {
                    if masked {
                        *s = MASK_FILL;
                    }
                });
                scores.softmax(1)
            }
        }
    }

    fn layer_norm(&self, gamma: &Array2<f32>, beta: &Array2<f32>, eps: f32) -> Array2<f32> {
        let d = self.ncols().max(1) as f32;
        let mean = self.sum_axis(Axis(1)) / d;
        let mean_view = mean.insert_axis(Axis(1));

        let centered = self - &mean_view;
        let var = centered.mapv(|x| x * x).sum_axis(Axis(1)) / d;
        let std = var.insert_axis(Axis(1)).mapv(|v| (v + eps).sqrt());

        &centered / &std * gamma + beta
    }

    fn relu(&self) -> Array2<f32> {
        self.mapv(|x| x.max(0.0))
    }

    fn sigmoid(&self) -> Array2<f32> {
        self.mapv(sigmoid)
    }

    fn tanh(&self) -> Array2<f32> {
        self.mapv(f32::tanh)
    }
}

/// 标量 sigmoid
pub fn sigmoid<T: Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

/// `[len, batch, dim]` → `[len * batch, dim]`
pub fn flatten_time(x: &Array3<f32>) -> Array2<f32> {
    let (len, batch, dim) = x.dim();
    Array2::from_shape_fn((len * batch, dim), |(r, k)| x[[r / batch, r % batch, k]])
}

/// `[len * batch, dim]` → `[len, batch, dim]`
pub fn unflatten_time(x: &Array2<f32>, len: usize, batch: usize) -> Array3<f32> {
    assert_eq!(x.nrows(), len * batch, "cannot unflatten {} rows into {}x{}", x.nrows(), len, batch);
    Array3::from_shape_fn((len, batch, x.ncols()), |(t, b, k)| x[[t * batch + b, k]])
}

/// 把逐步输出 `[batch, dim] × len` 堆叠成 `[len, batch, dim]`
pub fn stack_steps(steps: &[Array2<f32>]) -> Array3<f32> {
    let (batch, dim) = steps.first().map(|s| s.dim()).unwrap_or((0, 0));
    Array3::from_shape_fn((steps.len(), batch, dim), |(t, b, k)| steps[t][[b, k]])
}

/// 因果掩码：第 i 个 query 只能看到 key 位置 `j <= offset + i`
///
/// 根据当前长度动态生成，没有最大长度限制。
pub fn causal_mask(q_len: usize, k_len: usize, offset: usize) -> Array2<bool> {
    Array2::from_shape_fn((q_len, k_len), |(i, j)| j > offset + i)
}

/// 长度掩码：`[batch, max_len]`，超出长度的位置为 `true`
pub fn sequence_mask(lengths: &[usize], max_len: usize) -> Array2<bool> {
    Array2::from_shape_fn((lengths.len(), max_len), |(b, t)| t >= lengths[b])
}

/// 填充掩码：根据主特征（slot 0）是否等于 padding id 生成 `[batch, len]`
pub fn padding_mask(tokens: &Array3<usize>, padding_idx: usize) -> Array2<bool> {
    let (len, batch, _) = tokens.dim();
    Array2::from_shape_fn((batch, len), |(b, t)| tokens[[t, b, 0]] == padding_idx)
}

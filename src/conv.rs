//! 门控卷积
//!
//! CNN 编码器使用的卷积栈。每层是沿时间轴的一维卷积，输出通道数为输入的两倍，
//! 一半作为输出，一半作为门（GLU）：
//!
//! ```text
//! [o; g] = Conv(Dropout(x))
//! glu(x) = o ⊙ σ(g)
//! x'     = (x + glu(x)) · √0.5
//! ```
//!
//! 两端各补 `width / 2` 个零，输出长度与输入相同。

use ndarray::{s, Array3};
use rand::rngs::StdRng;
use rand::Rng;

use crate::layers::{Dropout, Linear};
use crate::tensor::{flatten_time, sigmoid, unflatten_time};

/// 残差缩放系数
const SCALE_WEIGHT: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// 单层门控卷积
#[derive(Debug, Clone)]
pub struct GatedConv {
    width: usize,
    dim: usize,
    /// 展开后的卷积核: [width * dim, 2 * dim]
    conv: Linear,
    dropout: Dropout,
}

impl GatedConv {
    pub fn new(dim: usize, width: usize, dropout: f32, rng: &mut StdRng) -> Self {
        assert!(width > 0, "kernel width must be positive");
        Self {
            width,
            dim,
            conv: Linear::new(width * dim, 2 * dim, true, rng),
            dropout: Dropout::new(dropout, rng.gen()),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// 输入输出均为 [len, batch, dim]
    pub fn forward(&mut self, x: &Array3<f32>) -> Array3<f32> {
        let (len, batch, dim) = x.dim();
        assert_eq!(dim, self.dim, "convolution built for dim {}, got {}", self.dim, dim);
        let x = self.dropout.forward(x);

        // 把每个输出位置的感受野展开成一行
        let pad = self.width / 2;
        let windows = Array3::from_shape_fn((len, batch, self.width * dim), |(t, b, k)| {
            let (offset, channel) = (k / dim, k % dim);
            match (t + offset).checked_sub(pad) {
                Some(src) if src < len => x[[src, b, channel]],
                _ => 0.0,
            }
        });

        let conv = unflatten_time(&self.conv.forward(&flatten_time(&windows)), len, batch);
        let out = conv.slice(s![.., .., ..dim]);
        let gate = conv.slice(s![.., .., dim..]).mapv(sigmoid);
        &out * &gate
    }

    pub fn param_count(&self) -> usize {
        self.conv.param_count()
    }
}

/// 多层门控卷积，带残差和缩放
#[derive(Debug, Clone)]
pub struct StackedCnn {
    layers: Vec<GatedConv>,
}

impl StackedCnn {
    pub fn new(num_layers: usize, dim: usize, width: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            layers: (0..num_layers).map(|_| GatedConv::new(dim, width, dropout, rng)).collect(),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub fn forward(&mut self, x: &Array3<f32>) -> Array3<f32> {
        let mut x = x.clone();
        for layer in &mut self.layers {
            x = (&x + &layer.forward(&x)) * SCALE_WEIGHT;
        }
        x
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|l| l.param_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;

    fn input(len: usize, batch: usize, dim: usize) -> Array3<f32> {
        Array3::from_shape_fn((len, batch, dim), |(t, b, k)| ((t * 3 + b + k * 2) % 7) as f32 * 0.2 - 0.6)
    }

    /// 逐位置手算卷积
    fn naive_conv(conv: &GatedConv, x: &Array3<f32>, t: usize, b: usize) -> Array2<f32> {
        let (len, _, dim) = x.dim();
        let pad = conv.width / 2;
        let mut row = Array2::zeros((1, conv.width * dim));
        for j in 0..conv.width {
            let src = t as isize + j as isize - pad as isize;
            if src >= 0 && (src as usize) < len {
                row.slice_mut(s![0, j * dim..(j + 1) * dim])
                    .assign(&x.slice(s![src as usize, b, ..]));
            }
        }
        conv.conv.forward(&row)
    }

    #[test]
    fn test_length_is_preserved_for_odd_and_even_widths() {
        for width in [1, 2, 3, 4] {
            let mut rng = StdRng::seed_from_u64(0);
            let mut cnn = StackedCnn::new(2, 6, width, 0.0, &mut rng);

            let out = cnn.forward(&input(5, 2, 6));

            assert_eq!(out.shape(), &[5, 2, 6], "width {}", width);
        }
    }

    #[test]
    fn test_gated_conv_matches_direct_computation() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = GatedConv::new(3, 3, 0.0, &mut rng);
        let x = input(4, 1, 3);

        let out = conv.forward(&x);

        for t in 0..4 {
            let raw = naive_conv(&conv, &x, t, 0);
            for k in 0..3 {
                let expected = raw[[0, k]] * sigmoid(raw[[0, k + 3]]);
                assert!((out[[t, 0, k]] - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_batch_elements_are_independent() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut cnn = StackedCnn::new(1, 4, 3, 0.0, &mut rng);
        let x = input(3, 2, 4);

        let both = cnn.forward(&x);
        let first = cnn.forward(&x.slice(s![.., 0..1, ..]).to_owned());

        for t in 0..3 {
            for k in 0..4 {
                assert!((both[[t, 0, k]] - first[[t, 0, k]]).abs() < 1e-6);
            }
        }
    }
}

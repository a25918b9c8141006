//! 基础层
//!
//! 包含 Linear、Layer Normalization、Dropout 和 Position-wise Feed-Forward。

use ndarray::{Array, Array2, Array3, Dimension};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tensor::{flatten_time, unflatten_time, TensorExt};

/// 线性层
///
/// ```text
/// y = xW + b
/// ```
#[derive(Debug, Clone)]
pub struct Linear {
    /// 权重: [in_features, out_features]
    weight: Array2<f32>,
    /// 偏置: [1, out_features]
    bias: Option<Array2<f32>>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        Self {
            weight: Array2::<f32>::random_xavier((in_features, out_features), rng),
            bias: bias.then(|| Array2::zeros((1, out_features))),
        }
    }

    /// 用给定的权重构建（测试或外部加载权重时使用）
    pub fn from_weights(weight: Array2<f32>, bias: Option<Array2<f32>>) -> Self {
        if let Some(b) = &bias {
            assert_eq!(b.dim(), (1, weight.ncols()), "bias must be [1, out_features]");
        }
        Self { weight, bias }
    }

    /// 前向传播
    ///
    /// 输入: [rows, in_features]
    /// 输出: [rows, out_features]
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        assert_eq!(
            x.ncols(),
            self.weight.nrows(),
            "Linear expects {} input features, got {}",
            self.weight.nrows(),
            x.ncols()
        );
        let output = x.matmul(&self.weight);
        match &self.bias {
            Some(b) => output + b,
            None => output,
        }
    }

    /// 对 `[len, batch, in]` 逐位置应用
    pub fn forward_seq(&self, x: &Array3<f32>) -> Array3<f32> {
        let (len, batch, _) = x.dim();
        unflatten_time(&self.forward(&flatten_time(x)), len, batch)
    }

    /// 获取参数数量
    pub fn param_count(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }
}

/// Layer Normalization
///
/// ```text
/// y = γ * ((x - μ) / √(σ² + ε)) + β
/// ```
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// 缩放参数 [1, d_model]
    gamma: Array2<f32>,
    /// 平移参数 [1, d_model]
    beta: Array2<f32>,
    /// 防止除零的小常数
    eps: f32,
}

impl LayerNorm {
    /// 创建新的 Layer Norm 层（γ = 1，β = 0，ε 默认 1e-6）
    pub fn new(d_model: usize, eps: Option<f32>) -> Self {
        Self {
            gamma: Array2::ones((1, d_model)),
            beta: Array2::zeros((1, d_model)),
            eps: eps.unwrap_or(1e-6),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.layer_norm(&self.gamma, &self.beta, self.eps)
    }

    pub fn forward_seq(&self, x: &Array3<f32>) -> Array3<f32> {
        let (len, batch, _) = x.dim();
        unflatten_time(&self.forward(&flatten_time(x)), len, batch)
    }

    pub fn param_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }
}

/// Dropout 层
///
/// 随机源由构造时的种子决定：同样的种子、同样的输入序列会得到同样的掩码。
/// 推理模式或 `p == 0` 时为恒等映射。
#[derive(Debug, Clone)]
pub struct Dropout {
    dropout_prob: f32,
    training: bool,
    rng: StdRng,
}

impl Dropout {
    pub fn new(dropout_prob: f32, seed: u64) -> Self {
        assert!(
            (0.0..1.0).contains(&dropout_prob),
            "dropout probability must be in [0, 1)"
        );
        Self {
            dropout_prob,
            training: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// 前向传播
    ///
    /// 训练时按概率丢弃并缩放 `1 / (1 - p)` 以保持期望值。
    pub fn forward<D: Dimension>(&mut self, x: &Array<f32, D>) -> Array<f32, D> {
        if !self.training || self.dropout_prob == 0.0 {
            return x.clone();
        }

        let p = self.dropout_prob;
        let rng = &mut self.rng;
        x.mapv(|v| if rng.gen::<f32>() < p { 0.0 } else { v / (1.0 - p) })
    }
}

/// Position-wise Feed-Forward Network
///
/// ```text
/// FFN(x) = x + Dropout(W2 · Dropout(ReLU(W1 · LayerNorm(x))))
/// ```
///
/// 自带 pre-norm 和残差连接。
#[derive(Debug, Clone)]
pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
    layer_norm: LayerNorm,
    dropout_1: Dropout,
    dropout_2: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(d_model: usize, d_ff: usize, dropout: f32, rng: &mut StdRng) -> Self {
        Self {
            w_1: Linear::new(d_model, d_ff, true, rng),
            w_2: Linear::new(d_ff, d_model, true, rng),
            layer_norm: LayerNorm::new(d_model, None),
            dropout_1: Dropout::new(dropout, rng.gen()),
            dropout_2: Dropout::new(dropout, rng.gen()),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout_1.set_training(training);
        self.dropout_2.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.dropout_1.is_training()
    }

    /// 输入: [rows, d_model]
    pub fn forward(&mut self, x: &Array2<f32>) -> Array2<f32> {
        let inter = self.w_1.forward(&self.layer_norm.forward(x)).relu();
        let inter = self.dropout_1.forward(&inter);
        let output = self.dropout_2.forward(&self.w_2.forward(&inter));
        output + x
    }

    /// 输入: [len, batch, d_model]
    pub fn forward_seq(&mut self, x: &Array3<f32>) -> Array3<f32> {
        let (len, batch, _) = x.dim();
        unflatten_time(&self.forward(&flatten_time(x)), len, batch)
    }

    pub fn param_count(&self) -> usize {
        self.w_1.param_count() + self.w_2.param_count() + self.layer_norm.param_count()
    }
}

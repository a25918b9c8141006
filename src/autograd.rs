//! 计算图标记
//!
//! 本 crate 只实现前向计算，但解码状态里的张量在训练模式下仍然"挂在"
//! 生成它们的计算上：增量解码时，上一步的状态会被下一步继续使用。
//! [`Var`] 记录每个状态张量的来源，[`Var::detach`] 把它截断成叶子节点，
//! 避免梯度历史在解码步之间无限延长。

use ndarray::{Array, Dimension, Ix3};

/// 计算图节点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorOp {
    /// 叶子节点（常量或已截断）
    Leaf,
    /// 编码器输出
    Encode,
    /// 循环网络的一步或一段
    Recurrent,
    /// 注意力计算
    Attention,
    /// Key / Value 投影
    Projection,
    /// 层归一化后的层输入（replay 模式记录的历史）
    LayerInput,
}

/// 带计算图标记的张量
#[derive(Debug, Clone, PartialEq)]
pub struct Var<D: Dimension = Ix3> {
    /// 数据
    pub data: Array<f32, D>,
    /// 生成此变量的操作
    pub op: TensorOp,
    /// 是否需要计算梯度
    pub requires_grad: bool,
}

impl<D: Dimension> Var<D> {
    /// 创建不需要梯度的常量
    pub fn constant(data: Array<f32, D>) -> Self {
        Self {
            data,
            op: TensorOp::Leaf,
            requires_grad: false,
        }
    }

    /// 创建由某个操作产生的变量
    ///
    /// 推理模式（`requires_grad == false`）下直接记为叶子。
    pub fn computed(data: Array<f32, D>, op: TensorOp, requires_grad: bool) -> Self {
        Self {
            data,
            op: if requires_grad { op } else { TensorOp::Leaf },
            requires_grad,
        }
    }

    /// 截断计算图，变为叶子节点
    pub fn detach(&mut self) {
        self.op = TensorOp::Leaf;
        self.requires_grad = false;
    }

    /// 是否为叶子节点
    pub fn is_leaf(&self) -> bool {
        self.op == TensorOp::Leaf && !self.requires_grad
    }

    /// 对数据做变换（例如 beam 重排），保留计算图标记
    pub fn map_data<F>(&self, f: F) -> Self
    where
        F: FnOnce(&Array<f32, D>) -> Array<f32, D>,
    {
        Self {
            data: f(&self.data),
            op: self.op,
            requires_grad: self.requires_grad,
        }
    }
}

//! 循环网络
//!
//! - [`RnnCell`]：单个 LSTM / GRU 单元
//! - [`StackedRnn`]：多层单元，逐步调用（input feeding 解码器使用）
//! - [`Rnn`]：多层、可双向、按长度 pack 的整段循环网络（编码器与标准解码器使用）

use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::RnnType;
use crate::layers::{Dropout, Linear};
use crate::tensor::{sigmoid, TensorExt};

/// 循环网络隐状态，每个张量形状为 `[layers * directions, batch, hidden]`
#[derive(Debug, Clone, PartialEq)]
pub enum RnnHidden {
    /// (h, c)
    Lstm(Array3<f32>, Array3<f32>),
    /// h
    Gru(Array3<f32>),
}

impl RnnHidden {
    pub fn zeros(rnn_type: RnnType, layers: usize, batch: usize, hidden_size: usize) -> Self {
        let z = Array3::zeros((layers, batch, hidden_size));
        match rnn_type {
            RnnType::Lstm => RnnHidden::Lstm(z.clone(), z),
            RnnType::Gru => RnnHidden::Gru(z),
        }
    }

    pub fn rnn_type(&self) -> RnnType {
        match self {
            RnnHidden::Lstm(..) => RnnType::Lstm,
            RnnHidden::Gru(_) => RnnType::Gru,
        }
    }

    /// 所有张量（LSTM 为 h、c，GRU 为 h）
    pub fn tensors(&self) -> Vec<&Array3<f32>> {
        match self {
            RnnHidden::Lstm(h, c) => vec![h, c],
            RnnHidden::Gru(h) => vec![h],
        }
    }

    /// 由张量列表重建，顺序与 [`RnnHidden::tensors`] 一致
    pub fn from_tensors(rnn_type: RnnType, tensors: Vec<Array3<f32>>) -> Self {
        let mut it = tensors.into_iter();
        match (rnn_type, it.next(), it.next(), it.next()) {
            (RnnType::Lstm, Some(h), Some(c), None) => RnnHidden::Lstm(h, c),
            (RnnType::Gru, Some(h), None, None) => RnnHidden::Gru(h),
            _ => panic!("hidden tensors do not match the {:?} cell layout", rnn_type),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.tensors()[0].len_of(Axis(1))
    }

    fn layer(&self, i: usize) -> (Array2<f32>, Option<Array2<f32>>) {
        match self {
            RnnHidden::Lstm(h, c) => (
                h.index_axis(Axis(0), i).to_owned(),
                Some(c.index_axis(Axis(0), i).to_owned()),
            ),
            RnnHidden::Gru(h) => (h.index_axis(Axis(0), i).to_owned(), None),
        }
    }

    fn from_layers(hs: Vec<Array2<f32>>, cs: Vec<Option<Array2<f32>>>) -> Self {
        let h = stack_layers(&hs);
        match cs.into_iter().collect::<Option<Vec<_>>>() {
            Some(cs) if !cs.is_empty() => RnnHidden::Lstm(h, stack_layers(&cs)),
            _ => RnnHidden::Gru(h),
        }
    }
}

fn stack_layers(layers: &[Array2<f32>]) -> Array3<f32> {
    let (batch, dim) = layers.first().map(|l| l.dim()).unwrap_or((0, 0));
    Array3::from_shape_fn((layers.len(), batch, dim), |(l, b, k)| layers[l][[b, k]])
}

/// LSTM 单元（门顺序 i, f, g, o）
#[derive(Debug, Clone)]
pub struct LstmCell {
    w_ih: Linear,
    w_hh: Linear,
    hidden_size: usize,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        Self {
            w_ih: Linear::new(input_size, 4 * hidden_size, true, rng),
            w_hh: Linear::new(hidden_size, 4 * hidden_size, true, rng),
            hidden_size,
        }
    }

    pub fn step(&self, x: &Array2<f32>, h: &Array2<f32>, c: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let gates = self.w_ih.forward(x) + self.w_hh.forward(h);
        let n = self.hidden_size;
        let i = gates.slice(s![.., 0..n]).mapv(sigmoid);
        let f = gates.slice(s![.., n..2 * n]).mapv(sigmoid);
        let g = gates.slice(s![.., 2 * n..3 * n]).mapv(f32::tanh);
        let o = gates.slice(s![.., 3 * n..4 * n]).mapv(sigmoid);

        let c_next = f * c + i * g;
        let h_next = o * c_next.mapv(f32::tanh);
        (h_next, c_next)
    }
}

/// GRU 单元（门顺序 r, z, n）
#[derive(Debug, Clone)]
pub struct GruCell {
    w_ih: Linear,
    w_hh: Linear,
    hidden_size: usize,
}

impl GruCell {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        Self {
            w_ih: Linear::new(input_size, 3 * hidden_size, true, rng),
            w_hh: Linear::new(hidden_size, 3 * hidden_size, true, rng),
            hidden_size,
        }
    }

    pub fn step(&self, x: &Array2<f32>, h: &Array2<f32>) -> Array2<f32> {
        let gi = self.w_ih.forward(x);
        let gh = self.w_hh.forward(h);
        let n = self.hidden_size;

        let r = (&gi.slice(s![.., 0..n]) + &gh.slice(s![.., 0..n])).sigmoid();
        let z = (&gi.slice(s![.., n..2 * n]) + &gh.slice(s![.., n..2 * n])).sigmoid();
        let candidate = (&gi.slice(s![.., 2 * n..]) + &(&r * &gh.slice(s![.., 2 * n..]))).tanh();

        (1.0 - &z) * candidate + z * h
    }
}

/// LSTM 或 GRU 单元
#[derive(Debug, Clone)]
pub enum RnnCell {
    Lstm(LstmCell),
    Gru(GruCell),
}

impl RnnCell {
    pub fn new(rnn_type: RnnType, input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        match rnn_type {
            RnnType::Lstm => RnnCell::Lstm(LstmCell::new(input_size, hidden_size, rng)),
            RnnType::Gru => RnnCell::Gru(GruCell::new(input_size, hidden_size, rng)),
        }
    }

    /// 单步计算，`c` 仅对 LSTM 有意义
    pub fn step(
        &self,
        x: &Array2<f32>,
        h: &Array2<f32>,
        c: Option<&Array2<f32>>,
    ) -> (Array2<f32>, Option<Array2<f32>>) {
        match self {
            RnnCell::Lstm(cell) => {
                let zero;
                let c = match c {
                    Some(c) => c,
                    None => {
                        zero = Array2::zeros(h.dim());
                        &zero
                    }
                };
                let (h, c) = cell.step(x, h, c);
                (h, Some(c))
            }
            RnnCell::Gru(cell) => (cell.step(x, h), None),
        }
    }
}

/// 多层循环单元，逐步调用
///
/// 层与层之间应用 dropout（最后一层输出不做）。
#[derive(Debug, Clone)]
pub struct StackedRnn {
    layers: Vec<RnnCell>,
    dropout: Dropout,
    rnn_type: RnnType,
}

impl StackedRnn {
    pub fn new(
        rnn_type: RnnType,
        num_layers: usize,
        input_size: usize,
        hidden_size: usize,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|i| {
                let in_size = if i == 0 { input_size } else { hidden_size };
                RnnCell::new(rnn_type, in_size, hidden_size, rng)
            })
            .collect();
        Self {
            layers,
            dropout: Dropout::new(dropout, rng.gen()),
            rnn_type,
        }
    }

    pub fn rnn_type(&self) -> RnnType {
        self.rnn_type
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// 输入: x [batch, input_size]，hidden [layers, batch, hidden]
    ///
    /// 返回: (最后一层输出 [batch, hidden], 新隐状态)
    pub fn step(&mut self, x: &Array2<f32>, hidden: &RnnHidden) -> (Array2<f32>, RnnHidden) {
        assert_eq!(
            hidden.rnn_type(),
            self.rnn_type,
            "hidden state cell type does not match the stacked cell"
        );
        let mut input = x.clone();
        let mut hs = Vec::with_capacity(self.layers.len());
        let mut cs = Vec::with_capacity(self.layers.len());

        for (i, cell) in self.layers.iter().enumerate() {
            let (h_0, c_0) = hidden.layer(i);
            let (h_1, c_1) = cell.step(&input, &h_0, c_0.as_ref());
            input = h_1.clone();
            if i + 1 != self.layers.len() {
                input = self.dropout.forward(&input);
            }
            hs.push(h_1);
            cs.push(c_1);
        }

        (input, RnnHidden::from_layers(hs, cs))
    }
}

/// 多层（可双向）循环网络，整段处理
#[derive(Debug, Clone)]
pub struct Rnn {
    /// [layer][direction]
    layers: Vec<Vec<RnnCell>>,
    dropout: Dropout,
    rnn_type: RnnType,
    hidden_size: usize,
}

impl Rnn {
    pub fn new(
        rnn_type: RnnType,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        dropout: f32,
        rng: &mut StdRng,
    ) -> Self {
        let directions = if bidirectional { 2 } else { 1 };
        let layers = (0..num_layers)
            .map(|i| {
                let in_size = if i == 0 { input_size } else { hidden_size * directions };
                (0..directions)
                    .map(|_| RnnCell::new(rnn_type, in_size, hidden_size, rng))
                    .collect()
            })
            .collect();
        Self {
            layers,
            dropout: Dropout::new(dropout, rng.gen()),
            rnn_type,
            hidden_size,
        }
    }

    pub fn num_directions(&self) -> usize {
        self.layers.first().map_or(1, |l| l.len())
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn rnn_type(&self) -> RnnType {
        self.rnn_type
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `x`: [len, batch, input_size]
    /// - `lengths`: 每个样本的有效长度；给出时超出长度的步不参与计算（pack），
    ///   对应输出为零，最终隐状态取自各自最后一个有效步
    /// - `hidden`: 初始隐状态 [layers * directions, batch, hidden]，缺省为零
    ///
    /// # 返回
    /// - 输出 [len, batch, directions * hidden]
    /// - 最终隐状态 [layers * directions, batch, hidden]
    pub fn forward(
        &mut self,
        x: &Array3<f32>,
        lengths: Option<&[usize]>,
        hidden: Option<&RnnHidden>,
    ) -> (Array3<f32>, RnnHidden) {
        let (len, batch, _) = x.dim();
        let lengths: Vec<usize> = match lengths {
            Some(l) => {
                assert_eq!(l.len(), batch, "lengths batch size mismatch");
                assert!(l.iter().all(|&n| n <= len), "length exceeds sequence length");
                l.to_vec()
            }
            None => vec![len; batch],
        };
        let directions = self.num_directions();
        let initial = match hidden {
            Some(h) => {
                assert_eq!(h.rnn_type(), self.rnn_type, "initial hidden cell type mismatch");
                h.clone()
            }
            None => RnnHidden::zeros(self.rnn_type, self.layers.len() * directions, batch, self.hidden_size),
        };

        let mut input = x.clone();
        let mut final_hs = Vec::new();
        let mut final_cs = Vec::new();
        let num_layers = self.layers.len();

        for (layer_idx, cells) in self.layers.iter().enumerate() {
            let mut layer_out = Array3::zeros((len, batch, directions * self.hidden_size));
            for (dir, cell) in cells.iter().enumerate() {
                let (h0, c0) = initial.layer(layer_idx * directions + dir);
                let (out, h, c) = run_direction(cell, &input, &lengths, h0, c0, dir == 1);
                let offset = dir * self.hidden_size;
                layer_out
                    .slice_mut(s![.., .., offset..offset + self.hidden_size])
                    .assign(&out);
                final_hs.push(h);
                final_cs.push(c);
            }
            input = if layer_idx + 1 != num_layers {
                self.dropout.forward(&layer_out)
            } else {
                layer_out
            };
        }

        (input, RnnHidden::from_layers(final_hs, final_cs))
    }
}

/// 单层单方向，按长度跳过 padding 步
fn run_direction(
    cell: &RnnCell,
    x: &Array3<f32>,
    lengths: &[usize],
    mut h: Array2<f32>,
    mut c: Option<Array2<f32>>,
    reverse: bool,
) -> (Array3<f32>, Array2<f32>, Option<Array2<f32>>) {
    let (len, batch, _) = x.dim();
    let hidden_size = h.ncols();
    let mut out = Array3::zeros((len, batch, hidden_size));

    let steps: Box<dyn Iterator<Item = usize>> = if reverse {
        Box::new((0..len).rev())
    } else {
        Box::new(0..len)
    };

    for t in steps {
        let x_t = x.index_axis(Axis(0), t).to_owned();
        let (h_new, c_new) = cell.step(&x_t, &h, c.as_ref());
        for b in (0..batch).filter(|&b| t < lengths[b]) {
            h.row_mut(b).assign(&h_new.row(b));
            if let (Some(c), Some(c_new)) = (c.as_mut(), c_new.as_ref()) {
                c.row_mut(b).assign(&c_new.row(b));
            }
            out.slice_mut(s![t, b, ..]).assign(&h_new.row(b));
        }
    }

    (out, h, c)
}

//! 解码器状态
//!
//! 一次解码（训练时的一整段 target，或推理时的一个 beam search）只对应一个状态。
//! 状态在每次 `forward` 中被移入并返回新的状态，不会被隐式共享。
//!
//! batch 维采用 beam-major 布局：
//!
//! ```text
//! row = beam * batch + sentence
//! ```
//!
//! 所有 beam 操作都归结为沿 batch 维的重新索引，见 [`DecoderState::map_batch_fn`]。

use ndarray::{Array, Array2, Array3, Axis, RemoveAxis};

use crate::autograd::{TensorOp, Var};
use crate::average_attention::AverageCache;
use crate::config::{RnnType, SelfAttnType};
use crate::multi_head_attention::KvCache;
use crate::rnn::RnnHidden;

/// 平铺：新 batch 下标 `copy * batch + b` 取自原下标 `b`
pub fn tile_indices(batch: usize, times: usize) -> Vec<usize> {
    (0..times).flat_map(|_| 0..batch).collect()
}

/// 对第 `idx` 个句子的 beam 按 `positions` 重排，其余行不变
///
/// 把 batch 维看成 `[beam_size, rows / beam_size]`，
/// 新的第 j 个 beam 取自旧的第 `positions[j]` 个 beam。
pub fn beam_indices(rows: usize, idx: usize, positions: &[usize], beam_size: usize) -> Vec<usize> {
    assert!(beam_size > 0, "beam size must be positive");
    assert_eq!(rows % beam_size, 0, "batch size {} is not a multiple of beam size {}", rows, beam_size);
    assert_eq!(positions.len(), beam_size, "expected one position per beam");
    let batch = rows / beam_size;
    assert!(idx < batch, "sentence index {} out of range for batch {}", idx, batch);
    assert!(positions.iter().all(|&p| p < beam_size), "beam position out of range");

    let mut indices: Vec<usize> = (0..rows).collect();
    for (j, &p) in positions.iter().enumerate() {
        indices[j * batch + idx] = p * batch + idx;
    }
    indices
}

fn select_var<D: RemoveAxis>(v: &Var<D>, axis: usize, indices: &[usize]) -> Var<D> {
    v.map_data(|d| d.select(Axis(axis), indices))
}

fn check_rows(rows: usize, indices: &[usize]) {
    assert!(
        indices.iter().all(|&i| i < rows),
        "batch index out of range for batch of {}",
        rows
    );
}

/// RNN 解码器状态
///
/// - `hidden`: LSTM 为 (h, c)，GRU 为 h，每个 [layers, batch, hidden]
/// - `input_feed`: 上一步输出 [1, batch, hidden]，初始为零
/// - `coverage`: 累积注意力 [1, batch, src_len]
#[derive(Debug, Clone, PartialEq)]
pub struct RnnDecoderState {
    rnn_type: RnnType,
    pub hidden: Vec<Var>,
    pub input_feed: Var,
    pub coverage: Option<Var>,
}

impl RnnDecoderState {
    pub fn new(hidden: RnnHidden, hidden_size: usize) -> Self {
        let batch = hidden.batch_size();
        let rnn_type = hidden.rnn_type();
        Self {
            rnn_type,
            hidden: hidden.tensors().into_iter().map(|h| Var::constant(h.clone())).collect(),
            input_feed: Var::constant(Array3::zeros((1, batch, hidden_size))),
            coverage: None,
        }
    }

    pub fn rnn_type(&self) -> RnnType {
        self.rnn_type
    }

    pub fn batch_size(&self) -> usize {
        self.input_feed.data.len_of(Axis(1))
    }

    /// 当前隐状态（拷贝）
    pub fn rnn_hidden(&self) -> RnnHidden {
        RnnHidden::from_tensors(self.rnn_type, self.hidden.iter().map(|h| h.data.clone()).collect())
    }

    /// 上一步输出 [batch, hidden]
    pub fn previous_output(&self) -> Array2<f32> {
        self.input_feed.data.index_axis(Axis(0), 0).to_owned()
    }

    /// coverage [batch, src_len]
    pub fn coverage_vector(&self) -> Option<Array2<f32>> {
        self.coverage.as_ref().map(|c| c.data.index_axis(Axis(0), 0).to_owned())
    }

    /// 一次解码后更新隐状态、input feed 和 coverage
    pub fn update_state(
        &mut self,
        hidden: RnnHidden,
        input_feed: Array2<f32>,
        coverage: Option<Array2<f32>>,
        requires_grad: bool,
    ) {
        assert_eq!(hidden.rnn_type(), self.rnn_type, "hidden state cell type changed");
        self.hidden = hidden
            .tensors()
            .into_iter()
            .map(|h| Var::computed(h.clone(), TensorOp::Recurrent, requires_grad))
            .collect();
        self.input_feed = Var::computed(input_feed.insert_axis(Axis(0)), TensorOp::Attention, requires_grad);
        self.coverage = coverage.map(|c| Var::computed(c.insert_axis(Axis(0)), TensorOp::Attention, requires_grad));
    }

    fn reindex_batch(&mut self, indices: &[usize]) {
        check_rows(self.batch_size(), indices);
        for h in &mut self.hidden {
            *h = select_var(h, 1, indices);
        }
        self.input_feed = select_var(&self.input_feed, 1, indices);
        if let Some(c) = &self.coverage {
            self.coverage = Some(select_var(c, 1, indices));
        }
    }

    pub fn detach(&mut self) {
        for h in &mut self.hidden {
            h.detach();
        }
        self.input_feed.detach();
        if let Some(c) = &mut self.coverage {
            c.detach();
        }
    }

    /// 所有状态张量
    pub fn all(&self) -> Vec<&Var> {
        self.hidden
            .iter()
            .chain(std::iter::once(&self.input_feed))
            .chain(self.coverage.iter())
            .collect()
    }
}

/// Transformer 解码器一层的增量缓存
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCache {
    pub self_attn: SelfAttnCache,
    /// memory bank 的 key / value，只投影一次
    pub memory: KvCache,
    /// 已缓存位置是否为 target padding [batch, len]
    pub key_padding: Option<Array2<bool>>,
}

/// 自注意力缓存
#[derive(Debug, Clone, PartialEq)]
pub enum SelfAttnCache {
    ScaledDot(KvCache),
    Average(AverageCache),
}

impl LayerCache {
    pub fn new(self_attn_type: SelfAttnType) -> Self {
        let self_attn = match self_attn_type {
            SelfAttnType::ScaledDot => SelfAttnCache::ScaledDot(KvCache::default()),
            SelfAttnType::Average => SelfAttnCache::Average(AverageCache::default()),
        };
        Self {
            self_attn,
            memory: KvCache::default(),
            key_padding: None,
        }
    }

    /// 已解码的位置数
    pub fn len(&self) -> usize {
        match &self.self_attn {
            SelfAttnCache::ScaledDot(kv) => kv.len(),
            SelfAttnCache::Average(avg) => avg.steps,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reindex_batch(&mut self, indices: &[usize]) {
        match &mut self.self_attn {
            SelfAttnCache::ScaledDot(kv) => kv.map_tensors(|t| select_var(t, 0, indices)),
            SelfAttnCache::Average(avg) => {
                if let Some(g) = &avg.prev_g {
                    avg.prev_g = Some(select_var(g, 0, indices));
                }
            }
        }
        self.memory.map_tensors(|t| select_var(t, 0, indices));
        if let Some(pad) = &self.key_padding {
            self.key_padding = Some(pad.select(Axis(0), indices));
        }
    }

    fn detach(&mut self) {
        match &mut self.self_attn {
            SelfAttnCache::ScaledDot(kv) => kv.detach(),
            SelfAttnCache::Average(avg) => avg.detach(),
        }
        self.memory.detach();
    }
}

/// Transformer 解码器状态
///
/// - `src`: 源端 token [src_len, batch, n_feat]，只读，用于源端 padding 掩码
/// - `previous_input`: 已解码的 target token（replay 模式）
/// - `previous_layer_inputs`: 每层记录的层归一化后输入 [batch, steps, dim]（replay 模式）
/// - `cache`: 每层一个增量缓存（fast 模式）
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerDecoderState {
    pub src: Array3<usize>,
    pub previous_input: Option<Array3<usize>>,
    pub previous_layer_inputs: Option<Vec<Var>>,
    pub cache: Option<Vec<LayerCache>>,
}

impl TransformerDecoderState {
    pub fn new(src: Array3<usize>) -> Self {
        Self {
            src,
            previous_input: None,
            previous_layer_inputs: None,
            cache: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.src.len_of(Axis(1))
    }

    /// replay 模式下已解码的步数
    pub fn previous_len(&self) -> usize {
        self.previous_input.as_ref().map_or(0, |p| p.len_of(Axis(0)))
    }

    /// 返回记录了新历史的状态，`src` 和缓存原样保留
    pub fn update_state(self, input: Array3<usize>, previous_layer_inputs: Vec<Var>) -> Self {
        Self {
            src: self.src,
            previous_input: Some(input),
            previous_layer_inputs: Some(previous_layer_inputs),
            cache: self.cache,
        }
    }

    /// 为 fast 模式建立空缓存，每层一个
    pub fn init_cache(&mut self, num_layers: usize, self_attn_type: SelfAttnType) {
        log::debug!(
            "initialising {} decoder layer caches ({:?} self-attention)",
            num_layers,
            self_attn_type
        );
        self.cache = Some((0..num_layers).map(|_| LayerCache::new(self_attn_type)).collect());
    }

    fn reindex_batch(&mut self, indices: &[usize]) {
        check_rows(self.batch_size(), indices);
        self.src = self.src.select(Axis(1), indices);
        if let Some(prev) = &self.previous_input {
            self.previous_input = Some(prev.select(Axis(1), indices));
        }
        if let Some(layers) = &mut self.previous_layer_inputs {
            for layer in layers.iter_mut() {
                *layer = select_var(layer, 0, indices);
            }
        }
        if let Some(cache) = &mut self.cache {
            for layer in cache.iter_mut() {
                layer.reindex_batch(indices);
            }
        }
    }

    pub fn detach(&mut self) {
        if let Some(layers) = &mut self.previous_layer_inputs {
            for layer in layers.iter_mut() {
                layer.detach();
            }
        }
        if let Some(cache) = &mut self.cache {
            for layer in cache.iter_mut() {
                layer.detach();
            }
        }
    }
}

/// 解码器状态
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderState {
    Rnn(RnnDecoderState),
    Transformer(TransformerDecoderState),
}

impl DecoderState {
    pub fn batch_size(&self) -> usize {
        match self {
            DecoderState::Rnn(s) => s.batch_size(),
            DecoderState::Transformer(s) => s.batch_size(),
        }
    }

    /// 沿 batch 维重新索引所有状态张量
    ///
    /// `f` 接收当前 batch 大小，返回新 batch 每一行取自的旧行下标。
    pub fn map_batch_fn<F>(&mut self, f: F)
    where
        F: FnOnce(usize) -> Vec<usize>,
    {
        let indices = f(self.batch_size());
        match self {
            DecoderState::Rnn(s) => s.reindex_batch(&indices),
            DecoderState::Transformer(s) => s.reindex_batch(&indices),
        }
    }

    /// 把整个 batch 复制 `beam_size` 份（beam-major）
    pub fn repeat_beam_size_times(&mut self, beam_size: usize) {
        log::debug!("repeating decoder state {} times for beam search", beam_size);
        self.map_batch_fn(|batch| tile_indices(batch, beam_size));
    }

    /// 按 `positions` 重排第 `idx` 个句子的 beam
    pub fn beam_update(&mut self, idx: usize, positions: &[usize], beam_size: usize) {
        log::debug!("reordering beams of sentence {}: {:?}", idx, positions);
        self.map_batch_fn(|rows| beam_indices(rows, idx, positions, beam_size));
    }

    /// 截断所有状态张量的计算历史
    pub fn detach(&mut self) {
        match self {
            DecoderState::Rnn(s) => s.detach(),
            DecoderState::Transformer(s) => s.detach(),
        }
    }
}

/// 沿 `axis` 把张量复制 `times` 次（beam-major）
pub fn repeat_batch<A: Clone, D: RemoveAxis>(x: &Array<A, D>, axis: usize, times: usize) -> Array<A, D> {
    x.select(Axis(axis), &tile_indices(x.len_of(Axis(axis)), times))
}

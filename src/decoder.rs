//! 解码器
//!
//! 三种解码器共享同一接口：
//!
//! ```text
//! forward(tgt, memory_bank, state, memory_lengths, step) -> (outputs, state, attns)
//! ```
//!
//! - [`StdRnnDecoder`]：整段 target 一次通过 RNN，再一次性计算 attention
//! - [`InputFeedRnnDecoder`]：逐步解码，上一步输出拼接到本步输入（input feeding）
//! - [`TransformerDecoder`]：见 [`crate::transformer_decoder`]

use ndarray::{s, Array3, Axis};
use rand::rngs::StdRng;
use rand::Rng;

use crate::attention::GlobalAttention;
use crate::config::{DecoderType, ModelOptions, RnnType};
use crate::decoder_state::{DecoderState, RnnDecoderState};
use crate::embedding::Embeddings;
use crate::encoder::EncoderSummary;
use crate::error::{ModelError, Result};
use crate::gate::{gated_output, ContextGate};
use crate::layers::Dropout;
use crate::rnn::{Rnn, RnnHidden, StackedRnn};
use crate::tensor::{flatten_time, stack_steps, unflatten_time, TensorExt};
use crate::transformer_decoder::TransformerDecoder;

/// 解码器返回的注意力，每项形状为 [tgt_len, batch, src_len]
#[derive(Debug, Clone, PartialEq)]
pub struct Attentions {
    /// 标准注意力
    pub std: Array3<f32>,
    /// copy attention（开启时）
    pub copy: Option<Array3<f32>>,
    /// 每步累积后的 coverage（开启时）
    pub coverage: Option<Array3<f32>>,
}

/// 标准 RNN 解码器
///
/// 不支持 coverage 和 copy attention。
#[derive(Debug, Clone)]
pub struct StdRnnDecoder {
    embeddings: Embeddings,
    rnn: Rnn,
    attn: GlobalAttention,
    context_gate: Option<ContextGate>,
    dropout: Dropout,
    hidden_size: usize,
    training: bool,
}

impl StdRnnDecoder {
    pub fn new(opts: &ModelOptions, embeddings: Embeddings, rng: &mut StdRng) -> Result<Self> {
        if opts.coverage_attn {
            return Err(ModelError::Unsupported {
                decoder: "standard RNN",
                feature: "coverage attention",
            });
        }
        if opts.copy_attn {
            return Err(ModelError::Unsupported {
                decoder: "standard RNN",
                feature: "copy attention",
            });
        }

        let input_size = embeddings.embedding_dim();
        let hidden = opts.rnn_size;
        Ok(Self {
            rnn: Rnn::new(opts.rnn_type, input_size, hidden, opts.dec_layers, false, opts.dropout, rng),
            context_gate: opts
                .context_gate
                .map(|t| ContextGate::new(t, input_size, hidden, hidden, hidden, rng)),
            attn: GlobalAttention::new(hidden, false, opts.global_attention, rng),
            dropout: Dropout::new(opts.dropout, rng.gen()),
            embeddings,
            hidden_size: hidden,
            training: false,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.embeddings.set_training(training);
        self.rnn.set_training(training);
        self.dropout.set_training(training);
    }

    pub fn forward(
        &mut self,
        tgt: &Array3<usize>,
        memory_bank: &Array3<f32>,
        state: &mut RnnDecoderState,
        memory_lengths: Option<&[usize]>,
    ) -> (Array3<f32>, Attentions) {
        let emb = self.embeddings.forward(tgt, None);
        let (tgt_len, batch, _) = emb.dim();

        let (rnn_output, hidden) = self.rnn.forward(&emb, None, Some(&state.rnn_hidden()));
        let (attn_outputs, attn_scores) = self.attn.forward(&rnn_output, memory_bank, memory_lengths, None);

        let outputs = unflatten_time(
            &gated_output(
                self.context_gate.as_ref(),
                &mut self.dropout,
                &flatten_time(&emb),
                &flatten_time(&rnn_output),
                &flatten_time(&attn_outputs),
            ),
            tgt_len,
            batch,
        );

        let final_output = outputs.index_axis(Axis(0), tgt_len - 1).to_owned();
        state.update_state(hidden, final_output, None, self.training);

        let attns = Attentions {
            std: attn_scores,
            copy: None,
            coverage: None,
        };
        (outputs, attns)
    }
}

/// Input feeding RNN 解码器
///
/// ```text
/// x_t     = [emb_t; out_{t-1}]
/// h_t     = StackedRnn(x_t, h_{t-1})
/// a_t     = Attn(h_t, memory)
/// out_t   = Dropout(Gate(x_t, h_t, a_t))
/// cov_t   = cov_{t-1} + align_t
/// ```
#[derive(Debug, Clone)]
pub struct InputFeedRnnDecoder {
    embeddings: Embeddings,
    rnn: StackedRnn,
    attn: GlobalAttention,
    copy_attn: Option<GlobalAttention>,
    context_gate: Option<ContextGate>,
    dropout: Dropout,
    coverage_attn: bool,
    hidden_size: usize,
    training: bool,
}

impl InputFeedRnnDecoder {
    pub fn new(opts: &ModelOptions, embeddings: Embeddings, rng: &mut StdRng) -> Self {
        let hidden = opts.rnn_size;
        let input_size = embeddings.embedding_dim() + hidden;
        Self {
            rnn: StackedRnn::new(opts.rnn_type, opts.dec_layers, input_size, hidden, opts.dropout, rng),
            context_gate: opts
                .context_gate
                .map(|t| ContextGate::new(t, input_size, hidden, hidden, hidden, rng)),
            attn: GlobalAttention::new(hidden, opts.coverage_attn, opts.global_attention, rng),
            copy_attn: opts
                .copy_attn
                .then(|| GlobalAttention::new(hidden, false, opts.global_attention, rng)),
            dropout: Dropout::new(opts.dropout, rng.gen()),
            coverage_attn: opts.coverage_attn,
            embeddings,
            hidden_size: hidden,
            training: false,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.embeddings.set_training(training);
        self.rnn.set_training(training);
        self.dropout.set_training(training);
    }

    pub fn forward(
        &mut self,
        tgt: &Array3<usize>,
        memory_bank: &Array3<f32>,
        state: &mut RnnDecoderState,
        memory_lengths: Option<&[usize]>,
    ) -> (Array3<f32>, Attentions) {
        let emb = self.embeddings.forward(tgt, None);
        let tgt_len = emb.len_of(Axis(0));

        let mut output = state.previous_output();
        let mut hidden = state.rnn_hidden();
        let mut coverage = state.coverage_vector();

        let mut outputs = Vec::with_capacity(tgt_len);
        let mut std = Vec::with_capacity(tgt_len);
        let mut copies = Vec::new();
        let mut coverages = Vec::new();

        for t in 0..tgt_len {
            let emb_t = emb.index_axis(Axis(0), t).to_owned().concat(&output, 1);

            let (rnn_output, next_hidden) = self.rnn.step(&emb_t, &hidden);
            hidden = next_hidden;
            let prior_coverage = if self.coverage_attn { coverage.as_ref() } else { None };
            let (attn_output, attn) = self.attn.forward_step(&rnn_output, memory_bank, memory_lengths, prior_coverage);

            output = gated_output(
                self.context_gate.as_ref(),
                &mut self.dropout,
                &emb_t,
                &rnn_output,
                &attn_output,
            );

            if self.coverage_attn {
                let next = match coverage.take() {
                    Some(c) => c + &attn,
                    None => attn.clone(),
                };
                coverages.push(next.clone());
                coverage = Some(next);
            }

            if let Some(copy_attn) = &self.copy_attn {
                let (_, copy) = copy_attn.forward_step(&output, memory_bank, memory_lengths, None);
                copies.push(copy);
            }

            outputs.push(output.clone());
            std.push(attn);
        }

        state.update_state(hidden, output, coverage, self.training);

        let attns = Attentions {
            std: stack_steps(&std),
            copy: self.copy_attn.as_ref().map(|_| stack_steps(&copies)),
            coverage: self.coverage_attn.then(|| stack_steps(&coverages)),
        };
        (stack_steps(&outputs), attns)
    }
}

/// 解码器
#[derive(Debug, Clone)]
pub enum Decoder {
    StdRnn(StdRnnDecoder),
    InputFeedRnn(InputFeedRnnDecoder),
    Transformer(TransformerDecoder),
}

/// RNN 解码器初始化时需要的结构信息
#[derive(Debug, Clone, Copy)]
struct RnnLayout {
    rnn_type: RnnType,
    num_layers: usize,
    hidden_size: usize,
}

impl Decoder {
    /// 根据配置构建解码器
    pub fn new(opts: &ModelOptions, embeddings: Embeddings, rng: &mut StdRng) -> Result<Self> {
        let decoder = match opts.decoder_type {
            DecoderType::StdRnn => Decoder::StdRnn(StdRnnDecoder::new(opts, embeddings, rng)?),
            DecoderType::InputFeedRnn => Decoder::InputFeedRnn(InputFeedRnnDecoder::new(opts, embeddings, rng)),
            DecoderType::Transformer => {
                if opts.heads == 0 || opts.rnn_size % opts.heads != 0 {
                    return Err(ModelError::InvalidConfig(format!(
                        "rnn_size {} must be divisible by heads {}",
                        opts.rnn_size, opts.heads
                    )));
                }
                if embeddings.embedding_dim() != opts.rnn_size {
                    return Err(ModelError::InvalidConfig(
                        "transformer layers require word_vec_size == rnn_size".into(),
                    ));
                }
                Decoder::Transformer(TransformerDecoder::new(
                    opts.dec_layers,
                    opts.rnn_size,
                    opts.heads,
                    opts.transformer_ff,
                    opts.dropout,
                    opts.self_attn_type,
                    opts.copy_attn,
                    embeddings,
                    rng,
                ))
            }
        };
        Ok(decoder)
    }

    pub fn decoder_type(&self) -> DecoderType {
        match self {
            Decoder::StdRnn(_) => DecoderType::StdRnn,
            Decoder::InputFeedRnn(_) => DecoderType::InputFeedRnn,
            Decoder::Transformer(_) => DecoderType::Transformer,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        match self {
            Decoder::StdRnn(d) => d.set_training(training),
            Decoder::InputFeedRnn(d) => d.set_training(training),
            Decoder::Transformer(d) => d.set_training(training),
        }
    }

    /// 由编码器输出构建初始解码状态
    ///
    /// # 参数
    /// - `src`: 源端 token [src_len, batch, n_feat]
    /// - `memory_bank`: [src_len, batch, dim]
    /// - `summary`: 编码器摘要
    /// - `bidirectional_encoder`: 摘要是否来自双向 RNN，是则把 `layers * 2` 折叠为 `layers`
    pub fn init_decoder_state(
        &self,
        src: &Array3<usize>,
        memory_bank: &Array3<f32>,
        summary: EncoderSummary,
        bidirectional_encoder: bool,
    ) -> Result<DecoderState> {
        assert_eq!(
            src.len_of(Axis(1)),
            memory_bank.len_of(Axis(1)),
            "source and memory bank batch sizes differ"
        );

        let layout = match self {
            Decoder::Transformer(d) => return Ok(DecoderState::Transformer(d.init_decoder_state(src))),
            Decoder::StdRnn(d) => RnnLayout {
                rnn_type: d.rnn.rnn_type(),
                num_layers: d.rnn.num_layers(),
                hidden_size: d.hidden_size,
            },
            Decoder::InputFeedRnn(d) => RnnLayout {
                rnn_type: d.rnn.rnn_type(),
                num_layers: d.rnn.num_layers(),
                hidden_size: d.hidden_size,
            },
        };

        let summary = if bidirectional_encoder {
            fold_directions(summary)
        } else {
            summary
        };
        let hidden = summary_to_hidden(summary, layout)?;
        Ok(DecoderState::Rnn(RnnDecoderState::new(hidden, layout.hidden_size)))
    }

    /// 为 fast 模式建立每层缓存，层数和 self-attention 类型取自解码器本身
    ///
    /// RNN 解码器没有缓存，状态保持不变。
    pub fn init_cache(&self, state: &mut DecoderState) {
        match (self, state) {
            (Decoder::Transformer(d), DecoderState::Transformer(s)) => s.init_cache(d.num_layers(), d.self_attn_type()),
            (Decoder::Transformer(_), DecoderState::Rnn(_)) => {
                panic!("Transformer decoder received a state of another decoder type")
            }
            _ => {}
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `tgt`: [tgt_len, batch, n_feat]
    /// - `memory_bank`: [src_len, batch, dim]
    /// - `state`: 解码状态，移入后返回新的状态
    /// - `memory_lengths`: 源端有效长度（RNN 解码器用于屏蔽 padding）
    /// - `step`: transformer 增量解码的位置偏移
    pub fn forward(
        &mut self,
        tgt: &Array3<usize>,
        memory_bank: &Array3<f32>,
        state: DecoderState,
        memory_lengths: Option<&[usize]>,
        step: Option<usize>,
    ) -> (Array3<f32>, DecoderState, Attentions) {
        assert_eq!(
            tgt.len_of(Axis(1)),
            memory_bank.len_of(Axis(1)),
            "target and memory bank batch sizes differ"
        );
        assert!(tgt.len_of(Axis(0)) > 0, "target must contain at least one token");

        match (self, state) {
            (Decoder::StdRnn(d), DecoderState::Rnn(mut s)) => {
                let (outputs, attns) = d.forward(tgt, memory_bank, &mut s, memory_lengths);
                (outputs, DecoderState::Rnn(s), attns)
            }
            (Decoder::InputFeedRnn(d), DecoderState::Rnn(mut s)) => {
                let (outputs, attns) = d.forward(tgt, memory_bank, &mut s, memory_lengths);
                (outputs, DecoderState::Rnn(s), attns)
            }
            (Decoder::Transformer(d), DecoderState::Transformer(s)) => {
                let (outputs, s, attns) = d.forward(tgt, memory_bank, s, step);
                (outputs, DecoderState::Transformer(s), attns)
            }
            (d, _) => panic!("{:?} decoder received a state of another decoder type", d.decoder_type()),
        }
    }
}

/// 双向编码器隐状态 `[layers * 2, batch, h]` → `[layers, batch, 2h]`
fn fold_directions(summary: EncoderSummary) -> EncoderSummary {
    let fold = |h: Array3<f32>| {
        let (rows, batch, dim) = h.dim();
        assert_eq!(rows % 2, 0, "bidirectional summary must have an even number of rows");
        let forward = h.slice(s![0..;2, .., ..]);
        let backward = h.slice(s![1..;2, .., ..]);
        let folded = ndarray::concatenate(Axis(2), &[forward, backward])
            .expect("forward and backward directions share layers and batch");
        debug_assert_eq!(folded.dim(), (rows / 2, batch, dim * 2));
        folded
    };
    match summary {
        EncoderSummary::Single(h) => EncoderSummary::Single(fold(h)),
        EncoderSummary::Pair(h, c) => EncoderSummary::Pair(fold(h), fold(c)),
    }
}

/// 把编码器摘要转换为解码器的初始隐状态
fn summary_to_hidden(summary: EncoderSummary, layout: RnnLayout) -> Result<RnnHidden> {
    for t in summary.tensors() {
        let (layers, _, dim) = t.dim();
        if layers != layout.num_layers || dim != layout.hidden_size {
            return Err(ModelError::IncompatibleState(format!(
                "encoder summary is {}x{}, decoder expects {} layers of size {}",
                layers, dim, layout.num_layers, layout.hidden_size
            )));
        }
    }

    let hidden = match (summary, layout.rnn_type) {
        (EncoderSummary::Pair(h, c), RnnType::Lstm) => RnnHidden::Lstm(h, c),
        (EncoderSummary::Single(h), RnnType::Gru) => RnnHidden::Gru(h),
        (EncoderSummary::Pair(h, _), RnnType::Gru) => {
            log::warn!("GRU decoder initialised from a paired encoder summary; using the first tensor");
            RnnHidden::Gru(h)
        }
        (EncoderSummary::Single(h), RnnType::Lstm) => {
            log::warn!("LSTM decoder initialised from a single encoder summary; cell state starts at zero");
            let c = Array3::zeros(h.dim());
            RnnHidden::Lstm(h, c)
        }
    };
    Ok(hidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{configs, ContextGateType, GlobalAttnType, SelfAttnType};
    use crate::decoder_state::SelfAttnCache;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn build(opts: &ModelOptions) -> Decoder {
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let embeddings = Embeddings::new(
            opts.tgt_vocab_size,
            &opts.tgt_feat_vocab_sizes,
            opts.word_vec_size,
            opts.padding_idx,
            opts.position_encoding,
            opts.dropout,
            &mut rng,
        );
        Decoder::new(opts, embeddings, &mut rng).unwrap()
    }

    fn src(len: usize, batch: usize) -> Array3<usize> {
        Array3::from_shape_fn((len, batch, 1), |(t, b, _)| 2 + t + b)
    }

    fn memory(len: usize, batch: usize, dim: usize) -> Array3<f32> {
        Array3::from_shape_fn((len, batch, dim), |(t, b, k)| ((t * 3 + b * 5 + k) % 7) as f32 * 0.2 - 0.6)
    }

    fn tgt(len: usize, batch: usize) -> Array3<usize> {
        Array3::from_shape_fn((len, batch, 1), |(t, b, _)| 3 + (t * 5 + b) % 13)
    }

    fn zero_summary(layers: usize, batch: usize, dim: usize) -> EncoderSummary {
        let h = Array3::zeros((layers, batch, dim));
        EncoderSummary::Pair(h.clone(), h)
    }

    #[test]
    fn test_input_feed_single_step_with_padding() {
        // batch = 2, src_len = 4，第二个样本只有 3 个有效 token
        let opts = ModelOptions {
            global_attention: GlobalAttnType::General,
            ..configs::tiny()
        };
        let mut decoder = build(&opts);
        let bank = memory(4, 2, 8);
        let state = decoder.init_decoder_state(&src(4, 2), &bank, zero_summary(1, 2, 8), false).unwrap();

        let (out, state, attns) = decoder.forward(&tgt(1, 2), &bank, state, Some(&[4, 3]), None);

        assert_eq!(out.shape(), &[1, 2, 8]);
        assert_eq!(attns.std.shape(), &[1, 2, 4]);
        assert!(attns.std[[0, 1, 3]] < 1e-12);
        assert_abs_diff_eq!(attns.std.slice(s![0, 1, ..]).sum(), 1.0, epsilon = 1e-5);
        assert!(attns.copy.is_none() && attns.coverage.is_none());

        let DecoderState::Rnn(s) = state else { unreachable!() };
        assert_eq!(s.previous_output(), out.index_axis(Axis(0), 0).to_owned());
    }

    #[test]
    fn test_stepwise_input_feed_matches_full_sequence() {
        let mut decoder = build(&configs::tiny());
        let bank = memory(3, 2, 8);
        let init = || zero_summary(1, 2, 8);
        let tgt = tgt(4, 2);

        let state = decoder.init_decoder_state(&src(3, 2), &bank, init(), false).unwrap();
        let (full, _, _) = decoder.forward(&tgt, &bank, state, None, None);

        let mut state = decoder.init_decoder_state(&src(3, 2), &bank, init(), false).unwrap();
        for t in 0..4 {
            let (out, next, _) = decoder.forward(&tgt.slice(s![t..t + 1, .., ..]).to_owned(), &bank, state, None, None);
            for b in 0..2 {
                for k in 0..8 {
                    assert_abs_diff_eq!(out[[0, b, k]], full[[t, b, k]], epsilon = 1e-5);
                }
            }
            state = next;
        }
    }

    #[test]
    fn test_coverage_accumulates_attention() {
        let opts = ModelOptions {
            coverage_attn: true,
            copy_attn: true,
            ..configs::tiny()
        };
        let mut decoder = build(&opts);
        let bank = memory(5, 1, 8);
        let state = decoder.init_decoder_state(&src(5, 1), &bank, zero_summary(1, 1, 8), false).unwrap();

        let (_, state, attns) = decoder.forward(&tgt(3, 1), &bank, state, None, None);

        let coverage = attns.coverage.unwrap();
        assert_eq!(coverage.shape(), &[3, 1, 5]);
        assert_eq!(attns.copy.map(|c| c.shape().to_vec()), Some(vec![3, 1, 5]));
        for j in 0..5 {
            let running: f32 = (0..3).map(|t| attns.std[[t, 0, j]]).sum();
            assert_abs_diff_eq!(coverage[[2, 0, j]], running, epsilon = 1e-5);
            assert_abs_diff_eq!(coverage[[0, 0, j]], attns.std[[0, 0, j]], epsilon = 1e-6);
        }
        // coverage 每步加一个分布
        assert_abs_diff_eq!(coverage.slice(s![2, 0, ..]).sum(), 3.0, epsilon = 1e-4);

        let DecoderState::Rnn(s) = state else { unreachable!() };
        assert_eq!(s.coverage_vector().unwrap(), coverage.index_axis(Axis(0), 2).to_owned());
    }

    #[test]
    fn test_detach_reaches_every_recurrent_tensor() {
        let opts = ModelOptions {
            coverage_attn: true,
            ..configs::tiny()
        };
        let mut decoder = build(&opts);
        decoder.set_training(true);
        let bank = memory(4, 2, 8);
        let state = decoder.init_decoder_state(&src(4, 2), &bank, zero_summary(1, 2, 8), false).unwrap();

        let (_, state, _) = decoder.forward(&tgt(2, 2), &bank, state, None, None);

        let DecoderState::Rnn(mut s) = state else { unreachable!() };
        // h, c, input feed, coverage
        assert_eq!(s.all().len(), 4);
        assert!(s.all().iter().all(|v| !v.is_leaf()));

        s.detach();

        assert!(s.all().iter().all(|v| v.is_leaf()));
    }

    #[test]
    #[should_panic(expected = "target must contain at least one token")]
    fn test_empty_target_is_fatal() {
        let mut decoder = build(&configs::tiny());
        let bank = memory(4, 2, 8);
        let state = decoder.init_decoder_state(&src(4, 2), &bank, zero_summary(1, 2, 8), false).unwrap();
        decoder.forward(&Array3::zeros((0, 2, 1)), &bank, state, None, None);
    }

    #[test]
    fn test_init_cache_uses_decoder_layout() {
        let opts = ModelOptions {
            decoder_type: DecoderType::Transformer,
            self_attn_type: SelfAttnType::Average,
            dec_layers: 2,
            ..configs::tiny()
        };
        let decoder = build(&opts);
        let bank = memory(4, 2, 8);
        let mut state = decoder.init_decoder_state(&src(4, 2), &bank, zero_summary(1, 2, 8), false).unwrap();

        decoder.init_cache(&mut state);

        let DecoderState::Transformer(s) = &state else { unreachable!() };
        let cache = s.cache.as_ref().unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.iter().all(|c| matches!(c.self_attn, SelfAttnCache::Average(_)) && c.is_empty()));

        // RNN 解码器没有缓存
        let rnn = build(&configs::tiny());
        let mut rnn_state = rnn.init_decoder_state(&src(4, 2), &bank, zero_summary(1, 2, 8), false).unwrap();
        let before = rnn_state.clone();
        rnn.init_cache(&mut rnn_state);
        assert_eq!(rnn_state, before);
    }

    #[test]
    fn test_std_rnn_decoder_with_context_gate() {
        for gate in [ContextGateType::Source, ContextGateType::Target, ContextGateType::Both] {
            let opts = ModelOptions {
                decoder_type: DecoderType::StdRnn,
                rnn_type: RnnType::Gru,
                context_gate: Some(gate),
                ..configs::tiny()
            };
            let mut decoder = build(&opts);
            let bank = memory(4, 2, 8);
            let state = decoder
                .init_decoder_state(&src(4, 2), &bank, EncoderSummary::Single(Array3::zeros((1, 2, 8))), false)
                .unwrap();

            let (out, state, attns) = decoder.forward(&tgt(3, 2), &bank, state, Some(&[4, 2]), None);

            assert_eq!(out.shape(), &[3, 2, 8]);
            assert!(out.iter().all(|v| v.abs() < 1.0));
            assert!(attns.std.slice(s![.., 1, 2..]).iter().all(|&w| w < 1e-12));
            assert_eq!(state.batch_size(), 2);
        }
    }

    #[test]
    fn test_std_rnn_rejects_coverage() {
        let opts = ModelOptions {
            decoder_type: DecoderType::StdRnn,
            coverage_attn: true,
            ..configs::tiny()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let embeddings = Embeddings::new(20, &[], 8, 1, false, 0.0, &mut rng);

        let err = Decoder::new(&opts, embeddings, &mut rng).unwrap_err();

        assert!(matches!(err, ModelError::Unsupported { .. }));
    }

    #[test]
    fn test_bidirectional_summary_is_folded() {
        let decoder = build(&ModelOptions {
            dec_layers: 2,
            ..configs::tiny()
        });
        // [layers * 2, batch, h / 2]，第 l 层前向为 2l，后向为 2l+1
        let h = Array3::from_shape_fn((4, 1, 4), |(row, _, _)| row as f32);
        let summary = EncoderSummary::Pair(h.clone(), h);

        let state = decoder
            .init_decoder_state(&src(2, 1), &memory(2, 1, 8), summary, true)
            .unwrap();

        let DecoderState::Rnn(s) = state else { unreachable!() };
        let hidden = &s.hidden[0].data;
        assert_eq!(hidden.shape(), &[2, 1, 8]);
        assert_eq!(hidden[[1, 0, 0]], 2.0);
        assert_eq!(hidden[[1, 0, 7]], 3.0);
    }

    #[test]
    fn test_summary_conversions() {
        let gru = build(&ModelOptions {
            rnn_type: RnnType::Gru,
            ..configs::tiny()
        });
        let state = gru
            .init_decoder_state(&src(2, 1), &memory(2, 1, 8), zero_summary(1, 1, 8), false)
            .unwrap();
        let DecoderState::Rnn(s) = state else { unreachable!() };
        assert_eq!(s.rnn_type(), RnnType::Gru);
        assert_eq!(s.hidden.len(), 1);

        let lstm = build(&configs::tiny());
        let single = EncoderSummary::Single(Array3::ones((1, 1, 8)));
        let state = lstm.init_decoder_state(&src(2, 1), &memory(2, 1, 8), single, false).unwrap();
        let DecoderState::Rnn(s) = state else { unreachable!() };
        assert_eq!(s.hidden.len(), 2);
        assert!(s.hidden[1].data.iter().all(|&v| v == 0.0));

        let err = lstm
            .init_decoder_state(&src(2, 1), &memory(2, 1, 8), zero_summary(3, 1, 8), false)
            .unwrap_err();
        assert!(matches!(err, ModelError::IncompatibleState(_)));
    }

    #[test]
    #[should_panic(expected = "target and memory bank batch sizes differ")]
    fn test_batch_mismatch_is_fatal() {
        let mut decoder = build(&configs::tiny());
        let bank = memory(3, 2, 8);
        let state = decoder.init_decoder_state(&src(3, 2), &bank, zero_summary(1, 2, 8), false).unwrap();
        decoder.forward(&tgt(2, 3), &bank, state, None, None);
    }
}

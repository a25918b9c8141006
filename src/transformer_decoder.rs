//! Transformer Decoder
//!
//! 每层三个子层，全部 pre-norm：
//!
//! ```text
//! x → x + Dropout(SelfAttn(LN(x)))           （因果掩码）
//!   → q + Dropout(ContextAttn(LN(q), memory)) （源端 padding 掩码）
//!   → FFN
//! ```
//!
//! 支持两种增量解码方式：
//! - **fast**：状态带有每层缓存，self-attention 的 key / value 追加到缓存，
//!   memory 的 key / value 只投影一次；
//! - **replay**：没有缓存时，状态记录每层归一化后的输入，下一次调用把新位置
//!   拼接在记录之后作为 key / value。
//!
//! 两种方式逐步解码的结果都与一次性解码整段 target 相同。

use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::Rng;

use crate::autograd::{TensorOp, Var};
use crate::average_attention::AverageAttention;
use crate::config::SelfAttnType;
use crate::decoder::Attentions;
use crate::decoder_state::{LayerCache, SelfAttnCache, TransformerDecoderState};
use crate::embedding::Embeddings;
use crate::layers::{Dropout, LayerNorm, PositionwiseFeedForward};
use crate::multi_head_attention::MultiHeadedAttention;
use crate::tensor::{causal_mask, padding_mask};

#[derive(Debug, Clone)]
enum SelfAttention {
    ScaledDot(MultiHeadedAttention),
    Average(AverageAttention),
}

/// 单个 Transformer Decoder 层
///
/// 张量布局为 batch-first：[batch, len, d_model]
#[derive(Debug, Clone)]
pub struct TransformerDecoderLayer {
    self_attn: SelfAttention,
    context_attn: MultiHeadedAttention,
    feed_forward: PositionwiseFeedForward,
    layer_norm_1: LayerNorm,
    layer_norm_2: LayerNorm,
    drop: Dropout,
}

impl TransformerDecoderLayer {
    pub fn new(
        d_model: usize,
        heads: usize,
        d_ff: usize,
        dropout: f32,
        self_attn_type: SelfAttnType,
        rng: &mut StdRng,
    ) -> Self {
        let self_attn = match self_attn_type {
            SelfAttnType::ScaledDot => SelfAttention::ScaledDot(MultiHeadedAttention::new(heads, d_model, dropout, rng)),
            SelfAttnType::Average => SelfAttention::Average(AverageAttention::new(d_model, dropout, rng)),
        };
        Self {
            self_attn,
            context_attn: MultiHeadedAttention::new(heads, d_model, dropout, rng),
            feed_forward: PositionwiseFeedForward::new(d_model, d_ff, dropout, rng),
            layer_norm_1: LayerNorm::new(d_model, None),
            layer_norm_2: LayerNorm::new(d_model, None),
            drop: Dropout::new(dropout, rng.gen()),
        }
    }

    pub fn set_training(&mut self, training: bool) {
        match &mut self.self_attn {
            SelfAttention::ScaledDot(a) => a.set_training(training),
            SelfAttention::Average(a) => a.set_training(training),
        }
        self.context_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.drop.set_training(training);
    }

    /// replay 模式前向传播
    ///
    /// # 参数
    /// - `inputs`: 新位置 [batch, q_len, d]
    /// - `memory_bank`: [batch, src_len, d]
    /// - `src_pad_mask`: [batch, q_len, src_len]
    /// - `dec_mask`: [batch, q_len, prev_len + q_len]
    /// - `previous_input`: 之前记录的本层输入 [batch, prev_len, d]
    ///
    /// # 返回
    /// - 输出 [batch, q_len, d]
    /// - context attention 权重 [batch, q_len, src_len]
    /// - 本层完整输入记录 [batch, prev_len + q_len, d]
    pub fn forward(
        &mut self,
        inputs: &Array3<f32>,
        memory_bank: &Array3<f32>,
        src_pad_mask: &Array3<bool>,
        dec_mask: &Array3<bool>,
        previous_input: Option<&Array3<f32>>,
    ) -> (Array3<f32>, Array3<f32>, Array3<f32>) {
        let input_norm = self.layer_norm_1.forward_seq(inputs);
        let all_input = match previous_input {
            Some(prev) => ndarray::concatenate(Axis(1), &[prev.view(), input_norm.view()])
                .expect("recorded layer input must share batch and model dims"),
            None => input_norm.clone(),
        };

        let query = match &mut self.self_attn {
            SelfAttention::ScaledDot(attn) => attn.forward(&all_input, &all_input, &input_norm, Some(dec_mask)).0,
            SelfAttention::Average(attn) => {
                let prev_len = all_input.len_of(Axis(1)) - input_norm.len_of(Axis(1));
                let (gated, _) = attn.forward(&all_input);
                gated.slice(s![.., prev_len.., ..]).to_owned()
            }
        };

        let (output, attn) = self.context_and_feed_forward(inputs, &query, |ctx, query_norm| {
            ctx.forward(memory_bank, memory_bank, query_norm, Some(src_pad_mask))
        });
        (output, attn, all_input)
    }

    /// fast 模式前向传播，使用并更新本层缓存
    ///
    /// `dec_mask` 为 [batch, q_len, cached_len + q_len]。
    pub fn forward_cached(
        &mut self,
        inputs: &Array3<f32>,
        memory_bank: &Array3<f32>,
        src_pad_mask: &Array3<bool>,
        dec_mask: &Array3<bool>,
        cache: &mut LayerCache,
    ) -> (Array3<f32>, Array3<f32>) {
        let input_norm = self.layer_norm_1.forward_seq(inputs);

        let query = match (&mut self.self_attn, &mut cache.self_attn) {
            (SelfAttention::ScaledDot(attn), SelfAttnCache::ScaledDot(kv)) => {
                attn.forward_self_cached(&input_norm, Some(dec_mask), kv).0
            }
            (SelfAttention::Average(attn), SelfAttnCache::Average(avg)) => attn.forward_cached(&input_norm, avg).0,
            _ => panic!("layer cache does not match the self-attention type"),
        };

        let memory = &mut cache.memory;
        self.context_and_feed_forward(inputs, &query, |ctx, query_norm| {
            ctx.forward_context_cached(memory_bank, query_norm, Some(src_pad_mask), memory)
        })
    }

    fn context_and_feed_forward<F>(&mut self, inputs: &Array3<f32>, query: &Array3<f32>, context: F) -> (Array3<f32>, Array3<f32>)
    where
        F: FnOnce(&mut MultiHeadedAttention, &Array3<f32>) -> (Array3<f32>, Array3<f32>),
    {
        let query = self.drop.forward(query) + inputs;
        let query_norm = self.layer_norm_2.forward_seq(&query);
        let (mid, attn) = context(&mut self.context_attn, &query_norm);
        let output = self.feed_forward.forward_seq(&(self.drop.forward(&mid) + &query));
        (output, attn)
    }
}

/// Transformer Decoder
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    embeddings: Embeddings,
    layers: Vec<TransformerDecoderLayer>,
    layer_norm: LayerNorm,
    self_attn_type: SelfAttnType,
    copy_attn: bool,
    training: bool,
}

impl TransformerDecoder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_layers: usize,
        d_model: usize,
        heads: usize,
        d_ff: usize,
        dropout: f32,
        self_attn_type: SelfAttnType,
        copy_attn: bool,
        embeddings: Embeddings,
        rng: &mut StdRng,
    ) -> Self {
        assert_eq!(d_model % heads, 0, "d_model must be divisible by n_heads");
        assert_eq!(
            embeddings.embedding_dim(),
            d_model,
            "transformer embeddings must have d_model dimensions"
        );

        let layers = (0..num_layers)
            .map(|_| TransformerDecoderLayer::new(d_model, heads, d_ff, dropout, self_attn_type, rng))
            .collect();

        Self {
            embeddings,
            layers,
            layer_norm: LayerNorm::new(d_model, None),
            self_attn_type,
            copy_attn,
            training: false,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn self_attn_type(&self) -> SelfAttnType {
        self.self_attn_type
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.embeddings.set_training(training);
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub fn init_decoder_state(&self, src: &Array3<usize>) -> TransformerDecoderState {
        TransformerDecoderState::new(src.clone())
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `tgt`: 新的 target token [tgt_len, batch, n_feat]
    /// - `memory_bank`: [src_len, batch, d]
    /// - `state`: 解码状态；带缓存时走 fast 模式，否则走 replay 模式
    /// - `step`: 第一个新 token 的绝对位置，缺省为已解码的步数
    ///
    /// # 返回
    /// - 输出 [tgt_len, batch, d]
    /// - 新状态
    /// - 注意力（`std`，开启 copy 时 `copy` 与之相同）
    pub fn forward(
        &mut self,
        tgt: &Array3<usize>,
        memory_bank: &Array3<f32>,
        mut state: TransformerDecoderState,
        step: Option<usize>,
    ) -> (Array3<f32>, TransformerDecoderState, Attentions) {
        let (tgt_len, batch, _) = tgt.dim();
        let (src_len, mem_batch, _) = memory_bank.dim();
        assert_eq!(state.batch_size(), batch, "decoder state and target batch sizes differ");
        assert_eq!(mem_batch, batch, "target and memory bank batch sizes differ");
        assert_eq!(state.src.len_of(Axis(0)), src_len, "memory bank and source lengths differ");

        let padding_idx = self.embeddings.word_padding_idx();
        let src_pad = padding_mask(&state.src, padding_idx);
        let src_pad_mask = Array3::from_shape_fn((batch, tgt_len, src_len), |(b, _, j)| src_pad[[b, j]]);
        let memory = memory_bank.view().permuted_axes([1, 0, 2]).to_owned();

        let prev_len = match &state.cache {
            Some(cache) => cache.first().map_or(0, |c| c.len()),
            None => state.previous_len(),
        };

        let emb = self.embeddings.forward(tgt, Some(step.unwrap_or(prev_len)));
        let mut output = emb.view().permuted_axes([1, 0, 2]).to_owned();
        let causal = causal_mask(tgt_len, prev_len + tgt_len, prev_len);
        let mut attn = None;

        match state.cache.as_mut() {
            Some(cache) => {
                assert_eq!(cache.len(), self.layers.len(), "one cache entry per decoder layer");
                let cached_padding = cache
                    .first()
                    .and_then(|c| c.key_padding.clone())
                    .unwrap_or_else(|| Array2::from_elem((batch, prev_len), false));
                let new_padding = padding_mask(tgt, padding_idx);
                let key_padding = ndarray::concatenate(Axis(1), &[cached_padding.view(), new_padding.view()])
                    .expect("cached key padding must share the batch");
                let dec_mask = Array3::from_shape_fn((batch, tgt_len, prev_len + tgt_len), |(b, i, j)| {
                    causal[[i, j]] || key_padding[[b, j]]
                });
                for (layer, layer_cache) in self.layers.iter_mut().zip(cache.iter_mut()) {
                    let (out, a) = layer.forward_cached(&output, &memory, &src_pad_mask, &dec_mask, layer_cache);
                    layer_cache.key_padding = Some(key_padding.clone());
                    output = out;
                    attn = Some(a);
                }
            }
            None => {
                let all_tokens = match &state.previous_input {
                    Some(prev) => ndarray::concatenate(Axis(0), &[prev.view(), tgt.view()])
                        .expect("previous target tokens must share batch and feature dims"),
                    None => tgt.clone(),
                };
                let tgt_pad = padding_mask(&all_tokens, padding_idx);
                let dec_mask = Array3::from_shape_fn((batch, tgt_len, prev_len + tgt_len), |(b, i, j)| {
                    causal[[i, j]] || tgt_pad[[b, j]]
                });

                let mut saved_inputs = Vec::with_capacity(self.layers.len());
                for (i, layer) in self.layers.iter_mut().enumerate() {
                    let previous = state
                        .previous_layer_inputs
                        .as_ref()
                        .and_then(|inputs| inputs.get(i))
                        .map(|v| &v.data);
                    let (out, a, all_input) = layer.forward(&output, &memory, &src_pad_mask, &dec_mask, previous);
                    output = out;
                    attn = Some(a);
                    saved_inputs.push(Var::computed(all_input, TensorOp::LayerInput, self.training));
                }
                state = state.update_state(all_tokens, saved_inputs);
            }
        }

        let output = self.layer_norm.forward_seq(&output);
        let outputs = output.permuted_axes([1, 0, 2]).as_standard_layout().to_owned();
        let std = attn
            .map(|a| a.permuted_axes([1, 0, 2]).as_standard_layout().to_owned())
            .unwrap_or_else(|| Array3::zeros((tgt_len, batch, src_len)));

        let attns = Attentions {
            copy: self.copy_attn.then(|| std.clone()),
            std,
            coverage: None,
        };
        (outputs, state, attns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn decoder(self_attn_type: SelfAttnType, layers: usize) -> TransformerDecoder {
        let mut rng = StdRng::seed_from_u64(7);
        let embeddings = Embeddings::new(20, &[], 8, 1, true, 0.0, &mut rng);
        TransformerDecoder::new(layers, 8, 2, 16, 0.0, self_attn_type, false, embeddings, &mut rng)
    }

    fn src() -> Array3<usize> {
        Array3::from_shape_fn((4, 2, 1), |(t, b, _)| if b == 1 && t == 3 { 1 } else { 2 + t + b })
    }

    fn memory() -> Array3<f32> {
        Array3::from_shape_fn((4, 2, 8), |(t, b, k)| ((t * 5 + b * 3 + k) % 7) as f32 * 0.2 - 0.5)
    }

    fn tgt() -> Array3<usize> {
        Array3::from_shape_fn((5, 2, 1), |(t, b, _)| 3 + (t * 2 + b) % 11)
    }

    fn assert_step_matches(full: &Array3<f32>, out: &Array3<f32>, t: usize) {
        for b in 0..2 {
            for k in 0..8 {
                assert_abs_diff_eq!(out[[0, b, k]], full[[t, b, k]], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_full_sequence_shapes() {
        let mut dec = decoder(SelfAttnType::ScaledDot, 2);
        let state = dec.init_decoder_state(&src());

        let (out, state, attns) = dec.forward(&tgt(), &memory(), state, None);

        assert_eq!(out.shape(), &[5, 2, 8]);
        assert_eq!(attns.std.shape(), &[5, 2, 4]);
        assert!(attns.copy.is_none());
        assert_eq!(state.previous_len(), 5);
        // 源端 padding 不分配权重
        for t in 0..5 {
            assert!(attns.std[[t, 1, 3]] < 1e-12);
            assert_abs_diff_eq!(attns.std.slice(s![t, 1, ..]).sum(), 1.0, epsilon = 1e-5);
        }
    }

    /// 句中带 padding 的 target：句子 0 第 2 步、句子 1 第 1 步
    fn padded_tgt() -> Array3<usize> {
        let mut tgt = tgt();
        tgt[[2, 0, 0]] = 1;
        tgt[[1, 1, 0]] = 1;
        tgt
    }

    #[test]
    fn test_fast_and_replay_match_full_decoding() {
        let cases = [
            (SelfAttnType::ScaledDot, tgt()),
            (SelfAttnType::Average, tgt()),
            (SelfAttnType::ScaledDot, padded_tgt()),
            (SelfAttnType::Average, padded_tgt()),
        ];
        for (self_attn_type, tgt) in cases {
            let mut dec = decoder(self_attn_type, 2);
            let (full, _, full_attns) = dec.forward(&tgt, &memory(), dec.init_decoder_state(&src()), None);

            let mut fast = dec.init_decoder_state(&src());
            fast.init_cache(dec.num_layers(), self_attn_type);
            let mut replay = dec.init_decoder_state(&src());

            for t in 0..5 {
                let step_tokens = tgt.slice(s![t..t + 1, .., ..]).to_owned();

                let (out, next, attns) = dec.forward(&step_tokens, &memory(), fast, Some(t));
                assert_step_matches(&full, &out, t);
                assert_abs_diff_eq!(attns.std[[0, 0, 1]], full_attns.std[[t, 0, 1]], epsilon = 1e-4);
                assert!(next.previous_layer_inputs.is_none());
                fast = next;

                let (out, next, _) = dec.forward(&step_tokens, &memory(), replay, None);
                assert_step_matches(&full, &out, t);
                replay = next;
            }

            let cache = fast.cache.as_ref().unwrap();
            assert!(cache.iter().all(|c| c.len() == 5));
            let key_padding = cache[1].key_padding.as_ref().unwrap();
            assert_eq!(key_padding.shape(), &[2, 5]);
            assert_eq!(key_padding[[0, 2]], tgt[[2, 0, 0]] == 1);
            assert_eq!(replay.previous_len(), 5);
            assert_eq!(replay.previous_layer_inputs.as_ref().unwrap()[1].data.shape(), &[2, 5, 8]);
        }
    }

    #[test]
    fn test_beam_reorder_of_cached_state() {
        let mut dec = decoder(SelfAttnType::ScaledDot, 1);
        let mut state = dec.init_decoder_state(&src());
        state.init_cache(1, SelfAttnType::ScaledDot);
        let memory = memory();

        let first = tgt().slice(s![0..1, .., ..]).to_owned();
        let (_, state, _) = dec.forward(&first, &memory, state, None);

        let mut state = crate::decoder_state::DecoderState::Transformer(state);
        state.repeat_beam_size_times(2);
        state.beam_update(1, &[0, 1], 2);
        let crate::decoder_state::DecoderState::Transformer(state) = state else { unreachable!() };

        let tiled_memory = crate::decoder_state::repeat_batch(&memory, 1, 2);
        let second = crate::decoder_state::repeat_batch(&tgt().slice(s![1..2, .., ..]).to_owned(), 1, 2);
        let (out, _, _) = dec.forward(&second, &tiled_memory, state, None);

        let (expected, _, _) = {
            let mut s = dec.init_decoder_state(&src());
            s.init_cache(1, SelfAttnType::ScaledDot);
            let (_, s, _) = dec.forward(&first, &memory, s, None);
            dec.forward(&tgt().slice(s![1..2, .., ..]).to_owned(), &memory, s, None)
        };
        for beam in 0..2 {
            for b in 0..2 {
                for k in 0..8 {
                    assert_abs_diff_eq!(out[[0, beam * 2 + b, k]], expected[[0, b, k]], epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "decoder state and target batch sizes differ")]
    fn test_batch_mismatch() {
        let mut dec = decoder(SelfAttnType::ScaledDot, 1);
        let state = dec.init_decoder_state(&src());
        dec.forward(&Array3::from_elem((1, 3, 1), 2), &memory(), state, None);
    }
}

//! Seq2Seq 翻译模型
//!
//! 组合编码器和解码器：
//!
//! ```text
//! src ─→ Encoder ─→ (summary, memory bank)
//!                        │
//!                        ↓
//!              init_decoder_state
//!                        │
//! tgt[:-1] ─→ Decoder ←──┘ ─→ (outputs, state, attns)
//! ```
//!
//! 训练时一次前向处理整个 target；推理时由外部的搜索循环调用
//! [`NmtModel::encode`]、[`NmtModel::init_decoder_state`]（或带缓存的
//! [`NmtModel::init_decoder_state_fast`]）和 [`NmtModel::decode`]。

use ndarray::{s, Array3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ModelOptions;
use crate::decoder::{Attentions, Decoder};
use crate::decoder_state::DecoderState;
use crate::embedding::Embeddings;
use crate::encoder::{Encoder, EncoderSummary};
use crate::error::Result;

/// 前向传播的结果
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// 解码器输出 [tgt_len - 1, batch, hidden]
    pub outputs: Array3<f32>,
    /// 注意力；多卡复制模式下为 `None`
    pub attns: Option<Attentions>,
    /// 最终解码状态；多卡复制模式下为 `None`
    pub dec_state: Option<DecoderState>,
}

/// 编码器-解码器模型
#[derive(Debug, Clone)]
pub struct NmtModel {
    encoder: Encoder,
    decoder: Decoder,
    multigpu: bool,
}

impl NmtModel {
    pub fn new(encoder: Encoder, decoder: Decoder) -> Self {
        Self {
            encoder,
            decoder,
            multigpu: false,
        }
    }

    /// 多卡复制模式：forward 不返回状态和注意力
    pub fn with_multigpu(mut self, multigpu: bool) -> Self {
        self.multigpu = multigpu;
        self
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }

    /// 编码源端
    pub fn encode(&mut self, src: &Array3<usize>, lengths: Option<&[usize]>) -> (EncoderSummary, Array3<f32>) {
        self.encoder.encode(src, lengths)
    }

    /// 由编码结果构建初始解码状态
    pub fn init_decoder_state(
        &self,
        src: &Array3<usize>,
        memory_bank: &Array3<f32>,
        summary: EncoderSummary,
    ) -> Result<DecoderState> {
        let bidirectional = self.encoder.num_directions() == 2;
        self.decoder.init_decoder_state(src, memory_bank, summary, bidirectional)
    }

    /// 构建带增量缓存的初始解码状态（transformer 解码器走 fast 模式）
    pub fn init_decoder_state_fast(
        &self,
        src: &Array3<usize>,
        memory_bank: &Array3<f32>,
        summary: EncoderSummary,
    ) -> Result<DecoderState> {
        let mut state = self.init_decoder_state(src, memory_bank, summary)?;
        self.decoder.init_cache(&mut state);
        Ok(state)
    }

    /// 解码一段 target（推理时通常为一个 token）
    pub fn decode(
        &mut self,
        tgt: &Array3<usize>,
        memory_bank: &Array3<f32>,
        state: DecoderState,
        memory_lengths: Option<&[usize]>,
        step: Option<usize>,
    ) -> (Array3<f32>, DecoderState, Attentions) {
        self.decoder.forward(tgt, memory_bank, state, memory_lengths, step)
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `src`: [src_len, batch, n_feat]
    /// - `tgt`: [tgt_len, batch, n_feat]，最后一个 token 不作为输入
    /// - `lengths`: 源端有效长度
    /// - `dec_state`: 给出时从该状态继续解码，否则由编码结果初始化
    pub fn forward(
        &mut self,
        src: &Array3<usize>,
        tgt: &Array3<usize>,
        lengths: Option<&[usize]>,
        dec_state: Option<DecoderState>,
    ) -> Result<ModelOutput> {
        let tgt_len = tgt.len_of(Axis(0));
        assert!(tgt_len >= 2, "target must contain at least two tokens");
        let tgt = tgt.slice(s![..tgt_len - 1, .., ..]).to_owned();

        let (summary, memory_bank) = self.encode(src, lengths);
        let state = match dec_state {
            Some(state) => state,
            None => self.init_decoder_state(src, &memory_bank, summary)?,
        };

        let (outputs, dec_state, attns) = self.decode(&tgt, &memory_bank, state, lengths, None);

        if self.multigpu {
            return Ok(ModelOutput {
                outputs,
                attns: None,
                dec_state: None,
            });
        }
        Ok(ModelOutput {
            outputs,
            attns: Some(attns),
            dec_state: Some(dec_state),
        })
    }
}

/// 根据配置构建模型
///
/// 所有参数由 `opts.seed` 决定，同样的配置得到同样的模型。
pub fn build_model(opts: &ModelOptions) -> Result<NmtModel> {
    opts.validate()?;
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let src_embeddings = Embeddings::new(
        opts.src_vocab_size,
        &opts.src_feat_vocab_sizes,
        opts.word_vec_size,
        opts.padding_idx,
        opts.position_encoding,
        opts.dropout,
        &mut rng,
    );
    let tgt_embeddings = Embeddings::new(
        opts.tgt_vocab_size,
        &opts.tgt_feat_vocab_sizes,
        opts.word_vec_size,
        opts.padding_idx,
        opts.position_encoding,
        opts.dropout,
        &mut rng,
    );

    let encoder = Encoder::new(opts, src_embeddings, &mut rng)?;
    let decoder = Decoder::new(opts, tgt_embeddings, &mut rng)?;

    log::debug!(
        "built {:?} encoder ({} layers) and {:?} decoder ({} layers), rnn_size {}",
        opts.encoder_type,
        opts.enc_layers,
        opts.decoder_type,
        opts.dec_layers,
        opts.rnn_size
    );
    Ok(NmtModel::new(encoder, decoder))
}

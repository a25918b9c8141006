//! # Mini NMT
//!
//! 一个从零实现的小型神经机器翻译模型核心：编码器、带注意力的解码器，
//! 以及供 beam search 使用的解码状态。
//!
//! ## 架构概览
//!
//! ```text
//! src → Embeddings → Encoder (mean / rnn / cnn / transformer)
//!                       │
//!              summary  │  memory bank
//!                       ↓
//! tgt → Embeddings → Decoder (std rnn / input-feed rnn / transformer)
//!                       ├── Global Attention (+ coverage, copy)
//!                       ├── Context Gate
//!                       └── DecoderState ←→ beam search
//! ```
//!
//! 张量布局：RNN 和全局注意力使用 `[len, batch, dim]`，
//! transformer 内部使用 `[batch, len, dim]`。

pub mod tensor;
pub mod autograd;
pub mod error;
pub mod config;
pub mod layers;
pub mod embedding;
pub mod rnn;
pub mod attention;
pub mod multi_head_attention;
pub mod average_attention;
pub mod gate;
pub mod conv;
pub mod encoder;
pub mod transformer;
pub mod decoder_state;
pub mod decoder;
pub mod transformer_decoder;
pub mod seq2seq;

pub use tensor::TensorExt;
pub use autograd::{TensorOp, Var};
pub use error::{ModelError, Result};
pub use config::{configs, ContextGateType, DecoderType, EncoderType, GlobalAttnType, ModelOptions, RnnType, SelfAttnType};
pub use layers::{Dropout, LayerNorm, Linear, PositionwiseFeedForward};
pub use embedding::{Embedding, Embeddings, PositionalEncoding};
pub use rnn::{Rnn, RnnHidden, StackedRnn};
pub use attention::GlobalAttention;
pub use multi_head_attention::{KvCache, MultiHeadedAttention};
pub use average_attention::{AverageAttention, AverageCache};
pub use gate::ContextGate;
pub use conv::StackedCnn;
pub use encoder::{Encoder, EncoderSummary};
pub use transformer::{TransformerEncoder, TransformerEncoderLayer};
pub use decoder_state::{DecoderState, LayerCache, RnnDecoderState, SelfAttnCache, TransformerDecoderState};
pub use decoder::{Attentions, Decoder, InputFeedRnnDecoder, StdRnnDecoder};
pub use transformer_decoder::{TransformerDecoder, TransformerDecoderLayer};
pub use seq2seq::{build_model, ModelOutput, NmtModel};

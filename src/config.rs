//! 模型配置
//!
//! 所有可识别的构建参数集中在 [`ModelOptions`] 中，可以从 JSON 读取。

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// 编码器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    /// 对嵌入取平均，没有循环结构
    Mean,
    /// 循环网络（可选双向）
    Rnn,
    /// 门控卷积
    Cnn,
    /// 自注意力
    Transformer,
}

/// 解码器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderType {
    /// 标准 RNN 解码器（整段 teacher forcing）
    StdRnn,
    /// Input feeding RNN 解码器（逐步）
    InputFeedRnn,
    /// Transformer 解码器
    Transformer,
}

/// 循环单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RnnType {
    #[serde(rename = "LSTM")]
    Lstm,
    #[serde(rename = "GRU")]
    Gru,
}

/// 全局注意力打分方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalAttnType {
    /// `h_t · h_s`
    Dot,
    /// `h_t W h_s`
    General,
    /// `v · tanh(W_q h_t + W_c h_s)`
    Mlp,
}

/// Transformer 解码器的自注意力类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelfAttnType {
    #[serde(rename = "scaled-dot")]
    ScaledDot,
    #[serde(rename = "average")]
    Average,
}

/// Context gate 的融合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextGateType {
    Source,
    Target,
    Both,
}

/// 模型构建参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// 源端词表大小
    pub src_vocab_size: usize,
    /// 目标端词表大小
    pub tgt_vocab_size: usize,
    /// 源端额外特征（slot 1..）的词表大小
    pub src_feat_vocab_sizes: Vec<usize>,
    /// 目标端额外特征的词表大小
    pub tgt_feat_vocab_sizes: Vec<usize>,
    /// 词向量维度
    pub word_vec_size: usize,
    /// padding token 的 id（两端共用）
    pub padding_idx: usize,
    /// 是否在嵌入中加入正弦位置编码
    pub position_encoding: bool,

    pub encoder_type: EncoderType,
    pub decoder_type: DecoderType,
    pub rnn_type: RnnType,
    pub enc_layers: usize,
    pub dec_layers: usize,
    /// 隐藏层 / 模型维度
    pub rnn_size: usize,
    /// 双向编码器
    pub bidirectional: bool,
    pub dropout: f32,

    pub global_attention: GlobalAttnType,
    pub self_attn_type: SelfAttnType,
    /// 多头注意力头数
    pub heads: usize,
    /// Transformer FFN 隐藏层维度
    pub transformer_ff: usize,

    pub coverage_attn: bool,
    pub copy_attn: bool,
    pub context_gate: Option<ContextGateType>,
    /// 卷积核宽度
    pub cnn_kernel_width: usize,

    /// 参数初始化与 dropout 使用的随机种子
    pub seed: u64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            src_vocab_size: 1000,
            tgt_vocab_size: 1000,
            src_feat_vocab_sizes: Vec::new(),
            tgt_feat_vocab_sizes: Vec::new(),
            word_vec_size: 500,
            padding_idx: 1,
            position_encoding: false,
            encoder_type: EncoderType::Rnn,
            decoder_type: DecoderType::InputFeedRnn,
            rnn_type: RnnType::Lstm,
            enc_layers: 2,
            dec_layers: 2,
            rnn_size: 500,
            bidirectional: false,
            dropout: 0.3,
            global_attention: GlobalAttnType::General,
            self_attn_type: SelfAttnType::ScaledDot,
            heads: 8,
            transformer_ff: 2048,
            coverage_attn: false,
            copy_attn: false,
            context_gate: None,
            cnn_kernel_width: 3,
            seed: 3435,
        }
    }
}

impl ModelOptions {
    /// 从 JSON 字符串读取，缺失字段使用默认值
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// 从 JSON 文件读取
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// 编码器方向数
    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// 检查配置组合是否合法
    pub fn validate(&self) -> Result<()> {
        if self.enc_layers == 0 || self.dec_layers == 0 {
            return Err(ModelError::InvalidConfig("layer count must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.rnn_size % self.num_directions() != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "rnn_size {} is not divisible by the number of directions {}",
                self.rnn_size,
                self.num_directions()
            )));
        }
        if self.padding_idx >= self.src_vocab_size || self.padding_idx >= self.tgt_vocab_size {
            return Err(ModelError::InvalidConfig(format!(
                "padding_idx {} is outside the vocabulary",
                self.padding_idx
            )));
        }

        let uses_transformer = self.encoder_type == EncoderType::Transformer
            || self.decoder_type == DecoderType::Transformer;
        if uses_transformer {
            if self.heads == 0 || self.rnn_size % self.heads != 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "rnn_size {} must be divisible by heads {}",
                    self.rnn_size, self.heads
                )));
            }
            if self.word_vec_size != self.rnn_size {
                return Err(ModelError::InvalidConfig(
                    "transformer layers require word_vec_size == rnn_size".into(),
                ));
            }
        }
        if self.encoder_type == EncoderType::Cnn && self.cnn_kernel_width == 0 {
            return Err(ModelError::InvalidConfig("cnn_kernel_width must be positive".into()));
        }

        if self.decoder_type == DecoderType::StdRnn {
            if self.coverage_attn {
                return Err(ModelError::Unsupported {
                    decoder: "standard RNN",
                    feature: "coverage attention",
                });
            }
            if self.copy_attn {
                return Err(ModelError::Unsupported {
                    decoder: "standard RNN",
                    feature: "copy attention",
                });
            }
        }

        Ok(())
    }
}

/// 预设配置
pub mod configs {
    use super::*;

    /// 极小模型（用于测试）
    pub fn tiny() -> ModelOptions {
        ModelOptions {
            src_vocab_size: 20,
            tgt_vocab_size: 20,
            word_vec_size: 8,
            enc_layers: 1,
            dec_layers: 1,
            rnn_size: 8,
            dropout: 0.0,
            heads: 2,
            transformer_ff: 16,
            ..ModelOptions::default()
        }
    }

    /// 经典的 attention RNN 翻译模型
    pub fn rnn_base() -> ModelOptions {
        ModelOptions {
            src_vocab_size: 50000,
            tgt_vocab_size: 50000,
            bidirectional: true,
            ..ModelOptions::default()
        }
    }

    /// "Attention is All You Need" 的 base 配置
    pub fn transformer_base() -> ModelOptions {
        ModelOptions {
            src_vocab_size: 32000,
            tgt_vocab_size: 32000,
            word_vec_size: 512,
            position_encoding: true,
            encoder_type: EncoderType::Transformer,
            decoder_type: DecoderType::Transformer,
            enc_layers: 6,
            dec_layers: 6,
            rnn_size: 512,
            dropout: 0.1,
            heads: 8,
            transformer_ff: 2048,
            ..ModelOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        configs::tiny().validate().unwrap();
        configs::rnn_base().validate().unwrap();
        configs::transformer_base().validate().unwrap();
    }

    #[test]
    fn test_odd_rnn_size_with_bidirectional_is_rejected() {
        let options = ModelOptions {
            rnn_size: 7,
            bidirectional: true,
            ..configs::tiny()
        };

        assert!(matches!(options.validate(), Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn test_std_rnn_rejects_coverage_and_copy() {
        let coverage = ModelOptions {
            decoder_type: DecoderType::StdRnn,
            coverage_attn: true,
            ..configs::tiny()
        };
        let copy = ModelOptions {
            decoder_type: DecoderType::StdRnn,
            copy_attn: true,
            ..configs::tiny()
        };

        assert!(matches!(coverage.validate(), Err(ModelError::Unsupported { .. })));
        assert!(matches!(copy.validate(), Err(ModelError::Unsupported { .. })));
    }

    #[test]
    fn test_from_json_uses_defaults_for_missing_fields() {
        let options = ModelOptions::from_json_str(
            r#"{
                "encoder_type": "transformer",
                "decoder_type": "transformer",
                "self_attn_type": "average",
                "rnn_type": "GRU",
                "word_vec_size": 16,
                "rnn_size": 16,
                "heads": 4,
                "context_gate": "both"
            }"#,
        )
        .unwrap();

        assert_eq!(options.encoder_type, EncoderType::Transformer);
        assert_eq!(options.self_attn_type, SelfAttnType::Average);
        assert_eq!(options.rnn_type, RnnType::Gru);
        assert_eq!(options.context_gate, Some(ContextGateType::Both));
        assert_eq!(options.padding_idx, 1);
    }

    #[test]
    fn test_from_json_rejects_unknown_variant() {
        let result = ModelOptions::from_json_str(r#"{ "global_attention": "cosine" }"#);
        assert!(matches!(result, Err(ModelError::Json(_))));
    }
}

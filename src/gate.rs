//! Context Gate
//!
//! 在 RNN 解码器中平衡源端上下文（attention 输出）与目标端上下文
//! （当前输入嵌入和 RNN 输出）对最终输出的贡献。
//!
//! ```text
//! z   = σ(W [e; h; c])
//! P_s = W_s c
//! P_t = W_t [e; h]
//!
//! source: tanh(P_t + z ⊙ P_s)
//! target: tanh(z ⊙ P_t + P_s)
//! both:   tanh((1 - z) ⊙ P_t + z ⊙ P_s)
//! ```

use ndarray::Array2;
use rand::rngs::StdRng;

use crate::config::ContextGateType;
use crate::layers::{Dropout, Linear};
use crate::tensor::TensorExt;

#[derive(Debug, Clone)]
pub struct ContextGate {
    gate_type: ContextGateType,
    gate: Linear,
    source_proj: Linear,
    target_proj: Linear,
}

impl ContextGate {
    /// # 参数
    /// - `embeddings_size`: 解码器每步输入的维度（input feed 时包含上一步输出）
    /// - `decoder_size`: RNN 输出维度
    /// - `attention_size`: attention 输出维度
    /// - `output_size`: 门控输出维度
    pub fn new(
        gate_type: ContextGateType,
        embeddings_size: usize,
        decoder_size: usize,
        attention_size: usize,
        output_size: usize,
        rng: &mut StdRng,
    ) -> Self {
        let input_size = embeddings_size + decoder_size + attention_size;
        Self {
            gate_type,
            gate: Linear::new(input_size, output_size, true, rng),
            source_proj: Linear::new(attention_size, output_size, true, rng),
            target_proj: Linear::new(embeddings_size + decoder_size, output_size, true, rng),
        }
    }

    pub fn gate_type(&self) -> ContextGateType {
        self.gate_type
    }

    /// 输入均为 [rows, *]，返回 [rows, output_size]
    pub fn forward(&self, prev_emb: &Array2<f32>, dec_state: &Array2<f32>, attn_state: &Array2<f32>) -> Array2<f32> {
        let target_input = prev_emb.concat(dec_state, 1);
        let z = self.gate.forward(&target_input.concat(attn_state, 1)).sigmoid();
        let source = self.source_proj.forward(attn_state);
        let target = self.target_proj.forward(&target_input);

        let mixed = match self.gate_type {
            ContextGateType::Source => &target + &(&z * &source),
            ContextGateType::Target => &(&z * &target) + &source,
            ContextGateType::Both => &(&z.mapv(|v| 1.0 - v) * &target) + &(&z * &source),
        };
        mixed.tanh()
    }

    pub fn param_count(&self) -> usize {
        self.gate.param_count() + self.source_proj.param_count() + self.target_proj.param_count()
    }
}

/// 解码器输出：有门控时 `dropout(gate(e, h, c))`，否则 `dropout(c)`
pub fn gated_output(
    gate: Option<&ContextGate>,
    dropout: &mut Dropout,
    prev_emb: &Array2<f32>,
    rnn_output: &Array2<f32>,
    attn_output: &Array2<f32>,
) -> Array2<f32> {
    match gate {
        Some(g) => dropout.forward(&g.forward(prev_emb, rnn_output, attn_output)),
        None => dropout.forward(attn_output),
    }
}

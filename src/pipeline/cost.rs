//! Token and cost arithmetic for admission control and final accounting.

use rust_decimal::Decimal;

use crate::models::inference::{ChatMessage, Usage};
use crate::providers::ModelInfo;

const ONE_MILLION: u64 = 1_000_000;

/// Rough prompt size: ~4 characters per token, counting role tags too.
/// Estimation feeds the admission bias, not billing, so cheap beats exact.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|m| m.content.chars().count() + m.role.len() + 4)
        .sum();
    chars.div_ceil(4) as u32
}

/// Pre-admission estimate: `(prompt + max_tokens/2) × price floor`.
/// Under-estimation is deliberate; stage 9 corrects with real usage.
pub fn estimate_cost(prompt_tokens: u32, max_tokens: u32, price_floor_per_m: Decimal) -> Decimal {
    let tokens = prompt_tokens as u64 + (max_tokens as u64) / 2;
    Decimal::from(tokens) * price_floor_per_m / Decimal::from(ONE_MILLION)
}

/// Billing-grade cost from provider-reported usage and the model's price
/// sheet.
pub fn actual_cost(usage: &Usage, info: &ModelInfo) -> Decimal {
    let input = Decimal::from(usage.prompt_tokens) * info.input_cost_per_m;
    let output = Decimal::from(usage.completion_tokens) * info.output_cost_per_m;
    (input + output) / Decimal::from(ONE_MILLION)
}

//! Best-effort token counting over the tiktoken BPE singletons.

use tiktoken_rs::{tokenizer, CoreBPE};

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
    }
}

/// Counts tokens with the encoder matching `model`, falling back to
/// `cl100k_base` for ids tiktoken does not know (Anthropic, Gemini).
pub fn count_tokens_bpe(model: &str, text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    bpe_for_model(model).encode_with_special_tokens(text).len()
}

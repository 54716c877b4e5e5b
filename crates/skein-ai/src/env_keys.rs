// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! API-key resolution from conventional environment variables.

/// Look up the API key for `provider` in its conventional environment
/// variables.  Returns `None` when nothing is set; the transport then
/// falls back to the key carried in the stream options.
pub fn get_env_api_key(provider: &str) -> Option<String> {
    let candidates: &[&str] = match provider {
        // OAuth token takes precedence over the plain API key.
        "anthropic" => &["ANTHROPIC_OAUTH_TOKEN", "ANTHROPIC_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "github-copilot" => &["COPILOT_GITHUB_TOKEN", "GH_TOKEN", "GITHUB_TOKEN"],
        "google" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        "xai" => &["XAI_API_KEY"],
        "groq" => &["GROQ_API_KEY"],
        "cerebras" => &["CEREBRAS_API_KEY"],
        "openrouter" => &["OPENROUTER_API_KEY"],
        "vercel-ai-gateway" => &["AI_GATEWAY_API_KEY"],
        "zai" => &["ZAI_API_KEY"],
        "mistral" => &["MISTRAL_API_KEY"],
        "minimax" => &["MINIMAX_API_KEY"],
        "huggingface" => &["HF_TOKEN"],
        "opencode" => &["OPENCODE_API_KEY"],
        _ => return None,
    };
    candidates.iter().find_map(|var| match std::env::var(var) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests poke process-global state; each test uses its own
    // variable names to stay independent of execution order.

    #[test]
    fn unknown_provider_yields_none() {
        assert_eq!(get_env_api_key("definitely-not-a-provider"), None);
    }

    #[test]
    fn groq_key_resolved_from_env() {
        std::env::set_var("GROQ_API_KEY", "gsk-test");
        assert_eq!(get_env_api_key("groq").as_deref(), Some("gsk-test"));
        std::env::remove_var("GROQ_API_KEY");
    }

    #[test]
    fn empty_value_treated_as_unset() {
        std::env::set_var("CEREBRAS_API_KEY", "");
        assert_eq!(get_env_api_key("cerebras"), None);
        std::env::remove_var("CEREBRAS_API_KEY");
    }

    #[test]
    fn anthropic_oauth_token_takes_precedence() {
        std::env::set_var("ANTHROPIC_OAUTH_TOKEN", "oat-1");
        std::env::set_var("ANTHROPIC_API_KEY", "key-2");
        assert_eq!(get_env_api_key("anthropic").as_deref(), Some("oat-1"));
        std::env::remove_var("ANTHROPIC_OAUTH_TOKEN");
        std::env::remove_var("ANTHROPIC_API_KEY");
    }
}

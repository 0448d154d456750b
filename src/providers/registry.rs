use serde::Serialize;

use crate::models::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Capability {
    Vision,
    Pdfs,
    Search,
    Reasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
}

/// One entry of the model table. `id` is what clients send; `api_identifier`
/// is what the provider expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub id: &'static str,
    pub name: &'static str,
    pub provider: ProviderId,
    pub api_identifier: &'static str,
    pub tier: Tier,
    pub capabilities: &'static [Capability],
}

impl ModelConfig {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

pub static MODELS: &[ModelConfig] = &[
    ModelConfig {
        id: "gpt-4o-mini",
        name: "GPT-4o Mini",
        provider: ProviderId::OpenAi,
        api_identifier: "gpt-4o-mini",
        tier: Tier::Free,
        capabilities: &[Capability::Vision],
    },
    ModelConfig {
        id: "claude-3-haiku-20240307",
        name: "Claude 3 Haiku",
        provider: ProviderId::Anthropic,
        api_identifier: "claude-3-haiku-20240307",
        tier: Tier::Free,
        capabilities: &[Capability::Vision, Capability::Pdfs],
    },
    ModelConfig {
        id: "gemini-1.5-flash-latest",
        name: "Gemini 1.5 Flash",
        provider: ProviderId::Google,
        api_identifier: "gemini-1.5-flash-latest",
        tier: Tier::Free,
        capabilities: &[Capability::Vision, Capability::Pdfs, Capability::Search],
    },
    ModelConfig {
        id: "gpt-4o",
        name: "GPT-4o",
        provider: ProviderId::OpenAi,
        api_identifier: "gpt-4o",
        tier: Tier::Pro,
        capabilities: &[Capability::Vision],
    },
    ModelConfig {
        id: "claude-3-5-sonnet-20240620",
        name: "Claude 3.5 Sonnet",
        provider: ProviderId::Anthropic,
        api_identifier: "claude-3-5-sonnet-20240620",
        tier: Tier::Pro,
        capabilities: &[Capability::Vision, Capability::Pdfs, Capability::Reasoning],
    },
    ModelConfig {
        id: "gemini-2.0-flash-exp",
        name: "Gemini 2.0 Flash",
        provider: ProviderId::Google,
        api_identifier: "gemini-2.0-flash-exp",
        tier: Tier::Pro,
        capabilities: &[Capability::Vision, Capability::Search, Capability::Pdfs],
    },
];

pub fn find_model(id: &str) -> Option<&'static ModelConfig> {
    MODELS.iter().find(|m| m.id == id)
}

pub fn all_models() -> &'static [ModelConfig] {
    MODELS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<_> = MODELS.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), MODELS.len());
    }

    #[test]
    fn test_every_provider_is_represented() {
        for provider in [ProviderId::OpenAi, ProviderId::Anthropic, ProviderId::Google] {
            assert!(MODELS.iter().any(|m| m.provider == provider));
        }
    }

    #[test]
    fn test_lookup() {
        let model = find_model("claude-3-5-sonnet-20240620").unwrap();
        assert_eq!(model.provider, ProviderId::Anthropic);
        assert_eq!(model.tier, Tier::Pro);
        assert!(model.supports(Capability::Reasoning));
        assert!(find_model("gpt-5-ultra").is_none());
    }
}

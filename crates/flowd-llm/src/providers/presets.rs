use std::collections::HashMap;

/// Defaults for an OpenAI-compatible backend, selected by `provider = "..."`.
#[derive(Debug, Clone, Copy)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

const fn keyed(name: &'static str, default_base_url: &'static str) -> ProviderPreset {
    ProviderPreset {
        name,
        default_base_url,
        needs_api_key: true,
        extra_headers: &[],
    }
}

/// Backends the default model ladders draw from.
const PRESETS: &[ProviderPreset] = &[
    keyed("openai", "https://api.openai.com/v1/chat/completions"),
    keyed("gemini", "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"),
    keyed("deepseek", "https://api.deepseek.com/v1/chat/completions"),
    keyed("qwen", "https://dashscope-intl.aliyuncs.com/compatible-mode/v1/chat/completions"),
    keyed("groq", "https://api.groq.com/openai/v1/chat/completions"),
    keyed("mistral", "https://api.mistral.ai/v1/chat/completions"),
    ProviderPreset {
        name: "openrouter",
        default_base_url: "https://openrouter.ai/api/v1/chat/completions",
        needs_api_key: true,
        extra_headers: &[("X-Title", "flowd")],
    },
    ProviderPreset {
        name: "ollama",
        default_base_url: "http://localhost:11434/v1/chat/completions",
        needs_api_key: false,
        extra_headers: &[],
    },
];

pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    PRESETS.iter().find(|p| p.name == provider).copied()
}

pub fn all_preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|p| p.name)
}

/// Preset headers with the user's configured headers layered on top.
pub fn build_extra_headers(
    preset: &ProviderPreset,
    user_headers: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = preset
        .extra_headers
        .iter()
        .filter(|(k, _)| !user_headers.contains_key(*k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut user: Vec<_> = user_headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    user.sort();
    headers.extend(user);
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_preset_resolves() {
        for name in all_preset_names() {
            assert!(get_preset(name).is_some(), "missing preset {}", name);
        }
        assert!(get_preset("anthropic").is_none());
        assert!(!get_preset("ollama").unwrap().needs_api_key);
    }

    #[test]
    fn user_headers_override_preset() {
        let preset = get_preset("openrouter").unwrap();
        let mut user = HashMap::new();
        user.insert("X-Title".to_string(), "custom".to_string());
        user.insert("HTTP-Referer".to_string(), "https://example.com".to_string());
        let headers = build_extra_headers(&preset, &user);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains(&("X-Title".to_string(), "custom".to_string())));
    }
}

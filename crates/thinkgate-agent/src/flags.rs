use serde::{Deserialize, Serialize};
use tracing::warn;

/// Runtime feature switches.
///
/// Loaded from the `[features]` config table, then overridden by the
/// `ENABLE_*` environment variables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Run several generate+critique branches per round and keep the best.
    #[serde(default)]
    pub parallel_thinking: bool,
    /// Re-rank providers by observed latency and success rate.
    #[serde(default)]
    pub adaptive_optimization: bool,
    /// Trim and collapse prompts before generation.
    #[serde(default)]
    pub prompt_compression: bool,
}

/// Overrides [`FeatureFlags::parallel_thinking`].
pub const ENV_PARALLEL_THINKING: &str = "ENABLE_PARALLEL_THINKING";
/// Overrides [`FeatureFlags::adaptive_optimization`].
pub const ENV_ADAPTIVE_OPTIMIZATION: &str = "ENABLE_ADAPTIVE_OPTIMIZATION";
/// Overrides [`FeatureFlags::prompt_compression`].
pub const ENV_PROMPT_COMPRESSION: &str = "ENABLE_PROMPT_COMPRESSION";

impl FeatureFlags {
    /// Applies the process environment on top of these flags.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary lookup. Unset or unparseable
    /// values leave the flag unchanged.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let apply = |name: &str, flag: &mut bool| {
            if let Some(raw) = lookup(name) {
                match parse_flag(&raw) {
                    Some(value) => *flag = value,
                    None => warn!(var = name, value = %raw, "Ignoring unrecognised flag value"),
                }
            }
        };
        apply(ENV_PARALLEL_THINKING, &mut self.parallel_thinking);
        apply(ENV_ADAPTIVE_OPTIMIZATION, &mut self.adaptive_optimization);
        apply(ENV_PROMPT_COMPRESSION, &mut self.prompt_compression);
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

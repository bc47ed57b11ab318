//! Service settings resolved from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::router::RouterSettings;

pub const DEFAULT_SESSION_COOKIE: &str = "sb-access-token";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    /// Environment variable holding the provider's API key.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "OPENAI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    /// Highest sampling temperature the provider's API accepts.
    pub fn max_temperature(&self) -> f32 {
        match self {
            LlmProvider::OpenAi => 2.0,
            LlmProvider::Anthropic => 1.0,
        }
    }
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            _ => Err(ConfigError::Invalid {
                var: "ASSISTANT_LLM_PROVIDER",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    /// `None` selects the provider's default model.
    pub model: Option<String>,
    pub api_key: Option<String>,
}

/// Where rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreSettings {
    Supabase { url: String, anon_key: String },
    Fixture { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind: SocketAddr,
    pub llm: LlmSettings,
    pub router: RouterSettings,
    pub store: StoreSettings,
    /// `token=user_id,...` pairs for fixture mode.
    pub dev_tokens: String,
    pub session_cookie: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Resolve settings through `lookup`, which returns a variable's value
    /// if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let bind = parse_or(&get, "ASSISTANT_BIND", SocketAddr::from(([127, 0, 0, 1], 8787)))?;

        let provider = match get("ASSISTANT_LLM_PROVIDER") {
            Some(value) => value.parse()?,
            None => LlmProvider::default(),
        };
        let llm = LlmSettings {
            provider,
            model: get("ASSISTANT_MODEL"),
            api_key: get(provider.api_key_var()),
        };

        let defaults = RouterSettings::default();
        let router = RouterSettings {
            router_temperature: parse_or(
                &get,
                "ASSISTANT_ROUTER_TEMPERATURE",
                defaults.router_temperature,
            )?,
            temperature: parse_or(&get, "ASSISTANT_TEMPERATURE", defaults.temperature)?,
            max_history: parse_or(&get, "ASSISTANT_MAX_HISTORY", defaults.max_history)?,
            call_timeout: Duration::from_secs(parse_or(
                &get,
                "ASSISTANT_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
        };
        for (var, temperature) in [
            ("ASSISTANT_ROUTER_TEMPERATURE", router.router_temperature),
            ("ASSISTANT_TEMPERATURE", router.temperature),
        ] {
            if !(0.0..=provider.max_temperature()).contains(&temperature) {
                return Err(ConfigError::Invalid {
                    var,
                    value: temperature.to_string(),
                });
            }
        }
        if router.call_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "ASSISTANT_CALL_TIMEOUT_SECS",
                value: "0".into(),
            });
        }

        let store = match (get("SUPABASE_URL"), get("SUPABASE_ANON_KEY")) {
            (Some(url), Some(anon_key)) => StoreSettings::Supabase { url, anon_key },
            (url, key) => {
                if url.is_some() || key.is_some() {
                    warn!("only one of SUPABASE_URL and SUPABASE_ANON_KEY is set; using fixture store");
                }
                StoreSettings::Fixture {
                    path: get("ASSISTANT_FIXTURE")
                        .map(PathBuf::from)
                        .unwrap_or_else(crate::default_fixture_path),
                }
            }
        };

        Ok(Self {
            bind,
            llm,
            router,
            store,
            dev_tokens: get("ASSISTANT_DEV_TOKENS").unwrap_or_default(),
            session_cookie: get("ASSISTANT_SESSION_COOKIE")
                .unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
        })
    }
}

/// Parse `var` if set, otherwise use `default`.
fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind, "127.0.0.1:8787".parse::<SocketAddr>().unwrap());
        assert_eq!(s.llm.provider, LlmProvider::OpenAi);
        assert_eq!(s.llm.model, None);
        assert_eq!(s.llm.api_key, None);
        assert_eq!(s.router, RouterSettings::default());
        assert!(matches!(s.store, StoreSettings::Fixture { .. }));
        assert_eq!(s.session_cookie, DEFAULT_SESSION_COOKIE);
        assert!(s.dev_tokens.is_empty());
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("ASSISTANT_BIND", "0.0.0.0:9000"),
            ("ASSISTANT_LLM_PROVIDER", "Anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("ASSISTANT_MODEL", "claude-sonnet-4-5"),
            ("ASSISTANT_ROUTER_TEMPERATURE", "0"),
            ("ASSISTANT_MAX_HISTORY", "8"),
            ("ASSISTANT_CALL_TIMEOUT_SECS", "12"),
            ("SUPABASE_URL", "https://x.supabase.co"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("ASSISTANT_SESSION_COOKIE", "session"),
        ])
        .unwrap();

        assert_eq!(s.bind.port(), 9000);
        assert_eq!(s.llm.provider, LlmProvider::Anthropic);
        assert_eq!(s.llm.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(s.llm.model.as_deref(), Some("claude-sonnet-4-5"));
        assert_eq!(s.router.router_temperature, 0.0);
        assert_eq!(s.router.max_history, 8);
        assert_eq!(s.router.call_timeout, Duration::from_secs(12));
        assert_eq!(
            s.store,
            StoreSettings::Supabase {
                url: "https://x.supabase.co".into(),
                anon_key: "anon".into()
            }
        );
        assert_eq!(s.session_cookie, "session");
    }

    #[test]
    fn test_fixture_path_override() {
        let s = settings(&[("ASSISTANT_FIXTURE", "/tmp/fixture.json")]).unwrap();
        assert_eq!(
            s.store,
            StoreSettings::Fixture {
                path: PathBuf::from("/tmp/fixture.json")
            }
        );
    }

    #[test]
    fn test_partial_supabase_falls_back_to_fixture() {
        let s = settings(&[("SUPABASE_URL", "https://x.supabase.co")]).unwrap();
        assert!(matches!(s.store, StoreSettings::Fixture { .. }));
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            settings(&[("ASSISTANT_MAX_HISTORY", "lots")]).unwrap_err(),
            ConfigError::Invalid {
                var: "ASSISTANT_MAX_HISTORY",
                value: "lots".into()
            }
        );
        assert!(settings(&[("ASSISTANT_LLM_PROVIDER", "gemini")]).is_err());
        assert!(settings(&[("ASSISTANT_BIND", "localhost")]).is_err());
        assert!(settings(&[("ASSISTANT_TEMPERATURE", "3.5")]).is_err());
        assert!(settings(&[("ASSISTANT_CALL_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn test_provider_parse_error_names_the_variable() {
        assert_eq!(
            "gemini".parse::<LlmProvider>(),
            Err(ConfigError::Invalid {
                var: "ASSISTANT_LLM_PROVIDER",
                value: "gemini".into()
            })
        );
        assert_eq!(" OpenAI ".parse::<LlmProvider>(), Ok(LlmProvider::OpenAi));
    }

    #[test]
    fn test_temperature_capped_per_provider() {
        let openai = settings(&[("ASSISTANT_TEMPERATURE", "1.5")]).unwrap();
        assert_eq!(openai.router.temperature, 1.5);

        assert_eq!(
            settings(&[
                ("ASSISTANT_LLM_PROVIDER", "anthropic"),
                ("ASSISTANT_TEMPERATURE", "1.5"),
            ])
            .unwrap_err(),
            ConfigError::Invalid {
                var: "ASSISTANT_TEMPERATURE",
                value: "1.5".into()
            }
        );
        assert!(
            settings(&[
                ("ASSISTANT_LLM_PROVIDER", "anthropic"),
                ("ASSISTANT_ROUTER_TEMPERATURE", "1.2"),
            ])
            .is_err()
        );
        assert!(
            settings(&[
                ("ASSISTANT_LLM_PROVIDER", "anthropic"),
                ("ASSISTANT_TEMPERATURE", "1"),
            ])
            .is_ok()
        );
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let s = settings(&[("ASSISTANT_MAX_HISTORY", "  ")]).unwrap();
        assert_eq!(s.router.max_history, 20);
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taxora_core::providers::RetryPolicy;
use tracing::{info, warn};

/// Shipped defaults, used by `taxora init` and when no config file exists yet
pub const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxoraConfig {
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_backend")]
    pub default_backend: String,
    #[serde(default = "default_true")]
    pub switching_enabled: bool,
    /// Empty string disables the default fallback
    #[serde(default = "default_fallback_backend")]
    pub fallback_backend: String,
    #[serde(default)]
    pub fallback_overrides: HashMap<String, String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            switching_enabled: true,
            fallback_backend: default_fallback_backend(),
            fallback_overrides: HashMap::new(),
        }
    }
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_fallback_backend() -> String {
    "local".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub chatgpt: ApiProviderConfig,
    #[serde(default)]
    pub claude: ApiProviderConfig,
    #[serde(default)]
    pub grok: ApiProviderConfig,
    #[serde(default)]
    pub perplexity: ApiProviderConfig,
    #[serde(default)]
    pub huggingface: ApiProviderConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

/// Settings shared by the hosted, key-authenticated backends.
/// An empty `model` or `base_url` means the backend's own default.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ApiProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            base_url: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: None,
        }
    }
}

impl std::fmt::Debug for ApiProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiProviderConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    /// Used once the primary key is rate limited
    #[serde(default)]
    pub backup_api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// 0 disables the client-side budget
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            backup_api_key: String::new(),
            model: String::new(),
            base_url: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: None,
            requests_per_minute: default_requests_per_minute(),
            requests_per_day: default_requests_per_day(),
        }
    }
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &mask_secret(&self.api_key))
            .field("backup_api_key", &mask_secret(&self.backup_api_key))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("requests_per_day", &self.requests_per_day)
            .finish()
    }
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_requests_per_minute() -> u32 {
    taxora_core::providers::gemini::DEFAULT_REQUESTS_PER_MINUTE
}

fn default_requests_per_day() -> u32 {
    taxora_core::providers::gemini::DEFAULT_REQUESTS_PER_DAY
}

/// Ollama-served model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_local_base_url")]
    pub base_url: String,
    #[serde(default = "default_local_model")]
    pub model: String,
    #[serde(default = "default_local_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_local_timeout_secs")]
    pub timeout_secs: Option<u64>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_local_base_url(),
            model: default_local_model(),
            max_tokens: default_local_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_local_timeout_secs(),
        }
    }
}

fn default_local_base_url() -> String {
    taxora_core::providers::local::OLLAMA_BASE_URL.to_string()
}

fn default_local_model() -> String {
    "granite3.3:8b".to_string()
}

fn default_local_max_tokens() -> u32 {
    512
}

fn default_local_timeout_secs() -> Option<u64> {
    Some(90)
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Recent user and assistant messages sent upstream with each turn
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Upper bound on a whole chat turn, fallback included
    #[serde(default)]
    pub chat_timeout_secs: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            port: default_gateway_port(),
            auth_token: String::new(),
            max_message_chars: default_max_message_chars(),
            history_window: default_history_window(),
            chat_timeout_secs: None,
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("auth_token", &mask_secret(&self.auth_token))
            .field("max_message_chars", &self.max_message_chars)
            .field("history_window", &self.history_window)
            .field("chat_timeout_secs", &self.chat_timeout_secs)
            .finish()
    }
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_max_message_chars() -> usize {
    taxora_gateway::server::DEFAULT_MAX_MESSAGE_CHARS
}

fn default_history_window() -> usize {
    taxora_gateway::session::DEFAULT_HISTORY_WINDOW
}

/// Show the first 3 and last 4 characters of a secret
fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taxora")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl TaxoraConfig {
    /// Load from `custom_path`, or `~/.taxora/config.toml`.
    ///
    /// An explicit path must exist. A missing default file falls back to
    /// the shipped defaults.
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let mut config = match custom_path {
            Some(path) => Self::load_from(path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::load_from(&path)?
                } else {
                    info!(
                        "No config at {}, using built-in defaults. Run `taxora init` to create one.",
                        path.display()
                    );
                    Self::parse(DEFAULT_CONFIG).context("Failed to parse built-in config")?
                }
            }
        };

        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        // Refuse files that group or other can read
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `taxora init` first.",
                path.display()
            )
        })?;

        for key in Self::hardcoded_secret_keys(&content) {
            warn!(
                "{} is hardcoded in {}. For security, reference an environment variable instead, e.g. \"${{VAR}}\"",
                key,
                path.display()
            );
        }

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Expand allowlisted `${VAR}` references, then parse TOML
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());
        Ok(toml::from_str(&expanded)?)
    }

    /// Apply `DEFAULT_AI_PROVIDER` and `ALLOW_AI_SWITCHING`
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = lookup("DEFAULT_AI_PROVIDER") {
            let provider = provider.trim().to_lowercase();
            if !provider.is_empty() {
                // "granite" was the local model's id in earlier deployments
                let provider = if provider == "granite" {
                    "local".to_string()
                } else {
                    provider
                };
                info!("DEFAULT_AI_PROVIDER overrides default backend: {}", provider);
                self.router.default_backend = provider;
            }
        }

        if let Some(allow) = lookup("ALLOW_AI_SWITCHING") {
            self.router.switching_enabled = allow.trim().eq_ignore_ascii_case("true");
        }
    }

    fn secrets(&self) -> Vec<(&'static str, &str)> {
        let p = &self.providers;
        vec![
            ("providers.gemini.api_key", &p.gemini.api_key),
            ("providers.gemini.backup_api_key", &p.gemini.backup_api_key),
            ("providers.chatgpt.api_key", &p.chatgpt.api_key),
            ("providers.claude.api_key", &p.claude.api_key),
            ("providers.grok.api_key", &p.grok.api_key),
            ("providers.perplexity.api_key", &p.perplexity.api_key),
            ("providers.huggingface.api_key", &p.huggingface.api_key),
            ("gateway.auth_token", &self.gateway.auth_token),
        ]
    }

    /// Secret keys written literally instead of as `${VAR}` references.
    /// Runs on the file text before expansion.
    pub fn hardcoded_secret_keys(raw: &str) -> Vec<&'static str> {
        let Ok(parsed) = toml::from_str::<TaxoraConfig>(raw) else {
            return Vec::new();
        };
        parsed
            .secrets()
            .into_iter()
            .filter(|(_, value)| !value.is_empty() && !value.contains("${"))
            .map(|(key, _)| key)
            .collect()
    }

    /// Copy with every secret masked, for display
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        let p = &mut copy.providers;
        p.gemini.api_key = mask_secret(&p.gemini.api_key);
        p.gemini.backup_api_key = mask_secret(&p.gemini.backup_api_key);
        for api in [
            &mut p.chatgpt,
            &mut p.claude,
            &mut p.grok,
            &mut p.perplexity,
            &mut p.huggingface,
        ] {
            api.api_key = mask_secret(&api.api_key);
        }
        copy.gateway.auth_token = mask_secret(&copy.gateway.auth_token);
        copy
    }
}

/// Allowlist of environment variable names that may be expanded in config files.
/// Anything else stays unexpanded so a tampered config cannot read arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "GEMINI_API_KEY",
    "GEMINI_API_KEY_BACKUP",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "XAI_API_KEY",
    "PERPLEXITY_API_KEY",
    "HUGGINGFACE_API_KEY",
    "TAXORA_GATEWAY_TOKEN",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = lookup(&var_name).unwrap_or_default();
        let value_len = value.len();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value_len;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_config_parses() {
        let config: TaxoraConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.router.default_backend, "local");
        assert!(config.router.switching_enabled);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.gateway.port, 8000);
        assert!(config.providers.local.enabled);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: TaxoraConfig = toml::from_str("").unwrap();
        assert_eq!(config.router.fallback_backend, "local");
        assert_eq!(config.providers.gemini.requests_per_minute, 50);
        assert_eq!(config.providers.gemini.requests_per_day, 1500);
        assert_eq!(config.providers.local.timeout_secs, Some(90));
        assert_eq!(config.providers.chatgpt.timeout_secs, None);
        assert_eq!(config.gateway.max_message_chars, 2000);
        assert_eq!(config.gateway.history_window, 10);
    }

    #[test]
    fn test_fallback_overrides() {
        let config: TaxoraConfig = toml::from_str(
            r#"
            [router]
            default_backend = "gemini"
            fallback_backend = ""

            [router.fallback_overrides]
            claude = "chatgpt"
            "#,
        )
        .unwrap();
        assert_eq!(config.router.default_backend, "gemini");
        assert!(config.router.fallback_backend.is_empty());
        assert_eq!(config.router.fallback_overrides["claude"], "chatgpt");
    }

    #[test]
    fn test_retry_policy() {
        let config: TaxoraConfig = toml::from_str(
            r#"
            [retry]
            max_retries = 4
            base_delay_ms = 100
            "#,
        )
        .unwrap();
        let policy = config.retry.policy();
        assert_eq!(policy.max_retries, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(20));
    }

    #[test]
    fn test_expand_allowlisted_vars() {
        let lookup = |name: &str| match name {
            "GEMINI_API_KEY" => Some("AIzaTest".to_string()),
            "SECRET_STUFF" => Some("leaked".to_string()),
            _ => None,
        };
        let expanded = expand_env_vars(
            r#"a = "${GEMINI_API_KEY}"
b = "${SECRET_STUFF}"
c = "${OPENAI_API_KEY}""#,
            lookup,
        );
        assert!(expanded.contains(r#"a = "AIzaTest""#));
        assert!(expanded.contains(r#"b = "${SECRET_STUFF}""#));
        assert!(expanded.contains(r#"c = """#));
        assert!(!expanded.contains("leaked"));
    }

    #[test]
    fn test_expand_unterminated_reference() {
        assert_eq!(expand_env_vars("key = \"${HOME\"", no_env), "key = \"${HOME\"");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TaxoraConfig::default();
        config.apply_env_overrides(|name| match name {
            "DEFAULT_AI_PROVIDER" => Some(" Gemini ".to_string()),
            "ALLOW_AI_SWITCHING" => Some("FALSE".to_string()),
            _ => None,
        });
        assert_eq!(config.router.default_backend, "gemini");
        assert!(!config.router.switching_enabled);

        config.apply_env_overrides(|name| match name {
            "DEFAULT_AI_PROVIDER" => Some("granite".to_string()),
            "ALLOW_AI_SWITCHING" => Some("true".to_string()),
            _ => None,
        });
        assert_eq!(config.router.default_backend, "local");
        assert!(config.router.switching_enabled);
    }

    #[test]
    fn test_env_overrides_absent() {
        let mut config = TaxoraConfig::default();
        config.apply_env_overrides(no_env);
        assert_eq!(config.router.default_backend, "local");
        assert!(config.router.switching_enabled);
    }

    #[test]
    fn test_hardcoded_secret_keys() {
        let raw = r#"
            [providers.gemini]
            api_key = "${GEMINI_API_KEY}"

            [providers.chatgpt]
            api_key = "sk-pasted-directly"
        "#;
        assert_eq!(
            TaxoraConfig::hardcoded_secret_keys(raw),
            vec!["providers.chatgpt.api_key"]
        );
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-abcdefghijkl"), "sk-...ijkl");
    }

    #[test]
    fn test_masked_and_debug_hide_keys() {
        let mut config = TaxoraConfig::default();
        config.providers.claude.api_key = "sk-ant-secretsecret".to_string();
        config.gateway.auth_token = "gateway-token-1234".to_string();

        let masked = config.masked();
        assert_eq!(masked.providers.claude.api_key, "sk-...cret");
        assert_eq!(masked.gateway.auth_token, "gat...1234");
        assert_eq!(masked.providers.grok.api_key, "(empty)");

        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-ant-secretsecret"));
        assert!(!debug.contains("gateway-token-1234"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_world_readable_file() {
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router]\ndefault_backend = \"gemini\"").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = TaxoraConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("chmod 600"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[router]\ndefault_backend = \"claude\"\n\n[gateway]\nport = 9100"
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .unwrap();
        }

        let config = TaxoraConfig::load_from(file.path()).unwrap();
        assert_eq!(config.router.default_backend, "claude");
        assert_eq!(config.gateway.port, 9100);
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = TaxoraConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("taxora init"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(TaxoraConfig::parse("[router\ndefault_backend =").is_err());
    }
}

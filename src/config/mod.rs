//! TOML configuration.
//!
//! Every section is optional; a missing section takes its defaults. Paths
//! accept `~` and are expanded when the file is loaded.

use crate::providers::ProviderKind;
use crate::registry::{default_catalog, ContentType, Model};
use crate::strategy::PricingTable;
use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "SHOTCALLER_CONFIG";

/// Environment variable overriding `[gateway] admin_token`.
pub const ADMIN_TOKEN_ENV: &str = "SHOTCALLER_ADMIN_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory holding `ledger.db`, `vault.db` and `vault.key`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Model catalog. Empty means the built-in catalog.
    #[serde(default)]
    pub models: Vec<Model>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            gateway: GatewayConfig::default(),
            ledger: LedgerConfig::default(),
            vault: VaultConfig::default(),
            pricing: PricingConfig::default(),
            providers: ProvidersConfig::default(),
            models: Vec::new(),
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Overall deadline for one HTTP request, provider call included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer token for `/admin/*`. Admin routes are closed when unset.
    #[serde(default)]
    pub admin_token: Option<SecretString>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Blocks credited to a tenant the first time it is seen.
    #[serde(default = "default_starting_grant")]
    pub starting_grant: u64,
    /// Admitted requests per tenant per window. 0 disables the limit.
    #[serde(default = "default_rate_limit_per_window")]
    pub rate_limit_per_window: u32,
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            starting_grant: default_starting_grant(),
            rate_limit_per_window: default_rate_limit_per_window(),
            rate_window_secs: default_rate_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_capacity_per_cycle")]
    pub default_capacity_per_cycle: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Master key file. Defaults to `<data_dir>/vault.key`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            default_capacity_per_cycle: default_capacity_per_cycle(),
            sweep_interval_secs: default_sweep_interval_secs(),
            key_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PricingConfig {
    /// Flat block cost per specialty request, keyed by content type name.
    #[serde(default)]
    pub specialty_costs: BTreeMap<String, u64>,
}

impl PricingConfig {
    pub fn table(&self) -> Result<PricingTable> {
        let mut specialty = BTreeMap::new();
        for (name, cost) in &self.specialty_costs {
            let content_type: ContentType = name
                .parse()
                .with_context(|| format!("[pricing.specialty_costs] key {name:?}"))?;
            specialty.insert(content_type, *cost);
        }
        Ok(PricingTable::new(specialty))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Seeded into the vault when the provider has no credentials yet.
    #[serde(default)]
    pub api_keys: Vec<SecretString>,
    /// Capacity for seeded keys. Falls back to the vault default.
    #[serde(default)]
    pub capacity_per_cycle: Option<u64>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_provider_timeout_secs(),
            base_url: None,
            api_keys: Vec::new(),
            capacity_per_cycle: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub gemini: ProviderConfig,
}

// ── Defaults ─────────────────────────────────────────────────────

fn default_data_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".shotcaller"))
        .unwrap_or_else(|| PathBuf::from(".shotcaller"))
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8088
}

fn default_max_body_bytes() -> usize {
    65_536
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_starting_grant() -> u64 {
    10
}

fn default_rate_limit_per_window() -> u32 {
    60
}

fn default_rate_window_secs() -> u64 {
    3600
}

fn default_cooldown_secs() -> u64 {
    3600
}

fn default_capacity_per_cycle() -> u64 {
    100_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_provider_timeout_secs() -> u64 {
    60
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Default config file: `~/.shotcaller/config.toml`.
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Load from `path`, `$SHOTCALLER_CONFIG`, or the default location.
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => {
                let path = expand_path(&path);
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))?
            }
            None => {
                let path = Self::default_path();
                if path.exists() {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read config: {}", path.display()))?;
                    Self::from_toml(&raw)
                        .with_context(|| format!("Failed to parse config: {}", path.display()))?
                } else {
                    Self::default()
                }
            }
        };

        if let Ok(token) = std::env::var(ADMIN_TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.gateway.admin_token = Some(SecretString::from(token));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and expand `~` in paths. Does not validate.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.data_dir = expand_path(&config.data_dir);
        config.vault.key_path = config.vault.key_path.as_deref().map(expand_path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.rate_window_secs == 0 {
            anyhow::bail!("[ledger] rate_window_secs must be greater than zero");
        }
        if self.vault.cooldown_secs == 0 {
            anyhow::bail!("[vault] cooldown_secs must be greater than zero");
        }
        if self.vault.default_capacity_per_cycle == 0 {
            anyhow::bail!("[vault] default_capacity_per_cycle must be greater than zero");
        }
        if self.vault.sweep_interval_secs == 0 {
            anyhow::bail!("[vault] sweep_interval_secs must be greater than zero");
        }
        if self.gateway.request_timeout_secs == 0 {
            anyhow::bail!("[gateway] request_timeout_secs must be greater than zero");
        }
        for &kind in ProviderKind::ALL {
            let provider = self.provider(kind);
            if provider.timeout_secs == 0 {
                anyhow::bail!("[providers.{kind}] timeout_secs must be greater than zero");
            }
            if provider.capacity_per_cycle == Some(0) {
                anyhow::bail!("[providers.{kind}] capacity_per_cycle must be greater than zero");
            }
        }

        self.pricing.table()?;

        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                anyhow::bail!("duplicate model id in [[models]]: {}", model.id);
            }
        }
        Ok(())
    }

    pub fn provider(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::OpenAi => &self.providers.openai,
            ProviderKind::Anthropic => &self.providers.anthropic,
            ProviderKind::Gemini => &self.providers.gemini,
        }
    }

    /// Configured catalog, or the built-in one when none is configured.
    pub fn catalog(&self) -> Vec<Model> {
        if self.models.is_empty() {
            default_catalog()
        } else {
            self.models.clone()
        }
    }

    pub fn ledger_db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn vault_db_path(&self) -> PathBuf {
        self.data_dir.join("vault.db")
    }

    pub fn vault_key_path(&self) -> PathBuf {
        self.vault
            .key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vault.key"))
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    #[test]
    fn empty_document_takes_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.ledger.starting_grant, 10);
        assert_eq!(config.ledger.rate_limit_per_window, 60);
        assert_eq!(config.ledger.rate_window_secs, 3600);
        assert_eq!(config.vault.cooldown_secs, 3600);
        assert_eq!(config.vault.default_capacity_per_cycle, 100_000);
        assert_eq!(config.provider(ProviderKind::Gemini).timeout_secs, 60);
        assert!(config.models.is_empty());
        assert_eq!(config.catalog().len(), default_catalog().len());
        config.validate().unwrap();
    }

    #[test]
    fn sections_parse() {
        let config = Config::from_toml(
            r#"
            data_dir = "/var/lib/shotcaller"

            [ledger]
            starting_grant = 25

            [vault]
            cooldown_secs = 120

            [pricing.specialty_costs]
            video = 4

            [providers.openai]
            timeout_secs = 15
            base_url = "http://localhost:9999/v1"
            api_keys = ["sk-one", "sk-two"]

            [[models]]
            id = "gpt-4o-mini"
            provider = "openai"
            group = "fast"
            pricing_unit = "kilo_units"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/shotcaller"));
        assert_eq!(config.ledger.starting_grant, 25);
        assert_eq!(config.vault.cooldown_secs, 120);
        let pricing = config.pricing.table().unwrap();
        assert_eq!(pricing.specialty_cost(ContentType::Video), 4);
        assert_eq!(pricing.specialty_cost(ContentType::Image), 1);
        let openai = config.provider(ProviderKind::OpenAi);
        assert_eq!(openai.timeout_secs, 15);
        assert_eq!(openai.api_keys.len(), 2);
        assert_eq!(openai.api_keys[1].expose_secret(), "sk-two");
        assert_eq!(config.catalog().len(), 1);
        assert_eq!(config.vault_db_path(), PathBuf::from("/var/lib/shotcaller/vault.db"));
    }

    #[test]
    fn debug_output_hides_api_keys() {
        let config = Config::from_toml(
            r#"
            [providers.anthropic]
            api_keys = ["sk-ant-very-secret"]
            "#,
        )
        .unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-ant-very-secret"));
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = Config::default();
        config.ledger.rate_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.vault.default_capacity_per_cycle = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.providers.gemini.timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("providers.gemini"));
    }

    #[test]
    fn validate_rejects_duplicate_models() {
        let mut config = Config::default();
        config.models = vec![default_catalog()[0].clone(), default_catalog()[0].clone()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nport = 9100\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.gateway.port, 9100);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(Some(&tmp.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn validate_rejects_unknown_content_type_in_pricing() {
        let config = Config::from_toml("[pricing.specialty_costs]\nhologram = 3\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("hologram"));
    }

    #[test]
    fn key_path_defaults_under_data_dir() {
        let config = Config::from_toml("data_dir = \"/srv/sc\"").unwrap();
        assert_eq!(config.vault_key_path(), PathBuf::from("/srv/sc/vault.key"));
    }
}

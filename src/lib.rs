//! HealthChain record registry core
//!
//! Derives privacy-preserving patient identifiers from biometric templates,
//! appends content-addressed record pointers to a per-patient append-only
//! ledger log, and records every read in a separate access audit log.

pub mod audit;
pub mod clock;
pub mod content;
pub mod digest;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod models;
pub mod records;
pub mod registry;
pub mod telemetry;

pub use error::RegistryError;
pub use registry::{FetchOutcome, IntegrityReport, Registry};

/// Application configuration
pub mod config {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Deserialize, Serialize)]
    #[serde(default)]
    pub struct Config {
        pub records: LedgerConfig,
        pub audit: LedgerConfig,
        pub retry: RetryConfig,
        pub logging: LoggingConfig,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum BackendKind {
        Memory,
        Sqlite,
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    #[serde(default)]
    pub struct LedgerConfig {
        pub backend: BackendKind,
        pub url: String,
        pub max_connections: u32,
        pub max_entry_bytes: usize,
    }

    impl Default for LedgerConfig {
        fn default() -> Self {
            Self {
                backend: BackendKind::Memory,
                url: String::new(),
                max_connections: 4,
                max_entry_bytes: 4096,
            }
        }
    }

    /// Backoff for ledger reads.
    #[derive(Debug, Clone, Deserialize, Serialize)]
    #[serde(default)]
    pub struct RetryConfig {
        /// Total attempts, including the first.
        pub attempts: usize,
        pub base_delay_ms: u64,
        pub max_delay_ms: u64,
    }

    impl Default for RetryConfig {
        fn default() -> Self {
            Self {
                attempts: 3,
                base_delay_ms: 50,
                max_delay_ms: 1_000,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize, Serialize)]
    #[serde(default)]
    pub struct LoggingConfig {
        /// `EnvFilter` directive used when `RUST_LOG` is unset.
        pub filter: String,
        pub json: bool,
    }

    impl Default for LoggingConfig {
        fn default() -> Self {
            Self {
                filter: "info".to_string(),
                json: false,
            }
        }
    }

    /// Load configuration from file
    ///
    /// Struct defaults, then `config/default`, then `config/<HEALTHCHAIN_ENV>`,
    /// then `HEALTHCHAIN__SECTION__KEY` environment variables.
    pub fn load_config() -> Result<Config, config::ConfigError> {
        let env = std::env::var("HEALTHCHAIN_ENV").unwrap_or_else(|_| "development".into());

        config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    /// `HEALTHCHAIN__RECORDS__URL` overrides `records.url`.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("HEALTHCHAIN")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

}

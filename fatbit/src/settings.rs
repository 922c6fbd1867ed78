use crate::{info, AppError};
use config::{Config, Environment, File};
use dotenv::dotenv;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Once;
use std::time::Duration;

/// Hard limits of a single entity group transaction.
pub const MAX_BATCH_ROWS: usize = 100;
pub const MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;

static DOTENV_ONCE: Once = Once::new();

fn ensure_dotenv_loaded() {
    DOTENV_ONCE.call_once(|| {
        match dotenv() {
            Ok(_) => info!("Config loaded including .env file."),
            Err(_) => info!("Config loaded without .env file."),
        }
    });
}

pub fn load_config<T>(path: &str, prefix: &str) -> Result<T, AppError>
where
    T: DeserializeOwned + Debug,
{
    ensure_dotenv_loaded();

    let builder = Config::builder()
        .add_source(File::with_name(path).required(true))
        .add_source(
            Environment::with_prefix(prefix)
                .try_parsing(true)
                .separator("__"),
        );

    let cfg = builder.build()?.try_deserialize::<T>()?;
    info!("{:#?}", cfg);
    Ok(cfg)
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FatbitSettings {
    pub codec: CodecSettings,
    pub batch: BatchSettings,
    pub query: QuerySettings,
    pub registry: RegistrySettings,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CodecSettings {
    pub max_slots: usize,
    pub slot_size: usize,
}

impl Default for CodecSettings {
    fn default() -> Self {
        // 64K column limit minus room for the encoding envelope
        Self { max_slots: 14, slot_size: 63_997 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchSettings {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_rows: MAX_BATCH_ROWS, max_bytes: MAX_BATCH_BYTES, concurrency: 8 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QuerySettings {
    pub page_size: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self { page_size: 1_000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistrySettings {
    pub partition_key: String,
    pub conflict_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self { partition_key: "__fatbit_index_registry".to_string(), conflict_retries: 5, retry_delay_ms: 50 }
    }
}

impl RegistrySettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl FatbitSettings {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let settings: FatbitSettings = load_config(path, "FATBIT")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: &str| Err(AppError::Configuration(msg.to_string()));
        if self.codec.max_slots == 0 || self.codec.max_slots > 99 {
            return fail("codec.max_slots must be within 1..=99");
        }
        if self.codec.slot_size == 0 {
            return fail("codec.slot_size must be positive");
        }
        if self.batch.max_rows == 0 || self.batch.max_rows > MAX_BATCH_ROWS {
            return fail("batch.max_rows must be within 1..=100");
        }
        if self.batch.max_bytes == 0 || self.batch.max_bytes > MAX_BATCH_BYTES {
            return fail("batch.max_bytes must be within 1..=4194304");
        }
        if self.batch.concurrency == 0 {
            return fail("batch.concurrency must be positive");
        }
        if self.query.page_size == 0 {
            return fail("query.page_size must be positive");
        }
        if self.registry.partition_key.trim().is_empty() {
            return fail("registry.partition_key must not be blank");
        }
        if self.registry.conflict_retries == 0 {
            return fail("registry.conflict_retries must be positive");
        }
        Ok(())
    }
}

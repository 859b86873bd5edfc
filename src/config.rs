use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    DynamoDb,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dynamodb" | "dynamo" => Ok(StoreBackend::DynamoDb),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("unknown STORE_BACKEND '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamoConfig {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub table_name: String,
    pub backend: StoreBackend,
    pub dynamo: DynamoConfig,
    pub store_timeout_ms: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; unset values fall back to local-dev defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.into());

        let backend = match lookup("STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::DynamoDb,
        };
        let store_timeout_ms = match lookup("STORE_TIMEOUT_MS") {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("STORE_TIMEOUT_MS '{raw}': {e}"))?,
            ),
            None => None,
        };
        let dynamo = DynamoConfig {
            endpoint: var("DYNAMODB_ENDPOINT", "http://localhost:8000"),
            region: var("AWS_REGION", "us-west-2"),
            access_key: var("AWS_ACCESS_KEY_ID", "AK1"),
            secret_key: var("AWS_SECRET_ACCESS_KEY", "SK1"),
        };

        Ok(Self {
            table_name: var("TABLE_NAME", "user-table"),
            backend,
            dynamo,
            store_timeout_ms,
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::config::{AppConfig, StoreBackend};
use crate::storage::{DynamoStore, KvStore, MemoryStore};
use crate::users::UserStore;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserStore>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let client = match config.backend {
            StoreBackend::DynamoDb => {
                let dynamo = &config.dynamo;
                Arc::new(
                    DynamoStore::new(
                        &dynamo.endpoint,
                        &dynamo.region,
                        &dynamo.access_key,
                        &dynamo.secret_key,
                    )
                    .await?,
                ) as Arc<dyn KvStore>
            }
            StoreBackend::Memory => {
                tracing::warn!("using in-memory store, data is lost on exit");
                Arc::new(MemoryStore::new()) as Arc<dyn KvStore>
            }
        };

        let mut users = UserStore::new(client, &config.table_name);
        if let Some(ms) = config.store_timeout_ms {
            users = users.with_timeout(Duration::from_millis(ms));
        }
        users
            .initialize_table()
            .await
            .context("initialize user table")?;

        Ok(Self::from_parts(users, config))
    }

    pub fn from_parts(users: UserStore, config: Arc<AppConfig>) -> Self {
        Self {
            users: Arc::new(users),
            config,
        }
    }

    /// State over a fresh in-memory table.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_lookup(|name| {
            (name == "STORE_BACKEND").then(|| "memory".to_string())
        })?);
        let users = UserStore::new(Arc::new(MemoryStore::new()), &config.table_name);
        users.initialize_table().await?;
        Ok(Self::from_parts(users, config))
    }
}

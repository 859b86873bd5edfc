use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::storage::{Guard, KvError, KvStore, TableSchema, WriteOp};
use crate::users::repo_types::{EmailIndex, User, EMAIL_ATTR, USER_KIND};

/// Users persisted as a primary record keyed by id plus an email reservation
/// keyed by email. Both halves only ever change inside one transaction.
#[derive(Clone)]
pub struct UserStore {
    client: Arc<dyn KvStore>,
    table: String,
    timeout: Option<Duration>,
}

impl UserStore {
    pub fn new(client: Arc<dyn KvStore>, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            timeout: None,
        }
    }

    /// Bounds every store call; an elapsed call fails and is not retried.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn call<T, F>(&self, fut: F) -> std::result::Result<T, KvError>
    where
        F: Future<Output = std::result::Result<T, KvError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| KvError::TimedOut(limit))?,
            None => fut.await,
        }
    }

    /// Creates the table when it is not listed yet.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn initialize_table(&self) -> Result<()> {
        let tables = self
            .call(self.client.list_tables())
            .await
            .map_err(|e| StoreError::transport("list_tables", &self.table, e))?;
        debug!(?tables, "found tables");

        if tables.iter().any(|name| name == &self.table) {
            info!("table already exists, skipping initialization");
            return Ok(());
        }

        info!("table not found, creating");
        self.call(self.client.create_table(&TableSchema::keyed_by_id(&self.table)))
            .await
            .map_err(|e| {
                error!(error = %e, "create table failed");
                StoreError::transport("create_table", &self.table, e)
            })?;
        info!("table created");
        Ok(())
    }

    /// Writes the user and its email reservation, both guarded against existing keys.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn create(&self, user: &User) -> Result<()> {
        require(&user.id, "id")?;
        require(&user.email, "email")?;

        let item = user
            .to_item()
            .map_err(|e| StoreError::transport("create", &user.id, e))?;
        let ops = vec![
            WriteOp::put_new(item),
            WriteOp::put_new(user.email_index().to_item()),
        ];

        match self.call(self.client.transact_write(&self.table, ops)).await {
            Ok(()) => {
                info!("user created");
                Ok(())
            }
            Err(e) if e.is_condition_failed() => {
                warn!("id or email already taken");
                Err(StoreError::DuplicateIdentity)
            }
            Err(e) => {
                error!(error = %e, "create transaction failed");
                Err(StoreError::transport("create", &user.id, e))
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: &str) -> Result<User> {
        require(id, "id")?;

        let item = self
            .call(self.client.get(&self.table, &User::key_for(id)))
            .await
            .map_err(|e| {
                error!(error = %e, "get failed");
                StoreError::transport("get", id, e)
            })?
            .ok_or(StoreError::NotFound)?;

        User::from_item(&item).map_err(|e| {
            error!(error = %e, "stored user unreadable");
            StoreError::transport("get", id, e)
        })
    }

    /// Resolves the email reservation, then reads the owning user.
    #[instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> Result<User> {
        require(email, "email")?;

        let item = self
            .call(self.client.get(&self.table, &EmailIndex::key_for(email)))
            .await
            .map_err(|e| {
                error!(error = %e, "get email index failed");
                StoreError::transport("get", email, e)
            })?
            .ok_or(StoreError::NotFound)?;
        let index = EmailIndex::from_item(&item).ok_or(StoreError::NotFound)?;

        self.get_by_id(&index.user_id).await
    }

    /// Every primary record, following scan pages until exhausted.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<User>> {
        let mut users = Vec::new();
        let mut start = None;
        loop {
            let page = self
                .call(self.client.scan(&self.table, USER_KIND, start))
                .await
                .map_err(|e| {
                    error!(error = %e, "scan failed");
                    StoreError::transport("scan", &self.table, e)
                })?;
            for item in &page.items {
                let user = User::from_item(item)
                    .map_err(|e| StoreError::transport("scan", &item.key.id, e))?;
                users.push(user);
            }
            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }
        debug!(count = users.len(), "listed users");
        Ok(users)
    }

    /// Replaces the primary record when the email is unchanged, otherwise
    /// runs [`UserStore::update`] to move the email reservation as well.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn put(&self, user: &User) -> Result<()> {
        require(&user.id, "id")?;
        require(&user.email, "email")?;

        let item = user
            .to_item()
            .map_err(|e| StoreError::transport("put", &user.id, e))?;
        let same_email = Guard::attr_equals(EMAIL_ATTR, &user.email);

        match self
            .call(self.client.put(&self.table, item, Some(same_email)))
            .await
        {
            Ok(()) => {
                debug!("user replaced in place");
                Ok(())
            }
            Err(e) if e.is_condition_failed() => {
                debug!("stored email differs, falling back to update");
                self.update(user).await
            }
            Err(e) => {
                error!(error = %e, "put failed");
                Err(StoreError::transport("put", &user.id, e))
            }
        }
    }

    /// Read-modify-write of the primary record. When the email changes the new
    /// reservation is inserted (guarded) and the old one deleted in the same
    /// transaction. Concurrent updates of one user may overwrite each other.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn update(&self, user: &User) -> Result<()> {
        require(&user.id, "id")?;
        require(&user.email, "email")?;

        let current = self.get_by_id(&user.id).await?;

        let item = user
            .to_item()
            .map_err(|e| StoreError::transport("update", &user.id, e))?;
        let mut ops = vec![WriteOp::put(item)];
        if user.email != current.email {
            debug!("email changed, moving reservation");
            ops.push(WriteOp::put_new(user.email_index().to_item()));
            ops.push(WriteOp::delete(EmailIndex::key_for(&current.email)));
        }

        match self.call(self.client.transact_write(&self.table, ops)).await {
            Ok(()) => {
                info!("user updated");
                Ok(())
            }
            Err(e) if e.is_condition_failed() => {
                warn!("new email already taken");
                Err(StoreError::DuplicateIdentity)
            }
            Err(e) => {
                error!(error = %e, "update transaction failed");
                Err(StoreError::transport("update", &user.id, e))
            }
        }
    }

    /// Reads the user to learn its email, then removes both records together.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let user = self.get_by_id(id).await?;

        let ops = vec![
            WriteOp::delete(user.key()),
            WriteOp::delete(EmailIndex::key_for(&user.email)),
        ];
        self.call(self.client.transact_write(&self.table, ops))
            .await
            .map_err(|e| {
                error!(error = %e, "delete transaction failed");
                StoreError::transport("delete", id, e)
            })?;
        info!("user deleted");
        Ok(())
    }
}

fn require(value: &str, field: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::MissingIdentifier(field));
    }
    Ok(())
}

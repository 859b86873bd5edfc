//! Single-table key-value store with per-item guards and multi-item transactions.
//!
//! Items are addressed by a hash key (`Id`) plus a sort key (`objectType`), the
//! same shape DynamoDB uses. `DynamoStore` talks to a real endpoint, `MemoryStore`
//! keeps everything in process with the same guard and transaction rules.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod dynamo;
mod memory;

pub use dynamo::DynamoStore;
pub use memory::MemoryStore;

/// Hash key attribute name.
pub const HASH_KEY: &str = "Id";
/// Sort key attribute name, holds the record kind.
pub const SORT_KEY: &str = "objectType";
/// Upper bound on members of one transactional write.
pub const MAX_TRANSACT_ITEMS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub id: String,
    pub kind: String,
}

impl ItemKey {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A stored item: its key plus string attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: ItemKey,
    pub attrs: BTreeMap<String, String>,
}

impl Item {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Precondition evaluated against the item currently stored at the target key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// No item may exist at the key.
    NotExists,
    /// An item must exist and carry `name` with exactly `value`.
    AttrEquals { name: String, value: String },
}

impl Guard {
    pub fn attr_equals(name: &str, value: impl Into<String>) -> Self {
        Guard::AttrEquals {
            name: name.to_string(),
            value: value.into(),
        }
    }

    /// Checks the guard against the stored item, if any.
    pub fn holds(&self, current: Option<&Item>) -> bool {
        match self {
            Guard::NotExists => current.is_none(),
            Guard::AttrEquals { name, value } => current
                .and_then(|item| item.attr(name))
                .is_some_and(|stored| stored == value.as_str()),
        }
    }
}

/// One member of a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { item: Item, guard: Option<Guard> },
    Delete { key: ItemKey, guard: Option<Guard> },
}

impl WriteOp {
    pub fn put(item: Item) -> Self {
        WriteOp::Put { item, guard: None }
    }

    pub fn put_new(item: Item) -> Self {
        WriteOp::Put {
            item,
            guard: Some(Guard::NotExists),
        }
    }

    pub fn delete(key: ItemKey) -> Self {
        WriteOp::Delete { key, guard: None }
    }

    pub fn key(&self) -> &ItemKey {
        match self {
            WriteOp::Put { item, .. } => &item.key,
            WriteOp::Delete { key, .. } => key,
        }
    }

    pub fn guard(&self) -> Option<&Guard> {
        match self {
            WriteOp::Put { guard, .. } | WriteOp::Delete { guard, .. } => guard.as_ref(),
        }
    }
}

/// One page of scan results. `next` is the key to resume from, `None` once exhausted.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub next: Option<ItemKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub read_capacity: i64,
    pub write_capacity: i64,
}

impl TableSchema {
    /// Hash key `Id`, range key `objectType`, 5/5 provisioned units.
    pub fn keyed_by_id(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_capacity: 5,
            write_capacity: 5,
        }
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("conditional check failed")]
    ConditionFailed,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("malformed item: {0}")]
    Malformed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl KvError {
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, KvError::ConditionFailed)
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, KvError>;

    async fn put(&self, table: &str, item: Item, guard: Option<Guard>) -> Result<(), KvError>;

    async fn delete(&self, table: &str, key: &ItemKey, guard: Option<Guard>)
        -> Result<(), KvError>;

    /// Returns items whose sort key equals `kind`, one page at a time.
    async fn scan(
        &self,
        table: &str,
        kind: &str,
        start: Option<ItemKey>,
    ) -> Result<ScanPage, KvError>;

    /// Applies every op or none of them.
    async fn transact_write(&self, table: &str, ops: Vec<WriteOp>) -> Result<(), KvError>;

    async fn list_tables(&self) -> Result<Vec<String>, KvError>;

    async fn create_table(&self, schema: &TableSchema) -> Result<(), KvError>;
}

/// Rejects transactions DynamoDB itself would refuse.
pub(crate) fn validate_transaction(ops: &[WriteOp]) -> Result<(), KvError> {
    if ops.is_empty() {
        return Err(KvError::Invalid("transaction has no members".into()));
    }
    if ops.len() > MAX_TRANSACT_ITEMS {
        return Err(KvError::Invalid(format!(
            "transaction has {} members, limit is {}",
            ops.len(),
            MAX_TRANSACT_ITEMS
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for op in ops {
        if !seen.insert(op.key()) {
            return Err(KvError::Invalid(format!(
                "transaction touches {} more than once",
                op.key()
            )));
        }
    }
    Ok(())
}

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::debug;

use super::{
    validate_transaction, Guard, Item, ItemKey, KvError, KvStore, ScanPage, TableSchema, WriteOp,
};

type Table = BTreeMap<ItemKey, Item>;

/// In-process store with DynamoDB's guard, transaction and scan paging rules.
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Table>>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(100)
    }

    /// `page_size` caps how many items one scan call evaluates, before filtering.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Number of items of every kind currently in `table`.
    pub fn item_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .map(|tables| tables.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Table) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| KvError::Transport(anyhow!("memory store lock poisoned")))?;
        let items = tables
            .get_mut(table)
            .ok_or_else(|| KvError::Invalid(format!("table '{table}' does not exist")))?;
        f(items)
    }
}

fn check(guard: Option<&Guard>, current: Option<&Item>) -> Result<(), KvError> {
    match guard {
        Some(guard) if !guard.holds(current) => Err(KvError::ConditionFailed),
        _ => Ok(()),
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, KvError> {
        self.with_table(table, |items| Ok(items.get(key).cloned()))
    }

    async fn put(&self, table: &str, item: Item, guard: Option<Guard>) -> Result<(), KvError> {
        self.with_table(table, |items| {
            check(guard.as_ref(), items.get(&item.key))?;
            items.insert(item.key.clone(), item);
            Ok(())
        })
    }

    async fn delete(
        &self,
        table: &str,
        key: &ItemKey,
        guard: Option<Guard>,
    ) -> Result<(), KvError> {
        self.with_table(table, |items| {
            check(guard.as_ref(), items.get(key))?;
            items.remove(key);
            Ok(())
        })
    }

    async fn scan(
        &self,
        table: &str,
        kind: &str,
        start: Option<ItemKey>,
    ) -> Result<ScanPage, KvError> {
        let page_size = self.page_size;
        self.with_table(table, |items| {
            let lower = match start {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            let mut evaluated = items.range((lower, Bound::Unbounded)).peekable();
            let mut page = ScanPage::default();
            let mut count = 0;
            while count < page_size {
                let Some((key, item)) = evaluated.next() else {
                    break;
                };
                count += 1;
                if key.kind == kind {
                    page.items.push(item.clone());
                }
                if count == page_size && evaluated.peek().is_some() {
                    page.next = Some(key.clone());
                }
            }
            Ok(page)
        })
    }

    async fn transact_write(&self, table: &str, ops: Vec<WriteOp>) -> Result<(), KvError> {
        validate_transaction(&ops)?;
        self.with_table(table, |items| {
            for op in &ops {
                check(op.guard(), items.get(op.key()))?;
            }
            for op in ops {
                match op {
                    WriteOp::Put { item, .. } => {
                        items.insert(item.key.clone(), item);
                    }
                    WriteOp::Delete { key, .. } => {
                        items.remove(&key);
                    }
                }
            }
            Ok(())
        })
    }

    async fn list_tables(&self) -> Result<Vec<String>, KvError> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| KvError::Transport(anyhow!("memory store lock poisoned")))?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), KvError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| KvError::Transport(anyhow!("memory store lock poisoned")))?;
        if tables.contains_key(&schema.name) {
            return Err(KvError::Invalid(format!(
                "table '{}' already exists",
                schema.name
            )));
        }
        debug!(table = %schema.name, "memory table created");
        tables.insert(schema.name.clone(), Table::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "test-table";

    async fn store_with_table(page_size: usize) -> MemoryStore {
        let store = MemoryStore::with_page_size(page_size);
        store
            .create_table(&TableSchema::keyed_by_id(TABLE))
            .await
            .expect("create table");
        store
    }

    fn item(id: &str, kind: &str) -> Item {
        Item::new(ItemKey::new(id, kind)).with("Name", id)
    }

    #[tokio::test]
    async fn operations_on_missing_table_are_rejected() {
        let store = MemoryStore::new();
        let err = store
            .get("nope", &ItemKey::new("a", "UserInfo"))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Invalid(_)));
    }

    #[tokio::test]
    async fn create_table_twice_fails() {
        let store = store_with_table(10).await;
        let err = store
            .create_table(&TableSchema::keyed_by_id(TABLE))
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Invalid(_)));
        assert_eq!(store.list_tables().await.unwrap(), vec![TABLE.to_string()]);
    }

    #[tokio::test]
    async fn guarded_put_and_delete() {
        let store = store_with_table(10).await;
        store
            .put(TABLE, item("a", "UserInfo"), Some(Guard::NotExists))
            .await
            .expect("first put");
        let err = store
            .put(TABLE, item("a", "UserInfo"), Some(Guard::NotExists))
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        let key = ItemKey::new("a", "UserInfo");
        let err = store
            .delete(TABLE, &key, Some(Guard::attr_equals("Name", "b")))
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
        store.delete(TABLE, &key, None).await.expect("delete");
        assert!(store.get(TABLE, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_transaction_applies_nothing() {
        let store = store_with_table(10).await;
        store
            .put(TABLE, item("taken", "UserInfo#email"), None)
            .await
            .unwrap();

        let err = store
            .transact_write(
                TABLE,
                vec![
                    WriteOp::put_new(item("fresh", "UserInfo")),
                    WriteOp::put_new(item("taken", "UserInfo#email")),
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
        assert!(store
            .get(TABLE, &ItemKey::new("fresh", "UserInfo"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.item_count(TABLE), 1);
    }

    #[tokio::test]
    async fn scan_pages_filter_by_kind() {
        let store = store_with_table(2).await;
        for id in ["a", "b", "c", "d", "e"] {
            store.put(TABLE, item(id, "UserInfo"), None).await.unwrap();
            store
                .put(TABLE, item(id, "UserInfo#email"), None)
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut start = None;
        let mut pages = 0;
        loop {
            let page = store.scan(TABLE, "UserInfo", start).await.unwrap();
            pages += 1;
            seen.extend(page.items.into_iter().map(|i| i.key.id));
            match page.next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(pages, 5);
    }
}

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::{
    config::{Builder as DynamoConfigBuilder, Region},
    error::SdkError,
    operation::{
        delete_item::DeleteItemError, put_item::PutItemError,
        transact_write_items::TransactWriteItemsError,
    },
    types::{
        AttributeDefinition, AttributeValue, Delete, KeySchemaElement, KeyType,
        ProvisionedThroughput, Put, ScalarAttributeType, TransactWriteItem,
    },
    Client,
};
use aws_smithy_types::retry::RetryConfig;
use tracing::debug;

use super::{
    validate_transaction, Guard, Item, ItemKey, KvError, KvStore, ScanPage, TableSchema, WriteOp,
    HASH_KEY, SORT_KEY,
};

type AttributeMap = HashMap<String, AttributeValue>;

/// `KvStore` backed by DynamoDB. SDK retries are disabled; callers own retry policy.
#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
}

impl DynamoStore {
    pub async fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
    ) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "static",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let conf = DynamoConfigBuilder::from(&shared)
            .endpoint_url(endpoint)
            .retry_config(RetryConfig::disabled())
            .build();

        Ok(Self::from_client(Client::from_conf(conf)))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn key_map(key: &ItemKey) -> AttributeMap {
    HashMap::from([
        (HASH_KEY.to_string(), AttributeValue::S(key.id.clone())),
        (SORT_KEY.to_string(), AttributeValue::S(key.kind.clone())),
    ])
}

fn item_to_map(item: Item) -> AttributeMap {
    let mut map = key_map(&item.key);
    map.extend(
        item.attrs
            .into_iter()
            .map(|(name, value)| (name, AttributeValue::S(value))),
    );
    map
}

fn map_to_item(map: &AttributeMap) -> Result<Item, KvError> {
    let string = |name: &str| -> Result<String, KvError> {
        match map.get(name) {
            Some(AttributeValue::S(value)) => Ok(value.clone()),
            Some(_) => Err(KvError::Malformed(format!("{name} is not a string"))),
            None => Err(KvError::Malformed(format!("{name} missing"))),
        }
    };
    let mut item = Item::new(ItemKey::new(string(HASH_KEY)?, string(SORT_KEY)?));
    for (name, value) in map {
        if name == HASH_KEY || name == SORT_KEY {
            continue;
        }
        match value {
            AttributeValue::S(value) => {
                item.attrs.insert(name.clone(), value.clone());
            }
            _ => return Err(KvError::Malformed(format!("{name} is not a string"))),
        }
    }
    Ok(item)
}

/// Condition expression plus the placeholders it binds.
struct Condition {
    expression: String,
    names: HashMap<String, String>,
    values: AttributeMap,
}

fn condition(guard: &Guard) -> Condition {
    match guard {
        Guard::NotExists => Condition {
            expression: "attribute_not_exists(#pk)".into(),
            names: HashMap::from([("#pk".to_string(), HASH_KEY.to_string())]),
            values: HashMap::new(),
        },
        Guard::AttrEquals { name, value } => Condition {
            expression: "#attr = :expected".into(),
            names: HashMap::from([("#attr".to_string(), name.clone())]),
            values: HashMap::from([(":expected".to_string(), AttributeValue::S(value.clone()))]),
        },
    }
}

fn transport<E>(err: E, what: &'static str) -> KvError
where
    E: std::error::Error + Send + Sync + 'static,
{
    KvError::Transport(anyhow::Error::new(err).context(what))
}

fn non_empty<T>(map: HashMap<String, T>) -> Option<HashMap<String, T>> {
    (!map.is_empty()).then_some(map)
}

/// A single put refused by its condition expression.
fn put_guard_failed<R>(err: &SdkError<PutItemError, R>) -> bool {
    matches!(
        err.as_service_error(),
        Some(PutItemError::ConditionalCheckFailedException(_))
    )
}

/// A transaction cancelled because at least one member's condition failed.
fn guard_cancelled<R>(err: &SdkError<TransactWriteItemsError, R>) -> bool {
    match err.as_service_error() {
        Some(TransactWriteItemsError::TransactionCanceledException(cancelled)) => cancelled
            .cancellation_reasons()
            .iter()
            .any(|reason| reason.code() == Some("ConditionalCheckFailed")),
        _ => false,
    }
}

fn transact_item(table: &str, op: WriteOp) -> Result<TransactWriteItem, KvError> {
    let member = match op {
        WriteOp::Put { item, guard } => {
            let cond = guard.as_ref().map(condition);
            let put = Put::builder()
                .table_name(table)
                .set_item(Some(item_to_map(item)))
                .set_condition_expression(cond.as_ref().map(|c| c.expression.clone()))
                .set_expression_attribute_names(
                    cond.as_ref().and_then(|c| non_empty(c.names.clone())),
                )
                .set_expression_attribute_values(cond.and_then(|c| non_empty(c.values)))
                .build()
                .map_err(|e| transport(e, "build transact put"))?;
            TransactWriteItem::builder().put(put).build()
        }
        WriteOp::Delete { key, guard } => {
            let cond = guard.as_ref().map(condition);
            let delete = Delete::builder()
                .table_name(table)
                .set_key(Some(key_map(&key)))
                .set_condition_expression(cond.as_ref().map(|c| c.expression.clone()))
                .set_expression_attribute_names(
                    cond.as_ref().and_then(|c| non_empty(c.names.clone())),
                )
                .set_expression_attribute_values(cond.and_then(|c| non_empty(c.values)))
                .build()
                .map_err(|e| transport(e, "build transact delete"))?;
            TransactWriteItem::builder().delete(delete).build()
        }
    };
    Ok(member)
}

#[async_trait]
impl KvStore for DynamoStore {
    async fn get(&self, table: &str, key: &ItemKey) -> Result<Option<Item>, KvError> {
        let out = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key_map(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| transport(e, "dynamodb get_item"))?;
        match out.item() {
            Some(map) if !map.is_empty() => map_to_item(map).map(Some),
            _ => Ok(None),
        }
    }

    async fn put(&self, table: &str, item: Item, guard: Option<Guard>) -> Result<(), KvError> {
        let cond = guard.as_ref().map(condition);
        let result = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(item_to_map(item)))
            .set_condition_expression(cond.as_ref().map(|c| c.expression.clone()))
            .set_expression_attribute_names(
                cond.as_ref().and_then(|c| non_empty(c.names.clone())),
            )
            .set_expression_attribute_values(cond.and_then(|c| non_empty(c.values)))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if put_guard_failed(&e) => Err(KvError::ConditionFailed),
            Err(e) => Err(transport(e, "dynamodb put_item")),
        }
    }

    async fn delete(
        &self,
        table: &str,
        key: &ItemKey,
        guard: Option<Guard>,
    ) -> Result<(), KvError> {
        let cond = guard.as_ref().map(condition);
        let result = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(key_map(key)))
            .set_condition_expression(cond.as_ref().map(|c| c.expression.clone()))
            .set_expression_attribute_names(
                cond.as_ref().and_then(|c| non_empty(c.names.clone())),
            )
            .set_expression_attribute_values(cond.and_then(|c| non_empty(c.values)))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(DeleteItemError::ConditionalCheckFailedException(_))
                ) =>
            {
                Err(KvError::ConditionFailed)
            }
            Err(e) => Err(transport(e, "dynamodb delete_item")),
        }
    }

    async fn scan(
        &self,
        table: &str,
        kind: &str,
        start: Option<ItemKey>,
    ) -> Result<ScanPage, KvError> {
        let out = self
            .client
            .scan()
            .table_name(table)
            .filter_expression("#kind = :kind")
            .expression_attribute_names("#kind", SORT_KEY)
            .expression_attribute_values(":kind", AttributeValue::S(kind.to_string()))
            .set_exclusive_start_key(start.as_ref().map(key_map))
            .send()
            .await
            .map_err(|e| transport(e, "dynamodb scan"))?;

        let items = out
            .items()
            .iter()
            .map(map_to_item)
            .collect::<Result<Vec<_>, _>>()?;
        let next = match out.last_evaluated_key() {
            Some(map) if !map.is_empty() => Some(map_to_item(map)?.key),
            _ => None,
        };
        debug!(table, kind, count = items.len(), more = next.is_some(), "scan page");
        Ok(ScanPage { items, next })
    }

    async fn transact_write(&self, table: &str, ops: Vec<WriteOp>) -> Result<(), KvError> {
        validate_transaction(&ops)?;
        let members = ops
            .into_iter()
            .map(|op| transact_item(table, op))
            .collect::<Result<Vec<_>, _>>()?;

        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(members))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if guard_cancelled(&e) => Err(KvError::ConditionFailed),
            Err(e) => Err(transport(e, "dynamodb transact_write_items")),
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>, KvError> {
        let mut names = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let out = self
                .client
                .list_tables()
                .set_exclusive_start_table_name(start.take())
                .send()
                .await
                .map_err(|e| transport(e, "dynamodb list_tables"))?;
            names.extend(out.table_names().iter().cloned());
            match out.last_evaluated_table_name() {
                Some(last) => start = Some(last.to_string()),
                None => break,
            }
        }
        Ok(names)
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), KvError> {
        let attribute = |name: &str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|e| transport(e, "build attribute definition"))
        };
        let key = |name: &str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|e| transport(e, "build key schema"))
        };
        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(schema.read_capacity)
            .write_capacity_units(schema.write_capacity)
            .build()
            .map_err(|e| transport(e, "build provisioned throughput"))?;

        self.client
            .create_table()
            .table_name(&schema.name)
            .attribute_definitions(attribute(HASH_KEY)?)
            .attribute_definitions(attribute(SORT_KEY)?)
            .key_schema(key(HASH_KEY, KeyType::Hash)?)
            .key_schema(key(SORT_KEY, KeyType::Range)?)
            .provisioned_throughput(throughput)
            .send()
            .await
            .context("dynamodb create_table")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_dynamodb::types::{
        error::{
            ConditionalCheckFailedException, ProvisionedThroughputExceededException,
            TransactionCanceledException,
        },
        CancellationReason,
    };

    fn cancelled(codes: &[&str]) -> SdkError<TransactWriteItemsError, ()> {
        let reasons = codes
            .iter()
            .map(|code| CancellationReason::builder().code(*code).build())
            .collect();
        let err = TransactionCanceledException::builder()
            .message("Transaction cancelled")
            .set_cancellation_reasons(Some(reasons))
            .build();
        SdkError::service_error(TransactWriteItemsError::TransactionCanceledException(err), ())
    }

    #[test]
    fn cancelled_transaction_with_failed_condition_is_a_guard_failure() {
        assert!(guard_cancelled(&cancelled(&["None", "ConditionalCheckFailed"])));
    }

    #[test]
    fn throttled_transaction_is_not_a_guard_failure() {
        assert!(!guard_cancelled(&cancelled(&["ThrottlingError"])));
        assert!(!guard_cancelled(&cancelled(&[])));
    }

    #[test]
    fn put_condition_failure_is_recognized() {
        let err: SdkError<PutItemError, ()> = SdkError::service_error(
            PutItemError::ConditionalCheckFailedException(
                ConditionalCheckFailedException::builder().message("nope").build(),
            ),
            (),
        );
        assert!(put_guard_failed(&err));

        let err: SdkError<PutItemError, ()> = SdkError::service_error(
            PutItemError::ProvisionedThroughputExceededException(
                ProvisionedThroughputExceededException::builder().message("slow down").build(),
            ),
            (),
        );
        assert!(!put_guard_failed(&err));
    }

    #[test]
    fn item_maps_to_string_attributes_with_key() {
        let item = Item::new(ItemKey::new("a@example.com", "UserInfo#email")).with("UserId", "u1");
        let map = item_to_map(item.clone());
        assert_eq!(map.len(), 3);
        assert_eq!(
            map.get(HASH_KEY),
            Some(&AttributeValue::S("a@example.com".into()))
        );
        assert_eq!(map_to_item(&map).expect("decode"), item);
    }

    #[test]
    fn non_string_attribute_is_malformed() {
        let mut map = key_map(&ItemKey::new("u1", "UserInfo"));
        map.insert("Name".into(), AttributeValue::N("5".into()));
        assert!(matches!(map_to_item(&map), Err(KvError::Malformed(_))));
    }

    #[test]
    fn missing_key_attribute_is_malformed() {
        let map = HashMap::from([(HASH_KEY.to_string(), AttributeValue::S("u1".into()))]);
        assert!(matches!(map_to_item(&map), Err(KvError::Malformed(_))));
    }

    #[test]
    fn guards_render_placeholder_conditions() {
        let not_exists = condition(&Guard::NotExists);
        assert_eq!(not_exists.expression, "attribute_not_exists(#pk)");
        assert_eq!(not_exists.names.get("#pk").map(String::as_str), Some(HASH_KEY));
        assert!(not_exists.values.is_empty());

        let equals = condition(&Guard::attr_equals("Email", "a@example.com"));
        assert_eq!(equals.expression, "#attr = :expected");
        assert_eq!(equals.names.get("#attr").map(String::as_str), Some("Email"));
        assert_eq!(
            equals.values.get(":expected"),
            Some(&AttributeValue::S("a@example.com".into()))
        );
    }

    #[test]
    fn transact_put_carries_table_and_condition() {
        let item = Item::new(ItemKey::new("u1", "UserInfo")).with("Email", "a@example.com");
        let member = transact_item("users", WriteOp::put_new(item)).expect("build");
        let put = member.put().expect("put member");
        assert_eq!(put.table_name(), "users");
        assert_eq!(
            put.condition_expression(),
            Some("attribute_not_exists(#pk)")
        );
        assert!(member.delete().is_none());
    }
}

//! Amazon DynamoDB document store

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, info};

use super::{Condition, DocumentStore, DocumentStoreError, Item};

const TABLE_ACTIVE_POLLS: u32 = 120;
const TABLE_ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where to reach DynamoDB
#[derive(Debug, Clone)]
pub struct DynamoDbConfig {
    /// Override for local or compatible deployments
    pub endpoint_url: Option<String>,
    pub region: String,
}

#[derive(Clone)]
pub struct DynamoDbStore {
    client: Client,
}

impl DynamoDbStore {
    /// Credentials come from the standard AWS provider chain
    pub async fn connect(config: &DynamoDbConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        info!(
            "Using DynamoDB in {} at {}",
            config.region,
            config.endpoint_url.as_deref().unwrap_or("the default endpoint")
        );
        Self {
            client: Client::new(&sdk_config),
        }
    }

    async fn table_status(&self, table: &str) -> Result<Option<TableStatus>, DocumentStoreError> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(output) => Ok(output
                .table()
                .and_then(|t| t.table_status())
                .cloned()),
            Err(e) => match classify(table, e) {
                DocumentStoreError::TableNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }
}

/// Map SDK failures onto the store's error taxonomy
fn classify<E, R>(table: &str, err: SdkError<E, R>) -> DocumentStoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    match err.code() {
        Some("ConditionalCheckFailedException") => DocumentStoreError::ConditionCheckFailed,
        Some("ResourceNotFoundException") => DocumentStoreError::TableNotFound(table.to_string()),
        _ => DocumentStoreError::Transport(format!("{}: {}", table, DisplayErrorContext(&err))),
    }
}

fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(to_attributes(map)),
    }
}

fn to_attributes(item: &Item) -> HashMap<String, AttributeValue> {
    item.iter()
        .map(|(name, value)| (name.clone(), to_attribute(value)))
        .collect()
}

fn parse_number(n: &str) -> Result<Value, DocumentStoreError> {
    if let Ok(i) = n.parse::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(u) = n.parse::<u64>() {
        return Ok(Value::from(u));
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| DocumentStoreError::InvalidItem(format!("bad number '{}'", n)))
}

fn from_attribute(value: &AttributeValue) -> Result<Value, DocumentStoreError> {
    match value {
        AttributeValue::Null(_) => Ok(Value::Null),
        AttributeValue::Bool(b) => Ok(Value::Bool(*b)),
        AttributeValue::N(n) => parse_number(n),
        AttributeValue::S(s) => Ok(Value::String(s.clone())),
        AttributeValue::Ss(values) => Ok(Value::from(values.clone())),
        AttributeValue::Ns(values) => values.iter().map(|n| parse_number(n)).collect(),
        AttributeValue::L(values) => values.iter().map(from_attribute).collect(),
        AttributeValue::M(map) => from_attributes(map).map(Value::Object),
        other => Err(DocumentStoreError::InvalidItem(format!(
            "unsupported attribute value {:?}",
            other
        ))),
    }
}

fn from_attributes(map: &HashMap<String, AttributeValue>) -> Result<Item, DocumentStoreError> {
    map.iter()
        .map(|(name, value)| Ok((name.clone(), from_attribute(value)?)))
        .collect()
}

/// Condition expression with its attribute names and values
struct Expression {
    text: String,
    names: HashMap<String, String>,
    values: Option<HashMap<String, AttributeValue>>,
}

fn expression(condition: &Condition) -> Expression {
    let names = |attribute: &str| HashMap::from([("#a".to_string(), attribute.to_string())]);
    match condition {
        Condition::AttributeNotExists(attribute) => Expression {
            text: "attribute_not_exists(#a)".to_string(),
            names: names(attribute),
            values: None,
        },
        Condition::AttributeEquals(attribute, value) => Expression {
            text: "#a = :v".to_string(),
            names: names(attribute),
            values: Some(HashMap::from([(":v".to_string(), to_attribute(value))])),
        },
        Condition::AttributeNotExistsOrLessThan(attribute, bound) => Expression {
            text: "attribute_not_exists(#a) OR #a < :v".to_string(),
            names: names(attribute),
            values: Some(HashMap::from([(
                ":v".to_string(),
                AttributeValue::N(bound.to_string()),
            )])),
        },
    }
}

fn build_error(err: impl std::fmt::Display) -> DocumentStoreError {
    DocumentStoreError::Transport(format!("invalid request: {}", err))
}

#[async_trait]
impl DocumentStore for DynamoDbStore {
    async fn ensure_table(
        &self,
        table: &str,
        key_attribute: &str,
    ) -> Result<(), DocumentStoreError> {
        if self.table_status(table).await?.is_none() {
            info!("Creating DynamoDB table {} keyed by {}", table, key_attribute);
            let created = self
                .client
                .create_table()
                .table_name(table)
                .attribute_definitions(
                    AttributeDefinition::builder()
                        .attribute_name(key_attribute)
                        .attribute_type(ScalarAttributeType::S)
                        .build()
                        .map_err(build_error)?,
                )
                .key_schema(
                    KeySchemaElement::builder()
                        .attribute_name(key_attribute)
                        .key_type(KeyType::Hash)
                        .build()
                        .map_err(build_error)?,
                )
                .billing_mode(BillingMode::PayPerRequest)
                .send()
                .await;
            if let Err(e) = created {
                // Another instance may have created it meanwhile
                if e.code() != Some("ResourceInUseException") {
                    return Err(classify(table, e));
                }
            }
        }

        for _ in 0..TABLE_ACTIVE_POLLS {
            if self.table_status(table).await? == Some(TableStatus::Active) {
                return Ok(());
            }
            tokio::time::sleep(TABLE_ACTIVE_POLL_INTERVAL).await;
        }
        Err(DocumentStoreError::Transport(format!(
            "table {} did not become active",
            table
        )))
    }

    async fn get_item(
        &self,
        table: &str,
        key_attribute: &str,
        key: &str,
    ) -> Result<Option<Item>, DocumentStoreError> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .key(key_attribute, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify(table, e))?;
        output.item().map(from_attributes).transpose()
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), DocumentStoreError> {
        let mut request = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(to_attributes(&item)));
        if let Some(condition) = condition {
            let expr = expression(&condition);
            request = request
                .condition_expression(expr.text)
                .set_expression_attribute_names(Some(expr.names))
                .set_expression_attribute_values(expr.values);
        }
        request.send().await.map_err(|e| classify(table, e))?;
        debug!("Put item into {}", table);
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        key_attribute: &str,
        key: &str,
        condition: Option<Condition>,
    ) -> Result<(), DocumentStoreError> {
        let mut request = self
            .client
            .delete_item()
            .table_name(table)
            .key(key_attribute, AttributeValue::S(key.to_string()));
        if let Some(condition) = condition {
            let expr = expression(&condition);
            request = request
                .condition_expression(expr.text)
                .set_expression_attribute_names(Some(expr.names))
                .set_expression_attribute_values(expr.values);
        }
        request.send().await.map_err(|e| classify(table, e))?;
        debug!("Deleted {} from {}", key, table);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<Item>, DocumentStoreError> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(table)
                .consistent_read(true)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| classify(table, e))?;

            for item in output.items() {
                items.push(from_attributes(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        debug!("Scanned {} items from {}", items.len(), table);
        Ok(items)
    }
}

//! The production [`KvClient`]: DynamoDB, reached through `aws-sdk-dynamodb`.
//!
//! This module is the one place that knows about DynamoDB's expression-attribute-name
//! aliasing and its `ConditionalCheckFailedException`. Everything above [`KvClient`]
//! (state store, heartbeat, shard lease protocol) is oblivious to it; see [`super`].

use super::{Condition, DocumentKey, KvClient, UpdateOp, UpdateRequest};
use crate::error::KvError;
use crate::model::StreamState;
use async_trait::async_trait;
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;

pub struct DynamoKvClient {
    client: Client,
    table_name: String,
}

impl DynamoKvClient {
    pub fn new(client: Client, table_name: impl Into<String>) -> DynamoKvClient {
        DynamoKvClient {
            client,
            table_name: table_name.into(),
        }
    }

    /// Connects using the default AWS credential/config chain, the same way the rest of
    /// this workspace's AWS-backed clients do.
    pub async fn connect(table_name: impl Into<String>) -> DynamoKvClient {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        DynamoKvClient::new(Client::new(&config), table_name)
    }

    fn key_attrs(&self, key: &DocumentKey) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                "consumerGroup".to_string(),
                AttributeValue::S(key.consumer_group.clone()),
            ),
            (
                "streamName".to_string(),
                AttributeValue::S(key.stream_name.clone()),
            ),
        ])
    }
}

/// Accumulates `ExpressionAttributeNames`/`ExpressionAttributeValues` placeholders while
/// translating [`Condition`]s and [`UpdateOp`]s to DynamoDB expression syntax, aliasing
/// every path segment so that reserved words like `version` or `name` are always safe.
#[derive(Default)]
struct ExprBuilder {
    name_alias: HashMap<String, String>,
    names: HashMap<String, String>,
    values: HashMap<String, AttributeValue>,
}

impl ExprBuilder {
    fn alias_segment(&mut self, segment: &str) -> String {
        if let Some(alias) = self.name_alias.get(segment) {
            return alias.clone();
        }
        let alias = format!("#n{}", self.names.len());
        self.name_alias.insert(segment.to_string(), alias.clone());
        self.names.insert(alias.clone(), segment.to_string());
        alias
    }

    fn alias_path(&mut self, path: &str) -> String {
        path.split('.')
            .map(|seg| self.alias_segment(seg))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn alias_value(&mut self, value: serde_json::Value) -> Result<String, KvError> {
        let placeholder = format!(":v{}", self.values.len());
        let attr: AttributeValue =
            serde_dynamo::to_attribute_value(&value).map_err(KvError::terminal)?;
        self.values.insert(placeholder.clone(), attr);
        Ok(placeholder)
    }

    fn condition_expression(&mut self, condition: &Condition) -> Result<String, KvError> {
        Ok(match condition {
            Condition::AttributeNotExists(path) => {
                format!("attribute_not_exists({})", self.alias_path(path))
            }
            Condition::AttributeExists(path) => {
                format!("attribute_exists({})", self.alias_path(path))
            }
            Condition::FieldEquals(path, value) => {
                let path = self.alias_path(path);
                let value = self.alias_value(value.clone())?;
                format!("{path} = {value}")
            }
            Condition::And(parts) => {
                let mut clauses = Vec::with_capacity(parts.len());
                for part in parts {
                    clauses.push(format!("({})", self.condition_expression(part)?));
                }
                clauses.join(" AND ")
            }
        })
    }

    fn update_expression(&mut self, ops: &[UpdateOp]) -> Result<String, KvError> {
        let mut sets = Vec::new();
        let mut removes = Vec::new();
        for op in ops {
            match op {
                UpdateOp::Set(path, value) => {
                    let path = self.alias_path(path);
                    let value = self.alias_value(value.clone())?;
                    sets.push(format!("{path} = {value}"));
                }
                UpdateOp::SetIfNotExists(path, value) => {
                    let path = self.alias_path(path);
                    let value = self.alias_value(value.clone())?;
                    sets.push(format!("{path} = if_not_exists({path}, {value})"));
                }
                UpdateOp::Remove(path) => removes.push(self.alias_path(path)),
            }
        }
        let mut clauses = Vec::new();
        if !sets.is_empty() {
            clauses.push(format!("SET {}", sets.join(", ")));
        }
        if !removes.is_empty() {
            clauses.push(format!("REMOVE {}", removes.join(", ")));
        }
        Ok(clauses.join(" "))
    }
}

#[async_trait]
impl KvClient for DynamoKvClient {
    async fn get(&self, key: &DocumentKey) -> Result<Option<StreamState>, KvError> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(self.key_attrs(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify_error)?;

        match result.item {
            Some(item) => {
                let state = serde_dynamo::from_item(item).map_err(KvError::terminal)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        _key: &DocumentKey,
        item: &StreamState,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        // The key fields (consumerGroup/streamName) are already present on `item`.
        let item: HashMap<String, AttributeValue> =
            serde_dynamo::to_item(item).map_err(KvError::terminal)?;

        let mut builder = self.client.put_item().table_name(&self.table_name).set_item(Some(item));

        if let Some(condition) = condition {
            let mut expr = ExprBuilder::default();
            let condition_expression = expr.condition_expression(&condition)?;
            builder = builder
                .condition_expression(condition_expression)
                .set_expression_attribute_names(Some(expr.names))
                .set_expression_attribute_values(Some(expr.values));
        }

        builder.send().await.map_err(classify_error)?;
        Ok(())
    }

    async fn update(&self, key: &DocumentKey, request: UpdateRequest) -> Result<(), KvError> {
        let mut expr = ExprBuilder::default();
        let update_expression = expr.update_expression(&request.ops)?;
        let condition_expression = request
            .condition
            .as_ref()
            .map(|c| expr.condition_expression(c))
            .transpose()?;

        let mut builder = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(self.key_attrs(key)))
            .update_expression(update_expression)
            .set_expression_attribute_names(Some(expr.names))
            .set_expression_attribute_values(Some(expr.values));

        if let Some(condition_expression) = condition_expression {
            builder = builder.condition_expression(condition_expression);
        }

        builder.send().await.map_err(classify_error)?;
        Ok(())
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), KvError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(self.key_attrs(key)))
            .send()
            .await
            .map_err(classify_error)?;
        Ok(())
    }
}

/// Shared across `put`/`update`/`delete`: every DynamoDB write error we care about either
/// is a conditional-check failure (not retried, first-class) or isn't (transient,
/// retried by [`super::retry::RetryingKvClient`]).
fn classify_error<E, R>(err: aws_sdk_dynamodb::error::SdkError<E, R>) -> KvError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let is_conditional_check_failed = err
        .code()
        .map(|code| code == "ConditionalCheckFailedException")
        .unwrap_or(false);
    if is_conditional_check_failed {
        return KvError::ConditionalCheckFailed;
    }
    match &err {
        aws_sdk_dynamodb::error::SdkError::TimeoutError(_)
        | aws_sdk_dynamodb::error::SdkError::DispatchFailure(_)
        | aws_sdk_dynamodb::error::SdkError::ResponseError(_) => KvError::transient(err),
        _ => KvError::terminal(err),
    }
}

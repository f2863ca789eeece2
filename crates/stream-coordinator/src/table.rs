//! Table provisioning: ensures the backing table exists, is tagged, and is
//! active, before any [`crate::kv::dynamo::DynamoKvClient`] touches it. External
//! collaborator territory — no coordination logic lives here.

use crate::config::BillingMode;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, BillingMode as SdkBillingMode, KeySchemaElement, KeyType,
    ProvisionedThroughput, ScalarAttributeType, SseSpecification, SseType, Tag, TableStatus,
};
use aws_sdk_dynamodb::Client;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to describe table '{0}'")]
    Describe(String, #[source] anyhow::Error),
    #[error("failed to create table '{0}'")]
    Create(String, #[source] anyhow::Error),
    #[error("timed out waiting for table '{0}' to become active")]
    NotActiveInTime(String),
}

/// Ensures `table_name` exists with the fixed key schema this crate requires
/// (`consumerGroup` partition key, `streamName` sort key), server-side encryption
/// on, and the requested billing mode; applies `tags`; blocks until `ACTIVE`.
pub async fn ensure_table_exists(
    client: &Client,
    table_name: &str,
    tags: &[(String, String)],
    billing_mode: &BillingMode,
) -> Result<(), ProvisionError> {
    let exists = match client.describe_table().table_name(table_name).send().await {
        Ok(_) => true,
        Err(err) if is_resource_not_found(&err) => false,
        Err(err) => {
            return Err(ProvisionError::Describe(table_name.to_string(), err.into()))
        }
    };

    if !exists {
        tracing::info!(table_name, "creating consumer group coordination table");
        let mut create = client
            .create_table()
            .table_name(table_name)
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("consumerGroup")
                    .key_type(KeyType::Hash)
                    .build()
                    .expect("hash key schema element is always valid"),
            )
            .key_schema(
                KeySchemaElement::builder()
                    .attribute_name("streamName")
                    .key_type(KeyType::Range)
                    .build()
                    .expect("range key schema element is always valid"),
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("consumerGroup")
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .expect("attribute definition is always valid"),
            )
            .attribute_definitions(
                AttributeDefinition::builder()
                    .attribute_name("streamName")
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .expect("attribute definition is always valid"),
            )
            .sse_specification(
                SseSpecification::builder()
                    .enabled(true)
                    .sse_type(SseType::Kms)
                    .build(),
            );

        create = match billing_mode {
            BillingMode::OnDemand => {
                create.billing_mode(SdkBillingMode::PayPerRequest)
            }
            BillingMode::Provisioned {
                read_capacity_units,
                write_capacity_units,
            } => create.billing_mode(SdkBillingMode::Provisioned).provisioned_throughput(
                ProvisionedThroughput::builder()
                    .read_capacity_units(*read_capacity_units)
                    .write_capacity_units(*write_capacity_units)
                    .build()
                    .expect("provisioned throughput is always valid"),
            ),
        };

        if !tags.is_empty() {
            create = create.set_tags(Some(
                tags.iter()
                    .map(|(k, v)| Tag::builder().key(k).value(v).build().expect("tag is always valid"))
                    .collect(),
            ));
        }

        create
            .send()
            .await
            .map_err(|err| ProvisionError::Create(table_name.to_string(), err.into()))?;
    }

    wait_until_active(client, table_name).await
}

fn is_resource_not_found<E, R>(err: &aws_sdk_dynamodb::error::SdkError<E, R>) -> bool
where
    E: aws_sdk_dynamodb::error::ProvideErrorMetadata,
{
    err.code() == Some("ResourceNotFoundException")
}

async fn wait_until_active(client: &Client, table_name: &str) -> Result<(), ProvisionError> {
    const MAX_ATTEMPTS: u32 = 60;
    for _ in 0..MAX_ATTEMPTS {
        let describe = client
            .describe_table()
            .table_name(table_name)
            .send()
            .await
            .map_err(|err| ProvisionError::Describe(table_name.to_string(), err.into()))?;

        let status = describe
            .table
            .and_then(|t| t.table_status)
            .unwrap_or(TableStatus::Creating);

        if status == TableStatus::Active {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(ProvisionError::NotActiveInTime(table_name.to_string()))
}

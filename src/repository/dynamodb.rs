//! DynamoDB-style key-value repository backend (spec §4.6).
//!
//! Primary key is `entity_id`; the whole entity is stored as a JSON blob
//! under a `data` attribute, since the three aggregates don't share a
//! schema. Filters that can't be pushed into a DynamoDB filter expression
//! fall back to scan-then-filter, which is what this implementation always
//! does — acceptable here given the broker's per-table item counts (spec
//! §4.6 permits this fallback explicitly).

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BrokerError, Result};
use crate::repository::{Identifiable, Repository};

pub struct DynamoDbRepository<T> {
    client: Client,
    table_name: String,
    _marker: std::marker::PhantomData<T>,
}

impl<T> DynamoDbRepository<T> {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            _marker: std::marker::PhantomData,
        }
    }
}

fn serialize_item<T: Serialize>(item: &T) -> Result<String> {
    Ok(serde_json::to_string(item)?)
}

fn deserialize_item<T: DeserializeOwned>(data: &str) -> Result<T> {
    Ok(serde_json::from_str(data)?)
}

#[async_trait]
impl<T> Repository<T> for DynamoDbRepository<T>
where
    T: Identifiable + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("entity_id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| BrokerError::provider_transient("dynamodb", e.to_string()))?;

        match response.item() {
            Some(item) => {
                let data = item
                    .get("data")
                    .and_then(|v| v.as_s().ok())
                    .ok_or_else(|| BrokerError::Internal("dynamodb item missing data attribute".to_string()))?;
                Ok(Some(deserialize_item(data)?))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&self, limit: Option<usize>, offset: usize) -> Result<Vec<T>> {
        let all = self.find(&|_: &T| true).await?;
        let mut all = all;
        all.sort_by_key(|item| item.entity_id());
        let page = all.into_iter().skip(offset);
        Ok(match limit {
            Some(n) => page.take(n).collect(),
            None => page.collect(),
        })
    }

    async fn save(&self, item: T) -> Result<()> {
        let data = serialize_item(&item)?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("entity_id", AttributeValue::S(item.entity_id()))
            .item("data", AttributeValue::S(data))
            .send()
            .await
            .map_err(|e| BrokerError::provider_transient("dynamodb", e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.get_by_id(id).await?.is_some();
        if existed {
            self.client
                .delete_item()
                .table_name(&self.table_name)
                .key("entity_id", AttributeValue::S(id.to_string()))
                .send()
                .await
                .map_err(|e| BrokerError::provider_transient("dynamodb", e.to_string()))?;
        }
        Ok(existed)
    }

    async fn find(&self, predicate: &(dyn Fn(&T) -> bool + Send + Sync)) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut exclusive_start_key = None;

        loop {
            let mut request = self.client.scan().table_name(&self.table_name);
            if let Some(key) = exclusive_start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }

            let response = request
                .send()
                .await
                .map_err(|e| BrokerError::provider_transient("dynamodb", e.to_string()))?;

            for entry in response.items() {
                if let Some(data) = entry.get("data").and_then(|v| v.as_s().ok()) {
                    let item: T = deserialize_item(data)?;
                    if predicate(&item) {
                        items.push(item);
                    }
                }
            }

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => exclusive_start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(items)
    }
}

//! AWS Secrets Manager secret store.
//!
//! Reference: <https://docs.aws.amazon.com/secretsmanager/latest/apireference/>

use async_trait::async_trait;
use log::debug;
use serde_json::json;

use stormware_core::{SecretResult, SecretStore};

use crate::auth::AwsAuth;
use crate::client::AwsClient;
use crate::error::{secret_result, AwsError, AwsResult};

const SERVICE: &str = "secretsmanager";

pub struct SecretsManager {
    client: AwsClient,
}

impl SecretsManager {
    pub fn new(client: AwsClient) -> Self {
        Self { client }
    }

    /// Connector for the session of `organization`.
    pub async fn connect(auth: &AwsAuth, organization: Option<&str>) -> AwsResult<Self> {
        Ok(Self::new(auth.session(organization, None).await?.client()))
    }

    async fn call(&self, action: &str, body: serde_json::Value) -> AwsResult<serde_json::Value> {
        let target = format!("secretsmanager.{}", action);
        self.client
            .json_request(SERVICE, &target, &body)
            .await?
            .json(SERVICE)
    }

    pub async fn get_secret_value(&self, key: &str) -> AwsResult<String> {
        debug!("Loading secret \"{}\"", key);
        let response = self.call("GetSecretValue", json!({ "SecretId": key })).await?;
        response
            .get("SecretString")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                AwsError::new(
                    SERVICE,
                    "MissingSecretString",
                    &format!("Secret \"{}\" has no string value", key),
                    200,
                )
            })
    }

    pub async fn describe_secret(&self, key: &str) -> AwsResult<serde_json::Value> {
        self.call("DescribeSecret", json!({ "SecretId": key })).await
    }

    pub async fn put_secret_value(&self, key: &str, value: &str) -> AwsResult<()> {
        match self
            .call("PutSecretValue", json!({ "SecretId": key, "SecretString": value }))
            .await
        {
            Err(e) if e.is_not_found() => {
                debug!("Creating secret \"{}\"", key);
                self.call("CreateSecret", json!({ "Name": key, "SecretString": value }))
                    .await?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    pub async fn delete_secret(&self, key: &str) -> AwsResult<()> {
        self.call(
            "DeleteSecret",
            json!({ "SecretId": key, "ForceDeleteWithoutRecovery": true }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for SecretsManager {
    fn backend(&self) -> &str {
        "AWS Secrets Manager"
    }

    async fn get(&self, key: &str) -> SecretResult<String> {
        secret_result(self.get_secret_value(key).await, key)
    }

    async fn exists(&self, key: &str) -> SecretResult<bool> {
        match self.describe_secret(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into_secret_error(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> SecretResult<()> {
        debug!("Storing secret \"{}\"", key);
        secret_result(self.put_secret_value(key, value).await, key)
    }

    async fn delete(&self, key: &str) -> SecretResult<()> {
        debug!("Deleting secret \"{}\"", key);
        secret_result(self.delete_secret(key).await, key)
    }
}

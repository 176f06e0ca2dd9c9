//! AWS API client implementation.
//!
//! This client speaks the EC2 and RDS query APIs with JSON responses.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    versions, DbInstance, DescribeDbInstancesResponse, DescribeInstancesResponse, Ec2Instance,
    RestoreDbInstanceResponse,
};
use crate::providers::traits::{
    attributes, AttributeValue, CloudProvider, CloudProviderError, DbModification,
    ResourceDescription, ResourceKind,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Query parameters for one API call.
type Params = Vec<(String, String)>;

#[derive(Debug, Clone, Copy)]
enum Service {
    Ec2,
    Rds,
}

/// AWS cloud provider.
#[derive(Clone)]
pub struct Aws {
    /// HTTP client.
    client: Client,
    /// AWS region.
    region: String,
    /// Overrides both service endpoints (local stacks, signing proxies, tests).
    endpoint_override: Option<String>,
}

impl Aws {
    /// Create a new AWS provider for a region (e.g. "us-east-1").
    ///
    /// Requests are sent unsigned; deployments route them through a SigV4
    /// signing proxy or point [`Aws::with_endpoint`] at one.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(region: impl Into<String>) -> Result<Self, CloudProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudProviderError::Http)?;

        Ok(Self {
            client,
            region: region.into(),
            endpoint_override: None,
        })
    }

    /// Send every request to `endpoint` instead of the regional endpoints.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn endpoint(&self, service: Service) -> String {
        if let Some(endpoint) = &self.endpoint_override {
            return endpoint.clone();
        }
        match service {
            Service::Ec2 => format!("https://ec2.{}.amazonaws.com", self.region),
            Service::Rds => format!("https://rds.{}.amazonaws.com", self.region),
        }
    }

    /// Execute a query API action.
    async fn aws_query<T: serde::de::DeserializeOwned>(
        &self,
        service: Service,
        method: Method,
        action: &str,
        mut params: Params,
    ) -> Result<T, CloudProviderError> {
        let version = match service {
            Service::Ec2 => versions::EC2,
            Service::Rds => versions::RDS,
        };
        params.insert(0, ("Action".to_string(), action.to_string()));
        params.insert(1, ("Version".to_string(), version.to_string()));

        let url = format!("{}/", self.endpoint(service));
        debug!(url = %url, action, method = %method, "AWS request");

        let response = self
            .client
            .request(method, &url)
            .header("Accept", "application/json")
            .header(
                "X-Amz-Date",
                chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            )
            .query(&params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Execute an action whose response body carries nothing we need.
    async fn aws_action(
        &self,
        service: Service,
        action: &str,
        params: Params,
    ) -> Result<(), CloudProviderError> {
        self.aws_query::<serde_json::Value>(service, Method::POST, action, params)
            .await
            .map(|_| ())
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND
            || text.contains("NotFound")
            || text.contains("DBInstanceNotFound")
        {
            Err(CloudProviderError::NotFound(text))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(CloudProviderError::Auth(text))
        } else if text.contains("IncorrectInstanceState") || text.contains("InvalidDBInstanceState")
        {
            Err(CloudProviderError::InvalidState(text))
        } else {
            Err(CloudProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Convert an EC2 instance to a resource description.
    fn to_compute(ec2: &Ec2Instance) -> ResourceDescription {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            attributes::INSTANCE_TYPE.to_string(),
            AttributeValue::from(ec2.instance_type.as_str()),
        );
        attrs.insert(
            attributes::IMAGE_ID.to_string(),
            AttributeValue::from(ec2.image_id.as_str()),
        );
        attrs.insert(
            attributes::SECURITY_GROUPS.to_string(),
            AttributeValue::set(ec2.security_groups.iter().map(|g| g.group_id.clone())),
        );

        ResourceDescription {
            id: ec2.instance_id.clone(),
            kind: ResourceKind::Compute,
            status: ec2.state.name.clone(),
            attributes: attrs,
            tags: ec2
                .tags
                .iter()
                .map(|t| (t.key.clone(), t.value.clone()))
                .collect(),
            arn: None,
        }
    }

    /// Convert an RDS instance to a resource description.
    fn to_database(db: &DbInstance) -> ResourceDescription {
        let mut attrs = BTreeMap::new();
        attrs.insert(
            attributes::INSTANCE_CLASS.to_string(),
            AttributeValue::from(db.db_instance_class.as_str()),
        );
        attrs.insert(
            attributes::ALLOCATED_STORAGE.to_string(),
            AttributeValue::Number(db.allocated_storage),
        );
        attrs.insert(
            attributes::ENGINE_VERSION.to_string(),
            AttributeValue::from(db.engine_version.as_str()),
        );
        attrs.insert(
            attributes::SECURITY_GROUPS.to_string(),
            AttributeValue::set(
                db.vpc_security_groups
                    .iter()
                    .map(|g| g.vpc_security_group_id.clone()),
            ),
        );
        attrs.insert(
            attributes::MULTI_AZ.to_string(),
            AttributeValue::Flag(db.multi_az),
        );

        ResourceDescription {
            id: db.db_instance_identifier.clone(),
            kind: ResourceKind::Database,
            status: db.db_instance_status.clone(),
            attributes: attrs,
            tags: db
                .tag_list
                .iter()
                .map(|t| (t.key.clone(), t.value.clone()))
                .collect(),
            arn: Some(db.db_instance_arn.clone()),
        }
    }

    async fn describe_instance(&self, id: &str) -> Result<ResourceDescription, CloudProviderError> {
        let response: DescribeInstancesResponse = self
            .aws_query(
                Service::Ec2,
                Method::GET,
                "DescribeInstances",
                vec![("InstanceId.1".to_string(), id.to_string())],
            )
            .await?;

        response
            .reservations
            .first()
            .and_then(|r| r.instances.first())
            .map(Self::to_compute)
            .ok_or_else(|| CloudProviderError::NotFound(format!("Instance not found: {id}")))
    }

    async fn describe_db_instance(
        &self,
        id: &str,
    ) -> Result<ResourceDescription, CloudProviderError> {
        let response: DescribeDbInstancesResponse = self
            .aws_query(
                Service::Rds,
                Method::GET,
                "DescribeDBInstances",
                vec![("DBInstanceIdentifier".to_string(), id.to_string())],
            )
            .await?;

        response
            .db_instances
            .first()
            .map(Self::to_database)
            .ok_or_else(|| CloudProviderError::NotFound(format!("DB instance not found: {id}")))
    }

    /// RDS tags are addressed by ARN.
    async fn db_arn(&self, id: &str) -> Result<String, CloudProviderError> {
        self.describe_db_instance(id)
            .await?
            .arn
            .ok_or_else(|| CloudProviderError::NotFound(format!("No ARN for DB instance {id}")))
    }
}

#[async_trait]
impl CloudProvider for Aws {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn describe(
        &self,
        id: &str,
        kind: ResourceKind,
    ) -> Result<ResourceDescription, CloudProviderError> {
        match kind {
            ResourceKind::Compute => self.describe_instance(id).await,
            ResourceKind::Database => self.describe_db_instance(id).await,
        }
    }

    // ========================================================================
    // EC2 operations
    // ========================================================================

    async fn reboot_instance(&self, id: &str) -> Result<(), CloudProviderError> {
        info!(instance_id = %id, "Rebooting instance");
        self.aws_action(
            Service::Ec2,
            "RebootInstances",
            vec![("InstanceId.1".to_string(), id.to_string())],
        )
        .await
    }

    async fn stop_instance(&self, id: &str) -> Result<(), CloudProviderError> {
        info!(instance_id = %id, "Stopping instance");
        self.aws_action(
            Service::Ec2,
            "StopInstances",
            vec![("InstanceId.1".to_string(), id.to_string())],
        )
        .await
    }

    async fn start_instance(&self, id: &str) -> Result<(), CloudProviderError> {
        info!(instance_id = %id, "Starting instance");
        self.aws_action(
            Service::Ec2,
            "StartInstances",
            vec![("InstanceId.1".to_string(), id.to_string())],
        )
        .await
    }

    async fn modify_instance_type(
        &self,
        id: &str,
        instance_type: &str,
    ) -> Result<(), CloudProviderError> {
        info!(instance_id = %id, instance_type, "Modifying instance type");
        self.aws_action(
            Service::Ec2,
            "ModifyInstanceAttribute",
            vec![
                ("InstanceId".to_string(), id.to_string()),
                ("InstanceType.Value".to_string(), instance_type.to_string()),
            ],
        )
        .await
    }

    async fn modify_instance_security_groups(
        &self,
        id: &str,
        groups: &[String],
    ) -> Result<(), CloudProviderError> {
        info!(instance_id = %id, groups = ?groups, "Modifying instance security groups");
        let mut params = vec![("InstanceId".to_string(), id.to_string())];
        for (i, group) in groups.iter().enumerate() {
            params.push((format!("GroupId.{}", i + 1), group.clone()));
        }
        self.aws_action(Service::Ec2, "ModifyInstanceAttribute", params)
            .await
    }

    async fn replace_root_volume(
        &self,
        id: &str,
        image_id: &str,
    ) -> Result<(), CloudProviderError> {
        info!(instance_id = %id, image_id, "Replacing root volume");
        self.aws_action(
            Service::Ec2,
            "CreateReplaceRootVolumeTask",
            vec![
                ("InstanceId".to_string(), id.to_string()),
                ("ImageId".to_string(), image_id.to_string()),
                ("DeleteReplacedRootVolume".to_string(), "true".to_string()),
            ],
        )
        .await
    }

    // ========================================================================
    // RDS operations
    // ========================================================================

    async fn reboot_db_instance(
        &self,
        id: &str,
        force_failover: bool,
    ) -> Result<(), CloudProviderError> {
        info!(db_instance_id = %id, force_failover, "Rebooting DB instance");
        self.aws_action(
            Service::Rds,
            "RebootDBInstance",
            vec![
                ("DBInstanceIdentifier".to_string(), id.to_string()),
                ("ForceFailover".to_string(), force_failover.to_string()),
            ],
        )
        .await
    }

    async fn modify_db_instance(
        &self,
        id: &str,
        modification: &DbModification,
    ) -> Result<(), CloudProviderError> {
        info!(db_instance_id = %id, ?modification, "Modifying DB instance");

        let mut params = vec![
            ("DBInstanceIdentifier".to_string(), id.to_string()),
            ("ApplyImmediately".to_string(), "true".to_string()),
        ];
        if let Some(class) = &modification.instance_class {
            params.push(("DBInstanceClass".to_string(), class.clone()));
        }
        if let Some(storage) = modification.allocated_storage {
            params.push(("AllocatedStorage".to_string(), storage.to_string()));
        }
        if let Some(groups) = &modification.security_groups {
            for (i, group) in groups.iter().enumerate() {
                params.push((format!("VpcSecurityGroupIds.member.{}", i + 1), group.clone()));
            }
        }

        self.aws_action(Service::Rds, "ModifyDBInstance", params)
            .await
    }

    async fn restore_db_from_snapshot(&self, id: &str) -> Result<String, CloudProviderError> {
        let target = format!(
            "{id}-restored-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        info!(db_instance_id = %id, target = %target, "Restoring DB instance to latest restorable time");

        let response: RestoreDbInstanceResponse = self
            .aws_query(
                Service::Rds,
                Method::POST,
                "RestoreDBInstanceToPointInTime",
                vec![
                    ("SourceDBInstanceIdentifier".to_string(), id.to_string()),
                    ("TargetDBInstanceIdentifier".to_string(), target),
                    ("UseLatestRestorableTime".to_string(), "true".to_string()),
                ],
            )
            .await?;

        Ok(response.db_instance.db_instance_identifier)
    }

    // ========================================================================
    // Tags
    // ========================================================================

    async fn create_tags(
        &self,
        id: &str,
        kind: ResourceKind,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudProviderError> {
        if tags.is_empty() {
            return Ok(());
        }
        debug!(resource_id = %id, count = tags.len(), "Writing tags");

        match kind {
            ResourceKind::Compute => {
                let mut params = vec![("ResourceId.1".to_string(), id.to_string())];
                for (i, (key, value)) in tags.iter().enumerate() {
                    params.push((format!("Tag.{}.Key", i + 1), key.clone()));
                    params.push((format!("Tag.{}.Value", i + 1), value.clone()));
                }
                self.aws_action(Service::Ec2, "CreateTags", params).await
            }
            ResourceKind::Database => {
                let arn = self.db_arn(id).await?;
                let mut params = vec![("ResourceName".to_string(), arn)];
                for (i, (key, value)) in tags.iter().enumerate() {
                    params.push((format!("Tags.member.{}.Key", i + 1), key.clone()));
                    params.push((format!("Tags.member.{}.Value", i + 1), value.clone()));
                }
                self.aws_action(Service::Rds, "AddTagsToResource", params)
                    .await
            }
        }
    }

    async fn delete_tags(
        &self,
        id: &str,
        kind: ResourceKind,
        keys: &[String],
    ) -> Result<(), CloudProviderError> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!(resource_id = %id, keys = ?keys, "Deleting tags");

        match kind {
            ResourceKind::Compute => {
                let mut params = vec![("ResourceId.1".to_string(), id.to_string())];
                for (i, key) in keys.iter().enumerate() {
                    params.push((format!("Tag.{}.Key", i + 1), key.clone()));
                }
                self.aws_action(Service::Ec2, "DeleteTags", params).await
            }
            ResourceKind::Database => {
                let arn = self.db_arn(id).await?;
                let mut params = vec![("ResourceName".to_string(), arn)];
                for (i, key) in keys.iter().enumerate() {
                    params.push((format!("TagKeys.member.{}", i + 1), key.clone()));
                }
                self.aws_action(Service::Rds, "RemoveTagsFromResource", params)
                    .await
            }
        }
    }
}

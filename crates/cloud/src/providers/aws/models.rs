//! AWS API request and response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// EC2 (Instance) types
// ============================================================================

/// EC2 instance information.
#[derive(Debug, Clone, Deserialize)]
pub struct Ec2Instance {
    /// Instance ID.
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    /// Instance type.
    #[serde(rename = "InstanceType")]
    pub instance_type: String,
    /// Instance state.
    #[serde(rename = "State")]
    pub state: InstanceState,
    /// Image ID (AMI).
    #[serde(rename = "ImageId")]
    pub image_id: String,
    /// Attached security groups.
    #[serde(rename = "SecurityGroups", default)]
    pub security_groups: Vec<GroupIdentifier>,
    /// Tags.
    #[serde(rename = "Tags", default)]
    pub tags: Vec<Tag>,
}

/// Instance state.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceState {
    /// State code.
    #[serde(rename = "Code")]
    pub code: i32,
    /// State name.
    #[serde(rename = "Name")]
    pub name: String,
}

/// Security group reference on an instance.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupIdentifier {
    /// Group ID.
    #[serde(rename = "GroupId")]
    pub group_id: String,
    /// Group name.
    #[serde(rename = "GroupName")]
    pub group_name: Option<String>,
}

/// Tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    #[serde(rename = "Key")]
    pub key: String,
    /// Tag value.
    #[serde(rename = "Value")]
    pub value: String,
}

/// Describe instances response.
#[derive(Debug, Deserialize)]
pub struct DescribeInstancesResponse {
    /// Reservations.
    #[serde(rename = "Reservations", default)]
    pub reservations: Vec<Reservation>,
}

/// Reservation.
#[derive(Debug, Deserialize)]
pub struct Reservation {
    /// Instances.
    #[serde(rename = "Instances", default)]
    pub instances: Vec<Ec2Instance>,
}

// ============================================================================
// RDS (Database) types
// ============================================================================

/// RDS database instance information.
#[derive(Debug, Clone, Deserialize)]
pub struct DbInstance {
    /// Instance identifier.
    #[serde(rename = "DBInstanceIdentifier")]
    pub db_instance_identifier: String,
    /// Instance ARN (tags are addressed by ARN).
    #[serde(rename = "DBInstanceArn")]
    pub db_instance_arn: String,
    /// Instance class (e.g. `db.t3.micro`).
    #[serde(rename = "DBInstanceClass")]
    pub db_instance_class: String,
    /// Instance status (`available`, `rebooting`, ...).
    #[serde(rename = "DBInstanceStatus")]
    pub db_instance_status: String,
    /// Allocated storage in GB.
    #[serde(rename = "AllocatedStorage")]
    pub allocated_storage: i64,
    /// Engine version.
    #[serde(rename = "EngineVersion")]
    pub engine_version: String,
    /// Multi-AZ deployment.
    #[serde(rename = "MultiAZ", default)]
    pub multi_az: bool,
    /// VPC security groups.
    #[serde(rename = "VpcSecurityGroups", default)]
    pub vpc_security_groups: Vec<VpcSecurityGroupMembership>,
    /// Tags.
    #[serde(rename = "TagList", default)]
    pub tag_list: Vec<Tag>,
}

/// VPC security group membership.
#[derive(Debug, Clone, Deserialize)]
pub struct VpcSecurityGroupMembership {
    /// Group ID.
    #[serde(rename = "VpcSecurityGroupId")]
    pub vpc_security_group_id: String,
    /// Membership status.
    #[serde(rename = "Status")]
    pub status: Option<String>,
}

/// Describe DB instances response.
#[derive(Debug, Deserialize)]
pub struct DescribeDbInstancesResponse {
    /// Matching instances.
    #[serde(rename = "DBInstances", default)]
    pub db_instances: Vec<DbInstance>,
}

/// Point-in-time restore response.
#[derive(Debug, Deserialize)]
pub struct RestoreDbInstanceResponse {
    /// The restored instance.
    #[serde(rename = "DBInstance")]
    pub db_instance: DbInstance,
}

/// API versions for the query endpoints.
pub mod versions {
    /// EC2 query API version.
    pub const EC2: &str = "2016-11-15";
    /// RDS query API version.
    pub const RDS: &str = "2014-10-31";
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::error::EcsError;

/// Name prefix the platform uses for injected service-connect proxies.
pub const SIDECAR_PREFIX: &str = "ecs-service-connect-";

/// Coordinates of one remote cluster, as stored in the context registry.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Services,
    Tasks,
    Nodes,
}

impl ResourceKind {
    pub fn title(self) -> &'static str {
        match self {
            Self::Services => "Services",
            Self::Tasks => "Tasks",
            Self::Nodes => "Nodes",
        }
    }

    pub fn singular(self) -> &'static str {
        match self {
            Self::Services => "service",
            Self::Tasks => "task",
            Self::Nodes => "node",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.singular())
    }
}

/// One list call's worth of identifiers plus the cursor for the next call.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResourcePage {
    pub identifiers: Vec<String>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DescribedResource {
    Service(ServiceDetail),
    Task(TaskDetail),
    Node(NodeDetail),
}

impl DescribedResource {
    /// ARN the record was described under; the merge key for the collector.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Service(service) => &service.service_arn,
            Self::Task(task) => &task.task_arn,
            Self::Node(node) => &node.container_instance_arn,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Service(service) => &service.name,
            Self::Task(task) => &task.task_id,
            Self::Node(node) => node
                .ec2_instance_id
                .as_deref()
                .unwrap_or(&node.container_instance_arn),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetail {
    pub name: String,
    pub service_arn: String,
    pub status: String,
    #[serde(rename = "taskDefinition")]
    pub task_def: String,
    pub desired_count: i32,
    pub running_count: i32,
    pub pending_count: i32,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub load_balancers: Vec<LoadBalancer>,
    pub network_config: Option<NetworkConfig>,
    pub events: Vec<ServiceEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub target_group: String,
    pub container_name: String,
    pub container_port: i32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnet_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<String>,
    #[serde(rename = "publicIP")]
    pub public_ip: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEvent {
    pub created_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    pub task_id: String,
    pub task_arn: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    #[serde(rename = "taskDefinitionFamily")]
    pub task_def_family: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_instance_arn: Option<String>,
    pub last_status: String,
    pub desired_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    pub group: String,
    pub launch_type: String,
    pub capacity_provider: String,
    pub containers: Vec<ContainerDetail>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl TaskDetail {
    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .iter()
            .map(|container| container.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDetail {
    pub name: String,
    pub image: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub health_status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_bindings: Vec<PortBinding>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub container_port: i32,
    pub host_port: i32,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub attachment_id: String,
    #[serde(rename = "privateIpv4")]
    pub private_ipv4: String,
    #[serde(rename = "publicIpv4", skip_serializing_if = "String::is_empty")]
    pub public_ipv4: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetail {
    pub container_instance_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ec2_instance_id: Option<String>,
    pub capacity_provider: String,
    pub running_tasks: i32,
    pub pending_tasks: i32,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub agent_connected: bool,
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub timestamp_millis: i64,
    pub message: String,
}

impl LogRecord {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_millis)
    }
}

/// Where a task container ships its output.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContainerLogConfig {
    pub container: String,
    pub driver: String,
    pub group: Option<String>,
    pub stream_prefix: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogQuery {
    pub group: String,
    pub stream: String,
    pub start_time_millis: i64,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LogPage {
    pub records: Vec<LogRecord>,
    pub next_token: Option<String>,
    pub is_last_page: bool,
}

/// Credentials for one execution channel. Deliberately not `Clone`: a relay
/// process takes it by value.
#[derive(Debug, Eq, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub stream_url: String,
    pub token: String,
}

pub fn is_sidecar_container(name: &str) -> bool {
    name.starts_with(SIDECAR_PREFIX)
}

pub fn task_id_from_arn(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}

/// Picks the container a task-scoped command should address.
pub fn select_container(
    task: &str,
    candidates: &[String],
    requested: Option<&str>,
) -> Result<String, EcsError> {
    if let Some(requested) = requested.filter(|name| !name.trim().is_empty()) {
        return candidates
            .iter()
            .find(|name| name.as_str() == requested)
            .cloned()
            .ok_or_else(|| EcsError::not_found("container", format!("{task}/{requested}")));
    }

    let eligible = candidates
        .iter()
        .filter(|name| !is_sidecar_container(name))
        .cloned()
        .collect::<Vec<_>>();
    match eligible.as_slice() {
        [] => Err(EcsError::not_found("container", format!("{task}/*"))),
        [only] => Ok(only.clone()),
        _ => Err(EcsError::AmbiguousContainer {
            task: task.to_string(),
            candidates: eligible,
        }),
    }
}

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatchlogs::Client as LogsClient;
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_ecs::config::Region;
use aws_sdk_ecs::primitives::DateTime as AwsDateTime;
use aws_sdk_ecs::types::{ContainerInstance, Service, Task};
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EcsError;
use crate::model::{
    ContainerDetail, ContainerLogConfig, DescribedResource, LoadBalancer, LogPage, LogQuery,
    LogRecord, NetworkConfig, NetworkInterface, NodeDetail, PortBinding, ResourceKind,
    ResourcePage, ServiceDetail, ServiceEvent, Session, Target, TaskDetail, is_sidecar_container,
    task_id_from_arn,
};

/// Largest page the list calls accept, used for every resource kind.
pub const MAX_PAGE_SIZE: usize = 100;
/// Largest identifier set a single describe call accepts.
pub const MAX_DESCRIBE_BATCH: usize = 100;

/// Remote control-plane calls the collector, log tail and session bridge need.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_identifiers(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ResourcePage, EcsError>;

    async fn describe(
        &self,
        kind: ResourceKind,
        identifiers: &[String],
    ) -> Result<Vec<DescribedResource>, EcsError>;

    async fn update_desired_count(&self, service: &str, desired: u32) -> Result<(), EcsError>;

    async fn stop_task(&self, task: &str, reason: &str) -> Result<(), EcsError>;

    async fn request_execution_session(
        &self,
        task: &str,
        container: &str,
        command: &str,
        interactive: bool,
    ) -> Result<Session, EcsError>;

    async fn describe_task_log_config(&self, task: &str)
    -> Result<Vec<ContainerLogConfig>, EcsError>;

    async fn fetch_log_records(&self, query: &LogQuery) -> Result<LogPage, EcsError>;
}

/// Races a remote call against the cancellation token.
pub async fn cancellable<T, F>(
    cancel: &CancellationToken,
    operation: &'static str,
    call: F,
) -> Result<T, EcsError>
where
    F: Future<Output = Result<T, EcsError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EcsError::Cancelled { operation }),
        result = call => result,
    }
}

/// ECS and CloudWatch Logs clients bound to one target.
#[derive(Clone)]
pub struct EcsGateway {
    ecs: EcsClient,
    logs: LogsClient,
    cluster: String,
    region: String,
}

impl EcsGateway {
    pub async fn connect(target: &Target) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if !target.region.trim().is_empty() {
            loader = loader.region(Region::new(target.region.clone()));
        }
        if !target.profile.trim().is_empty() {
            loader = loader.profile_name(&target.profile);
        }
        let shared = loader.load().await;
        let region = shared
            .region()
            .map(ToString::to_string)
            .unwrap_or_else(|| target.region.clone());
        debug!(
            context = %target.name,
            cluster = %target.cluster,
            region = %region,
            "connected ECS gateway"
        );

        Self {
            ecs: EcsClient::new(&shared),
            logs: LogsClient::new(&shared),
            cluster: target.cluster.clone(),
            region,
        }
    }

    /// Region the clients resolved, handed to the session relay.
    pub fn region(&self) -> &str {
        &self.region
    }

    async fn describe_services(&self, names: &[String]) -> Result<Vec<DescribedResource>, EcsError> {
        let output = self
            .ecs
            .describe_services()
            .cluster(&self.cluster)
            .set_services(Some(names.to_vec()))
            .send()
            .await
            .map_err(|error| EcsError::remote("DescribeServices", error))?;

        Ok(output
            .services()
            .iter()
            .map(|service| DescribedResource::Service(service_detail(service)))
            .collect())
    }

    async fn describe_tasks(&self, ids: &[String]) -> Result<Vec<DescribedResource>, EcsError> {
        let output = self
            .ecs
            .describe_tasks()
            .cluster(&self.cluster)
            .set_tasks(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|error| EcsError::remote("DescribeTasks", error))?;

        Ok(output
            .tasks()
            .iter()
            .map(|task| DescribedResource::Task(task_detail(task)))
            .collect())
    }

    async fn describe_nodes(&self, arns: &[String]) -> Result<Vec<DescribedResource>, EcsError> {
        let output = self
            .ecs
            .describe_container_instances()
            .cluster(&self.cluster)
            .set_container_instances(Some(arns.to_vec()))
            .send()
            .await
            .map_err(|error| EcsError::remote("DescribeContainerInstances", error))?;

        Ok(output
            .container_instances()
            .iter()
            .map(|node| DescribedResource::Node(node_detail(node)))
            .collect())
    }
}

#[async_trait]
impl ControlPlane for EcsGateway {
    async fn list_identifiers(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ResourcePage, EcsError> {
        let max_results = page_size.clamp(1, MAX_PAGE_SIZE) as i32;
        let next_token = cursor.map(str::to_string);
        let (identifiers, next_cursor) = match kind {
            ResourceKind::Services => {
                let output = self
                    .ecs
                    .list_services()
                    .cluster(&self.cluster)
                    .set_next_token(next_token)
                    .max_results(max_results)
                    .send()
                    .await
                    .map_err(|error| EcsError::remote("ListServices", error))?;
                (
                    output.service_arns().to_vec(),
                    output.next_token().map(str::to_string),
                )
            }
            ResourceKind::Tasks => {
                let output = self
                    .ecs
                    .list_tasks()
                    .cluster(&self.cluster)
                    .set_next_token(next_token)
                    .max_results(max_results)
                    .send()
                    .await
                    .map_err(|error| EcsError::remote("ListTasks", error))?;
                (
                    output.task_arns().to_vec(),
                    output.next_token().map(str::to_string),
                )
            }
            ResourceKind::Nodes => {
                let output = self
                    .ecs
                    .list_container_instances()
                    .cluster(&self.cluster)
                    .set_next_token(next_token)
                    .max_results(max_results)
                    .send()
                    .await
                    .map_err(|error| EcsError::remote("ListContainerInstances", error))?;
                (
                    output.container_instance_arns().to_vec(),
                    output.next_token().map(str::to_string),
                )
            }
        };

        Ok(ResourcePage {
            identifiers,
            next_cursor: next_cursor.filter(|token| !token.is_empty()),
        })
    }

    async fn describe(
        &self,
        kind: ResourceKind,
        identifiers: &[String],
    ) -> Result<Vec<DescribedResource>, EcsError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }
        match kind {
            ResourceKind::Services => self.describe_services(identifiers).await,
            ResourceKind::Tasks => self.describe_tasks(identifiers).await,
            ResourceKind::Nodes => self.describe_nodes(identifiers).await,
        }
    }

    async fn update_desired_count(&self, service: &str, desired: u32) -> Result<(), EcsError> {
        let desired = i32::try_from(desired)
            .map_err(|_| EcsError::Validation(format!("desired count {desired} is too large")))?;
        self.ecs
            .update_service()
            .cluster(&self.cluster)
            .service(service)
            .desired_count(desired)
            .send()
            .await
            .map_err(|error| EcsError::remote("UpdateService", error))?;
        Ok(())
    }

    async fn stop_task(&self, task: &str, reason: &str) -> Result<(), EcsError> {
        self.ecs
            .stop_task()
            .cluster(&self.cluster)
            .task(task)
            .reason(reason)
            .send()
            .await
            .map_err(|error| EcsError::remote("StopTask", error))?;
        Ok(())
    }

    async fn request_execution_session(
        &self,
        task: &str,
        container: &str,
        command: &str,
        interactive: bool,
    ) -> Result<Session, EcsError> {
        let output = self
            .ecs
            .execute_command()
            .cluster(&self.cluster)
            .task(task)
            .container(container)
            .command(command)
            .interactive(interactive)
            .send()
            .await
            .map_err(|error| EcsError::remote("ExecuteCommand", error))?;

        let Some(session) = output.session() else {
            return Err(EcsError::remote(
                "ExecuteCommand",
                "response did not include a session",
            ));
        };
        match (
            session.session_id(),
            session.stream_url(),
            session.token_value(),
        ) {
            (Some(session_id), Some(stream_url), Some(token)) => Ok(Session {
                session_id: session_id.to_string(),
                stream_url: stream_url.to_string(),
                token: token.to_string(),
            }),
            _ => Err(EcsError::remote(
                "ExecuteCommand",
                "session is missing its id, stream url or token",
            )),
        }
    }

    async fn describe_task_log_config(
        &self,
        task: &str,
    ) -> Result<Vec<ContainerLogConfig>, EcsError> {
        let described = self.describe_tasks(&[task.to_string()]).await?;
        let Some(DescribedResource::Task(detail)) = described.into_iter().next() else {
            return Err(EcsError::not_found("task", task));
        };

        let output = self
            .ecs
            .describe_task_definition()
            .task_definition(&detail.task_definition_arn)
            .send()
            .await
            .map_err(|error| EcsError::remote("DescribeTaskDefinition", error))?;
        let Some(definition) = output.task_definition() else {
            return Err(EcsError::not_found(
                "task definition",
                detail.task_definition_arn,
            ));
        };

        Ok(definition
            .container_definitions()
            .iter()
            .map(|container| {
                let name = container.name().unwrap_or_default().to_string();
                match container.log_configuration() {
                    Some(config) => {
                        let option = |key: &str| {
                            config
                                .options()
                                .and_then(|options| options.get(key))
                                .cloned()
                        };
                        ContainerLogConfig {
                            container: name,
                            driver: config.log_driver().as_str().to_string(),
                            group: option("awslogs-group"),
                            stream_prefix: option("awslogs-stream-prefix"),
                        }
                    }
                    None => ContainerLogConfig {
                        container: name,
                        driver: "none".to_string(),
                        group: None,
                        stream_prefix: None,
                    },
                }
            })
            .collect())
    }

    async fn fetch_log_records(&self, query: &LogQuery) -> Result<LogPage, EcsError> {
        let output = self
            .logs
            .get_log_events()
            .log_group_name(&query.group)
            .log_stream_name(&query.stream)
            .start_time(query.start_time_millis)
            .start_from_head(true)
            .set_next_token(query.page_token.clone())
            .send()
            .await
            .map_err(|error| EcsError::remote("GetLogEvents", error))?;

        let records = output
            .events()
            .iter()
            .map(|event| LogRecord {
                timestamp_millis: event.timestamp().unwrap_or_default(),
                message: event.message().unwrap_or_default().to_string(),
            })
            .collect::<Vec<_>>();
        let next_token = output.next_forward_token().map(str::to_string);
        // The forward token stops moving once the stream has nothing newer.
        let is_last_page = next_token.is_none() || next_token == query.page_token;

        Ok(LogPage {
            records,
            next_token,
            is_last_page,
        })
    }
}

fn service_detail(service: &Service) -> ServiceDetail {
    let network_config = service
        .network_configuration()
        .and_then(|config| config.awsvpc_configuration())
        .map(|vpc| NetworkConfig {
            subnet_ids: vpc.subnets().to_vec(),
            security_groups: vpc.security_groups().to_vec(),
            public_ip: vpc
                .assign_public_ip()
                .map(|value| value.as_str().to_string())
                .unwrap_or_default(),
        });

    ServiceDetail {
        name: service.service_name().unwrap_or_default().to_string(),
        service_arn: service.service_arn().unwrap_or_default().to_string(),
        status: service.status().unwrap_or_default().to_string(),
        task_def: service.task_definition().unwrap_or_default().to_string(),
        desired_count: service.desired_count(),
        running_count: service.running_count(),
        pending_count: service.pending_count(),
        created_at: service.created_at().and_then(to_chrono),
        load_balancers: service
            .load_balancers()
            .iter()
            .map(|lb| LoadBalancer {
                target_group: lb.target_group_arn().unwrap_or_default().to_string(),
                container_name: lb.container_name().unwrap_or_default().to_string(),
                container_port: lb.container_port().unwrap_or_default(),
            })
            .collect(),
        network_config,
        events: service
            .events()
            .iter()
            .map(|event| ServiceEvent {
                created_at: event.created_at().and_then(to_chrono),
                message: event.message().unwrap_or_default().to_string(),
            })
            .collect(),
    }
}

fn task_detail(task: &Task) -> TaskDetail {
    let task_arn = task.task_arn().unwrap_or_default().to_string();
    let task_definition_arn = task.task_definition_arn().unwrap_or_default().to_string();
    let containers = task
        .containers()
        .iter()
        .filter(|container| !is_sidecar_container(container.name().unwrap_or_default()))
        .map(|container| ContainerDetail {
            name: container.name().unwrap_or_default().to_string(),
            image: container.image().unwrap_or_default().to_string(),
            status: container.last_status().unwrap_or_default().to_string(),
            runtime_id: container.runtime_id().map(str::to_string),
            exit_code: container.exit_code(),
            health_status: container
                .health_status()
                .map(|status| status.as_str().to_string())
                .unwrap_or_default(),
            network_bindings: container
                .network_bindings()
                .iter()
                .map(|binding| PortBinding {
                    container_port: binding.container_port().unwrap_or_default(),
                    host_port: binding.host_port().unwrap_or_default(),
                    protocol: binding
                        .protocol()
                        .map(|protocol| protocol.as_str().to_string())
                        .unwrap_or_default(),
                })
                .collect(),
        })
        .collect();

    let network_interfaces = task
        .attachments()
        .iter()
        .filter(|attachment| attachment.r#type() == Some("ElasticNetworkInterface"))
        .map(|attachment| {
            let mut interface = NetworkInterface::default();
            for detail in attachment.details() {
                let value = detail.value().unwrap_or_default().to_string();
                match detail.name().unwrap_or_default() {
                    "networkInterfaceId" => interface.attachment_id = value,
                    "privateIPv4Address" => interface.private_ipv4 = value,
                    "publicIPv4Address" => interface.public_ipv4 = value,
                    "subnetId" => interface.subnet_id = value,
                    _ => {}
                }
            }
            interface
        })
        .collect();

    TaskDetail {
        task_id: task_id_from_arn(&task_arn),
        task_def_family: task_id_from_arn(&task_definition_arn),
        task_arn,
        cluster_arn: task.cluster_arn().unwrap_or_default().to_string(),
        task_definition_arn,
        container_instance_arn: task.container_instance_arn().map(str::to_string),
        last_status: task.last_status().unwrap_or_default().to_string(),
        desired_status: task.desired_status().unwrap_or_default().to_string(),
        cpu: task.cpu().map(str::to_string),
        memory: task.memory().map(str::to_string),
        created_at: task.created_at().and_then(to_chrono),
        started_at: task.started_at().and_then(to_chrono),
        stopped_at: task.stopped_at().and_then(to_chrono),
        stopped_reason: task.stopped_reason().map(str::to_string),
        group: task.group().unwrap_or_default().to_string(),
        launch_type: task
            .launch_type()
            .map(|launch| launch.as_str().to_string())
            .unwrap_or_else(|| "-".to_string()),
        capacity_provider: task
            .capacity_provider_name()
            .unwrap_or("-")
            .to_string(),
        containers,
        network_interfaces,
    }
}

fn node_detail(node: &ContainerInstance) -> NodeDetail {
    NodeDetail {
        container_instance_arn: node.container_instance_arn().unwrap_or_default().to_string(),
        ec2_instance_id: node.ec2_instance_id().map(str::to_string),
        capacity_provider: node.capacity_provider_name().unwrap_or("-").to_string(),
        running_tasks: node.running_tasks_count(),
        pending_tasks: node.pending_tasks_count(),
        status: node.status().unwrap_or_default().to_string(),
        status_reason: node.status_reason().map(str::to_string),
        agent_connected: node.agent_connected(),
        registered_at: node.registered_at().and_then(to_chrono),
    }
}

fn to_chrono(value: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(value.secs(), value.subsec_nanos())
}

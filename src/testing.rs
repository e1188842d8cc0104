use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ecs::ControlPlane;
use crate::error::EcsError;
use crate::logs::Pacer;
use crate::model::{
    ContainerDetail, ContainerLogConfig, DescribedResource, LogPage, LogQuery, LogRecord,
    ResourceKind, ResourcePage, ServiceDetail, Session, TaskDetail,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List {
        kind: ResourceKind,
        cursor: Option<String>,
        page_size: usize,
    },
    Describe {
        kind: ResourceKind,
        identifiers: Vec<String>,
    },
    Scale {
        service: String,
        desired: u32,
    },
    Stop {
        task: String,
        reason: String,
    },
    Exec {
        task: String,
        container: String,
        command: String,
        interactive: bool,
    },
    LogConfig {
        task: String,
    },
    FetchLogs(LogQuery),
    Pause(Duration),
}

/// Scripted control plane. List and log pages are served in order; describe
/// answers from `catalog` and silently drops identifiers it does not know.
#[derive(Default)]
pub struct FakeControlPlane {
    pub list_pages: Mutex<VecDeque<Result<ResourcePage, EcsError>>>,
    pub catalog: HashMap<String, DescribedResource>,
    pub fail_describe_call: Option<usize>,
    pub log_configs: Vec<ContainerLogConfig>,
    pub log_pages: Mutex<VecDeque<Result<LogPage, EcsError>>>,
    pub cancel_when_logs_exhausted: Option<CancellationToken>,
    pub session: Mutex<Option<Session>>,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeControlPlane {
    pub fn with_pages(pages: Vec<ResourcePage>) -> Self {
        Self {
            list_pages: Mutex::new(pages.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn describe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Describe { .. }))
            .count()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_identifiers(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<ResourcePage, EcsError> {
        self.record(Call::List {
            kind,
            cursor: cursor.map(str::to_string),
            page_size,
        });
        self.list_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ResourcePage::default()))
    }

    async fn describe(
        &self,
        kind: ResourceKind,
        identifiers: &[String],
    ) -> Result<Vec<DescribedResource>, EcsError> {
        self.record(Call::Describe {
            kind,
            identifiers: identifiers.to_vec(),
        });
        if self.fail_describe_call == Some(self.describe_count()) {
            return Err(EcsError::remote("Describe", "service unavailable"));
        }
        Ok(identifiers
            .iter()
            .filter_map(|id| self.catalog.get(id).cloned())
            .collect())
    }

    async fn update_desired_count(&self, service: &str, desired: u32) -> Result<(), EcsError> {
        self.record(Call::Scale {
            service: service.to_string(),
            desired,
        });
        Ok(())
    }

    async fn stop_task(&self, task: &str, reason: &str) -> Result<(), EcsError> {
        self.record(Call::Stop {
            task: task.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn request_execution_session(
        &self,
        task: &str,
        container: &str,
        command: &str,
        interactive: bool,
    ) -> Result<Session, EcsError> {
        self.record(Call::Exec {
            task: task.to_string(),
            container: container.to_string(),
            command: command.to_string(),
            interactive,
        });
        self.session
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| EcsError::remote("ExecuteCommand", "task is not running"))
    }

    async fn describe_task_log_config(
        &self,
        task: &str,
    ) -> Result<Vec<ContainerLogConfig>, EcsError> {
        self.record(Call::LogConfig {
            task: task.to_string(),
        });
        Ok(self.log_configs.clone())
    }

    async fn fetch_log_records(&self, query: &LogQuery) -> Result<LogPage, EcsError> {
        self.record(Call::FetchLogs(query.clone()));
        let next = self.log_pages.lock().unwrap().pop_front();
        match next {
            Some(page) => page,
            None => {
                if let Some(cancel) = &self.cancel_when_logs_exhausted {
                    cancel.cancel();
                }
                Ok(LogPage::default())
            }
        }
    }
}

/// Records pauses into the fake's call log instead of sleeping.
#[async_trait]
impl Pacer for std::sync::Arc<FakeControlPlane> {
    async fn pause(&self, interval: Duration) {
        self.record(Call::Pause(interval));
    }
}

pub fn service(name: &str) -> DescribedResource {
    DescribedResource::Service(ServiceDetail {
        name: name.to_string(),
        service_arn: service_arn(name),
        status: "ACTIVE".to_string(),
        ..ServiceDetail::default()
    })
}

pub fn service_arn(name: &str) -> String {
    format!("arn:aws:ecs:us-east-1:123456789012:service/prod/{name}")
}

pub fn task_with_containers(task_id: &str, containers: &[&str]) -> DescribedResource {
    DescribedResource::Task(TaskDetail {
        task_id: task_id.to_string(),
        task_arn: format!("arn:aws:ecs:us-east-1:123456789012:task/prod/{task_id}"),
        last_status: "RUNNING".to_string(),
        containers: containers
            .iter()
            .map(|name| ContainerDetail {
                name: (*name).to_string(),
                ..ContainerDetail::default()
            })
            .collect(),
        ..TaskDetail::default()
    })
}

pub fn log_record(timestamp_millis: i64, message: &str) -> LogRecord {
    LogRecord {
        timestamp_millis,
        message: message.to_string(),
    }
}

pub fn page(identifiers: &[&str], next_cursor: Option<&str>) -> ResourcePage {
    ResourcePage {
        identifiers: identifiers.iter().map(|id| (*id).to_string()).collect(),
        next_cursor: next_cursor.map(str::to_string),
    }
}

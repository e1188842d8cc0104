use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Write as _;

use crate::model::{
    DescribedResource, LogRecord, NodeDetail, ResourceKind, ServiceDetail, Target, TaskDetail,
    task_id_from_arn,
};

const COLUMN_GAP: &str = "   ";

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Wide,
    Json,
    Yaml,
}

impl OutputFormat {
    fn is_structured(self) -> bool {
        matches!(self, Self::Json | Self::Yaml)
    }
}

/// Aligned text columns, padded to the widest cell.
#[derive(Debug, Default)]
pub struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<&'static str>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn render(&self) -> String {
        let mut widths = self.headers.iter().map(|h| h.len()).collect::<Vec<_>>();
        for row in &self.rows {
            for (index, cell) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(index) {
                    *width = (*width).max(cell.chars().count());
                }
            }
        }

        let mut out = String::new();
        let headers = self.headers.iter().map(|h| (*h).to_string()).collect::<Vec<_>>();
        for row in std::iter::once(&headers).chain(self.rows.iter()) {
            let mut line = String::new();
            for (index, width) in widths.iter().enumerate() {
                let cell = row.get(index).map(String::as_str).unwrap_or("");
                if index + 1 == widths.len() {
                    line.push_str(cell);
                } else {
                    let _ = write!(line, "{cell:<width$}{COLUMN_GAP}");
                }
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }
}

pub fn structured<T>(value: &T, format: OutputFormat) -> Result<String>
where
    T: Serialize + ?Sized,
{
    match format {
        OutputFormat::Yaml => serde_yaml::to_string(value).context("failed to render YAML"),
        _ => serde_json::to_string_pretty(value)
            .map(|json| json + "\n")
            .context("failed to render JSON"),
    }
}

pub fn render_resources(
    kind: ResourceKind,
    records: &[DescribedResource],
    format: OutputFormat,
    now: DateTime<Utc>,
) -> Result<String> {
    if format.is_structured() {
        return structured(records, format);
    }
    if records.is_empty() {
        return Ok(format!("No {} found.\n", kind.title().to_lowercase()));
    }

    let wide = format == OutputFormat::Wide;
    let table = match kind {
        ResourceKind::Services => service_table(records, wide, now),
        ResourceKind::Tasks => task_table(records, wide, now),
        ResourceKind::Nodes => node_table(records, wide, now),
    };
    Ok(table.render())
}

fn service_table(records: &[DescribedResource], wide: bool, now: DateTime<Utc>) -> Table {
    let mut headers = vec!["NAME", "STATUS", "DESIRED", "RUNNING", "PENDING", "AGE"];
    if wide {
        headers.push("TASK DEFINITION");
    }
    let mut table = Table::new(headers);
    for record in records {
        let DescribedResource::Service(service) = record else {
            continue;
        };
        let mut row = vec![
            service.name.clone(),
            service.status.clone(),
            service.desired_count.to_string(),
            service.running_count.to_string(),
            service.pending_count.to_string(),
            human_age(service.created_at, now),
        ];
        if wide {
            row.push(short_task_definition(&service.task_def));
        }
        table.push(row);
    }
    table
}

fn task_table(records: &[DescribedResource], wide: bool, now: DateTime<Utc>) -> Table {
    let mut headers = vec!["TASK ID", "STATUS", "TASK DEFINITION", "STARTED", "AGE"];
    if wide {
        headers.extend(["CPU", "MEMORY", "LAUNCH TYPE", "CAPACITY PROVIDER"]);
    }
    let mut table = Table::new(headers);
    for record in records {
        let DescribedResource::Task(task) = record else {
            continue;
        };
        let mut row = vec![
            task.task_id.clone(),
            task.last_status.clone(),
            task.task_def_family.clone(),
            human_age(task.started_at, now),
            human_age(task.created_at, now),
        ];
        if wide {
            row.extend([
                dash(task.cpu.as_deref()),
                dash(task.memory.as_deref()),
                dash(Some(&task.launch_type)),
                dash(Some(&task.capacity_provider)),
            ]);
        }
        table.push(row);
    }
    table
}

fn node_table(records: &[DescribedResource], wide: bool, now: DateTime<Utc>) -> Table {
    let mut headers = vec!["INSTANCE", "STATUS", "AGENT", "RUNNING", "PENDING", "AGE"];
    if wide {
        headers.extend(["CAPACITY PROVIDER", "CONTAINER INSTANCE"]);
    }
    let mut table = Table::new(headers);
    for record in records {
        let DescribedResource::Node(node) = record else {
            continue;
        };
        let mut row = vec![
            node_label(node),
            node.status.clone(),
            if node.agent_connected {
                "connected".to_string()
            } else {
                "disconnected".to_string()
            },
            node.running_tasks.to_string(),
            node.pending_tasks.to_string(),
            human_age(node.registered_at, now),
        ];
        if wide {
            row.push(dash(Some(&node.capacity_provider)));
            row.push(task_id_from_arn(&node.container_instance_arn));
        }
        table.push(row);
    }
    table
}

fn node_label(node: &NodeDetail) -> String {
    node.ec2_instance_id
        .clone()
        .unwrap_or_else(|| task_id_from_arn(&node.container_instance_arn))
}

pub fn describe_service(service: &ServiceDetail) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Name:             {}", service.name);
    let _ = writeln!(out, "ARN:              {}", service.service_arn);
    let _ = writeln!(out, "Status:           {}", service.status);
    let _ = writeln!(out, "Task Definition:  {}", service.task_def);
    let _ = writeln!(out, "Desired Count:    {}", service.desired_count);
    let _ = writeln!(out, "Running Count:    {}", service.running_count);
    let _ = writeln!(out, "Pending Count:    {}", service.pending_count);
    let _ = writeln!(out, "Created At:       {}", timestamp(service.created_at));

    if !service.load_balancers.is_empty() {
        out.push_str("Load Balancers:\n");
        for lb in &service.load_balancers {
            let _ = writeln!(out, "  - Target Group:    {}", lb.target_group);
            let _ = writeln!(out, "    Container Name:  {}", lb.container_name);
            let _ = writeln!(out, "    Container Port:  {}", lb.container_port);
        }
    }
    if let Some(network) = &service.network_config {
        out.push_str("Network Configuration:\n");
        let _ = writeln!(out, "  Subnets:          {}", network.subnet_ids.join(", "));
        let _ = writeln!(out, "  Security Groups:  {}", network.security_groups.join(", "));
        let _ = writeln!(out, "  Public IP:        {}", network.public_ip);
    }
    if !service.events.is_empty() {
        out.push_str("Events:\n");
        for event in &service.events {
            let _ = writeln!(out, "  {}: {}", timestamp(event.created_at), event.message);
        }
    }
    out
}

pub fn describe_task(task: &TaskDetail) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task ID:          {}", task.task_id);
    let _ = writeln!(out, "ARN:              {}", task.task_arn);
    let _ = writeln!(out, "Cluster:          {}", task.cluster_arn);
    let _ = writeln!(out, "Task Definition:  {}", task.task_definition_arn);
    let _ = writeln!(out, "Status:           {}", task.last_status);
    let _ = writeln!(out, "Desired Status:   {}", task.desired_status);
    let _ = writeln!(out, "Group:            {}", dash(Some(&task.group)));
    let _ = writeln!(out, "Launch Type:      {}", dash(Some(&task.launch_type)));
    let _ = writeln!(out, "Capacity:         {}", dash(Some(&task.capacity_provider)));
    let _ = writeln!(out, "CPU:              {}", dash(task.cpu.as_deref()));
    let _ = writeln!(out, "Memory:           {}", dash(task.memory.as_deref()));
    let _ = writeln!(out, "Created At:       {}", timestamp(task.created_at));
    let _ = writeln!(out, "Started At:       {}", timestamp(task.started_at));
    if task.stopped_at.is_some() {
        let _ = writeln!(out, "Stopped At:       {}", timestamp(task.stopped_at));
        let _ = writeln!(out, "Stopped Reason:   {}", dash(task.stopped_reason.as_deref()));
    }
    if let Some(instance) = &task.container_instance_arn {
        let _ = writeln!(out, "Container Host:   {}", task_id_from_arn(instance));
    }

    out.push_str("Containers:\n");
    for container in &task.containers {
        let _ = writeln!(out, "  - Name:    {}", container.name);
        let _ = writeln!(out, "    Image:   {}", container.image);
        let _ = writeln!(out, "    Status:  {}", container.status);
        if !container.health_status.is_empty() {
            let _ = writeln!(out, "    Health:  {}", container.health_status);
        }
        if let Some(code) = container.exit_code {
            let _ = writeln!(out, "    Exit:    {code}");
        }
        for binding in &container.network_bindings {
            let _ = writeln!(
                out,
                "    Port:    {}:{}/{}",
                binding.host_port, binding.container_port, binding.protocol
            );
        }
    }
    if !task.network_interfaces.is_empty() {
        out.push_str("Network Interfaces:\n");
        for eni in &task.network_interfaces {
            let _ = writeln!(out, "  - Attachment:  {}", eni.attachment_id);
            let _ = writeln!(out, "    Private IP:  {}", eni.private_ipv4);
            if !eni.public_ipv4.is_empty() {
                let _ = writeln!(out, "    Public IP:   {}", eni.public_ipv4);
            }
            let _ = writeln!(out, "    Subnet:      {}", eni.subnet_id);
        }
    }
    out
}

/// Describe text separated by blank lines, or the records as a JSON/YAML array.
pub fn render_described(records: &[DescribedResource], format: OutputFormat) -> Result<String> {
    if matches!(format, OutputFormat::Json | OutputFormat::Yaml) {
        return structured(records, format);
    }

    let blocks = records
        .iter()
        .filter_map(|record| match record {
            DescribedResource::Service(service) => Some(describe_service(service)),
            DescribedResource::Task(task) => Some(describe_task(task)),
            DescribedResource::Node(_) => None,
        })
        .collect::<Vec<_>>();
    Ok(blocks.join("\n"))
}

pub fn render_contexts(targets: &[Target], active: &str) -> String {
    let mut table = Table::new(vec!["CURRENT", "NAME", "CLUSTER", "PROFILE", "REGION"]);
    for target in targets {
        table.push(vec![
            if target.name == active { "*" } else { "" }.to_string(),
            target.name.clone(),
            target.cluster.clone(),
            target.profile.clone(),
            target.region.clone(),
        ]);
    }
    table.render()
}

pub fn log_line(record: &LogRecord) -> String {
    let stamp = record
        .timestamp()
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| record.timestamp_millis.to_string());
    format!("{stamp}  {}", record.message.trim_end_matches('\n'))
}

pub fn human_age(timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(timestamp) = timestamp else {
        return "-".to_string();
    };
    format_elapsed_seconds((now - timestamp).num_seconds().max(0))
}

fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}

fn dash(value: Option<&str>) -> String {
    match value {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => "-".to_string(),
    }
}

fn short_task_definition(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_string()
}

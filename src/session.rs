use serde::Serialize;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use tokio::process::{Child, Command as TokioCommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ecs::{ControlPlane, cancellable};
use crate::error::EcsError;
use crate::model::{DescribedResource, ResourceKind, Session, select_container};

pub const DEFAULT_RELAY_PROGRAM: &str = "session-manager-plugin";
pub const RELAY_ENV: &str = "ECS_RELAY_PLUGIN";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BridgeState {
    Resolving,
    Requesting,
    Bridging,
    Terminated,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BridgeRequest {
    Exec { command: String },
    PortForward(PortMapping),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PortMapping {
    pub local: u16,
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = EcsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            EcsError::Validation(format!(
                "invalid port mapping format: {value}, expected LOCAL_PORT:CONTAINER_PORT"
            ))
        };
        let (local, container) = value.split_once(':').ok_or_else(invalid)?;
        let parse = |port: &str| {
            if port.is_empty() || !port.bytes().all(|byte| byte.is_ascii_digit()) {
                return Err(invalid());
            }
            port.parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(invalid)
        };
        Ok(Self {
            local: parse(local)?,
            container: parse(container)?,
        })
    }
}

/// Things worth telling the operator while a bridge runs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BridgeNotice {
    ContainerDetected(String),
    SessionStarting { task: String, container: String },
    Forwarding(PortMapping),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BridgeOutcome {
    Completed,
    Interrupted,
}

/// Remote command that proxies the container port over the session's stdio.
pub fn port_forward_command(port: u16) -> String {
    format!(
        "sh -c 'timeout 1 bash -c \"echo > /dev/tcp/localhost/{port}\" 2>/dev/null \
         || {{ echo \"Error: Port {port} is not open in the container. Make sure the service is running.\"; exit 1; }}; \
         if command -v socat >/dev/null 2>&1; then socat STDIO TCP:localhost:{port}; \
         elif command -v nc >/dev/null 2>&1; then nc localhost {port}; \
         elif command -v bash >/dev/null 2>&1; then bash -c \"exec 3</dev/tcp/localhost/{port}; cat <&3 & cat >&3; wait\"; \
         else echo \"Error: No suitable tool found for port forwarding.\"; \
         echo \"Please install socat or netcat in the container.\"; exit 1; fi'"
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionInput<'a> {
    session_id: &'a str,
    stream_url: &'a str,
    token_value: &'a str,
    client_mode: &'static str,
    response_mode: &'static str,
}

/// The first argument the relay executable expects.
pub fn relay_payload(session: &Session) -> Result<String, serde_json::Error> {
    serde_json::to_string(&SessionInput {
        session_id: &session.session_id,
        stream_url: &session.stream_url,
        token_value: &session.token,
        client_mode: "interactive",
        response_mode: "json",
    })
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayConfig {
    pub program: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_RELAY_PROGRAM.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_override(program: Option<String>) -> Self {
        match program.filter(|program| !program.trim().is_empty()) {
            Some(program) => Self { program },
            None => Self::default(),
        }
    }

    pub fn locate(&self) -> Result<PathBuf, EcsError> {
        let not_found = || EcsError::RelayNotFound {
            program: self.program.clone(),
        };
        if self.program.contains(MAIN_SEPARATOR) || self.program.contains('/') {
            let path = Path::new(&self.program);
            return if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(not_found())
            };
        }
        which::which(&self.program).map_err(|_| not_found())
    }
}

/// A running relay child. Dropping it kills the process.
struct RelayProcess {
    program: String,
    child: Child,
}

impl RelayProcess {
    fn launch(path: &Path, session: Session, region: &str) -> Result<Self, EcsError> {
        let program = path.display().to_string();
        let payload = relay_payload(&session).map_err(|error| EcsError::Relay {
            program: program.clone(),
            source: error.into(),
        })?;
        debug!(session = %session.session_id, relay = %program, "launching relay");

        let child = TokioCommand::new(path)
            .arg(payload)
            .arg(region)
            .arg("StartSession")
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EcsError::Relay {
                program: program.clone(),
                source,
            })?;
        Ok(Self { program, child })
    }

    async fn supervise(mut self, cancel: &CancellationToken) -> Result<BridgeOutcome, EcsError> {
        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = self.child.wait() => Some(status),
        };
        let Some(status) = waited else {
            self.terminate().await?;
            return Ok(BridgeOutcome::Interrupted);
        };
        let status = status.map_err(|source| EcsError::Relay {
            program: self.program.clone(),
            source,
        })?;
        self.check(status)
    }

    async fn terminate(&mut self) -> Result<(), EcsError> {
        info!(relay = %self.program, "stopping relay");
        if let Err(source) = self.child.start_kill() {
            // Already exited; still reap below.
            debug!(relay = %self.program, "relay kill failed: {source}");
        }
        self.child
            .wait()
            .await
            .map(|_| ())
            .map_err(|source| EcsError::Relay {
                program: self.program.clone(),
                source,
            })
    }

    fn check(&self, status: ExitStatus) -> Result<BridgeOutcome, EcsError> {
        debug!(relay = %self.program, %status, "relay exited");
        if status.success() {
            Ok(BridgeOutcome::Completed)
        } else {
            Err(EcsError::Relay {
                program: self.program.clone(),
                source: std::io::Error::other(format!("relay exited with {status}")),
            })
        }
    }
}

/// Turns one execution session into a local terminal relay.
pub struct SessionBridge<'a, A: ?Sized> {
    api: &'a A,
    relay: RelayConfig,
    region: String,
    state: BridgeState,
}

impl<'a, A> SessionBridge<'a, A>
where
    A: ControlPlane + ?Sized,
{
    pub fn new(api: &'a A, relay: RelayConfig, region: impl Into<String>) -> Self {
        Self {
            api,
            relay,
            region: region.into(),
            state: BridgeState::Resolving,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    fn enter(&mut self, state: BridgeState) {
        debug!(from = ?self.state, to = ?state, "session bridge transition");
        self.state = state;
    }

    pub async fn run(
        &mut self,
        task: &str,
        container: Option<&str>,
        request: BridgeRequest,
        cancel: &CancellationToken,
        notify: &mut dyn FnMut(BridgeNotice),
    ) -> Result<BridgeOutcome, EcsError> {
        let outcome = self.drive(task, container, request, cancel, notify).await;
        self.enter(BridgeState::Terminated);
        outcome
    }

    async fn drive(
        &mut self,
        task: &str,
        container: Option<&str>,
        request: BridgeRequest,
        cancel: &CancellationToken,
        notify: &mut dyn FnMut(BridgeNotice),
    ) -> Result<BridgeOutcome, EcsError> {
        self.enter(BridgeState::Resolving);
        let chosen = resolve_container(self.api, task, container, cancel).await?;
        if container.is_none_or(|name| name.trim().is_empty()) {
            notify(BridgeNotice::ContainerDetected(chosen.clone()));
        }

        self.enter(BridgeState::Requesting);
        let (command, forwarding) = match request {
            BridgeRequest::Exec { command } => (command, None),
            BridgeRequest::PortForward(mapping) => {
                (port_forward_command(mapping.container), Some(mapping))
            }
        };
        notify(BridgeNotice::SessionStarting {
            task: task.to_string(),
            container: chosen.clone(),
        });
        let session = cancellable(
            cancel,
            "request execution session",
            self.api
                .request_execution_session(task, &chosen, &command, true),
        )
        .await?;

        self.enter(BridgeState::Bridging);
        let path = self.relay.locate()?;
        if let Some(mapping) = forwarding {
            notify(BridgeNotice::Forwarding(mapping));
        }
        let relay = RelayProcess::launch(&path, session, &self.region)?;
        relay.supervise(cancel).await
    }
}

/// Resolves the container a task-scoped session should address.
pub async fn resolve_container<A>(
    api: &A,
    task: &str,
    requested: Option<&str>,
    cancel: &CancellationToken,
) -> Result<String, EcsError>
where
    A: ControlPlane + ?Sized,
{
    let described = cancellable(
        cancel,
        "describe task",
        api.describe(ResourceKind::Tasks, &[task.to_string()]),
    )
    .await?;
    let Some(DescribedResource::Task(detail)) = described.into_iter().next() else {
        return Err(EcsError::not_found("task", task));
    };
    select_container(task, &detail.container_names(), requested)
}

#[cfg(test)]
mod tests {
    use super::{
        BridgeNotice, BridgeRequest, BridgeState, PortMapping, RelayConfig, SessionBridge,
        port_forward_command, relay_payload,
    };
    use crate::error::EcsError;
    use crate::model::Session;
    use crate::testing::{Call, FakeControlPlane, task_with_containers};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn session() -> Session {
        Session {
            session_id: "ecs-execute-command-0a1b".to_string(),
            stream_url: "wss://ssmmessages.us-east-1.amazonaws.com/v1/data-channel/0a1b"
                .to_string(),
            token: "secret".to_string(),
        }
    }

    fn fake_with_task(containers: &[&str]) -> FakeControlPlane {
        let mut api = FakeControlPlane::default();
        api.catalog
            .insert("abc".to_string(), task_with_containers("abc", containers));
        *api.session.get_mut().unwrap() = Some(session());
        api
    }

    fn missing_relay() -> RelayConfig {
        RelayConfig::from_override(Some("ecs-relay-that-does-not-exist".to_string()))
    }

    fn exec_calls(api: &FakeControlPlane) -> Vec<Call> {
        api.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Exec { .. }))
            .collect()
    }

    #[test]
    fn port_mapping_accepts_local_and_container_ports() {
        assert_eq!(
            "8080:80".parse::<PortMapping>().unwrap(),
            PortMapping {
                local: 8080,
                container: 80
            }
        );
        for invalid in [
            "8080",
            "0:80",
            "a:b",
            "70000:80",
            "8080:80:1",
            ":80",
            "+8080:+80",
            "8080:+80",
            "8080: 80",
            " 8080:80",
            "8080:80 ",
        ] {
            assert!(
                matches!(
                    invalid.parse::<PortMapping>(),
                    Err(EcsError::Validation(_))
                ),
                "{invalid} should be rejected"
            );
        }
    }

    #[test]
    fn proxy_command_checks_port_then_prefers_socat_over_nc_over_bash() {
        let command = port_forward_command(5432);
        let check = command.find("/dev/tcp/localhost/5432").unwrap();
        let socat = command.find("socat STDIO TCP:localhost:5432").unwrap();
        let nc = command.find("nc localhost 5432").unwrap();
        let bash = command.find("exec 3</dev/tcp/localhost/5432").unwrap();
        assert!(check < socat && socat < nc && nc < bash);
        assert!(command.contains("Please install socat or netcat"));
    }

    #[test]
    fn relay_payload_carries_session_fields() {
        let payload: serde_json::Value =
            serde_json::from_str(&relay_payload(&session()).unwrap()).unwrap();
        assert_eq!(
            payload,
            json!({
                "sessionId": "ecs-execute-command-0a1b",
                "streamUrl": "wss://ssmmessages.us-east-1.amazonaws.com/v1/data-channel/0a1b",
                "tokenValue": "secret",
                "clientMode": "interactive",
                "responseMode": "json",
            })
        );
    }

    #[test]
    fn relay_lookup_failure_includes_install_hint() {
        let error = missing_relay().locate().unwrap_err();
        assert!(matches!(error, EcsError::RelayNotFound { .. }));
        assert!(error.to_string().contains("Session Manager plugin"));
        assert_eq!(
            RelayConfig::from_override(Some(" ".to_string())),
            RelayConfig::default()
        );
    }

    #[tokio::test]
    async fn exec_detects_container_and_always_requests_interactive() {
        let api = fake_with_task(&["ecs-service-connect-7f", "web"]);
        let mut notices = Vec::new();
        let mut bridge = SessionBridge::new(&api, missing_relay(), "us-east-1");

        let error = bridge
            .run(
                "abc",
                None,
                BridgeRequest::Exec {
                    command: "ls -la".to_string(),
                },
                &CancellationToken::new(),
                &mut |notice| notices.push(notice),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, EcsError::RelayNotFound { .. }));
        assert_eq!(bridge.state(), BridgeState::Terminated);
        assert_eq!(
            notices[0],
            BridgeNotice::ContainerDetected("web".to_string())
        );
        assert_eq!(
            exec_calls(&api),
            vec![Call::Exec {
                task: "abc".to_string(),
                container: "web".to_string(),
                command: "ls -la".to_string(),
                interactive: true,
            }]
        );
    }

    #[tokio::test]
    async fn ambiguous_task_never_requests_a_session() {
        let api = fake_with_task(&["web", "worker"]);
        let mut bridge = SessionBridge::new(&api, missing_relay(), "us-east-1");

        let error = bridge
            .run(
                "abc",
                None,
                BridgeRequest::Exec {
                    command: "sh".to_string(),
                },
                &CancellationToken::new(),
                &mut |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            EcsError::AmbiguousContainer { ref candidates, .. } if candidates.len() == 2
        ));
        assert!(exec_calls(&api).is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let api = FakeControlPlane::default();
        let mut bridge = SessionBridge::new(&api, missing_relay(), "us-east-1");
        let error = bridge
            .run(
                "nope",
                Some("web"),
                BridgeRequest::Exec {
                    command: "sh".to_string(),
                },
                &CancellationToken::new(),
                &mut |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(error, EcsError::NotFound { kind: "task", .. }));
    }

    #[tokio::test]
    async fn port_forward_sends_proxy_command_for_container_port() {
        let api = fake_with_task(&["web"]);
        let mut bridge = SessionBridge::new(&api, missing_relay(), "us-east-1");
        let mapping = "8080:80".parse::<PortMapping>().unwrap();

        let _ = bridge
            .run(
                "abc",
                Some("web"),
                BridgeRequest::PortForward(mapping),
                &CancellationToken::new(),
                &mut |_| {},
            )
            .await;
        let calls = exec_calls(&api);
        let Some(Call::Exec { command, .. }) = calls.first() else {
            panic!("expected an exec call");
        };
        assert_eq!(command, &port_forward_command(80));
    }

    #[cfg(unix)]
    mod relay {
        use super::fake_with_task;
        use crate::error::EcsError;
        use crate::session::{
            BridgeNotice, BridgeOutcome, BridgeRequest, PortMapping, RelayConfig, SessionBridge,
        };
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;
        use tokio_util::sync::CancellationToken;

        fn script(dir: &tempfile::TempDir, body: &str) -> RelayConfig {
            let path = dir.path().join("relay.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            RelayConfig::from_override(Some(path.display().to_string()))
        }

        #[tokio::test]
        async fn relay_exit_status_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let api = fake_with_task(&["web"]);
            let mut notices = Vec::new();
            let mut bridge = SessionBridge::new(&api, script(&dir, "exit 0"), "us-east-1");
            let outcome = bridge
                .run(
                    "abc",
                    Some("web"),
                    BridgeRequest::PortForward(PortMapping {
                        local: 8080,
                        container: 80,
                    }),
                    &CancellationToken::new(),
                    &mut |notice| notices.push(notice),
                )
                .await
                .unwrap();
            assert_eq!(outcome, BridgeOutcome::Completed);
            assert!(notices.contains(&BridgeNotice::Forwarding(PortMapping {
                local: 8080,
                container: 80
            })));

            let api = fake_with_task(&["web"]);
            let mut bridge = SessionBridge::new(&api, script(&dir, "exit 3"), "us-east-1");
            let error = bridge
                .run(
                    "abc",
                    Some("web"),
                    BridgeRequest::Exec {
                        command: "sh".to_string(),
                    },
                    &CancellationToken::new(),
                    &mut |_| {},
                )
                .await
                .unwrap_err();
            assert!(matches!(error, EcsError::Relay { .. }));
        }

        #[tokio::test]
        async fn cancellation_kills_and_reaps_relay() {
            let dir = tempfile::tempdir().unwrap();
            let api = fake_with_task(&["web"]);
            let relay = script(&dir, "sleep 30");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let mut bridge = SessionBridge::new(&api, relay, "us-east-1");
            let outcome = tokio::time::timeout(
                Duration::from_secs(10),
                bridge.run(
                    "abc",
                    Some("web"),
                    BridgeRequest::Exec {
                        command: "sh".to_string(),
                    },
                    &cancel,
                    &mut |_| {},
                ),
            )
            .await
            .expect("bridge should stop promptly")
            .unwrap();
            assert_eq!(outcome, BridgeOutcome::Interrupted);
        }
    }
}

//! Hosted Daytona backend.
//!
//! Talks to the Daytona REST API: sandboxes are created and deleted through
//! `/sandbox`, and files and processes go through the per-sandbox toolbox
//! endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::config::DaytonaConfig;
use crate::error::SandboxError;
use crate::sandbox::{
    EnvironmentId, ExecOutput, ExecRequest, ProvisionRequest, SandboxBackend, SandboxFile,
    resolve_path,
};

const BACKEND: &str = "daytona";

/// Home directory of the default sandbox user.
pub const WORKDIR: &str = "/home/daytona";

const START_POLL_INTERVAL: Duration = Duration::from_secs(1);
const START_POLL_ATTEMPTS: u32 = 120;

pub struct DaytonaBackend {
    client: Client,
    config: DaytonaConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<&'a str>,
    target: &'a str,
    labels: &'a std::collections::BTreeMap<String, String>,
    /// Minutes of inactivity before the provider stops the sandbox.
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_stop_interval: Option<u32>,
}

#[derive(Deserialize)]
struct SandboxInfo {
    id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "errorReason")]
    error_reason: Option<String>,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    command: &'a str,
    cwd: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    exit_code: i64,
    #[serde(default)]
    result: String,
}

/// Quote a word for a POSIX shell.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Render argv and per-invocation environment as one command line.
fn command_line(request: &ExecRequest) -> String {
    let mut words = Vec::with_capacity(request.argv.len() + request.env.len() + 1);
    if !request.env.is_empty() {
        words.push("env".to_string());
        for (key, value) in &request.env {
            words.push(shell_quote(&format!("{}={}", key, value.expose_secret())));
        }
    }
    words.extend(request.argv.iter().map(|w| shell_quote(w)));
    words.join(" ")
}

impl DaytonaBackend {
    pub fn new(config: DaytonaConfig) -> Result<Self, SandboxError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| SandboxError::Connection {
                backend: BACKEND.to_string(),
                reason: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn toolbox_url(&self, id: &EnvironmentId, path: &str) -> String {
        self.url(&format!("toolbox/{}/toolbox/{}", id, path.trim_start_matches('/')))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(self.config.api_key.expose_secret())
    }

    /// Send a request and turn transport errors and non-2xx statuses into a
    /// reason string.
    async fn send(&self, builder: RequestBuilder) -> Result<Response, String> {
        let response = self
            .authed(builder)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(format!("HTTP {}: {}", status, body.chars().take(512).collect::<String>()))
    }

    async fn wait_until_started(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        for _ in 0..START_POLL_ATTEMPTS {
            let info: SandboxInfo = self
                .send(self.client.get(self.url(&format!("sandbox/{}", id))))
                .await
                .map_err(|reason| SandboxError::ProvisionFailed { reason })?
                .json()
                .await
                .map_err(|e| SandboxError::ProvisionFailed {
                    reason: e.to_string(),
                })?;

            match info.state.as_deref() {
                Some("started") | None => return Ok(()),
                Some(state @ ("error" | "build_failed" | "destroyed")) => {
                    return Err(SandboxError::ProvisionFailed {
                        reason: format!(
                            "sandbox {} entered state {}: {}",
                            id,
                            state,
                            info.error_reason.unwrap_or_default()
                        ),
                    });
                }
                Some(_) => tokio::time::sleep(START_POLL_INTERVAL).await,
            }
        }
        Err(SandboxError::ProvisionFailed {
            reason: format!("sandbox {} did not start in time", id),
        })
    }

    async fn execute(
        &self,
        id: &EnvironmentId,
        command: &str,
        cwd: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SandboxError> {
        let body = ExecuteBody {
            command,
            cwd,
            timeout: timeout.map(|t| t.as_secs().max(1)),
        };
        let response: ExecuteResponse = self
            .send(
                self.client
                    .post(self.toolbox_url(id, "process/execute"))
                    .json(&body),
            )
            .await
            .map_err(|reason| SandboxError::ExecFailed {
                id: id.clone(),
                reason,
            })?
            .json()
            .await
            .map_err(|e| SandboxError::ExecFailed {
                id: id.clone(),
                reason: format!("invalid execute response: {}", e),
            })?;

        // The toolbox merges both streams into `result`.
        Ok(ExecOutput {
            exit_code: response.exit_code,
            stdout: response.result,
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl SandboxBackend for DaytonaBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    /// The client is configured; the hosted API is contacted per job.
    async fn health_check(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn allocate(&self, request: &ProvisionRequest) -> Result<EnvironmentId, SandboxError> {
        let mut labels = request.labels.clone();
        labels.insert("name".to_string(), request.name.clone());
        let body = CreateSandboxBody {
            snapshot: request.snapshot.as_deref(),
            target: &self.config.target,
            labels: &labels,
            auto_stop_interval: request.auto_stop_minutes,
        };

        let info: SandboxInfo = self
            .send(self.client.post(self.url("sandbox")).json(&body))
            .await
            .map_err(|reason| SandboxError::ProvisionFailed { reason })?
            .json()
            .await
            .map_err(|e| SandboxError::ProvisionFailed {
                reason: format!("invalid create response: {}", e),
            })?;

        Ok(EnvironmentId::new(info.id))
    }

    async fn wait_ready(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        self.wait_until_started(id).await
    }

    async fn set_auto_stop(&self, id: &EnvironmentId, minutes: u32) -> Result<(), SandboxError> {
        self.send(
            self.client
                .post(self.url(&format!("sandbox/{}/autostop/{}", id, minutes))),
        )
        .await
        .map(|_| ())
        .map_err(|reason| SandboxError::AutoStopFailed {
            id: id.clone(),
            reason,
        })
    }

    async fn upload(&self, id: &EnvironmentId, file: &SandboxFile) -> Result<(), SandboxError> {
        let full_path = resolve_path(WORKDIR, &file.path);
        let name = full_path
            .rsplit('/')
            .next()
            .unwrap_or(full_path.as_str())
            .to_string();
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(file.bytes.clone()).file_name(name),
        );

        self.send(
            self.client
                .post(self.toolbox_url(id, "files/upload"))
                .query(&[("path", full_path.as_str())])
                .multipart(form),
        )
        .await
        .map_err(|reason| SandboxError::UploadFailed {
            id: id.clone(),
            path: full_path.clone(),
            reason,
        })?;

        if file.executable {
            let chmod = format!("chmod 755 {}", shell_quote(&full_path));
            let output = self.execute(id, &chmod, WORKDIR, None).await?;
            if !output.success() {
                return Err(SandboxError::UploadFailed {
                    id: id.clone(),
                    path: full_path,
                    reason: format!("chmod failed: {}", output.stdout.trim()),
                });
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &EnvironmentId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, SandboxError> {
        let cwd = request.working_dir.as_deref().unwrap_or(WORKDIR);
        self.execute(id, &command_line(request), cwd, request.timeout)
            .await
    }

    async fn download(&self, id: &EnvironmentId, path: &str) -> Result<Vec<u8>, SandboxError> {
        let full_path = resolve_path(WORKDIR, path);
        let download_failed = |reason: String| SandboxError::DownloadFailed {
            id: id.clone(),
            path: full_path.clone(),
            reason,
        };

        let response = self
            .send(
                self.client
                    .get(self.toolbox_url(id, "files/download"))
                    .query(&[("path", full_path.as_str())]),
            )
            .await
            .map_err(download_failed)?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn destroy(&self, id: &EnvironmentId) -> Result<(), SandboxError> {
        self.send(self.client.delete(self.url(&format!("sandbox/{}", id))))
            .await
            .map(|_| ())
            .map_err(|reason| SandboxError::DestroyFailed {
                id: id.clone(),
                reason,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use secrecy::SecretString;
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockState {
        auth: Vec<String>,
        commands: Vec<String>,
        deleted: Vec<String>,
        autostop: Vec<(String, u32)>,
        created: Vec<serde_json::Value>,
    }

    type Shared = Arc<Mutex<MockState>>;

    async fn create_sandbox(
        State(state): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        {
            let mut state = state.lock().await;
            if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
                state.auth.push(auth.to_string());
            }
            state.created.push(body.clone());
        }
        if body["snapshot"] == "missing" {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"message": "snapshot not found"})),
            );
        }
        (
            StatusCode::OK,
            Json(serde_json::json!({"id": "sbx-1", "state": "creating"})),
        )
    }

    async fn sandbox_info(Path(id): Path<String>) -> Json<serde_json::Value> {
        Json(serde_json::json!({"id": id, "state": "started"}))
    }

    async fn delete_sandbox(State(state): State<Shared>, Path(id): Path<String>) -> StatusCode {
        state.lock().await.deleted.push(id);
        StatusCode::OK
    }

    async fn autostop(
        State(state): State<Shared>,
        Path((id, minutes)): Path<(String, u32)>,
    ) -> StatusCode {
        state.lock().await.autostop.push((id, minutes));
        StatusCode::OK
    }

    async fn execute(
        State(state): State<Shared>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let command = body["command"].as_str().unwrap_or_default().to_string();
        state.lock().await.commands.push(command.clone());
        let exit_code = if command.contains("fail") { 1 } else { 0 };
        Json(serde_json::json!({"exitCode": exit_code, "result": format!("ran {}", command)}))
    }

    async fn download(
        Query(params): Query<std::collections::HashMap<String, String>>,
    ) -> Result<String, StatusCode> {
        match params.get("path").map(String::as_str) {
            Some("/home/daytona/results.json") => Ok("{\"ok\":true}".to_string()),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn start_mock() -> (SocketAddr, Shared) {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));
        let router = Router::new()
            .route("/sandbox", post(create_sandbox))
            .route("/sandbox/{id}", get(sandbox_info).delete(delete_sandbox))
            .route("/sandbox/{id}/autostop/{minutes}", post(autostop))
            .route("/toolbox/{id}/toolbox/process/execute", post(execute))
            .route("/toolbox/{id}/toolbox/files/upload", post(|| async { StatusCode::OK }))
            .route("/toolbox/{id}/toolbox/files/download", get(download))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    fn backend(addr: SocketAddr) -> DaytonaBackend {
        DaytonaBackend::new(DaytonaConfig {
            api_key: SecretString::from("dtn-test".to_string()),
            api_url: format!("http://{}", addr),
            target: "us".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn command_line_quotes_words_and_env() {
        let request = ExecRequest::new(["./treasury-sim", "runner", "--input", "it's.json"])
            .with_env("ANTHROPIC_API_KEY", SecretString::from("sk-1".to_string()));
        assert_eq!(
            command_line(&request),
            r"env 'ANTHROPIC_API_KEY=sk-1' './treasury-sim' 'runner' '--input' 'it'\''s.json'"
        );
    }

    #[tokio::test]
    async fn lifecycle_against_mock_api() {
        let (addr, state) = start_mock().await;
        let backend = backend(addr);

        let id = backend
            .allocate(&ProvisionRequest {
                name: "job".to_string(),
                auto_stop_minutes: Some(10),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id.as_str(), "sbx-1");
        backend.wait_ready(&id).await.unwrap();

        backend.set_auto_stop(&id, 10).await.unwrap();
        backend
            .upload(&id, &SandboxFile::new("treasury-sim", vec![1, 2, 3]).executable())
            .await
            .unwrap();
        let output = backend
            .exec(&id, &ExecRequest::new(["true"]))
            .await
            .unwrap();
        assert!(output.success());

        let bytes = backend.download(&id, "results.json").await.unwrap();
        assert_eq!(bytes, b"{\"ok\":true}");
        assert!(backend.download(&id, "missing.json").await.is_err());

        backend.destroy(&id).await.unwrap();

        let state = state.lock().await;
        assert_eq!(state.auth, vec!["Bearer dtn-test".to_string()]);
        assert_eq!(state.created[0]["autoStopInterval"], 10);
        assert_eq!(state.created[0]["labels"]["name"], "job");
        assert_eq!(state.autostop, vec![("sbx-1".to_string(), 10)]);
        assert_eq!(state.deleted, vec!["sbx-1".to_string()]);
        assert_eq!(
            state.commands,
            vec![
                "chmod 755 '/home/daytona/treasury-sim'".to_string(),
                "'true'".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn failed_exec_reports_exit_code() {
        let (addr, _) = start_mock().await;
        let output = backend(addr)
            .exec(&EnvironmentId::new("sbx-1"), &ExecRequest::new(["fail"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.stdout.contains("fail"));
    }

    #[tokio::test]
    async fn create_error_surfaces_status() {
        let (addr, _) = start_mock().await;
        let err = backend(addr)
            .allocate(&ProvisionRequest {
                name: "job".to_string(),
                snapshot: Some("missing".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
    }

    #[tokio::test]
    async fn allocate_without_auto_stop_omits_interval() {
        let (addr, state) = start_mock().await;
        backend(addr)
            .allocate(&ProvisionRequest {
                name: "job".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = state.lock().await;
        assert!(state.created[0].get("autoStopInterval").is_none());
        assert!(state.deleted.is_empty());
    }
}

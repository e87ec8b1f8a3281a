//! End-to-end tests of the HTTP service against the in-process sandbox.
//!
//! Every job runs the real runner code, so these exercise the whole path:
//! HTTP -> dispatcher -> executor -> registry -> runner -> result document.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::Value;

use treasury_sim::config::JobConfig;
use treasury_sim::orchestrator::{AppState, JobExecutor, RunnerProgram, start_server};
use treasury_sim::sandbox::EnvironmentRegistry;
use treasury_sim::simulation::{Account, AccountCategory, SimulationMode, SimulationParameters};
use treasury_sim::testing::{InMemorySandbox, StubLlm, sample_request, sample_request_with_mode};

struct TestService {
    addr: SocketAddr,
    backend: Arc<InMemorySandbox>,
    registry: Arc<EnvironmentRegistry>,
    client: reqwest::Client,
}

impl TestService {
    async fn start(backend: InMemorySandbox, job: JobConfig, advisory_key: Option<&str>) -> Self {
        let backend = Arc::new(backend);
        let registry = Arc::new(EnvironmentRegistry::new(backend.clone()));
        let executor = JobExecutor::new(
            Arc::clone(&registry),
            RunnerProgram::from_bytes(b"runner".to_vec()),
            job,
        )
        .with_advisory_key(advisory_key.map(|k| SecretString::from(k.to_string())));

        let addr = start_server("127.0.0.1:0".parse().unwrap(), AppState::new(Arc::new(executor)))
            .await
            .expect("server starts");

        Self {
            addr,
            backend,
            registry,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: &Value) -> (reqwest::StatusCode, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("request succeeds");
        let status = resp.status();
        (status, resp.json().await.expect("json body"))
    }
}

fn metric_fields(body: &Value) -> Value {
    let keys = [
        "idleCashPct",
        "liquidityCoverageDays",
        "estYieldBps",
        "shortfallRiskPct",
        "recommendation",
        "transferDetails",
    ];
    Value::Object(
        keys.iter()
            .map(|k| (k.to_string(), body[*k].clone()))
            .collect(),
    )
}

#[tokio::test]
async fn health_endpoint() {
    let service = TestService::start(InMemorySandbox::new(), JobConfig::default(), None).await;

    let body: Value = service
        .client
        .get(service.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sandbox_connected"], true);
}

#[tokio::test]
async fn remote_and_local_metrics_agree() {
    let service = TestService::start(InMemorySandbox::new(), JobConfig::default(), None).await;

    for mode in [
        SimulationMode::Conservative,
        SimulationMode::Balanced,
        SimulationMode::Aggressive,
        SimulationMode::Custom,
    ] {
        let request = serde_json::to_value(sample_request_with_mode(mode)).unwrap();
        let (local_status, local) = service.post("/simulate/local", &request).await;
        let (remote_status, remote) = service.post("/simulate", &request).await;

        assert_eq!(local_status, 200);
        assert_eq!(remote_status, 200);
        assert_eq!(metric_fields(&local), metric_fields(&remote), "mode {mode}");
    }
    assert!(service.registry.list_active().await.is_empty());
}

#[tokio::test]
async fn remote_and_local_metrics_agree_with_overrides() {
    let service = TestService::start(InMemorySandbox::new(), JobConfig::default(), None).await;

    let fx_rates: BTreeMap<String, f64> = [("EUR".to_string(), 1.08), ("GBP".to_string(), 1.27)]
        .into_iter()
        .collect();
    let scenarios = [
        (
            SimulationMode::Custom,
            SimulationParameters {
                liquidity_threshold_pct: Some(15.0),
                custom_risk_multiplier: Some(1.3),
                custom_transfer_threshold: Some(5_000.0),
                fx_rates: Some(fx_rates.clone()),
                ..Default::default()
            },
        ),
        (
            SimulationMode::Custom,
            SimulationParameters {
                risk_appetite: Some("high".to_string()),
                investment_horizon_days: Some(90),
                fx_rates: Some(fx_rates.clone()),
                ..Default::default()
            },
        ),
        (
            SimulationMode::Balanced,
            SimulationParameters {
                liquidity_threshold_pct: Some(25.0),
                investment_horizon_days: Some(30),
                ..Default::default()
            },
        ),
        (
            SimulationMode::Aggressive,
            SimulationParameters {
                liquidity_threshold_pct: Some(0.0),
                custom_transfer_threshold: Some(0.0),
                fx_rates: Some(fx_rates.clone()),
                ..Default::default()
            },
        ),
    ];

    for (mode, parameters) in scenarios {
        let mut request = sample_request_with_mode(mode);
        request.accounts.push(Account {
            id: "acc-3".to_string(),
            name: "Euro Reserve".to_string(),
            bank: "Second Bank".to_string(),
            currency: "EUR".to_string(),
            balance: 25_000.0,
            account_type: AccountCategory::Savings,
        });
        request.parameters = Some(parameters.clone());
        let request = serde_json::to_value(request).unwrap();

        let (local_status, local) = service.post("/simulate/local", &request).await;
        let (remote_status, remote) = service.post("/simulate", &request).await;

        assert_eq!(local_status, 200, "{parameters:?}");
        assert_eq!(remote_status, 200, "{parameters:?}");
        assert_eq!(
            metric_fields(&local),
            metric_fields(&remote),
            "mode {mode} with {parameters:?}"
        );
    }
    assert_eq!(service.backend.created_count(), 4);
    assert!(service.registry.list_active().await.is_empty());
}

#[tokio::test]
async fn worked_example_over_http() {
    let stub = Arc::new(StubLlm::default());
    let backend = InMemorySandbox::new().with_llm(stub.clone());
    let service = TestService::start(backend, JobConfig::default(), None).await;
    let request = serde_json::to_value(sample_request()).unwrap();

    let (status, body) = service.post("/simulate", &request).await;
    assert_eq!(status, 200);
    assert_eq!(body["idleCashPct"], 39.33);
    assert_eq!(body["liquidityCoverageDays"], 75.0);
    assert_eq!(body["estYieldBps"], 157);
    assert_eq!(body["shortfallRiskPct"], 2.0);
    assert_eq!(
        body["recommendation"],
        "Transfer $47,200 from Operating to Yield"
    );
    assert_eq!(body["transferDetails"]["fromAccount"], "Operating");
    assert_eq!(body["transferDetails"]["toAccount"], "Yield");
    assert_eq!(body["advisory"]["enabled"], false);
    assert_eq!(
        body["advisory"]["reasoning"],
        "Advisory analysis skipped - no API key provided"
    );
    // Without the credential the provider is never contacted.
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn advisory_runs_when_credential_is_configured() {
    let backend = InMemorySandbox::new().with_llm(Arc::new(StubLlm::default()));
    let service = TestService::start(backend, JobConfig::default(), Some("sk-ant-test")).await;
    let request = serde_json::to_value(sample_request()).unwrap();

    let (status, body) = service.post("/simulate", &request).await;
    assert_eq!(status, 200);
    assert_eq!(body["advisory"]["enabled"], true);
    assert_eq!(body["advisory"]["confidence"], 0.85);
    assert_eq!(body["advisory"]["recommendation"], "Proceed with the transfer.");
}

#[tokio::test]
async fn advisory_failure_degrades_without_failing_the_job() {
    let backend = InMemorySandbox::new().with_llm(Arc::new(StubLlm::failing("overloaded")));
    let service = TestService::start(backend, JobConfig::default(), Some("sk-ant-test")).await;
    let request = serde_json::to_value(sample_request()).unwrap();

    let (status, body) = service.post("/simulate", &request).await;
    assert_eq!(status, 200);
    assert_eq!(body["idleCashPct"], 39.33);
    assert_eq!(body["advisory"]["enabled"], false);
    assert_eq!(body["advisory"]["confidence"], 0.5);
    assert!(
        body["advisory"]["error"]
            .as_str()
            .unwrap()
            .contains("overloaded")
    );
}

#[tokio::test]
async fn remote_failure_returns_500_and_tears_down() {
    let backend = InMemorySandbox::new();
    backend.fail_mode(SimulationMode::Conservative);
    let service = TestService::start(backend, JobConfig::default(), None).await;
    let request = serde_json::to_value(sample_request()).unwrap();

    let (status, body) = service.post("/simulate", &request).await;
    assert_eq!(status, 500);
    let detail = body["detail"].as_str().unwrap();
    assert!(detail.contains("remote-exec failed"));
    assert!(detail.contains("stderr: simulated runner failure"));

    assert_eq!(service.backend.created_count(), 1);
    assert_eq!(service.backend.destroyed().len(), 1);
    assert!(service.registry.list_active().await.is_empty());
}

#[tokio::test]
async fn timeout_returns_504_and_tears_down() {
    let backend = InMemorySandbox::new();
    backend.hang_runner();
    let job = JobConfig {
        timeout: Duration::from_secs(1),
        ..JobConfig::default()
    };
    let service = TestService::start(backend, job, None).await;
    let request = serde_json::to_value(sample_request()).unwrap();

    let (status, body) = service.post("/simulate", &request).await;
    assert_eq!(status, 504);
    assert_eq!(body["detail"], "Simulation timed out after 1 seconds");
    assert_eq!(service.backend.destroyed().len(), 1);
    assert_eq!(service.backend.active_count(), 0);
}

#[tokio::test]
async fn parallel_batch_isolates_failures() {
    let backend = InMemorySandbox::new();
    backend.fail_mode(SimulationMode::Aggressive);
    let service = TestService::start(backend, JobConfig::default(), None).await;

    let body = serde_json::json!({
        "simulations": [
            sample_request_with_mode(SimulationMode::Conservative),
            sample_request_with_mode(SimulationMode::Balanced),
            sample_request_with_mode(SimulationMode::Aggressive),
            sample_request_with_mode(SimulationMode::Custom),
            sample_request_with_mode(SimulationMode::Conservative),
        ]
    });
    let (status, body) = service.post("/simulate/parallel", &body).await;

    assert_eq!(status, 200);
    let results = body["results"].as_object().unwrap();
    let errors = body["errors"].as_object().unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(errors.len(), 1);
    assert!(results.contains_key("conservative-2"));
    assert!(errors["aggressive"].as_str().unwrap().contains("remote-exec"));
    assert!(body["total_time"].is_number());

    assert_eq!(service.backend.created_count(), 5);
    assert_eq!(service.backend.active_count(), 0);
    assert!(service.registry.list_active().await.is_empty());
}

#[tokio::test]
async fn retained_environment_is_reported() {
    let job = JobConfig {
        auto_cleanup: false,
        ..JobConfig::default()
    };
    let service = TestService::start(InMemorySandbox::new(), job, None).await;
    let request = serde_json::to_value(sample_request()).unwrap();

    let (status, body) = service.post("/simulate", &request).await;
    assert_eq!(status, 200);
    assert_eq!(body["environmentRetained"], true);
    let id = body["sandboxId"].as_str().unwrap();
    assert_eq!(service.registry.list_active().await.len(), 1);
    assert_eq!(service.registry.list_active().await[0].as_str(), id);

    // Shutdown path cleans up what auto-cleanup left behind.
    service.registry.teardown_all().await;
    assert_eq!(service.backend.active_count(), 0);
}

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use reqwest::blocking::Client as HttpClient;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
}

impl ComputeDevice {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputeDevice::Cpu => "cpu",
            ComputeDevice::Cuda => "cuda",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(ComputeDevice::Cpu),
            "cuda" | "gpu" => Some(ComputeDevice::Cuda),
            _ => None,
        }
    }

    /// Checks for an NVIDIA driver on this host.
    pub fn detect() -> Self {
        let markers = ["/proc/driver/nvidia/version", "/dev/nvidia0"];
        if markers.iter().any(|marker| Path::new(marker).exists()) {
            ComputeDevice::Cuda
        } else {
            ComputeDevice::Cpu
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt in, text out. Calls block; the engine runs them on the blocking pool.
pub trait TextModel: Send + Sync {
    fn name(&self) -> &str;

    /// Accelerator the backend runs on; fixed once the model is constructed.
    fn compute_device(&self) -> ComputeDevice;

    fn load(&self) -> Result<()> {
        Ok(())
    }

    fn infer(&self, prompt: &str, max_length: usize, temperature: f32) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_predict: usize,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Text-generation endpoint speaking the `/api/generate` JSON protocol
/// (non-streaming, `{"response": ...}` replies).
pub struct HttpTextModel {
    name: String,
    endpoint: Url,
    timeout: Duration,
    // Built on first use, on the blocking thread that makes the call.
    client: OnceLock<HttpClient>,
    compute_device: ComputeDevice,
}

impl HttpTextModel {
    pub fn new(
        name: impl Into<String>,
        endpoint: Url,
        timeout: Duration,
        compute_device: Option<ComputeDevice>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            timeout,
            client: OnceLock::new(),
            compute_device: compute_device.unwrap_or_else(ComputeDevice::detect),
        }
    }

    fn client(&self) -> Result<&HttpClient> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = HttpClient::builder()
            .user_agent("edge-telemetry-sim/0.1")
            .timeout(self.timeout)
            .build()
            .context("failed to build model client")?;
        Ok(self.client.get_or_init(|| client))
    }

    fn generate(&self, request: &GenerateRequest<'_>) -> Result<String> {
        let url = self
            .endpoint
            .join("api/generate")
            .context("invalid model endpoint")?;
        let resp = self
            .client()?
            .post(url)
            .json(request)
            .send()
            .context("model request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(anyhow!("model endpoint HTTP {status}: {}", text.trim()));
        }
        let body: GenerateResponse = resp.json().context("invalid model response")?;
        if let Some(err) = body.error {
            return Err(anyhow!("model error: {err}"));
        }
        body.response
            .ok_or_else(|| anyhow!("model response missing text"))
    }
}

impl TextModel for HttpTextModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute_device(&self) -> ComputeDevice {
        self.compute_device
    }

    // An empty prompt makes the server load the weights without generating.
    fn load(&self) -> Result<()> {
        self.generate(&GenerateRequest {
            model: &self.name,
            prompt: "",
            stream: false,
            options: None,
        })
        .map(|_| ())
    }

    fn infer(&self, prompt: &str, max_length: usize, temperature: f32) -> Result<String> {
        self.generate(&GenerateRequest {
            model: &self.name,
            prompt,
            stream: false,
            options: Some(GenerateOptions {
                num_predict: max_length,
                temperature,
                top_p: 0.9,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[test]
    fn compute_device_parses_aliases() {
        assert_eq!(ComputeDevice::parse("CPU"), Some(ComputeDevice::Cpu));
        assert_eq!(ComputeDevice::parse(" cuda "), Some(ComputeDevice::Cuda));
        assert_eq!(ComputeDevice::parse("gpu"), Some(ComputeDevice::Cuda));
        assert_eq!(ComputeDevice::parse("tpu"), None);
    }

    #[test]
    fn compute_device_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ComputeDevice::Cuda).unwrap(),
            serde_json::json!("cuda")
        );
        assert_eq!(ComputeDevice::Cpu.to_string(), "cpu");
    }

    #[test]
    fn generate_request_omits_options_for_preload() {
        let request = GenerateRequest {
            model: "phi3.5",
            prompt: "",
            stream: false,
            options: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "phi3.5");
        assert!(value.get("options").is_none());
    }

    #[test]
    fn http_model_keeps_configured_device() {
        let model = HttpTextModel::new(
            "phi3.5",
            Url::parse("http://127.0.0.1:11434/").unwrap(),
            Duration::from_secs(5),
            Some(ComputeDevice::Cuda),
        );
        assert_eq!(model.name(), "phi3.5");
        assert_eq!(model.compute_device(), ComputeDevice::Cuda);
    }

    type Seen = Arc<Mutex<Vec<Value>>>;

    /// Stand-in `/api/generate` server. The prompt picks the reply.
    async fn generate_stub(State(seen): State<Seen>, Json(body): Json<Value>) -> Response {
        seen.lock().unwrap().push(body.clone());
        let prompt = body["prompt"].as_str().unwrap_or_default();
        match prompt {
            "oom" => Json(json!({ "error": "out of memory" })).into_response(),
            "busy" => (StatusCode::SERVICE_UNAVAILABLE, "model busy").into_response(),
            "silent" => Json(json!({ "done": true })).into_response(),
            _ => Json(json!({ "response": format!("echo:{prompt}"), "done": true })).into_response(),
        }
    }

    async fn spawn_stub() -> (Url, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/api/generate", post(generate_stub))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), seen)
    }

    async fn infer_blocking(model: Arc<HttpTextModel>, prompt: &'static str) -> Result<String> {
        tokio::task::spawn_blocking(move || model.infer(prompt, 64, 0.3))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn infer_returns_text_and_sends_generation_options() {
        let (endpoint, seen) = spawn_stub().await;
        let model = Arc::new(HttpTextModel::new(
            "phi3.5",
            endpoint,
            Duration::from_secs(5),
            Some(ComputeDevice::Cpu),
        ));

        let text = infer_blocking(model, "status?").await.unwrap();
        assert_eq!(text, "echo:status?");

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent["model"], "phi3.5");
        assert_eq!(sent["stream"], false);
        assert_eq!(sent["options"]["num_predict"], 64);
        assert!((sent["options"]["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
        assert!((sent["options"]["top_p"].as_f64().unwrap() - 0.9).abs() < 1e-6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_sends_empty_prompt_without_options() {
        let (endpoint, seen) = spawn_stub().await;
        let model = Arc::new(HttpTextModel::new(
            "phi3.5",
            endpoint,
            Duration::from_secs(5),
            Some(ComputeDevice::Cpu),
        ));

        tokio::task::spawn_blocking(move || model.load())
            .await
            .unwrap()
            .unwrap();

        let requests = seen.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["prompt"], "");
        assert!(requests[0].get("options").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_failures_become_errors() {
        let (endpoint, seen) = spawn_stub().await;
        let model = Arc::new(HttpTextModel::new(
            "phi3.5",
            endpoint,
            Duration::from_secs(5),
            Some(ComputeDevice::Cpu),
        ));

        let err = infer_blocking(model.clone(), "oom").await.unwrap_err();
        assert_eq!(err.to_string(), "model error: out of memory");

        let err = infer_blocking(model.clone(), "busy").await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("model endpoint HTTP 503"), "{message}");
        assert!(message.ends_with("model busy"), "{message}");

        let err = infer_blocking(model, "silent").await.unwrap_err();
        assert_eq!(err.to_string(), "model response missing text");

        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_endpoint_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let model = Arc::new(HttpTextModel::new(
            "phi3.5",
            Url::parse(&format!("http://{addr}/")).unwrap(),
            Duration::from_secs(2),
            Some(ComputeDevice::Cpu),
        ));
        let err = infer_blocking(model, "status?").await.unwrap_err();
        assert!(err.to_string().contains("model request failed"));
    }
}

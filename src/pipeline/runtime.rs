//! Shared vision-model runtime.
//!
//! **Why this exists**: the model weights are the one process-wide shared
//! mutable resource. Every extractor variant invokes the same loaded model,
//! and the backing inference server serves one request well at a time —
//! concurrent generate calls from different sessions degrade all of them.
//! The runtime owns the backend handle, the device assignment, and an
//! exclusive-access gate serializing inference.
//!
//! Construct one `ModelRuntime` at process start and pass it by `Arc` to
//! every extractor. `get_instance()` exists for the process-wide default
//! (idempotent, loads once); tests construct runtimes directly with a mock
//! backend.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ExtractionError;

// ──────────────────────────────────────────────
// Device selection
// ──────────────────────────────────────────────

/// Compute device the model is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// GPU-class accelerator (CUDA or equivalent).
    Gpu,
    /// Any other hardware accelerator (Metal or equivalent).
    Accelerator,
    /// General-purpose compute.
    Cpu,
}

impl Device {
    /// Placement policy: prefer a GPU-class accelerator, then any available
    /// accelerator, else fall back to general-purpose compute.
    pub fn select(caps: &Capabilities) -> Device {
        if caps.gpu_available {
            Device::Gpu
        } else if caps.accelerator_available {
            Device::Accelerator
        } else {
            Device::Cpu
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Gpu => "gpu",
            Device::Accelerator => "accelerator",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hardware the backend reports as available.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub gpu_available: bool,
    pub accelerator_available: bool,
}

// ──────────────────────────────────────────────
// Decode options
// ──────────────────────────────────────────────

/// Fixed decode parameters per extractor variant.
///
/// Backends map what their API supports; beam count is advisory for
/// HTTP backends that only expose sampling controls.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub max_new_tokens: u32,
    pub num_beams: u32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub sample: bool,
}

// ──────────────────────────────────────────────
// VisionBackend trait
// ──────────────────────────────────────────────

/// Black-box vision-language capability: `generate(images, prompt) -> text`.
pub trait VisionBackend: Send + Sync {
    /// Load model weights. Idempotent from the runtime's point of view —
    /// the runtime calls this at most once per process.
    fn load(&self) -> Result<(), ExtractionError>;

    /// Hardware the backend advertises, used for device placement.
    fn capabilities(&self) -> Capabilities;

    /// Run one inference over PNG-encoded images.
    fn generate(
        &self,
        images: &[Vec<u8>],
        prompt: &str,
        options: &DecodeOptions,
    ) -> Result<String, ExtractionError>;

    /// Opportunistic memory-cache release after an inference call. Never
    /// releases the shared weights.
    fn release_cache(&self) {}
}

// ──────────────────────────────────────────────
// ModelRuntime
// ──────────────────────────────────────────────

static INSTANCE: OnceLock<Arc<ModelRuntime>> = OnceLock::new();

/// Load-once, share-everywhere model handle.
pub struct ModelRuntime {
    backend: Arc<dyn VisionBackend>,
    device: Device,
    /// Exclusive access gate — one inference at a time.
    gate: Mutex<()>,
    loaded: Mutex<bool>,
}

impl ModelRuntime {
    /// Construct a runtime over an explicit backend. Weights are not
    /// loaded until [`ensure_loaded`](Self::ensure_loaded) or the first
    /// [`generate`](Self::generate).
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        let device = Device::select(&backend.capabilities());
        info!(%device, "Model runtime created");
        Self {
            backend,
            device,
            gate: Mutex::new(()),
            loaded: Mutex::new(false),
        }
    }

    /// Process-wide default instance, built from environment configuration
    /// on first call and cached for the process lifetime.
    pub fn get_instance() -> Arc<ModelRuntime> {
        INSTANCE
            .get_or_init(|| Arc::new(ModelRuntime::new(Arc::new(OllamaVisionBackend::from_env()))))
            .clone()
    }

    /// Install a runtime as the process-wide instance. First caller wins;
    /// the installed (or previously cached) instance is returned.
    pub fn install(runtime: Arc<ModelRuntime>) -> Arc<ModelRuntime> {
        INSTANCE.get_or_init(|| runtime).clone()
    }

    /// The active compute device, for callers that need placement.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Load weights if not already loaded. Idempotent; a load failure is
    /// fatal — there is no partial or degraded mode.
    pub fn ensure_loaded(&self) -> Result<(), ExtractionError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|p| p.into_inner());
        if *loaded {
            return Ok(());
        }
        info!(device = %self.device, "Loading model weights");
        self.backend.load()?;
        *loaded = true;
        info!("Model loaded successfully");
        Ok(())
    }

    /// Run one inference call, serialized through the exclusive gate.
    ///
    /// The backend's memory cache is released after the call regardless of
    /// outcome; the shared weights stay resident.
    pub fn generate(
        &self,
        images: &[Vec<u8>],
        prompt: &str,
        options: &DecodeOptions,
    ) -> Result<String, ExtractionError> {
        self.ensure_loaded()?;

        let _gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
        let start = Instant::now();
        let result = self.backend.generate(images, prompt, options);
        self.backend.release_cache();

        match &result {
            Ok(text) => info!(
                elapsed_ms = %start.elapsed().as_millis(),
                text_len = text.len(),
                "Generation complete"
            ),
            Err(e) => warn!(
                elapsed_ms = %start.elapsed().as_millis(),
                error = %e,
                "Generation failed"
            ),
        }
        result
    }
}

// ──────────────────────────────────────────────
// OllamaVisionBackend
// ──────────────────────────────────────────────

/// Production vision backend speaking the Ollama chat API.
pub struct OllamaVisionBackend {
    base_url: String,
    model: String,
    keep_alive: String,
    capabilities: Capabilities,
    client: reqwest::blocking::Client,
}

impl OllamaVisionBackend {
    pub fn new(base_url: &str, model: &str, capabilities: Capabilities) -> Self {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        // CPU placement gets no keep_alive so the server can reclaim
        // memory between calls; accelerators hold the model warm.
        let keep_alive = if capabilities.gpu_available || capabilities.accelerator_available {
            "15m".to_string()
        } else {
            "0".to_string()
        };
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            keep_alive,
            capabilities,
            client,
        }
    }

    /// Build from `VISION_API_URL`, `VISION_MODEL`, and `VISION_ACCELERATOR`
    /// ("gpu", "accelerator", or unset for CPU).
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("VISION_API_URL").unwrap_or_else(|_| "http://localhost:11434".into());
        let model = std::env::var("VISION_MODEL").unwrap_or_else(|_| "smolvlm".into());
        let capabilities = match std::env::var("VISION_ACCELERATOR").as_deref() {
            Ok("gpu") => Capabilities {
                gpu_available: true,
                accelerator_available: true,
            },
            Ok("accelerator") => Capabilities {
                gpu_available: false,
                accelerator_available: true,
            },
            _ => Capabilities::default(),
        };
        Self::new(&base_url, &model, capabilities)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    keep_alive: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Serialize)]
struct ChatOptions {
    num_predict: u32,
    temperature: f32,
    repeat_penalty: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagsModel>,
}

#[derive(Deserialize)]
struct TagsModel {
    name: String,
}

impl VisionBackend for OllamaVisionBackend {
    fn load(&self) -> Result<(), ExtractionError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ExtractionError::ModelLoad(format!("Backend unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(ExtractionError::ModelLoad(format!(
                "Backend returned {}",
                response.status()
            )));
        }
        let tags: TagsResponse = response
            .json()
            .map_err(|e| ExtractionError::ModelLoad(format!("Bad tags response: {e}")))?;
        if !tags.models.iter().any(|m| m.name.starts_with(&self.model)) {
            return Err(ExtractionError::ModelLoad(format!(
                "Model {} not available on backend",
                self.model
            )));
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn generate(
        &self,
        images: &[Vec<u8>],
        prompt: &str,
        options: &DecodeOptions,
    ) -> Result<String, ExtractionError> {
        let encoded: Vec<String> = images
            .iter()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
            .collect();

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
                images: encoded,
            }],
            stream: false,
            keep_alive: &self.keep_alive,
            options: ChatOptions {
                num_predict: options.max_new_tokens,
                temperature: if options.sample { options.temperature } else { 0.0 },
                repeat_penalty: options.repetition_penalty,
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| ExtractionError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ExtractionError::Generation(format!(
                "Backend returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| ExtractionError::Generation(format!("Bad chat response: {e}")))?;
        if parsed.message.content.trim().is_empty() {
            return Err(ExtractionError::Generation(
                "Model generated empty output".into(),
            ));
        }
        Ok(parsed.message.content)
    }

    fn release_cache(&self) {
        // The server reclaims per keep_alive; nothing to free locally.
        debug!(keep_alive = %self.keep_alive, "Cache release deferred to backend");
    }
}

// ──────────────────────────────────────────────
// MockVisionBackend (testing)
// ──────────────────────────────────────────────

/// Mock backend with configurable response, failure modes, and call
/// counters for asserting load-once and release-after-call behavior.
pub struct MockVisionBackend {
    response: Result<String, String>,
    fail_load: bool,
    delay: std::time::Duration,
    capabilities: Capabilities,
    load_calls: std::sync::atomic::AtomicUsize,
    generate_calls: std::sync::atomic::AtomicUsize,
    release_calls: std::sync::atomic::AtomicUsize,
}

impl MockVisionBackend {
    pub fn new(response: &str) -> Self {
        Self {
            response: Ok(response.to_string()),
            fail_load: false,
            delay: std::time::Duration::ZERO,
            capabilities: Capabilities::default(),
            load_calls: Default::default(),
            generate_calls: Default::default(),
            release_calls: Default::default(),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            response: Err(error.to_string()),
            ..Self::new("")
        }
    }

    pub fn with_failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Simulate a slow model by sleeping inside `generate`.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl VisionBackend for MockVisionBackend {
    fn load(&self) -> Result<(), ExtractionError> {
        self.load_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_load {
            return Err(ExtractionError::ModelLoad("mock load failure".into()));
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn generate(
        &self,
        _images: &[Vec<u8>],
        _prompt: &str,
        _options: &DecodeOptions,
    ) -> Result<String, ExtractionError> {
        self.generate_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(e) => Err(ExtractionError::Generation(e.clone())),
        }
    }

    fn release_cache(&self) {
        self.release_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::prompts::decode_options;
    use crate::session::DocumentKind;

    #[test]
    fn device_selection_prefers_gpu() {
        assert_eq!(
            Device::select(&Capabilities {
                gpu_available: true,
                accelerator_available: true
            }),
            Device::Gpu
        );
        assert_eq!(
            Device::select(&Capabilities {
                gpu_available: false,
                accelerator_available: true
            }),
            Device::Accelerator
        );
        assert_eq!(Device::select(&Capabilities::default()), Device::Cpu);
    }

    #[test]
    fn ensure_loaded_is_idempotent() {
        let backend = Arc::new(MockVisionBackend::new("ok"));
        let runtime = ModelRuntime::new(backend.clone());
        runtime.ensure_loaded().unwrap();
        runtime.ensure_loaded().unwrap();
        assert_eq!(backend.load_calls(), 1, "weights loaded exactly once");
    }

    #[test]
    fn failed_load_is_fatal_not_partial() {
        let backend = Arc::new(MockVisionBackend::new("ok").with_failing_load());
        let runtime = ModelRuntime::new(backend);
        assert!(matches!(
            runtime.ensure_loaded(),
            Err(ExtractionError::ModelLoad(_))
        ));
    }

    #[test]
    fn generate_releases_cache_on_success_and_failure() {
        let opts = decode_options(DocumentKind::IdCard);

        let ok_backend = Arc::new(MockVisionBackend::new("Name: TAN"));
        let runtime = ModelRuntime::new(ok_backend.clone());
        runtime.generate(&[vec![1, 2, 3]], "prompt", &opts).unwrap();
        assert_eq!(ok_backend.release_calls(), 1);

        let err_backend = Arc::new(MockVisionBackend::failing("boom"));
        let runtime = ModelRuntime::new(err_backend.clone());
        assert!(runtime.generate(&[vec![1]], "prompt", &opts).is_err());
        assert_eq!(err_backend.release_calls(), 1, "released even on failure");
    }

    #[test]
    fn get_instance_returns_same_instance() {
        let runtime = Arc::new(ModelRuntime::new(Arc::new(MockVisionBackend::new("ok"))));
        let first = ModelRuntime::install(runtime);
        let second = ModelRuntime::get_instance();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn ollama_backend_keep_alive_follows_placement() {
        let cpu = OllamaVisionBackend::new("http://localhost:11434", "smolvlm", Capabilities::default());
        assert_eq!(cpu.keep_alive, "0");
        let gpu = OllamaVisionBackend::new(
            "http://localhost:11434/",
            "smolvlm",
            Capabilities {
                gpu_available: true,
                accelerator_available: true,
            },
        );
        assert_eq!(gpu.keep_alive, "15m");
        assert_eq!(gpu.base_url, "http://localhost:11434", "trailing slash trimmed");
    }
}

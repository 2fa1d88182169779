//! Shared fakes for integration tests: scripted backend, keyword embedder, recording
//! telemetry, and a small government.
#![allow(dead_code)]

use capsule_core::prompts::{ARBITER_TEMPLATE, ASSIST_TEMPLATE, SCORING_TEMPLATE};
use capsule_core::{
    BackendError, Collaborators, Embedder, Engine, EngineConfig, FixedResourceProvider, InferenceBackend,
    InvokeRequest, MetabolicCost, NodeRef, NodeSpec, Profile, ResourceSnapshot, SkillRegistry, TelemetryEvent,
    TelemetrySink,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Dispatch,
    Scoring,
    Arbiter,
    Assist,
}

fn template_head(template: &str) -> &str {
    template.split('{').next().unwrap_or(template)
}

fn classify(prompt: &str) -> CallKind {
    if prompt.starts_with(template_head(SCORING_TEMPLATE)) {
        CallKind::Scoring
    } else if prompt.starts_with(template_head(ARBITER_TEMPLATE)) {
        CallKind::Arbiter
    } else if prompt.starts_with(template_head(ASSIST_TEMPLATE)) {
        CallKind::Assist
    } else {
        CallKind::Dispatch
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub kind: CallKind,
    pub node_id: String,
    pub request: InvokeRequest,
}

/// Answers by call kind. Scores and critiques pop from a queue, then fall back to a
/// default.
pub struct ScriptedBackend {
    pub reply: Mutex<String>,
    scores: Mutex<VecDeque<String>>,
    pub default_score: Mutex<String>,
    critiques: Mutex<VecDeque<String>>,
    pub default_critique: Mutex<String>,
    pub assist_text: Mutex<String>,
    pub fail_dispatch: AtomicBool,
    pub dispatch_delay: Mutex<Option<Duration>>,
    pub down: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Recorded>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            reply: Mutex::new("4".to_string()),
            scores: Mutex::new(VecDeque::new()),
            default_score: Mutex::new("0.9".to_string()),
            critiques: Mutex::new(VecDeque::new()),
            default_critique: Mutex::new("CLEAR".to_string()),
            assist_text: Mutex::new("assist text".to_string()),
            fail_dispatch: AtomicBool::new(false),
            dispatch_delay: Mutex::new(None),
            down: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_score(&self, score: &str) {
        *self.default_score.lock().unwrap() = score.to_string();
    }

    pub fn push_scores(&self, scores: &[&str]) {
        self.scores.lock().unwrap().extend(scores.iter().map(|s| s.to_string()));
    }

    pub fn set_critique(&self, critique: &str) {
        *self.default_critique.lock().unwrap() = critique.to_string();
    }

    pub fn push_critiques(&self, critiques: &[&str]) {
        self.critiques.lock().unwrap().extend(critiques.iter().map(|s| s.to_string()));
    }

    pub fn delay_dispatch(&self, delay: Duration) {
        *self.dispatch_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<Recorded> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls_of(kind).len()
    }
}

#[async_trait::async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn invoke(&self, node: &NodeRef, request: &InvokeRequest) -> Result<String, BackendError> {
        let kind = classify(&request.prompt);
        self.calls.lock().unwrap().push(Recorded {
            kind,
            node_id: node.node_id.clone(),
            request: request.clone(),
        });
        match kind {
            CallKind::Dispatch => {
                let delay = *self.dispatch_delay.lock().unwrap();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self.fail_dispatch.load(Ordering::SeqCst) {
                    return Err(BackendError::Transport("connection reset by peer".to_string()));
                }
                Ok(self.reply.lock().unwrap().clone())
            }
            CallKind::Scoring => {
                let next = self.scores.lock().unwrap().pop_front();
                Ok(next.unwrap_or_else(|| self.default_score.lock().unwrap().clone()))
            }
            CallKind::Arbiter => {
                let next = self.critiques.lock().unwrap().pop_front();
                Ok(next.unwrap_or_else(|| self.default_critique.lock().unwrap().clone()))
            }
            CallKind::Assist => Ok(self.assist_text.lock().unwrap().clone()),
        }
    }

    async fn health(&self, node: &NodeRef) -> bool {
        !self.down.lock().unwrap().contains(&node.node_id)
    }
}

/// One dimension per keyword; version can be changed mid-test.
pub struct KeywordEmbedder {
    pub version: Mutex<String>,
}

impl KeywordEmbedder {
    const AXES: [&'static str; 5] = ["strategy", "truth", "intelligence", "simpl", "code"];

    pub fn new() -> Self {
        Self {
            version: Mutex::new("kw-1".to_string()),
        }
    }
}

#[async_trait::async_trait]
impl Embedder for KeywordEmbedder {
    fn version(&self) -> String {
        self.version.lock().unwrap().clone()
    }

    fn dimension(&self) -> usize {
        Self::AXES.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let lower = text.to_lowercase();
        Ok(Self::AXES.iter().map(|k| if lower.contains(k) { 1.0 } else { 0.0 }).collect())
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name == name).count()
    }

    pub fn find(&self, name: &str) -> Option<TelemetryEvent> {
        self.events().into_iter().find(|e| e.name == name)
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// President (low), Strategist (medium, 8000MB), Fact Checker (low),
/// Intelligence Analyst (medium), Simplifier (micro). One local node per backend.
pub fn government() -> EngineConfig {
    let profiles = vec![
        Profile::new("President", "base", MetabolicCost::Low).as_president(),
        Profile::new("Chief Strategist", "big", MetabolicCost::Medium).with_capabilities(["strategy"]),
        Profile::new("Fact Checker", "checker", MetabolicCost::Low).with_capabilities(["truth"]),
        Profile::new("Intelligence Analyst", "analyst", MetabolicCost::Medium).with_capabilities(["intelligence"]),
        Profile::new("Simplifier", "tiny", MetabolicCost::Micro).with_capabilities(["simplification"]),
    ];
    let nodes = profiles
        .iter()
        .map(|p| NodeSpec::new(format!("node-{}", p.backend_id), p.backend_id.as_str(), "http://local", 100_000))
        .collect();
    let mut config = EngineConfig {
        profiles,
        nodes,
        ..EngineConfig::default()
    };
    config.pass.resolver_roles = [
        ("Truth", "Fact Checker"),
        ("Intelligence", "Intelligence Analyst"),
        ("Simplifier", "Simplifier"),
    ]
    .into_iter()
    .map(|(r, t)| (r.to_string(), t.to_string()))
    .collect();
    config.timeouts.health_ms = 200;
    config
}

pub struct Harness {
    pub engine: Engine,
    pub backend: Arc<ScriptedBackend>,
    pub embedder: Arc<KeywordEmbedder>,
    pub telemetry: Arc<RecordingTelemetry>,
}

pub async fn harness(snapshot: ResourceSnapshot) -> Harness {
    harness_with(government(), snapshot, None).await
}

pub async fn harness_with(
    config: EngineConfig,
    snapshot: ResourceSnapshot,
    skills: Option<Arc<dyn SkillRegistry>>,
) -> Harness {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new());
    let embedder = Arc::new(KeywordEmbedder::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    let mut collaborators = Collaborators::new(
        backend.clone(),
        embedder.clone(),
        Arc::new(FixedResourceProvider(snapshot)),
    )
    .with_telemetry(telemetry.clone());
    if let Some(skills) = skills {
        collaborators = collaborators.with_skills(skills);
    }
    let engine = Engine::build(config, collaborators).await.unwrap();
    Harness {
        engine,
        backend,
        embedder,
        telemetry,
    }
}

//! Integration tests for the consume → render → evaluate → settle pipeline.
//!
//! Each test wires the real template, processor and consumer to an
//! in-memory queue and a stub LLM, and checks message dispositions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use essay_eval::error::{LlmError, ProcessingError};
use essay_eval::llm::{
    BackendHandle, FinishReason, LlmProvider, ProviderConfig, ProviderType, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse, create_backend,
};
use essay_eval::pipeline::types::{InboundMessage, MessageHandler, ProcessingOutcome};
use essay_eval::pipeline::{PromptProcessor, PromptTemplate};
use essay_eval::queue::{InMemoryQueue, QueueEvent};
use essay_eval::store::{StaticTemplateStore, TemplateStore};
use essay_eval::tools::ToolRegistry;
use essay_eval::tools::builtin::{EvaluateSkillsTool, EvaluationPolicy};
use essay_eval::worker::{Consumer, ConsumerConfig, RunSummary};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const TEMPLATE_NAME: &str = "essay.yaml";

const TEMPLATE: &str = r#"
name: essay_evaluation
template_format: handlebars
template: |
  <message role="system">SKILLS={{skills_list}}</message>
  <message role="user">{{essay}}</message>
input_variables:
  - name: skills_list
    description: Skills to evaluate
  - name: essay
    description: Essay text
execution_settings:
  default:
    temperature: 0.0
"#;

/// Stub LLM provider for integration tests (no real API calls).
///
/// Scores every skill listed in the system turn with 8. Essays named
/// `slow` stall on their first call; essays named `hang` never answer.
struct StubLlm {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls_per_essay: Mutex<HashMap<String, usize>>,
}

impl StubLlm {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls_per_essay: Mutex::new(HashMap::new()),
        })
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn text_response(content: &str) -> ToolCompletionResponse {
    ToolCompletionResponse {
        content: Some(content.to_string()),
        tool_calls: vec![],
        input_tokens: 0,
        output_tokens: 0,
        finish_reason: FinishReason::Stop,
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn provider_name(&self) -> &str {
        "stub"
    }
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        // Second round: the tool already answered.
        if request.messages.iter().any(|m| m.tool_call_id.is_some()) {
            return Ok(text_response("done"));
        }

        let essay = request.messages[1].content.clone().unwrap_or_default();
        let attempt = {
            let mut per_essay = self.calls_per_essay.lock().unwrap();
            let count = per_essay.entry(essay.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match (essay.as_str(), attempt) {
            ("slow", 1) | ("hang", _) => tokio::time::sleep(Duration::from_secs(3600)).await,
            _ => tokio::time::sleep(self.delay).await,
        }

        let skills_json = request.messages[0]
            .content
            .as_deref()
            .and_then(|c| c.strip_prefix("SKILLS="))
            .unwrap_or("[]");
        let skills: Vec<String> = serde_json::from_str(skills_json).unwrap();
        let evaluations: Vec<serde_json::Value> = skills
            .iter()
            .map(|s| serde_json::json!({"skill_name": s, "comments": "bom", "score": 8}))
            .collect();

        Ok(ToolCompletionResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "evaluate_skills".to_string(),
                arguments: serde_json::json!({ "skills": evaluations }),
            }],
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::ToolUse,
        })
    }
}

/// Wraps the processor and records every outcome with its delivery count.
struct Recording {
    inner: PromptProcessor,
    outcomes: Mutex<Vec<(String, u32, ProcessingOutcome)>>,
}

#[async_trait]
impl MessageHandler for Recording {
    async fn handle(&self, message: &InboundMessage) -> ProcessingOutcome {
        let outcome = self.inner.handle(message).await;
        self.outcomes.lock().unwrap().push((
            message.body.clone(),
            message.delivery_count,
            outcome.clone(),
        ));
        outcome
    }
}

async fn load_template() -> Arc<PromptTemplate> {
    let store = StaticTemplateStore::new().with_template(TEMPLATE_NAME, TEMPLATE);
    let bytes = store.fetch(TEMPLATE_NAME).await.unwrap();
    Arc::new(PromptTemplate::from_yaml(bytes, TEMPLATE_NAME).unwrap())
}

async fn recording_processor(backend: BackendHandle, backend_timeout: Duration) -> Arc<Recording> {
    let processor =
        PromptProcessor::new(load_template().await, Arc::new(backend), backend_timeout).unwrap();
    Arc::new(Recording {
        inner: processor,
        outcomes: Mutex::new(Vec::new()),
    })
}

fn stub_backend(llm: Arc<StubLlm>) -> BackendHandle {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EvaluateSkillsTool::new(EvaluationPolicy::default())));
    BackendHandle::new(llm, tools)
}

fn consumer_config(max_concurrency: usize) -> ConsumerConfig {
    ConsumerConfig {
        max_concurrency,
        shutdown_timeout: Duration::from_millis(200),
        max_delivery_attempts: 3,
        receive_batch_size: 10,
        receive_wait: Duration::from_millis(20),
    }
}

/// Wait until `n` messages were completed or dead-lettered.
async fn wait_settled(events: &mut broadcast::Receiver<QueueEvent>, n: usize) {
    let mut seen = 0;
    while seen < n {
        match events.recv().await.unwrap() {
            QueueEvent::Completed { .. } | QueueEvent::DeadLettered { .. } => seen += 1,
            _ => {}
        }
    }
}

/// Run a consumer until `n` messages settle, then stop it.
async fn run_until_settled(
    queue: &Arc<InMemoryQueue>,
    handler: Arc<Recording>,
    config: ConsumerConfig,
    n: usize,
) -> RunSummary {
    let mut events = queue.subscribe();
    let consumer = Consumer::new(queue.clone(), handler, config).unwrap();
    let shutdown = consumer.shutdown_handle();
    let run = tokio::spawn(consumer.start());

    timeout(TEST_TIMEOUT, wait_settled(&mut events, n))
        .await
        .expect("messages did not settle in time");
    shutdown.stop();
    timeout(TEST_TIMEOUT, run)
        .await
        .expect("consumer did not stop in time")
        .unwrap()
}

#[tokio::test]
async fn end_to_end_single_skill() {
    let llm = StubLlm::new(Duration::ZERO);
    let handler = recording_processor(stub_backend(llm.clone()), Duration::from_secs(5)).await;
    let queue = InMemoryQueue::new();
    let id = queue
        .send(r#"{"skills_list": ["coerência"], "essay": "texto"}"#)
        .await;

    let summary = run_until_settled(&queue, handler.clone(), consumer_config(2), 1).await;

    assert_eq!(queue.completed().await, vec![id]);
    assert!(queue.dead_letters().await.is_empty());
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.received, 1);
    // Tool round plus the final answer.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);

    let outcomes = handler.outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    let ProcessingOutcome::Success(result) = &outcomes[0].2 else {
        panic!("expected success, got {:?}", outcomes[0].2);
    };
    assert_eq!(result.skill_evaluations.len(), 1);
    assert_eq!(result.skill_evaluations[0].skill_name, "coerência");
    assert_eq!(result.aggregate_score, 8.0);
    assert!(result.approved);
}

#[tokio::test]
async fn missing_essay_is_dead_lettered_without_backend_call() {
    let llm = StubLlm::new(Duration::ZERO);
    let handler = recording_processor(stub_backend(llm.clone()), Duration::from_secs(5)).await;
    let queue = InMemoryQueue::new();
    queue.send(r#"{"skills_list": ["coerência"]}"#).await;

    let summary = run_until_settled(&queue, handler, consumer_config(2), 1).await;

    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "ValidationError");
    assert!(dead[0].description.contains("essay"));
    assert_eq!(dead[0].delivery_count, 1);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn timeout_on_first_attempt_is_redelivered() {
    let llm = StubLlm::new(Duration::ZERO);
    let handler = recording_processor(stub_backend(llm.clone()), Duration::from_millis(100)).await;
    let queue = InMemoryQueue::new();
    queue.send(r#"{"skills_list": ["a", "b"], "essay": "slow"}"#).await;

    let summary = run_until_settled(&queue, handler.clone(), consumer_config(2), 1).await;

    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(queue.completed().await.len(), 1);

    let outcomes = handler.outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].1, 1);
    assert!(matches!(
        outcomes[0].2,
        ProcessingOutcome::Retryable(ProcessingError::Transient(_))
    ));
    assert_eq!(outcomes[1].1, 2);
    assert!(matches!(outcomes[1].2, ProcessingOutcome::Success(_)));
}

#[tokio::test]
async fn concurrency_never_exceeds_bound() {
    let llm = StubLlm::new(Duration::from_millis(40));
    let handler = recording_processor(stub_backend(llm.clone()), Duration::from_secs(5)).await;
    let queue = InMemoryQueue::new();
    for i in 0..15 {
        queue
            .send(format!(r#"{{"skills_list": ["a"], "essay": "essay {i}"}}"#))
            .await;
    }

    let summary = run_until_settled(&queue, handler, consumer_config(4), 15).await;

    assert_eq!(summary.completed, 15);
    assert!(summary.peak_in_flight <= 4);
    assert!(llm.peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(queue.in_flight_count().await, 0);
}

#[tokio::test]
async fn shutdown_timeout_abandons_and_never_completes() {
    let llm = StubLlm::new(Duration::ZERO);
    let handler = recording_processor(stub_backend(llm.clone()), Duration::from_secs(3600)).await;
    let queue = InMemoryQueue::new();
    let mut events = queue.subscribe();
    queue.send(r#"{"skills_list": ["a"], "essay": "hang"}"#).await;

    let consumer = Consumer::new(queue.clone(), handler, consumer_config(2)).unwrap();
    let shutdown = consumer.shutdown_handle();
    let run = tokio::spawn(consumer.start());

    timeout(TEST_TIMEOUT, async {
        while llm.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("backend was never called");
    shutdown.stop();
    let summary = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap();

    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.completed, 0);
    assert!(queue.completed().await.is_empty());
    assert_eq!(queue.ready_count().await, 1);

    let mut abandoned = false;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, QueueEvent::Completed { .. }));
        abandoned |= matches!(event, QueueEvent::Abandoned { .. });
    }
    assert!(abandoned);
}

#[tokio::test]
async fn azure_backend_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .and(header("api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "evaluate_skills",
                            "arguments": "{\"skills\":[{\"skill_name\":\"coerência\",\"comments\":\"ok\",\"score\":7},{\"skill_name\":\"gramática\",\"comments\":\"ok\",\"score\":5}]}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/openai/deployments/gpt-4o/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{
                "message": {"content": "Avaliação registrada."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 40, "completion_tokens": 5}
        })))
        .mount(&server)
        .await;

    let provider = ProviderConfig {
        provider_type: ProviderType::AzureOpenAi,
        deployment_name: Some("gpt-4o".to_string()),
        endpoint: Some(server.uri()),
        api_key: Some(SecretString::from("test-key")),
        api_version: Some("2024-06-01".to_string()),
    };
    let backend = create_backend(&provider, EvaluationPolicy::default()).unwrap();
    let handler = recording_processor(backend, Duration::from_secs(5)).await;
    let queue = InMemoryQueue::new();
    queue
        .send(r#"{"skills_list": ["coerência", "gramática"], "essay": "texto"}"#)
        .await;

    let summary = run_until_settled(&queue, handler.clone(), consumer_config(1), 1).await;
    assert_eq!(summary.completed, 1);

    let outcomes = handler.outcomes.lock().unwrap();
    let ProcessingOutcome::Success(result) = &outcomes[0].2 else {
        panic!("expected success, got {:?}", outcomes[0].2);
    };
    assert_eq!(result.aggregate_score, 6.0);
    assert!(!result.approved);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

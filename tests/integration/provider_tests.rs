use assistant_orchestrator::config::{LlmProvider, ModelConfig, RouterConfig};
use assistant_orchestrator::llm::openai_generic::GenericOpenAiClient;
use assistant_orchestrator::llm::{ChatMessage, CompletionProvider, CompletionRequest, ProviderError};
use assistant_orchestrator::router::{CircuitState, GenerateOptions, ModelRouter, RouterError};
use serde_json::json;
use std::time::Duration;
use tokio_test::assert_ok;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> CompletionRequest {
    CompletionRequest {
        model: "test-model".into(),
        messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
        temperature: 0.2,
        max_tokens: 64,
    }
}

fn client(server: &MockServer, timeout: Duration) -> GenericOpenAiClient {
    GenericOpenAiClient::new(
        "generic",
        format!("{}/v1", server.uri()),
        Some("test-key".into()),
        timeout,
    )
}

#[tokio::test]
async fn test_completion_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let completion = client(&server, Duration::from_secs(5))
        .complete(&request())
        .await
        .unwrap();

    assert_eq!(completion.content, "hello there");
    let usage = completion.usage.unwrap();
    assert_eq!(usage.input_tokens, 12);
    assert_eq!(usage.output_tokens, 3);
}

#[tokio::test]
async fn test_server_error_is_availability_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_secs(5))
        .complete(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Status { status: 500, ref body } if body == "boom"));
    assert!(err.is_availability_failure());
}

#[tokio::test]
async fn test_empty_choices_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_secs(5))
        .complete(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Malformed(_)));
    assert!(!err.is_availability_failure());
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": [{"message": {"content": "late"}}]}))
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&server)
        .await;

    let err = client(&server, Duration::from_millis(100))
        .complete(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Timeout(_)));
}

#[tokio::test]
async fn test_router_opens_breaker_on_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let models = vec![ModelConfig::new("local", LlmProvider::OpenAIGeneric)
        .with_base_url(format!("{}/v1", server.uri()))];
    let config = RouterConfig {
        failure_threshold: 1,
        cooldown_ms: 60_000,
        ..RouterConfig::default()
    };
    let router = ModelRouter::new(&models, &config).unwrap();

    let first = router
        .generate_response("s", "u", &GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        first,
        RouterError::Provider {
            source: ProviderError::Status { status: 503, .. },
            ..
        }
    ));

    // the second call never reaches the server
    let second = router
        .generate_response("s", "u", &GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(second, RouterError::AllProvidersUnavailable));
    assert_eq!(router.circuit_breaker_status()[0].state, CircuitState::Open);
}

#[test]
fn test_generic_provider_requires_base_url() {
    let models = vec![ModelConfig::new("local", LlmProvider::OpenAIGeneric)];
    assert!(ModelRouter::new(&models, &RouterConfig::default()).is_err());

    let models = vec![ModelConfig::new("local", LlmProvider::OpenAIGeneric)
        .with_base_url("http://localhost:8000/v1")];
    let router = assert_ok!(ModelRouter::new(&models, &RouterConfig::default()));
    assert_eq!(router.model_names(), vec!["local"]);
}

use crate::common::*;
use assistant_orchestrator::config::RouterConfig;
use assistant_orchestrator::llm::{Completion, ProviderError, TokenUsage};
use assistant_orchestrator::router::{CallStatus, CircuitState, GenerateOptions, RouterError};
use std::sync::Arc;
use std::time::Duration;

fn tight_breaker() -> RouterConfig {
    RouterConfig {
        failure_threshold: 2,
        cooldown_ms: 1_000,
        success_threshold: 1,
        half_open_max_calls: 1,
        ..RouterConfig::default()
    }
}

#[tokio::test]
async fn test_fails_over_to_next_model() {
    let primary = Arc::new(ScriptedProvider::new("primary").fail(unavailable()));
    let backup = Arc::new(ScriptedProvider::new("backup").reply("from backup"));
    let router = router_with(
        vec![
            (model("primary"), Arc::clone(&primary)),
            (model("backup"), Arc::clone(&backup)),
        ],
        &RouterConfig::default(),
    );

    let response = router
        .generate_response("sys", "hello", &GenerateOptions::default())
        .await
        .unwrap();

    assert_eq!(response.content, "from backup");
    assert_eq!(response.model, "backup");
    assert_eq!(primary.calls(), 1);

    let records = router.call_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].status, CallStatus::Error);
    assert_eq!(records[0].error_code, Some("http_status"));
    assert_eq!(records[1].status, CallStatus::Success);

    let status = router.circuit_breaker_status();
    assert_eq!(status[0].consecutive_failures, 1);
    assert_eq!(status[0].state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_recovers_after_cooldown() {
    let solo = Arc::new(
        ScriptedProvider::new("solo")
            .fail(unavailable())
            .fail(unavailable())
            .always_reply("back"),
    );
    let router = router_with(vec![(model("solo"), Arc::clone(&solo))], &tight_breaker());
    let options = GenerateOptions::default();

    for _ in 0..2 {
        let err = router.generate_response("s", "u", &options).await.unwrap_err();
        assert!(matches!(err, RouterError::Provider { ref model, .. } if model == "solo"));
    }

    // Open: refused without touching the provider
    let err = router.generate_response("s", "u", &options).await.unwrap_err();
    assert!(matches!(err, RouterError::AllProvidersUnavailable));
    assert_eq!(solo.calls(), 2);

    let status = &router.circuit_breaker_status()[0];
    assert_eq!(status.state, CircuitState::Open);
    assert!(status.retry_in_ms.unwrap() <= 1_000);
    assert_eq!(router.metrics()[0].rejected, 1);

    tokio::time::advance(Duration::from_millis(1_001)).await;

    let response = router.generate_response("s", "u", &options).await.unwrap();
    assert_eq!(response.content, "back");
    assert_eq!(router.circuit_breaker_status()[0].state, CircuitState::Closed);
    assert_eq!(router.circuit_breaker_status()[0].consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_call_reopens() {
    let solo = Arc::new(ScriptedProvider::new("solo").otherwise(Err(unavailable())));
    let router = router_with(vec![(model("solo"), Arc::clone(&solo))], &tight_breaker());
    let options = GenerateOptions::default();

    for _ in 0..2 {
        let _ = router.generate_response("s", "u", &options).await;
    }
    tokio::time::advance(Duration::from_millis(1_001)).await;

    // the half-open trial call fails and the breaker opens again
    assert!(router.generate_response("s", "u", &options).await.is_err());
    assert_eq!(solo.calls(), 3);
    assert_eq!(router.circuit_breaker_status()[0].state, CircuitState::Open);

    assert!(matches!(
        router.generate_response("s", "u", &options).await,
        Err(RouterError::AllProvidersUnavailable)
    ));
}

#[tokio::test]
async fn test_malformed_responses_do_not_trip_breaker() {
    let sloppy = Arc::new(
        ScriptedProvider::new("sloppy").otherwise(Err(ProviderError::Malformed("no choices".into()))),
    );
    let config = RouterConfig {
        failure_threshold: 1,
        ..RouterConfig::default()
    };
    let router = router_with(vec![(model("sloppy"), Arc::clone(&sloppy))], &config);

    for _ in 0..3 {
        let err = router
            .generate_response("s", "u", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Provider {
                source: ProviderError::Malformed(_),
                ..
            }
        ));
    }

    assert_eq!(sloppy.calls(), 3);
    let status = &router.circuit_breaker_status()[0];
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(router.metrics()[0].failures, 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_provider_times_out_and_counts_as_failure() {
    let slow = Arc::new(
        ScriptedProvider::new("slow")
            .always_reply("too late")
            .with_delay(Duration::from_secs(5)),
    );
    let config = RouterConfig {
        request_timeout_ms: 100,
        ..RouterConfig::default()
    };
    let router = router_with(vec![(model("slow"), slow)], &config);

    let err = router
        .generate_response("s", "u", &GenerateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RouterError::Provider {
            source: ProviderError::Timeout(_),
            ..
        }
    ));
    assert_eq!(router.circuit_breaker_status()[0].consecutive_failures, 1);
    assert_eq!(router.call_records()[0].error_code, Some("timeout"));
}

#[tokio::test]
async fn test_cost_and_usage_accounting() {
    let priced = Arc::new(ScriptedProvider::new("priced").otherwise(Ok(Completion {
        content: "ok".into(),
        usage: Some(TokenUsage::new(1_000, 500)),
    })));
    let router = router_with(
        vec![(model("priced").with_costs(0.01, 0.02), priced)],
        &RouterConfig::default(),
    );

    let response = router
        .generate_response("s", "u", &GenerateOptions::default())
        .await
        .unwrap();
    assert!((response.cost_usd - 0.02).abs() < 1e-9);
    assert_eq!(response.usage.input_tokens, 1_000);

    router
        .generate_response("s", "u", &GenerateOptions::default())
        .await
        .unwrap();

    assert!((router.total_cost() - 0.04).abs() < 1e-9);
    let metrics = &router.metrics()[0];
    assert_eq!(metrics.requests, 2);
    assert_eq!(metrics.successes, 2);
    assert_eq!(metrics.total_tokens, 3_000);
    assert!((metrics.cost_usd - 0.04).abs() < 1e-9);
}

#[tokio::test]
async fn test_preferred_model_goes_first() {
    let first = Arc::new(ScriptedProvider::new("first").always_reply("first"));
    let second = Arc::new(ScriptedProvider::new("second").always_reply("second"));
    let router = router_with(
        vec![
            (model("first"), Arc::clone(&first)),
            (model("second"), Arc::clone(&second)),
        ],
        &RouterConfig::default(),
    );

    let options = GenerateOptions {
        preferred_model: Some("second".into()),
        ..GenerateOptions::default()
    };
    let response = router.generate_response("s", "u", &options).await.unwrap();
    assert_eq!(response.model, "second");
    assert_eq!(first.calls(), 0);

    // unknown preference falls back to configured order
    let options = GenerateOptions {
        preferred_model: Some("missing".into()),
        ..GenerateOptions::default()
    };
    let response = router.generate_response("s", "u", &options).await.unwrap();
    assert_eq!(response.model, "first");
}

#[tokio::test]
async fn test_manual_reset() {
    let flaky = Arc::new(ScriptedProvider::new("flaky").otherwise(Err(unavailable())));
    let router = router_with(vec![(model("flaky"), flaky)], &tight_breaker());

    for _ in 0..2 {
        let _ = router.generate_response("s", "u", &GenerateOptions::default()).await;
    }
    assert_eq!(router.circuit_breaker_status()[0].state, CircuitState::Open);

    assert!(router.reset_circuit_breaker("flaky"));
    assert_eq!(router.circuit_breaker_status()[0].state, CircuitState::Closed);
    assert!(!router.reset_circuit_breaker("nobody"));
}

#[tokio::test]
async fn test_no_models_configured() {
    let router = no_models();
    let err = router
        .generate_response("s", "u", &GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NoModelsConfigured));
    assert_eq!(router.total_cost(), 0.0);
}

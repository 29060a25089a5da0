use crate::common::*;
use assistant_orchestrator::config::ServiceConfig;
use assistant_orchestrator::pipeline::PipelineContext;
use assistant_orchestrator::planning::ToolStep;
use assistant_orchestrator::service::{
    ExecutionStatus, PipelineService, Priority, ServiceError, ServiceEvent, SubmitOptions,
};
use std::sync::Arc;
use std::time::Duration;

fn steps(tool: &str) -> SubmitOptions {
    SubmitOptions {
        steps: Some(vec![ToolStep::new(tool)]),
        ..SubmitOptions::default()
    }
}

fn blocker() -> SubmitOptions {
    SubmitOptions {
        steps: Some(vec![
            ToolStep::new("create_directory").with_arg("path", "/tmp/block"),
            ToolStep::new("create_directory").with_arg("path", "/tmp/block/inner"),
        ]),
        ..SubmitOptions::default()
    }
}

async fn submit(service: &PipelineService, request: &str, options: SubmitOptions) -> String {
    service
        .submit_request(request, PipelineContext::new("s"), options)
        .await
        .unwrap()
        .execution_id
}

#[tokio::test]
async fn test_high_priority_runs_first() {
    let (executive, mut gate) = RecordingExecutive::gated();
    let service = service(Arc::new(executive), 1);
    let mut events = service.subscribe();

    let blocking = submit(&service, "block", blocker()).await;
    gate.next_entered().await;
    assert_eq!(service.execution_status(&blocking), ExecutionStatus::Active);

    let low = submit(
        &service,
        "low",
        SubmitOptions {
            priority: Priority::Low,
            ..steps("get_current_time")
        },
    )
    .await;
    let high = submit(
        &service,
        "high",
        SubmitOptions {
            priority: Priority::High,
            ..steps("get_current_time")
        },
    )
    .await;
    let normal = submit(&service, "normal", steps("get_current_time")).await;

    assert_eq!(service.queue_length(), 3);
    assert_eq!(service.execution_status(&low), ExecutionStatus::Queued);

    gate.open();
    let seen = collect_until_completed(&mut events, 4).await;
    let started: Vec<String> = seen
        .into_iter()
        .filter_map(|event| match event {
            ServiceEvent::Started { id } => Some(id),
            _ => None,
        })
        .collect();

    assert_eq!(started, vec![blocking, high, normal, low.clone()]);
    assert_eq!(service.execution_status(&low), ExecutionStatus::Completed);
    assert_eq!(service.metrics().successful, 4);
}

#[tokio::test]
async fn test_concurrency_limit_respected() {
    let (executive, mut gate) = RecordingExecutive::gated();
    let executive = Arc::new(executive.delay("get_current_time", Duration::from_millis(20)));
    let service = service(Arc::clone(&executive), 2);
    let mut events = service.subscribe();

    for i in 0..4 {
        submit(&service, &format!("req-{}", i), steps("get_current_time")).await;
    }
    gate.next_entered().await;
    gate.next_entered().await;

    assert_eq!(service.active_count(), 2);
    assert_eq!(service.queue_length(), 2);
    let metrics = service.metrics();
    assert_eq!(metrics.active, 2);
    assert_eq!(metrics.queue_length, 2);

    gate.open();
    collect_until_completed(&mut events, 4).await;
    assert_eq!(service.active_count(), 0);
    assert_eq!(executive.max_in_flight(), 2);
    assert_eq!(service.metrics().tool_usage["get_current_time"], 4);
}

#[tokio::test]
async fn test_cancel_queued_request() {
    let (executive, mut gate) = RecordingExecutive::gated();
    let service = Arc::new(service(Arc::new(executive), 1));
    let mut events = service.subscribe();

    submit(&service, "block", blocker()).await;
    gate.next_entered().await;

    // a caller waiting on a queued request is woken by the cancel
    let waiting = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .submit_request("queued", PipelineContext::new("s"), steps("get_current_time").waiting())
                .await
        })
    };

    let queued_id = loop {
        match events.recv().await.unwrap() {
            ServiceEvent::Queued { id, priority } if priority == Priority::Normal => {
                if service.execution_status(&id) == ExecutionStatus::Queued {
                    break id;
                }
            }
            _ => {}
        }
    };

    assert!(service.cancel_execution(&queued_id));
    assert_eq!(
        waiting.await.unwrap().unwrap_err(),
        ServiceError::Dropped(queued_id.clone())
    );
    assert_eq!(service.execution_status(&queued_id), ExecutionStatus::NotFound);
    assert_eq!(service.queue_length(), 0);
    assert_eq!(service.metrics().cancelled, 1);
    assert!(!service.cancel_execution(&queued_id));

    gate.open();
}

#[tokio::test]
async fn test_cancel_active_request() {
    let (executive, mut gate) = RecordingExecutive::gated();
    let executive = Arc::new(executive);
    let service = service(Arc::clone(&executive), 1);
    let mut events = service.subscribe();

    let id = submit(&service, "block", blocker()).await;
    gate.next_entered().await;

    assert!(service.cancel_execution(&id));
    gate.open();

    let seen = collect_until_completed(&mut events, 1).await;
    assert!(seen.contains(&ServiceEvent::Cancelled { id: id.clone() }));
    assert!(seen.contains(&ServiceEvent::Completed {
        id: id.clone(),
        success: false
    }));

    let record = service.execution_result(&id).unwrap();
    assert!(record.cancelled);
    assert!(record.result.aborted());
    assert_eq!(record.result.steps.len(), 1);
    assert_eq!(executive.finished_tools().len(), 1);

    let metrics = service.metrics();
    assert_eq!(metrics.cancelled, 1);
    assert_eq!(metrics.failed, 0);
}

#[tokio::test]
async fn test_cancel_after_work_finished_counts_as_success() {
    let (executive, mut gate) = RecordingExecutive::gated();
    let service = service(Arc::new(executive), 1);
    let mut events = service.subscribe();

    let id = submit(&service, "one step", steps("get_current_time")).await;
    gate.next_entered().await;

    // the only step is already running, so the cancel has nothing left to stop
    assert!(service.cancel_execution(&id));
    gate.open();
    collect_until_completed(&mut events, 1).await;

    let record = service.execution_result(&id).unwrap();
    assert!(!record.cancelled);
    assert!(record.result.success);

    let metrics = service.metrics();
    assert_eq!(metrics.successful, 1);
    assert_eq!(metrics.cancelled, 0);
}

#[tokio::test]
async fn test_wait_for_completion_with_priority() {
    let service = service(Arc::new(RecordingExecutive::new()), 5);

    let response = service
        .submit_request(
            "time please",
            PipelineContext::new("s"),
            SubmitOptions {
                priority: Priority::High,
                ..steps("get_current_time").waiting()
            },
        )
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert!(result.success);
    let record = service.execution_result(&response.execution_id).unwrap();
    assert_eq!(record.priority, Priority::High);
    assert_eq!(record.request, "time please");
    assert!(!record.cancelled);
    assert!(record.completed_at >= record.created_at);
}

#[tokio::test]
async fn test_shutdown_abandons_stuck_runs() {
    let (executive, mut gate) = RecordingExecutive::gated();
    let service = Arc::new(service(Arc::new(executive), 1));

    submit(&service, "stuck", blocker()).await;
    gate.next_entered().await;

    let waiting = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .submit_request("never runs", PipelineContext::new("s"), steps("get_current_time").waiting())
                .await
        })
    };
    while service.queue_length() == 0 {
        tokio::task::yield_now().await;
    }

    let abandoned = service.shutdown(Duration::from_millis(50)).await;
    assert_eq!(abandoned, 1);
    assert_eq!(service.active_count(), 0);
    assert_eq!(service.history_len(), 0);
    assert!(matches!(waiting.await.unwrap(), Err(ServiceError::Dropped(_))));

    let err = service
        .submit_request("late", PipelineContext::new("s"), steps("get_current_time"))
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::ShuttingDown);

    gate.open();
}

#[tokio::test]
async fn test_shutdown_waits_for_active_runs() {
    let service = service(
        Arc::new(RecordingExecutive::new().delay("get_current_time", Duration::from_millis(50))),
        2,
    );
    submit(&service, "quick", steps("get_current_time")).await;

    let abandoned = service.shutdown(Duration::from_secs(5)).await;
    assert_eq!(abandoned, 0);
    assert_eq!(service.metrics().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_trims_history() {
    let scheduler = Arc::new(scheduler(
        fast_pipeline(),
        no_models(),
        Arc::new(RecordingExecutive::new()),
    ));
    let service = PipelineService::new(
        scheduler,
        ServiceConfig {
            max_history: 2,
            auto_cleanup_interval_ms: 1_000,
            ..ServiceConfig::default()
        },
    );

    let mut ids = Vec::new();
    for i in 0..4 {
        let response = service
            .submit_request(
                format!("req-{}", i),
                PipelineContext::new("s"),
                steps("get_current_time").waiting(),
            )
            .await
            .unwrap();
        ids.push(response.execution_id);
    }

    // long enough for two cleanup ticks
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(service.history_len(), 2);
    assert_eq!(service.execution_status(&ids[0]), ExecutionStatus::NotFound);
    assert_eq!(service.execution_status(&ids[1]), ExecutionStatus::NotFound);
    assert_eq!(service.execution_status(&ids[3]), ExecutionStatus::Completed);
    // metrics survive eviction
    assert_eq!(service.metrics().total, 4);
}

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;

use plait_core::error::{PlaitError, Result};
use plait_core::event::{EventKind, WorkflowEvent};
use plait_core::template::{PlanNode, SourceRef, Template};
use plait_core::traits::ProviderAdapter;
use plait_core::types::{CompletionRequest, Role, StreamChunk};
use plait_core::workflow::{ApplyTo, GenStep, OutputCapture, TransformSpec, TrimMode, Workflow};
use plait_test_utils::{
    sample_context, simple_template, single_step_workflow, step_output_template, test_profile,
    text_step, MockAdapter, ScriptedResponse, TASK,
};
use plait_workflow::{InMemoryCatalog, RunHandle, RunStatus, WorkflowRunner};

fn runner(adapter: Arc<dyn ProviderAdapter>, templates: Vec<Template>) -> WorkflowRunner {
    let mut catalog = InMemoryCatalog::new().with_profile(test_profile("default"));
    for template in templates {
        catalog.insert_template(template);
    }
    let catalog = Arc::new(catalog);
    WorkflowRunner::builder(adapter, catalog.clone(), catalog).build()
}

#[derive(Clone, Copy, PartialEq)]
enum CancelAt {
    /// As the provider is called, before any chunk is read.
    Request,
    /// As the provider hands over its final chunk.
    Done,
}

/// Trips the run's cancellation signal from inside the provider call.
struct CancellingAdapter {
    inner: MockAdapter,
    at: CancelAt,
}

impl ProviderAdapter for CancellingAdapter {
    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>> {
        let signal = request.signal.clone();
        if self.at == CancelAt::Request {
            signal.cancel();
        }
        let at = self.at;
        Box::pin(async move {
            let stream = self.inner.complete_stream(request).await?;
            Ok(stream
                .inspect(move |chunk| {
                    if at == CancelAt::Done && matches!(chunk, Ok(StreamChunk::Done(_))) {
                        signal.cancel();
                    }
                })
                .boxed())
        })
    }
}

fn three_steps() -> Workflow {
    Workflow::new("wf-three", TASK)
        .with_step(text_step("one", "tpl-turn", "a"))
        .with_step(text_step("two", "tpl-turn", "b"))
        .with_step(text_step("three", "tpl-turn", "c"))
}

fn finished_steps(events: &[WorkflowEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StepFinished { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect()
}

async fn all_events(handle: &RunHandle) -> Vec<WorkflowEvent> {
    handle.events().expect("run exists").collect().await
}

fn names(events: &[WorkflowEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(WorkflowEvent::name)
        .filter(|n| *n != "stream_delta")
        .collect()
}

#[tokio::test]
async fn test_single_step_event_sequence() {
    let adapter = Arc::new(MockAdapter::new().with_response(ScriptedResponse::text("Ana picks the lock.")));
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);

    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), sample_context())
        .expect("start");
    let output = handle.result().await.expect("run succeeds");
    let events = all_events(&handle).await;

    assert_eq!(
        names(&events),
        vec![
            "run_started",
            "step_started",
            "prompt_rendered",
            "step_prompt",
            "step_captured",
            "step_finished",
            "run_finished",
        ]
    );
    assert!(events.iter().any(|e| e.name() == "stream_delta"));
    assert_eq!(output.final_outputs["turn"], json!("Ana picks the lock."));
    assert_eq!(output.step_responses["generate"], "Ana picks the lock.");

    let request = &adapter.requests()[0];
    assert_eq!(request.model, "default-model");
    assert_eq!(request.messages.len(), 2);
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[1].content, "Generate a turn");

    let snapshot = handle.snapshot().expect("snapshot");
    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.events.len(), events.len());
}

#[tokio::test]
async fn test_step_outputs_feed_later_steps() {
    let adapter = Arc::new(MockAdapter::new().with_responses([
        ScriptedResponse::text("A rough first draft."),
        ScriptedResponse::text("A polished scene."),
    ]));
    let runner = runner(
        adapter.clone(),
        vec![
            simple_template("tpl-draft"),
            step_output_template("tpl-polish", "draft_content"),
        ],
    );
    let workflow = Workflow::new("wf-two", TASK)
        .with_step(text_step("draft", "tpl-draft", "draft_content"))
        .with_step(GenStep::new("polish", "default", "tpl-polish").with_output(OutputCapture::text("final")));

    let handle = runner.start_run(workflow, sample_context()).expect("start");
    let output = handle.result().await.expect("run succeeds");

    assert_eq!(output.final_outputs["draft_content"], json!("A rough first draft."));
    assert_eq!(output.final_outputs["final"], json!("A polished scene."));
    assert_eq!(output.step_responses.len(), 2);
    assert_eq!(
        output.step_responses.keys().collect::<Vec<_>>(),
        vec!["draft", "polish"]
    );

    let second = &adapter.requests()[1];
    assert_eq!(second.messages.last().unwrap().content, "A rough first draft.");
}

#[tokio::test]
async fn test_cancel_mid_stream() {
    let adapter = Arc::new(
        MockAdapter::new()
            .with_chunk_delay(Duration::from_millis(20))
            .with_response(ScriptedResponse::text("one two three four five six seven eight nine ten")),
    );
    let runner = runner(adapter, vec![simple_template("tpl-turn")]);
    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), sample_context())
        .expect("start");

    let mut events = handle.events().expect("events");
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let is_delta = matches!(event.kind, EventKind::StreamDelta { .. });
        seen.push(event);
        if is_delta {
            break;
        }
    }
    handle.cancel().expect("cancel");
    seen.extend(events.collect::<Vec<_>>().await);

    let err = handle.result().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.to_string(), "Workflow cancelled");

    let names = names(&seen);
    assert_eq!(names.last(), Some(&"run_cancelled"));
    assert!(!names.contains(&"step_finished"));
    assert!(!names.contains(&"run_finished"));
    assert_eq!(handle.snapshot().unwrap().status, RunStatus::Cancelled);

    // A second cancel is harmless.
    handle.cancel().expect("cancel again");
}

#[tokio::test]
async fn test_json_capture_with_and_without_path() {
    let adapter = Arc::new(MockAdapter::new().with_response(ScriptedResponse::chunks([
        r#"{"result":"success","#,
        r#""nested":{"value":42}}"#,
    ])));
    let runner = runner(adapter, vec![simple_template("tpl-json")]);
    let workflow = Workflow::new("wf-json", TASK).with_step(
        GenStep::new("extract", "default", "tpl-json")
            .with_output(OutputCapture::json("value", Some("nested.value")))
            .with_output(OutputCapture::json("whole", None)),
    );

    let handle = runner.start_run(workflow, json!({})).expect("start");
    let output = handle.result().await.expect("run succeeds");

    assert_eq!(output.final_outputs["value"], json!(42));
    assert_eq!(
        output.final_outputs["whole"],
        json!({"result": "success", "nested": {"value": 42}})
    );
}

#[tokio::test]
async fn test_input_transformed_only_on_change() {
    let adapter = Arc::new(MockAdapter::new().with_default(ScriptedResponse::text("  padded reply  ")));
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);

    let quiet = Workflow::new("wf-quiet", TASK).with_step(
        text_step("generate", "tpl-turn", "turn")
            .with_transform(TransformSpec::trim(ApplyTo::Output, TrimMode::Both))
            .with_transform(TransformSpec::regex(ApplyTo::Input, "no such text", "x", None)),
    );
    let handle = runner.start_run(quiet, json!({})).expect("start");
    let output = handle.result().await.expect("run succeeds");
    let events = all_events(&handle).await;

    assert!(!names(&events).contains(&"input_transformed"));
    assert_eq!(output.final_outputs["turn"], json!("padded reply"));

    let rewriting = Workflow::new("wf-rewrite", TASK).with_step(
        text_step("generate", "tpl-turn", "turn")
            .with_transform(TransformSpec::regex(ApplyTo::Input, "generate", "Write", Some("i"))),
    );
    let handle = runner.start_run(rewriting, json!({})).expect("start");
    handle.result().await.expect("run succeeds");
    let events = all_events(&handle).await;

    let transformed = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::InputTransformed { messages, .. } => Some(messages.clone()),
            _ => None,
        })
        .expect("input_transformed emitted");
    assert_eq!(transformed[1].content, "Write a turn");
    assert_eq!(adapter.requests()[1].messages[1].content, "Write a turn");
}

#[tokio::test]
async fn test_invalid_workflow_fails_before_run() {
    let adapter = Arc::new(MockAdapter::new());
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);

    let err = runner
        .start_run_json(json!({"id": "wf", "task": TASK, "steps": []}), json!({}))
        .unwrap_err();
    assert!(matches!(err, PlaitError::Validation(_)));

    let duplicate = Workflow::new("wf-dup", TASK)
        .with_step(text_step("same", "tpl-turn", "a"))
        .with_step(text_step("same", "tpl-turn", "b"));
    assert!(runner.start_run(duplicate, json!({})).is_err());

    let unknown_task = Workflow::new("wf-task", "poetry").with_step(text_step("s", "tpl-turn", "a"));
    assert!(matches!(
        runner.start_run(unknown_task, json!({})),
        Err(PlaitError::UnknownTask(_))
    ));

    assert!(runner.store().is_empty());
    assert_eq!(adapter.call_count(), 0);
}

#[tokio::test]
async fn test_provider_error_ends_with_run_error() {
    let adapter = Arc::new(MockAdapter::new().with_response(ScriptedResponse::request_error("503 unavailable")));
    let runner = runner(adapter, vec![simple_template("tpl-turn")]);
    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start");

    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, PlaitError::RunFailed(_)));
    assert!(err.to_string().contains("503 unavailable"));

    let events = all_events(&handle).await;
    match &events.last().expect("events").kind {
        EventKind::RunError { step_id, error } => {
            assert_eq!(step_id.as_deref(), Some("generate"));
            assert!(error.contains("generate"));
        }
        other => panic!("expected run_error, got {other:?}"),
    }
    assert!(!names(&events).contains(&"step_finished"));
    assert_eq!(handle.snapshot().unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_missing_template_fails_step() {
    let adapter = Arc::new(MockAdapter::new());
    let runner = runner(adapter.clone(), vec![]);
    let handle = runner
        .start_run(single_step_workflow("tpl-missing", "turn"), json!({}))
        .expect("start");

    let err = handle.result().await.unwrap_err();
    assert!(err.to_string().contains("tpl-missing"));
    assert_eq!(adapter.call_count(), 0);
}

#[tokio::test]
async fn test_late_subscriber_replays_everything() {
    let adapter = Arc::new(MockAdapter::new());
    let runner = runner(adapter, vec![simple_template("tpl-turn")]);
    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start");
    handle.result().await.expect("run succeeds");

    let first = all_events(&handle).await;
    let second = all_events(&handle).await;
    assert_eq!(first, second);
    assert_eq!(first.first().map(WorkflowEvent::name), Some("run_started"));
    assert!(first.last().unwrap().kind.is_terminal());
    assert!(first.iter().all(|e| &e.run_id == handle.id()));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let adapter = Arc::new(MockAdapter::new().with_default(ScriptedResponse::text("same reply")));
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);

    let a = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start a");
    let b = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start b");
    assert_ne!(a.id(), b.id());

    let (ra, rb) = tokio::join!(a.result(), b.result());
    assert_eq!(ra.unwrap(), rb.unwrap());
    assert_eq!(adapter.call_count(), 2);
    assert_eq!(runner.store().len(), 2);
}

#[tokio::test]
async fn test_event_log_written() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter: Arc<MockAdapter> = Arc::new(MockAdapter::new());
    let catalog = Arc::new(
        InMemoryCatalog::new()
            .with_profile(test_profile("default"))
            .with_template(simple_template("tpl-turn")),
    );
    let runner = WorkflowRunner::builder(adapter, catalog.clone(), catalog)
        .event_log(dir.path().to_path_buf(), 2)
        .build();

    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start");
    handle.result().await.expect("run succeeds");

    let path = dir.path().join(format!("{}.jsonl", handle.id()));
    let mut content = String::new();
    for _ in 0..100 {
        content = std::fs::read_to_string(&path).unwrap_or_default();
        if content.contains("run_finished") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines.first().is_some_and(|l| l.contains("run_started")));
    assert!(lines.last().is_some_and(|l| l.contains("run_finished")));
    assert!(!content.contains("stream_delta"));
}

#[tokio::test]
async fn test_final_content_preferred_over_stream() {
    let adapter = Arc::new(MockAdapter::new().with_responses([
        ScriptedResponse::text("streamed words").with_final("authoritative text"),
        ScriptedResponse::text("only the stream").without_final(),
    ]));
    let runner = runner(adapter, vec![simple_template("tpl-turn")]);

    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start");
    let output = handle.result().await.expect("run succeeds");
    assert_eq!(output.final_outputs["turn"], json!("authoritative text"));

    let handle = runner
        .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
        .expect("start");
    let output = handle.result().await.expect("run succeeds");
    assert_eq!(output.final_outputs["turn"], json!("only the stream"));
}

#[tokio::test]
async fn test_stream_error_aborts_remaining_steps() {
    let adapter = Arc::new(MockAdapter::new().with_responses([
        ScriptedResponse::text("first step ok"),
        ScriptedResponse::text("never fully sent").with_stream_error(1, "connection reset"),
    ]));
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);

    let handle = runner.start_run(three_steps(), json!({})).expect("start");
    let err = handle.result().await.unwrap_err();
    assert!(err.to_string().contains("connection reset"));
    assert_eq!(adapter.call_count(), 2);

    let events = all_events(&handle).await;
    assert_eq!(finished_steps(&events), vec!["one"]);
    assert!(matches!(
        &events.last().unwrap().kind,
        EventKind::RunError { step_id: Some(id), .. } if id == "two"
    ));

    let snapshot = handle.snapshot().unwrap();
    assert_eq!(snapshot.step_outputs["a"], json!("first step ok"));
    assert!(snapshot.output.is_none());
}

#[tokio::test]
async fn test_unknown_source_in_template_ends_with_run_error() {
    let adapter = Arc::new(MockAdapter::new());
    let template = Template::new("tpl-lore", TASK)
        .with_node(PlanNode::message(Role::System, "You narrate."))
        .with_node(PlanNode::message_from(Role::User, SourceRef::new("lorebook")));
    let runner = runner(adapter.clone(), vec![template]);

    let handle = runner
        .start_run(single_step_workflow("tpl-lore", "turn"), json!({}))
        .expect("start");
    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, PlaitError::RunFailed(_)));
    assert!(err.to_string().contains("lorebook"));

    let events = all_events(&handle).await;
    assert_eq!(names(&events), vec!["run_started", "step_started", "run_error"]);
    match &events.last().expect("events").kind {
        EventKind::RunError { step_id, error } => {
            assert_eq!(step_id.as_deref(), Some("generate"));
            assert!(error.contains("tpl-lore"));
        }
        other => panic!("expected run_error, got {other:?}"),
    }
    assert_eq!(adapter.call_count(), 0);
    assert_eq!(handle.snapshot().unwrap().status, RunStatus::Failed);
}

#[tokio::test]
async fn test_template_task_mismatch_ends_with_run_error() {
    let adapter = Arc::new(MockAdapter::new());
    let summary = Template::new("tpl-summary", "chapter_summarization")
        .with_node(PlanNode::message(Role::System, "Summarize the chapter."));
    let runner = runner(adapter.clone(), vec![summary]);

    let handle = runner
        .start_run(single_step_workflow("tpl-summary", "turn"), json!({}))
        .expect("start");
    let err = handle.result().await.unwrap_err();
    assert!(err.to_string().contains("chapter_summarization"));
    assert!(err.to_string().contains(TASK));

    let events = all_events(&handle).await;
    assert_eq!(names(&events), vec!["run_started", "step_started", "run_error"]);
    assert_eq!(adapter.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_between_steps_skips_the_rest() {
    let adapter = Arc::new(CancellingAdapter {
        inner: MockAdapter::new().with_default(ScriptedResponse::text("first and only")),
        at: CancelAt::Done,
    });
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);

    let handle = runner.start_run(three_steps(), json!({})).expect("start");
    let err = handle.result().await.unwrap_err();
    assert!(err.is_cancelled());

    let events = all_events(&handle).await;
    let names = names(&events);
    assert_eq!(finished_steps(&events), vec!["one"]);
    assert_eq!(names.iter().filter(|n| **n == "step_started").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "run_cancelled").count(), 1);
    assert_eq!(names.last(), Some(&"run_cancelled"));
    assert!(!names.contains(&"run_finished"));
    assert_eq!(adapter.inner.call_count(), 1);

    let snapshot = handle.snapshot().unwrap();
    assert_eq!(snapshot.status, RunStatus::Cancelled);
    assert_eq!(snapshot.step_outputs["a"], json!("first and only"));
    assert!(snapshot.output.is_none());
}

#[tokio::test]
async fn test_cancel_after_first_step_via_handle() {
    let adapter = Arc::new(
        MockAdapter::new()
            .with_chunk_delay(Duration::from_millis(20))
            .with_default(ScriptedResponse::text("slow steady words")),
    );
    let runner = runner(adapter.clone(), vec![simple_template("tpl-turn")]);
    let handle = runner.start_run(three_steps(), json!({})).expect("start");

    let mut events = handle.events().expect("events");
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let first_done = matches!(event.kind, EventKind::StepFinished { .. });
        seen.push(event);
        if first_done {
            break;
        }
    }
    handle.cancel().expect("cancel");
    seen.extend(events.collect::<Vec<_>>().await);

    assert!(handle.result().await.unwrap_err().is_cancelled());
    let names = names(&seen);
    assert_eq!(finished_steps(&seen), vec!["one"]);
    assert_eq!(names.iter().filter(|n| **n == "run_cancelled").count(), 1);
    assert_eq!(names.last(), Some(&"run_cancelled"));
    assert!(!seen.iter().any(|e| matches!(
        &e.kind,
        EventKind::StepStarted { step_id, .. } if step_id == "three"
    )));
    assert!(adapter.call_count() <= 2);
}

#[tokio::test]
async fn test_cancel_wins_over_ready_reply() {
    let adapter = Arc::new(CancellingAdapter {
        inner: MockAdapter::new().with_default(ScriptedResponse::text("already complete")),
        at: CancelAt::Request,
    });
    let runner = runner(adapter, vec![simple_template("tpl-turn")]);

    for _ in 0..20 {
        let handle = runner
            .start_run(single_step_workflow("tpl-turn", "turn"), json!({}))
            .expect("start");
        assert!(handle.result().await.unwrap_err().is_cancelled());

        let events = all_events(&handle).await;
        assert!(!events.iter().any(|e| e.name() == "stream_delta"));
        assert_eq!(names(&events).last(), Some(&"run_cancelled"));
        assert!(finished_steps(&events).is_empty());
    }
}

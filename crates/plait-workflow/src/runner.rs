use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::BoxStream;
use futures::StreamExt;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use plait_core::config::{AppConfig, EngineConfig};
use plait_core::error::{PlaitError, Result};
use plait_core::event::{EventKind, StepResult, WorkflowEvent};
use plait_core::template::Template;
use plait_core::traits::{ProfileStore, ProviderAdapter, TemplateStore};
use plait_core::types::{CompletionRequest, GenParams, ModelProfile, RequestHints, RunId, StreamChunk};
use plait_core::workflow::{ApplyTo, GenStep, TransformSpec, Workflow};
use plait_prompt::budget::BudgetManager;
use plait_prompt::compiler::{compile_template, CompiledTemplate};
use plait_prompt::executor::render;
use plait_prompt::registry::{RegistrySet, SourceRegistry, STEP_INPUTS_KEY};

use crate::capture::capture_outputs;
use crate::event_log::EventLogger;
use crate::store::{RunOutput, RunResult, RunSnapshot, RunStore};
use crate::transform::{transform_messages, transform_text};

type CacheKey = (String, u32, String);

struct RunnerShared {
    adapter: Arc<dyn ProviderAdapter>,
    templates: Arc<dyn TemplateStore>,
    profiles: Arc<dyn ProfileStore>,
    registries: RegistrySet,
    store: Arc<RunStore>,
    engine: EngineConfig,
    event_log: Option<(PathBuf, u8)>,
    compiled: Mutex<HashMap<CacheKey, Arc<CompiledTemplate>>>,
}

impl RunnerShared {
    /// Compile a template against the registry, memoized by id, version and task.
    fn compile(
        &self,
        template: &Template,
        registry: &dyn SourceRegistry,
    ) -> Result<Arc<CompiledTemplate>> {
        let key = (template.id.clone(), template.version, template.task.clone());
        if let Some(hit) = self
            .compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let allowed = registry.allowed_sources();
        let compiled = Arc::new(compile_template(template, Some(&allowed))?);
        debug!(template_id = %template.id, version = template.version, "Compiled template");
        self.compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, compiled.clone());
        Ok(compiled)
    }
}

/// Starts and drives workflow runs.
///
/// Each run is one spawned task executing its steps in order, and its event
/// log always ends with exactly one terminal event.
#[derive(Clone)]
pub struct WorkflowRunner {
    shared: Arc<RunnerShared>,
}

impl WorkflowRunner {
    pub fn builder(
        adapter: Arc<dyn ProviderAdapter>,
        templates: Arc<dyn TemplateStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> WorkflowRunnerBuilder {
        WorkflowRunnerBuilder {
            adapter,
            templates,
            profiles,
            registries: RegistrySet::with_builtins(),
            store: None,
            engine: EngineConfig::default(),
            event_log: None,
        }
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.shared.store
    }

    /// Parse and validate a workflow document, then start it.
    pub fn start_run_json(&self, workflow: Value, context: Value) -> Result<RunHandle> {
        self.start_run(Workflow::parse(workflow)?, context)
    }

    /// Validate `workflow` and start executing it in the background.
    ///
    /// Malformed input fails here, before a run or any event exists.
    pub fn start_run(&self, workflow: Workflow, context: Value) -> Result<RunHandle> {
        workflow.validate()?;
        let registry = self.shared.registries.extended(&workflow.task)?;
        let Value::Object(context) = context else {
            return Err(PlaitError::Validation(
                "run context must be a JSON object".to_string(),
            ));
        };

        let store = self.shared.store.clone();
        let ticket = store.create(&workflow.id, &workflow.task);
        info!(
            run_id = %ticket.id,
            workflow_id = %workflow.id,
            task = %workflow.task,
            steps = workflow.steps.len(),
            "Starting workflow run"
        );

        if let Some((log_dir, level)) = &self.shared.event_log {
            let events = store.events(&ticket.id)?;
            let logger = EventLogger::new(log_dir.clone(), *level);
            tokio::spawn(logger.run(ticket.id.clone(), events));
        }

        store.push(
            &ticket.id,
            EventKind::RunStarted {
                workflow_id: workflow.id.clone(),
                task: workflow.task.clone(),
            },
        )?;

        let run = Run {
            id: ticket.id.clone(),
            workflow,
            context,
            registry,
            signal: ticket.signal.clone(),
            shared: self.shared.clone(),
            step_outputs: Map::new(),
            step_responses: IndexMap::new(),
            current_step: None,
        };
        tokio::spawn(run.drive());

        Ok(RunHandle {
            id: ticket.id,
            store,
            result: ticket.result,
        })
    }
}

pub struct WorkflowRunnerBuilder {
    adapter: Arc<dyn ProviderAdapter>,
    templates: Arc<dyn TemplateStore>,
    profiles: Arc<dyn ProfileStore>,
    registries: RegistrySet,
    store: Option<Arc<RunStore>>,
    engine: EngineConfig,
    event_log: Option<(PathBuf, u8)>,
}

impl WorkflowRunnerBuilder {
    pub fn registries(mut self, registries: RegistrySet) -> Self {
        self.registries = registries;
        self
    }

    pub fn store(mut self, store: Arc<RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Log every run's events as JSONL under `log_dir`.
    pub fn event_log(mut self, log_dir: PathBuf, level: u8) -> Self {
        self.event_log = Some((log_dir, level));
        self
    }

    /// Apply engine defaults, retention and logging from config.
    /// Relative paths resolve against `base`.
    pub fn config(mut self, config: &AppConfig, base: &std::path::Path) -> Self {
        self.engine = config.engine.clone();
        self.store = Some(Arc::new(RunStore::new(config.store.clone())));
        if let (Some(path), Some(log)) = (config.log_path(base), config.log.as_ref()) {
            self.event_log = Some((path, log.level));
        }
        self
    }

    pub fn build(self) -> WorkflowRunner {
        WorkflowRunner {
            shared: Arc::new(RunnerShared {
                adapter: self.adapter,
                templates: self.templates,
                profiles: self.profiles,
                registries: self.registries,
                store: self.store.unwrap_or_default(),
                engine: self.engine,
                event_log: self.event_log,
                compiled: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Handle to a started run.
pub struct RunHandle {
    id: RunId,
    store: Arc<RunStore>,
    result: RunResult,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub fn id(&self) -> &RunId {
        &self.id
    }

    /// The run's events: full replay, then live until the run ends.
    pub fn events(&self) -> Result<BoxStream<'static, WorkflowEvent>> {
        self.store.events(&self.id)
    }

    /// Resolves with the run's outputs, or the error that ended it.
    pub async fn result(&self) -> Result<RunOutput> {
        self.result.clone().wait().await
    }

    pub fn cancel(&self) -> Result<()> {
        self.store.cancel(&self.id)
    }

    pub fn snapshot(&self) -> Result<RunSnapshot> {
        self.store.snapshot(&self.id)
    }
}

/// State owned by one executing run.
struct Run {
    id: RunId,
    workflow: Workflow,
    context: Map<String, Value>,
    registry: Arc<dyn SourceRegistry>,
    signal: CancellationToken,
    shared: Arc<RunnerShared>,
    step_outputs: Map<String, Value>,
    step_responses: IndexMap<String, String>,
    current_step: Option<String>,
}

impl Run {
    fn emit(&self, kind: EventKind) {
        if let Err(e) = self.shared.store.push(&self.id, kind) {
            warn!(run_id = %self.id, error = %e, "Failed to record event");
        }
    }

    async fn drive(mut self) {
        let outcome = self.run_steps().await;
        let store = self.shared.store.clone();

        let concluded = match outcome {
            Ok(()) if !self.signal.is_cancelled() => {
                let output = RunOutput {
                    final_outputs: self.step_outputs.clone(),
                    step_responses: std::mem::take(&mut self.step_responses),
                };
                store.finalize(&self.id, output)
            }
            Err(e) if !e.is_cancelled() && !self.signal.is_cancelled() => {
                error!(
                    run_id = %self.id,
                    step_id = ?self.current_step,
                    error = %e,
                    "Workflow run failed"
                );
                store.fail(&self.id, self.current_step.clone(), e.to_string())
            }
            _ => Ok(false),
        };

        // `false` means a cancellation reached the store first.
        let settled = match concluded {
            Ok(true) => Ok(()),
            Ok(false) => {
                info!(run_id = %self.id, step_id = ?self.current_step, "Workflow run cancelled");
                store.cancel(&self.id).and_then(|()| {
                    self.emit(EventKind::RunCancelled {});
                    store.close(&self.id)
                })
            }
            Err(e) => Err(e),
        };
        if let Err(e) = settled {
            warn!(run_id = %self.id, error = %e, "Run removed before it settled");
        }
    }

    async fn run_steps(&mut self) -> Result<()> {
        let steps = self.workflow.steps.clone();
        for step in &steps {
            if self.signal.is_cancelled() {
                return Err(PlaitError::Cancelled);
            }
            self.current_step = Some(step.id.clone());
            self.run_step(step).await?;
        }
        self.current_step = None;
        Ok(())
    }

    fn render_context(&self) -> Value {
        let mut ctx = self.context.clone();
        ctx.insert(
            STEP_INPUTS_KEY.to_string(),
            Value::Object(self.step_outputs.clone()),
        );
        Value::Object(ctx)
    }

    async fn run_step(&mut self, step: &GenStep) -> Result<()> {
        let shared = self.shared.clone();
        info!(run_id = %self.id, step_id = %step.id, "Starting step");
        self.emit(EventKind::StepStarted {
            step_id: step.id.clone(),
            name: step.name.clone(),
        });

        let template = shared.templates.load_template(&step.prompt_template_id).await?;
        let profile = shared.profiles.load_profile(&step.model_profile_id).await?;
        if template.task != self.workflow.task {
            return Err(PlaitError::template(
                &template.id,
                format!(
                    "template task '{}' does not match workflow task '{}'",
                    template.task, self.workflow.task
                ),
            ));
        }
        let compiled = shared.compile(&template, self.registry.as_ref())?;

        let max_context = step
            .max_context_tokens
            .unwrap_or(shared.engine.default_max_context_tokens);
        let mut budget = BudgetManager::new(max_context);
        let messages = render(
            &compiled,
            &self.render_context(),
            &mut budget,
            self.registry.as_ref(),
        );
        debug!(
            step_id = %step.id,
            messages = messages.len(),
            consumed = budget.consumed(),
            remaining = budget.remaining(),
            max_tokens = max_context,
            "Prompt rendered"
        );
        self.emit(EventKind::PromptRendered {
            step_id: step.id.clone(),
            messages: messages.clone(),
        });

        let input_transforms: Vec<&TransformSpec> = step.transforms_for(ApplyTo::Input).collect();
        let (messages, changed) = transform_messages(messages, input_transforms.iter().copied())?;
        if changed {
            self.emit(EventKind::InputTransformed {
                step_id: step.id.clone(),
                messages: messages.clone(),
            });
        }

        let hints = RequestHints::for_messages(&messages);
        self.emit(EventKind::StepPrompt {
            step_id: step.id.clone(),
            model_profile_id: profile.id.clone(),
            model_id: profile.model_id.clone(),
            hints: Some(hints.clone()),
        });

        let request = CompletionRequest {
            model: profile.model_id.clone(),
            messages,
            max_output_tokens: step
                .max_output_tokens
                .or(profile.max_output_tokens)
                .unwrap_or(shared.engine.default_max_output_tokens),
            stop: step.stop.clone(),
            gen_params: merge_gen_params(step.gen_params.as_ref(), &profile),
            hints: Some(hints),
            signal: self.signal.clone(),
        };
        let response = self.stream_completion(step, &profile, request).await?;

        let response = transform_text(response, step.transforms_for(ApplyTo::Output))?;
        let captured = capture_outputs(&response, &step.outputs);
        if !captured.is_empty() {
            self.emit(EventKind::StepCaptured {
                step_id: step.id.clone(),
                outputs: captured.clone(),
            });
        }

        self.step_outputs
            .extend(captured.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.step_responses.insert(step.id.clone(), response.clone());
        shared
            .store
            .record_step(&self.id, &step.id, &response, &captured)?;
        self.emit(EventKind::StepFinished {
            step_id: step.id.clone(),
            result: StepResult { response, captured },
        });
        info!(run_id = %self.id, step_id = %step.id, "Step finished");
        Ok(())
    }

    /// Stream one completion, forwarding deltas as events.
    async fn stream_completion(
        &self,
        step: &GenStep,
        profile: &ModelProfile,
        request: CompletionRequest,
    ) -> Result<String> {
        let adapter = self.shared.adapter.clone();
        let wrap = |e: PlaitError| match e {
            PlaitError::Cancelled => PlaitError::Cancelled,
            PlaitError::ProviderStream(msg) => PlaitError::ProviderStream(format!(
                "step '{}' ({}): {}",
                step.id, profile.model_id, msg
            )),
            PlaitError::Provider(msg) => PlaitError::Provider(format!(
                "step '{}' ({}): {}",
                step.id, profile.model_id, msg
            )),
            other => PlaitError::Provider(format!(
                "step '{}' ({}): {}",
                step.id, profile.model_id, other
            )),
        };

        // Cancellation is checked first so a ready chunk never outruns it.
        let mut stream = tokio::select! {
            biased;
            _ = self.signal.cancelled() => return Err(PlaitError::Cancelled),
            result = adapter.complete_stream(request) => result.map_err(wrap)?,
        };

        let mut accumulated = String::new();
        let mut final_content = None;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.signal.cancelled() => return Err(PlaitError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                None => break,
                Some(Err(e)) => return Err(wrap(e)),
                Some(Ok(StreamChunk::Delta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    accumulated.push_str(&delta);
                    self.emit(EventKind::StreamDelta {
                        step_id: step.id.clone(),
                        delta,
                    });
                }
                Some(Ok(StreamChunk::Done(response))) => {
                    debug!(step_id = %step.id, finish_reason = ?response.finish_reason, "Stream finished");
                    final_content = response.content;
                    break;
                }
            }
        }

        Ok(final_content
            .filter(|content| !content.is_empty())
            .unwrap_or(accumulated))
    }
}

/// Step parameters override the profile's field by field.
fn merge_gen_params(step: Option<&GenParams>, profile: &ModelProfile) -> Option<GenParams> {
    match (step, profile.gen_params.as_ref()) {
        (Some(step), Some(base)) => Some(step.merged_over(base)),
        (step, base) => step.or(base).cloned(),
    }
}

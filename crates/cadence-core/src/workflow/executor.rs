//! Workflow engine: drives a full run from unit list to `WorkflowResult`.
//!
//! Each `execute_workflow` call:
//! 1. Validates the unit set and builds a wave plan (sequential stages get
//!    one unit per wave; parallel task sets go through dependency analysis)
//! 2. Creates a fresh `ExecutionContext` seeded with the workflow variables
//! 3. Registers the run (cancellation token and status) in the registry
//! 4. Hands the plan to the `WaveExecutor`
//! 5. Aggregates every unit result into the final report
//!
//! The engine itself holds no per-run state besides the run registry, so
//! one instance serves any number of concurrent callers. The worker-pool
//! semaphore is the only resource shared between runs.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_types::config::EngineConfig;
use cadence_types::event::EngineEvent;
use cadence_types::workflow::{
    ExecutionMode, RunStatus, UnitDefinition, UnitResult, Workflow, WorkflowResult,
};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::ExecutionContext;
use super::dag::{analyze_dependencies, plan_sequential};
use super::definition::WorkflowError;
use super::template::{PromptRenderer, TemplateRenderer};
use super::unit_runner::UnitExecutor;
use super::wave::{WaveExecutor, WaveRun};
use crate::event::EventBus;
use crate::llm::registry::ProviderRegistry;
use crate::repository::box_store::BoxStateStore;

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Reusable, thread-safe workflow engine.
pub struct WorkflowEngine {
    config: EngineConfig,
    providers: ProviderRegistry,
    renderer: Arc<dyn PromptRenderer>,
    pool: Arc<Semaphore>,
    events: EventBus,
    waves: WaveExecutor,
    checkpoint: Option<CheckpointManager>,
    /// Runs currently executing, keyed by run id.
    active: DashMap<String, RunHandle>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, providers: ProviderRegistry) -> Self {
        let events = EventBus::new(config.event_capacity);
        let pool = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let renderer: Arc<dyn PromptRenderer> = Arc::new(TemplateRenderer);
        let waves = build_wave_executor(&config, &providers, &renderer, &pool, &events);
        Self {
            config,
            providers,
            renderer,
            pool,
            events,
            waves,
            checkpoint: None,
            active: DashMap::new(),
        }
    }

    /// Enable resumable runs backed by `store`.
    pub fn with_state_store(mut self, store: BoxStateStore) -> Self {
        self.checkpoint = Some(CheckpointManager::new(store));
        self
    }

    /// Replace the default `{{key}}` renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self.waves = build_wave_executor(
            &self.config,
            &self.providers,
            &self.renderer,
            &self.pool,
            &self.events,
        );
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn checkpoint(&self) -> Option<&CheckpointManager> {
        self.checkpoint.as_ref()
    }

    /// Ids of runs currently executing, sorted.
    pub fn active_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        runs.sort();
        runs
    }

    /// Lifecycle status of an active run; `None` once it has finished or if
    /// it never existed. Terminal statuses are reported on the
    /// `WorkflowResult` instead.
    pub fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        self.active.get(run_id).map(|handle| handle.status)
    }

    /// Cancel an active run. Every in-flight unit receives cancellation; the
    /// run finishes `Failed` with finished results preserved.
    pub fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        let handle = self
            .active
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        handle.cancel.cancel();
        tracing::info!(run_id, "workflow cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a workflow under a fresh run id. Nothing is checkpointed.
    pub async fn execute_workflow(&self, workflow: &Workflow) -> Result<WorkflowResult, EngineError> {
        let run_id = Uuid::now_v7().to_string();
        self.run(&run_id, workflow, &workflow.units, HashMap::new(), None)
            .await
    }

    /// Run (or resume) `run_id`, checkpointing the plan and every result.
    ///
    /// Successful results already saved for `run_id` are reused and their
    /// units are not executed again. If `workflow.units` is empty the saved
    /// plan is loaded instead (validators are not persisted).
    pub async fn execute_workflow_resumable(
        &self,
        run_id: &str,
        workflow: &Workflow,
    ) -> Result<WorkflowResult, EngineError> {
        let checkpoint = self
            .checkpoint
            .as_ref()
            .ok_or(EngineError::StoreUnavailable)?;

        let loaded;
        let units: &[UnitDefinition] = if workflow.units.is_empty() {
            loaded = checkpoint
                .load_plan(run_id)
                .await?
                .ok_or_else(|| CheckpointError::PlanNotFound(run_id.to_string()))?;
            &loaded
        } else {
            &workflow.units
        };

        let mut restored = checkpoint.load_completed(run_id).await?;
        restored.retain(|name, _| units.iter().any(|u| &u.name == name));

        self.run(run_id, workflow, units, restored, Some(checkpoint))
            .await
    }

    async fn run(
        &self,
        run_id: &str,
        workflow: &Workflow,
        units: &[UnitDefinition],
        restored: HashMap<String, UnitResult>,
        checkpoint: Option<&CheckpointManager>,
    ) -> Result<WorkflowResult, EngineError> {
        // Definition errors abort before anything runs.
        let plan = match workflow.mode {
            ExecutionMode::Sequential => plan_sequential(units)?,
            ExecutionMode::Parallel => analyze_dependencies(units)?,
        };

        let cancel = CancellationToken::new();
        let active = ActiveRun::register(&self.active, run_id, cancel.clone())?;

        if let Some(checkpoint) = checkpoint {
            checkpoint.checkpoint_plan(run_id, units).await;
        }

        let started_at = Utc::now();
        let mut context =
            ExecutionContext::with_variables(&workflow.variables, self.config.max_output_bytes);
        let mut results: HashMap<String, UnitResult> = HashMap::with_capacity(units.len());
        let mut restored = restored;
        for unit in units {
            if let Some(mut result) = restored.remove(&unit.name) {
                context.commit(&mut result);
                results.insert(unit.name.clone(), result);
            }
        }
        let resumed = results.len();
        active.set_status(RunStatus::Running);

        tracing::info!(
            run_id,
            workflow = %workflow.name,
            mode = ?workflow.mode,
            units = units.len(),
            waves = plan.len(),
            resumed,
            "starting workflow execution"
        );
        self.events.publish(EngineEvent::RunStarted {
            run_id: run_id.to_string(),
            workflow_name: workflow.name.clone(),
            mode: workflow.mode,
            units: units.len(),
            resumed,
        });

        self.waves
            .run_waves(
                WaveRun {
                    run_id,
                    units,
                    plan: &plan,
                    cancel: &cancel,
                    checkpoint,
                    halt_on_required_failure: workflow.mode == ExecutionMode::Sequential,
                },
                &mut context,
                &mut results,
            )
            .await;

        let cancelled = cancel.is_cancelled();
        let overall_success = !cancelled
            && units
                .iter()
                .filter(|u| u.required)
                .all(|u| results.get(&u.name).is_some_and(|r| r.success));
        let status = if overall_success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let result = WorkflowResult {
            run_id: run_id.to_string(),
            workflow_name: workflow.name.clone(),
            status,
            overall_success,
            order: units.iter().map(|u| u.name.clone()).collect(),
            waves: plan.into_waves(),
            results,
            started_at,
            completed_at: Utc::now(),
            cancelled,
        };

        let units_succeeded = result.results.values().filter(|r| r.success).count();
        let units_failed = result.results.len() - units_succeeded;
        tracing::info!(
            run_id,
            workflow = %workflow.name,
            status = ?status,
            units_succeeded,
            units_failed,
            duration_ms = result.duration_ms(),
            "workflow execution finished"
        );
        self.events.publish(EngineEvent::RunCompleted {
            run_id: run_id.to_string(),
            workflow_name: workflow.name.clone(),
            success: overall_success,
            duration_ms: result.duration_ms(),
            units_succeeded,
            units_failed,
        });

        Ok(result)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("providers", &self.providers.list_names())
            .field("active_runs", &self.active.len())
            .field("resumable", &self.checkpoint.is_some())
            .finish()
    }
}

fn build_wave_executor(
    config: &EngineConfig,
    providers: &ProviderRegistry,
    renderer: &Arc<dyn PromptRenderer>,
    pool: &Arc<Semaphore>,
    events: &EventBus,
) -> WaveExecutor {
    let units = UnitExecutor::new(providers.clone(), events.clone())
        .with_renderer(Arc::clone(renderer))
        .with_default_retry(config.retry.clone())
        .with_default_timeout(config.unit_timeout());
    WaveExecutor::new(Arc::new(units), Arc::clone(pool), events.clone())
        .with_min_parallel_wave_size(config.min_parallel_wave_size)
        .with_wave_timeout(config.wave_timeout())
}

/// Cancellation handle and lifecycle status of an active run.
struct RunHandle {
    cancel: CancellationToken,
    status: RunStatus,
}

/// Registry entry for a running run; removed on drop.
struct ActiveRun<'a> {
    runs: &'a DashMap<String, RunHandle>,
    run_id: String,
}

impl<'a> ActiveRun<'a> {
    /// Register `run_id` as `NotStarted`; fails if the id is already active.
    fn register(
        runs: &'a DashMap<String, RunHandle>,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        match runs.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::RunActive(run_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RunHandle {
                    cancel,
                    status: RunStatus::NotStarted,
                });
                Ok(Self {
                    runs,
                    run_id: run_id.to_string(),
                })
            }
        }
    }

    fn set_status(&self, status: RunStatus) {
        if let Some(mut handle) = self.runs.get_mut(&self.run_id) {
            handle.status = status;
        }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Caller-facing errors. Unit-level failures never appear here; they are in
/// the returned `WorkflowResult`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition error: empty, duplicate, invalid name, cycle.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// A resumable run was requested but no state store is configured.
    #[error("resumable execution requires a state store")]
    StoreUnavailable,

    /// The state store failed while loading a run.
    #[error("state store error: {0}")]
    Store(#[from] CheckpointError),

    /// No active run with this id.
    #[error("workflow run not found: {0}")]
    RunNotFound(String),

    /// A run with this id is already executing.
    #[error("workflow run already active: {0}")]
    RunActive(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::GenerationProvider;
    use crate::repository::memory::InMemoryStateStore;
    use cadence_types::llm::{GenerationRequest, ProviderError};
    use cadence_types::retry::RetryPolicy;
    use cadence_types::workflow::{AgentSpec, FailureKind};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    type Responder = dyn Fn(&str) -> Result<String, ProviderError> + Send + Sync;

    /// Provider driven by a closure over the rendered prompt. Records every
    /// prompt and the peak number of concurrent calls.
    #[derive(Clone)]
    struct StubProvider {
        respond: Arc<Responder>,
        delay: Arc<dyn Fn(&str) -> Duration + Send + Sync>,
        calls: Arc<AtomicU32>,
        prompts: Arc<Mutex<Vec<String>>>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn new<F>(respond: F) -> Self
        where
            F: Fn(&str) -> Result<String, ProviderError> + Send + Sync + 'static,
        {
            Self {
                respond: Arc::new(respond),
                delay: Arc::new(|_| Duration::ZERO),
                calls: Arc::new(AtomicU32::new(0)),
                prompts: Arc::new(Mutex::new(Vec::new())),
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn echo() -> Self {
            Self::new(|prompt| Ok(format!("out({prompt})")))
        }

        fn with_delay<F>(mut self, delay: F) -> Self
        where
            F: Fn(&str) -> Duration + Send + Sync + 'static,
        {
            self.delay = Arc::new(delay);
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl GenerationProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = (self.delay)(&request.prompt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.respond)(&request.prompt)
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_max_workers(4)
            .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 1))
    }

    fn engine(provider: &StubProvider) -> WorkflowEngine {
        engine_with(config(), provider)
    }

    fn engine_with(config: EngineConfig, provider: &StubProvider) -> WorkflowEngine {
        WorkflowEngine::new(
            config,
            ProviderRegistry::new().with_provider("stub", provider.clone()),
        )
    }

    fn unit(name: &str, template: &str) -> UnitDefinition {
        UnitDefinition::new(name, template, AgentSpec::new(format!("{name}-agent"), "stub"))
    }

    fn kind(result: &WorkflowResult, name: &str) -> Option<FailureKind> {
        result.get(name).and_then(|r| r.failure_kind())
    }

    // -----------------------------------------------------------------------
    // Parallel mode
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_book_scenario_renders_both_dependencies() {
        let provider = StubProvider::new(|prompt| {
            Ok(if prompt.starts_with("Title") {
                "X".to_string()
            } else if prompt.starts_with("Outline") {
                "Y".to_string()
            } else {
                "chapter text".to_string()
            })
        });
        let engine = engine(&provider);
        let wf = Workflow::parallel(
            "book",
            vec![
                unit("title", "Title please"),
                unit("outline", "Outline please"),
                unit("chapter1", "Chapter from {{outline}} titled {{title}}"),
            ],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.overall_success);
        assert_eq!(
            result.waves,
            vec![
                vec!["title".to_string(), "outline".to_string()],
                vec!["chapter1".to_string()]
            ]
        );
        let chapter_prompt = provider
            .prompts()
            .into_iter()
            .find(|p| p.starts_with("Chapter"))
            .unwrap();
        assert!(chapter_prompt.contains('X'));
        assert!(chapter_prompt.contains('Y'));
        assert_eq!(result.output("chapter1"), Some("chapter text"));
        assert_eq!(result.get("title").unwrap().agent.name, "title-agent");
    }

    #[tokio::test]
    async fn test_propagated_skip_never_invokes_provider() {
        let provider = StubProvider::new(|prompt| {
            if prompt.starts_with("fail") {
                Err(ProviderError::InvalidInput("bad".into()))
            } else {
                Ok(format!("ok:{prompt}"))
            }
        });
        let engine = engine(&provider);
        let wf = Workflow::parallel(
            "skip",
            vec![
                unit("a", "fail here"),
                unit("b", "B uses {{a}}"),
                unit("c", "C uses {{b.output}}"),
                unit("d", "independent"),
            ],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert!(!result.overall_success);
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(kind(&result, "a"), Some(FailureKind::NonRetryableProvider));
        assert_eq!(kind(&result, "b"), Some(FailureKind::PropagatedSkip));
        assert_eq!(kind(&result, "c"), Some(FailureKind::PropagatedSkip));
        assert_eq!(result.get("b").unwrap().attempts, 0);
        assert!(result.get("d").unwrap().success);
        assert!(!provider.prompts().iter().any(|p| p.starts_with('B') || p.starts_with('C')));
        assert_eq!(result.failed_units(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_any_unit_runs() {
        let provider = StubProvider::echo();
        let engine = engine(&provider);
        let wf = Workflow::parallel(
            "cyclic",
            vec![unit("a", "{{b}}"), unit("b", "{{a}}"), unit("c", "free")],
        );

        let err = engine.execute_workflow(&wf).await.unwrap_err();

        match err {
            EngineError::Workflow(WorkflowError::DependencyCycle { members }) => {
                assert_eq!(members, vec!["a", "b"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert_eq!(provider.calls(), 0);
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_rejected() {
        let provider = StubProvider::echo();
        let engine = engine(&provider);

        let err = engine
            .execute_workflow(&Workflow::parallel("empty", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::EmptyWorkflow)));

        let err = engine
            .execute_workflow(&Workflow::sequential("dup", vec![unit("a", "x"), unit("a", "y")]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Workflow(WorkflowError::DuplicateUnit(_))));
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let provider = StubProvider::echo().with_delay(|_| Duration::from_millis(5));
        let engine = Arc::new(engine(&provider));

        let workflows: Vec<Workflow> = (0..8)
            .map(|i| {
                Workflow::parallel(
                    format!("wf{i}"),
                    vec![
                        unit(&format!("w{i}_seed"), &format!("seed {i}")),
                        unit(&format!("w{i}_grow"), &format!("grow {{{{w{i}_seed}}}}")),
                    ],
                )
            })
            .collect();

        let runs = workflows.iter().map(|wf| engine.execute_workflow(wf));
        let results = futures_util::future::join_all(runs).await;

        for (i, result) in results.into_iter().enumerate() {
            let result = result.unwrap();
            assert!(result.overall_success);
            let mut names: Vec<&str> = result.results.keys().map(String::as_str).collect();
            names.sort();
            let seed = format!("w{i}_seed");
            let grow = format!("w{i}_grow");
            assert_eq!(names, vec![grow.as_str(), seed.as_str()]);
            assert_eq!(
                result.output(&grow),
                Some(format!("out(grow out(seed {i}))").as_str())
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_timeout_does_not_affect_siblings() {
        let provider = StubProvider::new(|p| Ok(p.to_string())).with_delay(|prompt| {
            if prompt == "slow" {
                Duration::from_millis(200)
            } else {
                Duration::from_millis(10)
            }
        });
        let engine = engine(&provider);
        let wf = Workflow::parallel(
            "timeouts",
            vec![unit("slow", "slow").with_timeout_ms(50), unit("fast", "fast")],
        );

        let start = tokio::time::Instant::now();
        let result = engine.execute_workflow(&wf).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(kind(&result, "slow"), Some(FailureKind::Timeout));
        assert!(result.get("fast").unwrap().success);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(60), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wave_timeout_fails_outstanding_units() {
        let provider = StubProvider::echo().with_delay(|_| Duration::from_secs(1));
        let config = config()
            .with_unit_timeout(None)
            .with_wave_timeout(Some(Duration::from_millis(100)));
        let engine = engine_with(config, &provider);
        let wf = Workflow::parallel("wave", vec![unit("a", "a"), unit("b", "b"), unit("c", "{{a}}")]);

        let result = engine.execute_workflow(&wf).await.unwrap();

        for name in ["a", "b"] {
            let failure = result.get(name).unwrap().failure.clone().unwrap();
            assert_eq!(failure.kind, FailureKind::Timeout);
            assert!(failure.message.contains("wave timed out"));
        }
        assert_eq!(kind(&result, "c"), Some(FailureKind::PropagatedSkip));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let provider = StubProvider::echo().with_delay(|_| Duration::from_millis(50));
        let engine = engine_with(config().with_max_workers(2), &provider);
        let units = (0..6).map(|i| unit(&format!("u{i}"), &format!("p{i}"))).collect();

        let result = engine
            .execute_workflow(&Workflow::parallel("pool", units))
            .await
            .unwrap();

        assert!(result.overall_success);
        assert_eq!(provider.calls(), 6);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
        assert!(provider.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_prev_output_is_positional_in_parallel_mode() {
        let provider = StubProvider::new(|prompt| Ok(prompt.to_uppercase()));
        let engine = engine(&provider);
        let wf = Workflow::parallel(
            "chain",
            vec![unit("a", "alpha"), unit("b", "beta"), unit("c", "after {{prev_output}}")],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(result.output("c"), Some("AFTER BETA"));
    }

    #[tokio::test]
    async fn test_initial_variables_seed_context() {
        let provider = StubProvider::echo();
        let engine = engine(&provider);
        let wf = Workflow::parallel("vars", vec![unit("a", "About {{topic}}")])
            .with_variable("topic", "rust");

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(result.output("a"), Some("out(About rust)"));
    }

    #[tokio::test]
    async fn test_unknown_token_is_render_failure() {
        let provider = StubProvider::echo();
        let engine = engine(&provider);
        let wf = Workflow::parallel("render", vec![unit("a", "About {{nothing}}")]);

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(kind(&result, "a"), Some(FailureKind::Render));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_optional_failure_keeps_run_successful() {
        let provider = StubProvider::new(|prompt| {
            if prompt == "flaky" {
                Err(ProviderError::Fatal("nope".into()))
            } else {
                Ok("fine".into())
            }
        });
        let engine = engine(&provider);
        let wf = Workflow::parallel(
            "optional",
            vec![unit("extra", "flaky").optional(), unit("main", "solid")],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert!(result.overall_success);
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.failed_units(), vec!["extra"]);
    }

    #[tokio::test]
    async fn test_workflow_declared_in_yaml() {
        let yaml = r#"
name: article
mode: parallel
variables:
  topic: ownership
units:
  - name: draft
    prompt_template: "Draft about {{ topic }}"
    agent: { name: writer, provider: stub }
  - name: review
    prompt_template: "Review {{draft.output}}"
    agent: { name: editor, provider: stub, system_prompt: "Be strict." }
    max_retries: 1
"#;
        let wf: Workflow = serde_yaml_ng::from_str(yaml).unwrap();
        let provider = StubProvider::echo();
        let engine = engine(&provider);

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert!(result.overall_success);
        assert_eq!(result.output("review"), Some("out(Review out(Draft about ownership))"));
        assert_eq!(result.get("review").unwrap().agent.name, "editor");
    }

    #[tokio::test]
    async fn test_events_cover_run_lifecycle() {
        let provider = StubProvider::echo();
        let engine = engine(&provider);
        let mut rx = engine.subscribe();
        let wf = Workflow::parallel("events", vec![unit("a", "x"), unit("b", "{{a}}")]);

        let result = engine.execute_workflow(&wf).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.run_id(), result.run_id);
            events.push(event);
        }
        assert!(matches!(events.first(), Some(EngineEvent::RunStarted { units: 2, .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::RunCompleted { success: true, units_succeeded: 2, .. })
        ));
        let waves = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::WaveStarted { .. }))
            .count();
        assert_eq!(waves, 2);
    }

    // -----------------------------------------------------------------------
    // Sequential mode
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_sequential_chains_prev_output() {
        let provider = StubProvider::echo();
        let engine = engine(&provider);
        let wf = Workflow::sequential(
            "seq",
            vec![unit("one", "start"), unit("two", "next {{prev_output}}")],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert!(result.overall_success);
        assert_eq!(result.waves.len(), 2);
        assert_eq!(result.output("two"), Some("out(next out(start))"));
    }

    #[tokio::test]
    async fn test_sequential_required_failure_halts() {
        let provider = StubProvider::new(|prompt| {
            if prompt == "break" {
                Err(ProviderError::AuthenticationFailed)
            } else {
                Ok("ok".into())
            }
        });
        let engine = engine(&provider);
        let wf = Workflow::sequential(
            "halt",
            vec![unit("s1", "go"), unit("s2", "break"), unit("s3", "never")],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.get("s1").unwrap().success);
        assert_eq!(kind(&result, "s2"), Some(FailureKind::NonRetryableProvider));
        assert_eq!(kind(&result, "s3"), Some(FailureKind::Halted));
        assert_eq!(result.get("s3").unwrap().attempts, 0);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_sequential_optional_failure_skips_dependents_only() {
        let provider = StubProvider::new(|prompt| {
            if prompt == "flaky" {
                Err(ProviderError::Fatal("nope".into()))
            } else {
                Ok("ok".into())
            }
        });
        let engine = engine(&provider);
        let wf = Workflow::sequential(
            "optional",
            vec![
                unit("s1", "flaky").optional(),
                unit("s2", "use {{prev_output}}").optional(),
                unit("s3", "independent"),
            ],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(kind(&result, "s2"), Some(FailureKind::PropagatedSkip));
        assert!(result.get("s3").unwrap().success);
        assert!(result.overall_success);
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_sequential_required_skip_halts() {
        let provider = StubProvider::new(|prompt| {
            if prompt == "flaky" {
                Err(ProviderError::Fatal("nope".into()))
            } else {
                Ok("ok".into())
            }
        });
        let engine = engine(&provider);
        let wf = Workflow::sequential(
            "required-skip",
            vec![
                unit("s1", "flaky").optional(),
                unit("s2", "use {{prev_output}}"),
                unit("s3", "independent"),
            ],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert_eq!(kind(&result, "s1"), Some(FailureKind::NonRetryableProvider));
        assert_eq!(kind(&result, "s2"), Some(FailureKind::PropagatedSkip));
        assert_eq!(kind(&result, "s3"), Some(FailureKind::Halted));
        assert_eq!(result.get("s3").unwrap().attempts, 0);
        assert_eq!(provider.calls(), 1);
        assert!(!result.overall_success);
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_wave_timeout_halts_remaining_stages() {
        let provider = StubProvider::echo().with_delay(|prompt| {
            if prompt == "slow" {
                Duration::from_secs(1)
            } else {
                Duration::from_millis(1)
            }
        });
        let config = config()
            .with_unit_timeout(None)
            .with_wave_timeout(Some(Duration::from_millis(100)));
        let engine = engine_with(config, &provider);
        let wf = Workflow::sequential(
            "stage-timeout",
            vec![unit("s1", "quick"), unit("s2", "slow"), unit("s3", "after")],
        );

        let result = engine.execute_workflow(&wf).await.unwrap();

        assert!(result.get("s1").unwrap().success);
        let failure = result.get("s2").unwrap().failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("wave timed out"));
        assert_eq!(kind(&result, "s3"), Some(FailureKind::Halted));
        assert_eq!(provider.calls(), 2);
        assert!(!result.cancelled);
        assert_eq!(result.status, RunStatus::Failed);
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sequential_mid_stage() {
        let provider = StubProvider::echo().with_delay(|prompt| {
            if prompt == "quick" {
                Duration::from_millis(1)
            } else {
                Duration::from_secs(5)
            }
        });
        let engine = Arc::new(engine(&provider));
        let wf = Workflow::sequential(
            "cancel-stage",
            vec![unit("s1", "quick"), unit("s2", "slow"), unit("s3", "after")],
        );

        let handle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.execute_workflow(&wf).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let active = engine.active_runs();
        assert_eq!(active.len(), 1);
        engine.cancel(&active[0]).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.get("s1").unwrap().success);
        assert_eq!(kind(&result, "s2"), Some(FailureKind::Cancelled));
        assert_eq!(kind(&result, "s3"), Some(FailureKind::Cancelled));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_small_wave_runs_inline() {
        let provider = StubProvider::echo().with_delay(|_| Duration::from_secs(5));
        let engine = Arc::new(engine_with(
            config().with_min_parallel_wave_size(10),
            &provider,
        ));
        let wf = Workflow::parallel("inline", vec![unit("a", "a"), unit("b", "b")]);

        let handle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.execute_workflow(&wf).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let active = engine.active_runs();
        engine.cancel(&active[0]).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert_eq!(kind(&result, "a"), Some(FailureKind::Cancelled));
        assert_eq!(kind(&result, "b"), Some(FailureKind::Cancelled));
        // Inline waves run one unit at a time; b never reached the provider.
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_preserves_finished_results() {
        let provider = StubProvider::echo().with_delay(|prompt| {
            if prompt == "quick" {
                Duration::from_millis(1)
            } else {
                Duration::from_secs(5)
            }
        });
        let engine = Arc::new(engine(&provider));
        let wf = Workflow::parallel(
            "cancel",
            vec![unit("a", "quick"), unit("b", "slow {{a}}"), unit("c", "slow {{a}}")],
        );

        let handle = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.execute_workflow(&wf).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let active = engine.active_runs();
        assert_eq!(active.len(), 1);
        assert_eq!(engine.run_status(&active[0]), Some(RunStatus::Running));
        engine.cancel(&active[0]).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert!(result.cancelled);
        assert_eq!(result.status, RunStatus::Failed);
        assert!(!result.overall_success);
        assert!(result.get("a").unwrap().success);
        assert_eq!(kind(&result, "b"), Some(FailureKind::Cancelled));
        assert_eq!(kind(&result, "c"), Some(FailureKind::Cancelled));
        assert!(engine.active_runs().is_empty());
        assert_eq!(engine.run_status(&active[0]), None);
    }

    #[test]
    fn test_cancel_unknown_run() {
        let engine = engine(&StubProvider::echo());
        assert!(matches!(
            engine.cancel("nope"),
            Err(EngineError::RunNotFound(id)) if id == "nope"
        ));
    }

    // -----------------------------------------------------------------------
    // Resumability
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_resume_executes_only_missing_unit() {
        let provider = StubProvider::echo();
        let engine = engine(&provider).with_state_store(BoxStateStore::new(InMemoryStateStore::new()));
        let units = vec![
            unit("a", "first"),
            unit("b", "second"),
            unit("c", "combine {{a}} {{b}}"),
        ];
        let checkpoint = engine.checkpoint().unwrap();
        checkpoint.save_plan("run-42", &units).await.unwrap();
        let saved_a = UnitResult::succeeded(&units[0], "saved-a".into(), 1, Utc::now());
        let saved_b = UnitResult::succeeded(&units[1], "saved-b".into(), 2, Utc::now());
        checkpoint.save_unit_result("run-42", &saved_a).await.unwrap();
        checkpoint.save_unit_result("run-42", &saved_b).await.unwrap();

        // Empty unit list: the plan comes from the store.
        let wf = Workflow::parallel("resume", vec![]);
        let result = engine
            .execute_workflow_resumable("run-42", &wf)
            .await
            .unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.prompts(), vec!["combine saved-a saved-b".to_string()]);
        assert_eq!(result.run_id, "run-42");
        assert_eq!(result.results.len(), 3);
        assert_eq!(result.get("a"), Some(&saved_a));
        assert_eq!(result.get("b"), Some(&saved_b));
        assert!(result.overall_success);

        let stored = checkpoint.load_completed("run-42").await.unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_reruns_failed_units() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let provider = StubProvider::new(move |prompt| {
            if prompt == "flaky" && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::Fatal("first run fails".into()))
            } else {
                Ok(format!("done:{prompt}"))
            }
        });
        let engine = engine(&provider).with_state_store(BoxStateStore::new(InMemoryStateStore::new()));
        let wf = Workflow::parallel("retry-run", vec![unit("stable", "stable"), unit("flaky", "flaky")]);

        let first = engine.execute_workflow_resumable("run-7", &wf).await.unwrap();
        assert!(!first.overall_success);

        let second = engine.execute_workflow_resumable("run-7", &wf).await.unwrap();
        assert!(second.overall_success);
        assert_eq!(second.get("stable"), first.get("stable"));
        // stable ran once, flaky twice.
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_resumable_requires_store() {
        let engine = engine(&StubProvider::echo());
        let wf = Workflow::parallel("x", vec![unit("a", "x")]);
        assert!(matches!(
            engine.execute_workflow_resumable("r", &wf).await,
            Err(EngineError::StoreUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_resume_without_saved_plan() {
        let engine = engine(&StubProvider::echo())
            .with_state_store(BoxStateStore::new(InMemoryStateStore::new()));
        let err = engine
            .execute_workflow_resumable("missing", &Workflow::parallel("x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(CheckpointError::PlanNotFound(_))));
    }
}

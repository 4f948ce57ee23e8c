//! Integration tests for calcflow-cycle: lifecycle, delta reuse and streaming.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use calcflow_core::{
    ComputationTargetSpecification, DependencyGraph, DependencyGraphBuilder, DependencyNode,
    FunctionId, FunctionParameters, ParameterizedFunction, TargetKind, UniqueId, ValueProperties,
    ValueRequirement, ValueSpecification,
};
use calcflow_cycle::{
    CachedValue, CompiledCalculationConfiguration, CompiledViewDefinition, ComputationCycleQuery,
    ComputationResultListener, ComputedValue, CycleError, DeltaCalculator,
    DependencyGraphExecutor, ExecutableGraph, ExecutionEventSink, ExecutionHandle, ExecutionLog,
    ExecutionLogModeSource, FunctionInvocation, FunctionInvoker, InMemoryMarketDataSnapshot,
    InvocationResult, LocalExecutorConfig, LocalGraphExecutor, LogLevel, NodeStateFlag,
    NoopResultListener, SingleComputationCycle, ViewComputationCache, ViewComputationResultModel,
    ViewCycleExecutionOptions, ViewCycleState, ViewDefinition, ViewProcessContext,
};
use calcflow_function::{DefaultFunctionBlacklistQuery, FunctionBlacklistRule};
use serde_json::{json, Value};

// ============================================================================
// Fixtures
// ============================================================================

const CONFIG: &str = "Default";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn aapl() -> ComputationTargetSpecification {
    ComputationTargetSpecification::of(TargetKind::security(), UniqueId::of("Ticker", "AAPL"))
}

fn spec(name: &str) -> ValueSpecification {
    ValueSpecification::new(name, aapl(), ValueProperties::new())
}

fn spot() -> ValueSpecification {
    spec("Spot")
}

fn pv() -> ValueSpecification {
    spec("PV")
}

fn scaled_pv() -> ValueSpecification {
    spec("ScaledPV")
}

fn function_node(function: &str, inputs: Vec<ValueSpecification>, output: ValueSpecification) -> DependencyNode {
    DependencyNode::new(
        ParameterizedFunction::new(FunctionId::new(function), FunctionParameters::empty()),
        aapl(),
        inputs,
        vec![output],
    )
}

/// Spot (market data) -> PV (terminal)
fn pv_graph(config: &str) -> DependencyGraph {
    let mut builder = DependencyGraphBuilder::new(config);
    builder.add_market_data(spot()).unwrap();
    builder
        .add_node(function_node("PVFunction", vec![spot()], pv()))
        .unwrap();
    builder.add_terminal_output(pv(), ValueRequirement::unconstrained("PV", aapl()));
    builder.build().unwrap()
}

/// Spot -> PV -> ScaledPV (terminal)
fn chain_graph() -> DependencyGraph {
    let mut builder = DependencyGraphBuilder::new(CONFIG);
    builder.add_market_data(spot()).unwrap();
    builder
        .add_node(function_node("PVFunction", vec![spot()], pv()))
        .unwrap();
    builder
        .add_node(function_node("ScaleFunction", vec![pv()], scaled_pv()))
        .unwrap();
    builder.add_terminal_output(scaled_pv(), ValueRequirement::unconstrained("ScaledPV", aapl()));
    builder.build().unwrap()
}

fn snapshot(spot_value: f64) -> InMemoryMarketDataSnapshot {
    InMemoryMarketDataSnapshot::new().with_value(spot(), spot_value)
}

/// Multiplies its first input by the `factor` parameter (default 2).
#[derive(Clone, Default)]
struct Multiplier {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    quiet: bool,
}

impl FunctionInvoker for Multiplier {
    fn execute(
        &self,
        invocation: &FunctionInvocation<'_>,
        log: &mut ExecutionLog,
    ) -> anyhow::Result<Vec<ComputedValue>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("pricing model diverged");
        }
        let input = invocation
            .inputs
            .iter()
            .next()
            .and_then(|(_, value)| value.as_f64())
            .ok_or_else(|| anyhow!("no numeric input"))?;
        let factor = invocation
            .parameters
            .value()
            .get("factor")
            .and_then(Value::as_f64)
            .unwrap_or(2.0);
        if !self.quiet {
            log.info(format!("priced with factor {factor}"));
        }
        Ok(invocation
            .desired_outputs
            .iter()
            .map(|output| ComputedValue::new(output.clone(), json!(input * factor)))
            .collect())
    }
}

struct Fixture {
    view: Arc<CompiledViewDefinition>,
    executor: Arc<LocalGraphExecutor>,
    invoker: Multiplier,
}

impl Fixture {
    fn new() -> Self {
        Self::with_view(
            CompiledViewDefinition::new(ViewDefinition::new("Test"))
                .with_configuration(CompiledCalculationConfiguration::new(pv_graph(CONFIG))),
        )
    }

    fn with_view(view: CompiledViewDefinition) -> Self {
        Self::with_invoker(view, Multiplier::default())
    }

    fn with_invoker(view: CompiledViewDefinition, invoker: Multiplier) -> Self {
        init_tracing();
        let executor = LocalGraphExecutor::new(LocalExecutorConfig::default())
            .with_invoker("PVFunction", invoker.clone())
            .with_invoker("ScaleFunction", invoker.clone());
        Self {
            view: Arc::new(view),
            executor: Arc::new(executor),
            invoker,
        }
    }

    fn context(&self) -> ViewProcessContext {
        ViewProcessContext::new(self.executor.clone())
    }

    fn cycle(&self, n: u32) -> SingleComputationCycle {
        self.cycle_in(n, self.context(), ViewCycleExecutionOptions::at(1_000))
    }

    fn cycle_in(
        &self,
        n: u32,
        context: ViewProcessContext,
        options: ViewCycleExecutionOptions,
    ) -> SingleComputationCycle {
        SingleComputationCycle::new(
            UniqueId::of("Cycle", n.to_string()),
            Arc::new(context),
            Arc::clone(&self.view),
            options,
            Arc::new(NoopResultListener),
        )
    }

    fn calls(&self) -> usize {
        self.invoker.calls.load(Ordering::SeqCst)
    }

    fn fail(&self, fail: bool) {
        self.invoker.fail.store(fail, Ordering::SeqCst);
    }

    fn graph(&self) -> Arc<DependencyGraph> {
        Arc::clone(self.view.configuration(CONFIG).unwrap().graph())
    }
}

fn run(
    cycle: &mut SingleComputationCycle,
    previous: Option<&SingleComputationCycle>,
    snapshot: &InMemoryMarketDataSnapshot,
) {
    assert!(cycle.pre_execute(previous, snapshot, false).unwrap());
    cycle.execute().unwrap();
    cycle.post_execute().unwrap();
}

fn terminal_value(cycle: &SingleComputationCycle, specification: &ValueSpecification) -> CachedValue {
    cycle
        .result_model()
        .value(CONFIG, specification)
        .unwrap_or_else(|| panic!("Expected result for {specification}"))
        .value
        .clone()
}

fn cache(cycle: &SingleComputationCycle) -> Arc<ViewComputationCache> {
    cycle.computation_cache(CONFIG).unwrap()
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[test]
fn test_unchanged_market_data_reuses_previous_results() {
    let fixture = Fixture::new();
    let snapshot = snapshot(100.0);
    let graph = fixture.graph();
    let node_a = graph.producer_of(&pv()).unwrap();

    let mut first = fixture.cycle(1);
    run(&mut first, None, &snapshot);
    assert_eq!(fixture.calls(), 1);
    assert_eq!(terminal_value(&first, &pv()), CachedValue::Value(json!(200.0)));

    let mut second = fixture.cycle(2);
    run(&mut second, Some(&first), &snapshot);

    assert_eq!(fixture.calls(), 1, "unchanged node must not be resubmitted");
    assert_eq!(terminal_value(&second, &pv()), terminal_value(&first, &pv()));
    assert_eq!(second.node_state(CONFIG, node_a), Some(NodeStateFlag::Executed));

    let dirty = HashSet::new();
    let delta = DeltaCalculator::new(&graph, &cache(&second), &cache(&first), &dirty).compute_delta();
    assert!(delta.unchanged.contains(&node_a));
    assert!(delta.changed.is_empty());
}

#[test]
fn test_changed_market_data_resubmits_and_reports_failure() {
    let fixture = Fixture::new();
    let graph = fixture.graph();
    let node_m = graph.producer_of(&spot()).unwrap();
    let node_a = graph.producer_of(&pv()).unwrap();

    let mut first = fixture.cycle(1);
    run(&mut first, None, &snapshot(100.0));

    fixture.fail(true);
    let mut second = fixture.cycle(2);
    run(&mut second, Some(&first), &snapshot(101.0));

    let dirty = HashSet::new();
    let delta = DeltaCalculator::new(&graph, &cache(&second), &cache(&first), &dirty).compute_delta();
    assert!(delta.changed.contains(&node_m));
    assert!(delta.changed.contains(&node_a));

    assert_eq!(fixture.calls(), 2);
    assert_eq!(second.node_state(CONFIG, node_a), Some(NodeStateFlag::Failed));
    assert_eq!(terminal_value(&second, &pv()), CachedValue::evaluation_error());

    let result = second.result_model().value(CONFIG, &pv()).unwrap();
    assert_eq!(result.invocation_result, Some(InvocationResult::FunctionThrewException));
    assert!(result.aggregated_log.as_ref().unwrap().has_level(LogLevel::Error));
}

#[test]
fn test_empty_snapshot_suppresses_cycle() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);

    let proceed = cycle
        .pre_execute(None, &InMemoryMarketDataSnapshot::new(), true)
        .unwrap();

    assert!(!proceed);
    assert_eq!(cycle.state(), ViewCycleState::Executing);
    assert!(terminal_value(&cycle, &pv()).is_suppressed());
    assert_eq!(fixture.calls(), 0);

    cycle.post_execute().unwrap();
    cycle.release().unwrap();
    assert_eq!(cycle.state(), ViewCycleState::Destroyed);
}

// ============================================================================
// Lifecycle misuse
// ============================================================================

#[test]
fn test_execute_twice_fails() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);
    cycle.pre_execute(None, &snapshot(100.0), false).unwrap();
    cycle.execute().unwrap();

    match cycle.execute() {
        Err(CycleError::AlreadyExecuted) => {}
        other => panic!("Expected AlreadyExecuted, got {other:?}"),
    }
    assert_eq!(fixture.calls(), 1);
}

#[test]
fn test_pre_execute_twice_fails() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);
    cycle.pre_execute(None, &snapshot(100.0), false).unwrap();

    match cycle.pre_execute(None, &snapshot(100.0), false) {
        Err(CycleError::InvalidState { state, .. }) => assert_eq!(state, ViewCycleState::Executing),
        other => panic!("Expected InvalidState, got {other:?}"),
    }
}

#[test]
fn test_execute_before_pre_execute_fails() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);
    assert!(matches!(
        cycle.execute(),
        Err(CycleError::InvalidState {
            state: ViewCycleState::AwaitingExecution,
            ..
        })
    ));
}

#[test]
fn test_query_requires_caches() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);
    let query = ComputationCycleQuery::new(CONFIG, [pv()]);

    assert!(matches!(
        cycle.query_results(&query),
        Err(CycleError::InvalidState { .. })
    ));

    run(&mut cycle, None, &snapshot(100.0));
    assert!(cycle.query_results(&query).is_ok());

    let unknown = ComputationCycleQuery::new("Missing", [pv()]);
    match cycle.query_computation_caches(&unknown) {
        Err(CycleError::UnknownCalculationConfiguration { name }) => assert_eq!(name, "Missing"),
        other => panic!("Expected UnknownCalculationConfiguration, got {other:?}"),
    }

    cycle.release().unwrap();
    assert!(matches!(
        cycle.query_results(&query),
        Err(CycleError::InvalidState {
            state: ViewCycleState::Destroyed,
            ..
        })
    ));
}

#[test]
fn test_release_twice_fails() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);
    run(&mut cycle, None, &snapshot(100.0));

    cycle.release().unwrap();
    assert!(matches!(cycle.release(), Err(CycleError::AlreadyReleased)));
}

#[test]
fn test_previous_cycle_must_be_executed() {
    let fixture = Fixture::new();
    let mut first = fixture.cycle(1);
    first.pre_execute(None, &snapshot(100.0), false).unwrap();

    let mut second = fixture.cycle(2);
    match second.pre_execute(Some(&first), &snapshot(100.0), false) {
        Err(CycleError::PreviousCycleNotExecuted { state }) => {
            assert_eq!(state, ViewCycleState::Executing)
        }
        other => panic!("Expected PreviousCycleNotExecuted, got {other:?}"),
    }
    assert_eq!(second.state(), ViewCycleState::AwaitingExecution);
}

// ============================================================================
// Interruption
// ============================================================================

/// Accepts graphs and never completes them.
#[derive(Default)]
struct StalledExecutor {
    sinks: Mutex<Vec<ExecutionEventSink>>,
    cancelled: Arc<AtomicBool>,
}

struct StalledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ExecutionHandle for StalledHandle {
    fn cancel(&self, _may_interrupt: bool) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    fn is_done(&self) -> bool {
        false
    }
}

impl DependencyGraphExecutor for StalledExecutor {
    fn execute(
        &self,
        _graph: ExecutableGraph,
        _cache: Arc<ViewComputationCache>,
        sink: ExecutionEventSink,
    ) -> Box<dyn ExecutionHandle> {
        self.sinks.lock().unwrap().push(sink);
        Box::new(StalledHandle {
            cancelled: Arc::clone(&self.cancelled),
        })
    }
}

#[test]
fn test_interrupt_cancels_outstanding_jobs() {
    let fixture = Fixture::new();
    let executor = Arc::new(StalledExecutor::default());
    let mut cycle = fixture.cycle_in(
        1,
        ViewProcessContext::new(executor.clone()),
        ViewCycleExecutionOptions::at(1_000),
    );
    cycle.pre_execute(None, &snapshot(100.0), false).unwrap();

    let handle = cycle.interrupt_handle();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.interrupt();
    });

    assert!(matches!(cycle.execute(), Err(CycleError::Interrupted)));
    interrupter.join().unwrap();

    assert_eq!(cycle.state(), ViewCycleState::ExecutionInterrupted);
    assert!(executor.cancelled.load(Ordering::SeqCst));
    assert!(cycle.duration().is_none());

    // Still queryable, market data present.
    let values = cycle
        .query_computation_caches(&ComputationCycleQuery::new(CONFIG, [spot(), pv()]))
        .unwrap();
    assert_eq!(values.len(), 1);
    assert!(cycle.post_execute().is_err());
    cycle.release().unwrap();
}

#[test]
fn test_interrupt_before_execute() {
    let fixture = Fixture::new();
    let executor = Arc::new(StalledExecutor::default());
    let mut cycle = fixture.cycle_in(
        1,
        ViewProcessContext::new(executor.clone()),
        ViewCycleExecutionOptions::at(1_000),
    );
    cycle.pre_execute(None, &snapshot(100.0), false).unwrap();
    cycle.interrupt_handle().interrupt();

    assert!(matches!(cycle.execute(), Err(CycleError::Interrupted)));
    assert!(executor.cancelled.load(Ordering::SeqCst));
}

// ============================================================================
// Executor failures
// ============================================================================

struct PanickingInvoker;

impl FunctionInvoker for PanickingInvoker {
    fn execute(
        &self,
        _invocation: &FunctionInvocation<'_>,
        _log: &mut ExecutionLog,
    ) -> anyhow::Result<Vec<ComputedValue>> {
        panic!("curve bootstrap blew up");
    }
}

/// Reports every graph as failed without running it.
struct RejectingExecutor;

/// Drops the event sink without completing the graph.
struct VanishingExecutor;

struct FinishedHandle;

impl ExecutionHandle for FinishedHandle {
    fn cancel(&self, _may_interrupt: bool) -> bool {
        false
    }

    fn is_done(&self) -> bool {
        true
    }
}

impl DependencyGraphExecutor for RejectingExecutor {
    fn execute(
        &self,
        graph: ExecutableGraph,
        _cache: Arc<ViewComputationCache>,
        sink: ExecutionEventSink,
    ) -> Box<dyn ExecutionHandle> {
        sink.graph_failed(graph.calculation_configuration, "compute grid unavailable");
        Box::new(FinishedHandle)
    }
}

impl DependencyGraphExecutor for VanishingExecutor {
    fn execute(
        &self,
        _graph: ExecutableGraph,
        _cache: Arc<ViewComputationCache>,
        sink: ExecutionEventSink,
    ) -> Box<dyn ExecutionHandle> {
        drop(sink);
        Box::new(FinishedHandle)
    }
}

fn run_with_executor(executor: Arc<dyn DependencyGraphExecutor>) -> (Fixture, SingleComputationCycle) {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle_in(
        1,
        ViewProcessContext::new(executor),
        ViewCycleExecutionOptions::at(1_000),
    );
    run(&mut cycle, None, &snapshot(100.0));
    (fixture, cycle)
}

fn assert_pv_failed(fixture: &Fixture, cycle: &SingleComputationCycle) {
    let node_a = fixture.graph().producer_of(&pv()).unwrap();
    assert_eq!(cycle.state(), ViewCycleState::Executed);
    assert_eq!(cycle.node_state(CONFIG, node_a), Some(NodeStateFlag::Failed));
    assert_eq!(terminal_value(cycle, &pv()), CachedValue::evaluation_error());

    let result = cycle.result_model().value(CONFIG, &pv()).unwrap();
    assert_eq!(result.invocation_result, Some(InvocationResult::FunctionThrewException));
    assert!(result.aggregated_log.as_ref().unwrap().has_level(LogLevel::Error));
}

#[test]
fn test_panicking_function_fails_only_its_node() {
    init_tracing();
    let executor = LocalGraphExecutor::new(LocalExecutorConfig::fine_grained())
        .with_invoker("PVFunction", PanickingInvoker);
    let (fixture, cycle) = run_with_executor(Arc::new(executor));

    assert_pv_failed(&fixture, &cycle);
    let result = cycle.result_model().value(CONFIG, &pv()).unwrap();
    assert_eq!(result.compute_node_id.as_deref(), Some("local"));
}

#[test]
fn test_graph_failed_marks_outstanding_nodes_failed() {
    let (fixture, cycle) = run_with_executor(Arc::new(RejectingExecutor));

    assert_pv_failed(&fixture, &cycle);
    assert!(cache(&cycle)
        .get_value(&pv())
        .is_some_and(|value| value == CachedValue::evaluation_error()));
}

#[test]
fn test_executor_dropping_sink_fails_outstanding_nodes() {
    let (fixture, cycle) = run_with_executor(Arc::new(VanishingExecutor));

    assert_pv_failed(&fixture, &cycle);
    let result = cycle.result_model().value(CONFIG, &pv()).unwrap();
    assert_eq!(result.compute_node_id.as_deref(), Some("executor"));
}

// ============================================================================
// Suppression
// ============================================================================

#[test]
fn test_blacklisted_node_is_suppressed_without_submission() {
    let fixture = Fixture::new();
    let blacklist = DefaultFunctionBlacklistQuery::new();
    blacklist.add_rule(FunctionBlacklistRule::for_function("PVFunction"));
    let context = fixture.context().with_blacklist(Arc::new(blacklist));

    let mut cycle = fixture.cycle_in(1, context, ViewCycleExecutionOptions::at(1_000));
    run(&mut cycle, None, &snapshot(100.0));

    let node_a = fixture.graph().producer_of(&pv()).unwrap();
    assert_eq!(fixture.calls(), 0);
    assert_eq!(cycle.node_state(CONFIG, node_a), Some(NodeStateFlag::Suppressed));
    assert!(terminal_value(&cycle, &pv()).is_suppressed());

    let results = cycle
        .query_results(&ComputationCycleQuery::new(CONFIG, [pv()]))
        .unwrap();
    assert_eq!(results[&pv()].invocation_result, Some(InvocationResult::Suppressed));
}

#[test]
fn test_failed_node_propagates_as_suppressed() {
    let fixture = Fixture::new();
    let node_a = fixture.graph().producer_of(&pv()).unwrap();

    fixture.fail(true);
    let mut first = fixture.cycle(1);
    run(&mut first, None, &snapshot(100.0));
    assert_eq!(first.node_state(CONFIG, node_a), Some(NodeStateFlag::Failed));

    let mut second = fixture.cycle(2);
    run(&mut second, Some(&first), &snapshot(100.0));

    assert_eq!(fixture.calls(), 1, "failed node must not be resubmitted");
    assert_eq!(second.node_state(CONFIG, node_a), Some(NodeStateFlag::Failed));
    let values = second
        .query_computation_caches(&ComputationCycleQuery::new(CONFIG, [pv()]))
        .unwrap();
    assert_eq!(values.len(), 1);
    assert!(values[0].value.is_suppressed());
}

// ============================================================================
// Market data
// ============================================================================

#[test]
fn test_market_data_shift_applies_to_inputs() {
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Shifted")).with_configuration(
            CompiledCalculationConfiguration::new(pv_graph(CONFIG)).with_market_data_shift("*1.5"),
        ),
    );
    let mut cycle = fixture.cycle(1);
    run(&mut cycle, None, &snapshot(100.0));

    assert_eq!(terminal_value(&cycle, &pv()), CachedValue::Value(json!(300.0)));
    assert_eq!(
        cycle.result_model().market_data()[&spot()].value,
        CachedValue::Value(json!(150.0))
    );
}

#[test]
fn test_invalid_shift_is_ignored() {
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Shifted")).with_configuration(
            CompiledCalculationConfiguration::new(pv_graph(CONFIG)).with_market_data_shift("%2"),
        ),
    );
    let mut cycle = fixture.cycle(1);
    run(&mut cycle, None, &snapshot(100.0));

    assert_eq!(terminal_value(&cycle, &pv()), CachedValue::Value(json!(200.0)));
}

fn market_data_messages(cycle: &SingleComputationCycle) -> Vec<String> {
    let results = cycle
        .query_results(&ComputationCycleQuery::new(CONFIG, [spot()]))
        .unwrap();
    results[&spot()]
        .aggregated_log
        .as_ref()
        .and_then(|log| log.logs())
        .unwrap_or_default()
        .iter()
        .flat_map(|entry| entry.log.events())
        .map(|event| event.message.clone())
        .collect()
}

#[test]
fn test_non_finite_shift_is_reported_apart_from_absent_data() {
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Shifted")).with_configuration(
            CompiledCalculationConfiguration::new(pv_graph(CONFIG)).with_market_data_shift("*1e308"),
        ),
    );
    let mut shifted = fixture.cycle(1);
    run(&mut shifted, None, &snapshot(100.0));

    assert_eq!(cache(&shifted).get_value(&spot()), Some(CachedValue::missing_market_data()));
    let messages = market_data_messages(&shifted);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("market data discarded by shift"));

    let mut absent = fixture.cycle(2);
    run(&mut absent, None, &InMemoryMarketDataSnapshot::new());
    let messages = market_data_messages(&absent);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("missing market data"));
}

#[test]
fn test_missing_market_data_is_explicit() {
    let fixture = Fixture::new();
    let mut cycle = fixture.cycle(1);
    run(&mut cycle, None, &InMemoryMarketDataSnapshot::new());

    let node_a = fixture.graph().producer_of(&pv()).unwrap();
    assert_eq!(fixture.calls(), 0);
    assert_eq!(cycle.node_state(CONFIG, node_a), Some(NodeStateFlag::Failed));

    let results = cycle
        .query_results(&ComputationCycleQuery::new(CONFIG, [spot(), pv()]))
        .unwrap();
    assert_eq!(results[&spot()].value, CachedValue::missing_market_data());
    assert!(results[&spot()]
        .aggregated_log
        .as_ref()
        .unwrap()
        .has_level(LogLevel::Warn));

    let pv_result = &results[&pv()];
    assert_eq!(pv_result.value, CachedValue::missing_inputs());
    assert_eq!(pv_result.missing_inputs, vec![spot()]);
    assert_eq!(pv_result.invocation_result, Some(InvocationResult::MissingInputs));
}

// ============================================================================
// Function parameters
// ============================================================================

fn selection_view() -> CompiledViewDefinition {
    CompiledViewDefinition::new(ViewDefinition::new("Scenario")).with_configuration(
        CompiledCalculationConfiguration::new(pv_graph(CONFIG)).with_selection("bump", [pv()]),
    )
}

#[test]
fn test_changed_parameters_force_recompute() {
    let fixture = Fixture::with_view(selection_view());

    let mut first = fixture.cycle(1);
    run(&mut first, None, &snapshot(100.0));
    assert_eq!(
        first.function_parameters(CONFIG, &pv()),
        Some(&FunctionParameters::empty())
    );
    assert_eq!(terminal_value(&first, &pv()), CachedValue::Value(json!(200.0)));

    let options = ViewCycleExecutionOptions::at(2_000)
        .with_function_parameters("bump", FunctionParameters::new(json!({"factor": 3.0})));
    let mut second = fixture.cycle_in(2, fixture.context(), options);
    run(&mut second, Some(&first), &snapshot(100.0));

    assert_eq!(fixture.calls(), 2);
    assert_eq!(terminal_value(&second, &pv()), CachedValue::Value(json!(300.0)));
}

#[test]
fn test_same_parameters_allow_reuse() {
    let fixture = Fixture::with_view(selection_view());
    let options = || {
        ViewCycleExecutionOptions::at(1_000)
            .with_function_parameters("bump", FunctionParameters::new(json!({"factor": 3.0})))
    };

    let mut first = fixture.cycle_in(1, fixture.context(), options());
    run(&mut first, None, &snapshot(100.0));
    let mut second = fixture.cycle_in(2, fixture.context(), options());
    run(&mut second, Some(&first), &snapshot(100.0));

    assert_eq!(fixture.calls(), 1);
    assert_eq!(terminal_value(&second, &pv()), CachedValue::Value(json!(300.0)));
}

// ============================================================================
// Execution logs
// ============================================================================

#[test]
fn test_full_log_mode_reruns_nodes_without_captured_events() {
    let invoker = Multiplier {
        quiet: true,
        ..Default::default()
    };
    let fixture = Fixture::with_invoker(
        CompiledViewDefinition::new(ViewDefinition::new("Test"))
            .with_configuration(CompiledCalculationConfiguration::new(pv_graph(CONFIG))),
        invoker,
    );

    let mut first = fixture.cycle(1);
    run(&mut first, None, &snapshot(100.0));
    let first_log = first.result_model().value(CONFIG, &pv()).unwrap().aggregated_log.clone();
    assert!(!first_log.unwrap().has_captured_events());

    let full = fixture
        .context()
        .with_log_mode_source(ExecutionLogModeSource::full());
    let mut second = fixture.cycle_in(2, full, ViewCycleExecutionOptions::at(1_000));
    run(&mut second, Some(&first), &snapshot(100.0));

    assert_eq!(fixture.calls(), 2);
    let second_log = second.result_model().value(CONFIG, &pv()).unwrap().aggregated_log.clone();
    assert!(second_log.unwrap().has_captured_events());
}

#[test]
fn test_full_log_mode_threads_input_logs() {
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Chain"))
            .with_configuration(CompiledCalculationConfiguration::new(chain_graph())),
    );
    let context = fixture
        .context()
        .with_log_mode_source(ExecutionLogModeSource::full());
    let mut cycle = fixture.cycle_in(1, context, ViewCycleExecutionOptions::at(1_000));
    run(&mut cycle, None, &snapshot(100.0));

    assert_eq!(terminal_value(&cycle, &scaled_pv()), CachedValue::Value(json!(400.0)));

    let result = cycle.result_model().value(CONFIG, &scaled_pv()).unwrap();
    let logs = result.aggregated_log.as_ref().unwrap().logs().unwrap();
    let functions: Vec<&str> = logs
        .iter()
        .map(|entry| entry.function.function_id().name())
        .collect();
    assert_eq!(functions, vec!["ScaleFunction", "PVFunction"]);
}

// ============================================================================
// Streaming and cache dumps
// ============================================================================

#[test]
fn test_fragments_stream_to_channel_listener() {
    let fixture = Fixture::new();
    let (sender, receiver) = crossbeam_channel::unbounded::<ViewComputationResultModel>();
    let mut cycle = SingleComputationCycle::new(
        UniqueId::of("Cycle", "1"),
        Arc::new(fixture.context()),
        Arc::clone(&fixture.view),
        ViewCycleExecutionOptions::at(1_000),
        Arc::new(sender),
    );
    run(&mut cycle, None, &snapshot(100.0));

    let fragments: Vec<ViewComputationResultModel> = receiver.try_iter().collect();
    assert!(fragments.len() >= 2);
    assert!(fragments[0].market_data().contains_key(&spot()));
    assert!(fragments
        .iter()
        .any(|fragment| fragment.value(CONFIG, &pv()).is_some()));
    assert!(fragments
        .iter()
        .all(|fragment| fragment.cycle_id == Some(UniqueId::of("Cycle", "1"))));
}

#[test]
fn test_closure_listener_sees_every_terminal_output() {
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Chain"))
            .with_configuration(CompiledCalculationConfiguration::new(chain_graph())),
    );
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let listener = move |fragment: ViewComputationResultModel| {
        counter.fetch_add(fragment.len(), Ordering::SeqCst);
    };
    let listener: Arc<dyn ComputationResultListener> = Arc::new(listener);
    let mut cycle = SingleComputationCycle::new(
        UniqueId::of("Cycle", "1"),
        Arc::new(fixture.context()),
        Arc::clone(&fixture.view),
        ViewCycleExecutionOptions::at(1_000),
        listener,
    );
    run(&mut cycle, None, &snapshot(100.0));

    // ScaledPV is the only terminal output.
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(cycle.result_model().len(), 1);
}

#[test]
fn test_release_dumps_caches_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Dumped").with_cache_dump_in(dir.path()))
            .with_configuration(CompiledCalculationConfiguration::new(pv_graph(CONFIG))),
    );
    let mut cycle = fixture.cycle(1);
    run(&mut cycle, None, &snapshot(100.0));
    cycle.release().unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(files.len(), 1);
    let file_name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(file_name.starts_with("computation-cache-Default-"));
    assert!(file_name.ends_with(".txt"));

    let contents: serde_json::Map<String, Value> =
        serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
    assert!(contents.contains_key(&spot().to_string()));
    assert!(contents.contains_key(&pv().to_string()));
}

#[test]
fn test_configurations_are_isolated() {
    let fixture = Fixture::with_view(
        CompiledViewDefinition::new(ViewDefinition::new("Multi"))
            .with_configuration(CompiledCalculationConfiguration::new(pv_graph("Base")))
            .with_configuration(
                CompiledCalculationConfiguration::new(pv_graph("Bumped")).with_market_data_shift("+10"),
            ),
    );
    let mut cycle = fixture.cycle(1);
    run(&mut cycle, None, &snapshot(100.0));

    assert_eq!(fixture.calls(), 2);
    let base = cycle.result_model().value("Base", &pv()).unwrap();
    let bumped = cycle.result_model().value("Bumped", &pv()).unwrap();
    assert_eq!(base.value, CachedValue::Value(json!(200.0)));
    assert_eq!(bumped.value, CachedValue::Value(json!(220.0)));
    assert_eq!(cycle.result_model().calculation_configurations().count(), 2);
    assert!(cycle.duration().is_some());
}

//! Execution logs and their aggregation along the dependency graph.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use calcflow_core::{ComputationTargetSpecification, ParameterizedFunction, ValueSpecification};
use serde::{Deserialize, Serialize};

/// Severity of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Events recorded while executing one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    events: Vec<LogEvent>,
    levels: BTreeSet<LogLevel>,
    exception: Option<String>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log holding a single event.
    pub fn single(level: LogLevel, message: impl Into<String>) -> Self {
        let mut log = Self::new();
        log.add(level, message);
        log
    }

    pub fn add(&mut self, level: LogLevel, message: impl Into<String>) {
        self.levels.insert(level);
        self.events.push(LogEvent::new(level, message));
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.add(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.add(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.add(LogLevel::Error, message);
    }

    /// Record a function failure; also raises the `Error` indicator.
    pub fn set_exception(&mut self, message: impl Into<String>) {
        self.levels.insert(LogLevel::Error);
        self.exception = Some(message.into());
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn levels(&self) -> &BTreeSet<LogLevel> {
        &self.levels
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// How much log detail to carry through aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogMode {
    /// Level indicators only.
    #[default]
    Indicators,
    /// Every event from the node and its inputs.
    Full,
}

/// Chooses the log mode per output specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionLogModeSource {
    pub default_mode: ExecutionLogMode,
    #[serde(default, with = "override_entries")]
    overrides: HashMap<ValueSpecification, ExecutionLogMode>,
}

/// Overrides as a sorted `[specification, mode]` list; specifications are
/// not valid JSON map keys.
mod override_entries {
    use std::collections::HashMap;

    use calcflow_core::ValueSpecification;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ExecutionLogMode;

    pub fn serialize<S: Serializer>(
        overrides: &HashMap<ValueSpecification, ExecutionLogMode>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut entries: Vec<_> = overrides.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        serializer.collect_seq(entries)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<ValueSpecification, ExecutionLogMode>, D::Error> {
        let entries = Vec::<(ValueSpecification, ExecutionLogMode)>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

impl ExecutionLogModeSource {
    pub fn new(default_mode: ExecutionLogMode) -> Self {
        Self {
            default_mode,
            overrides: HashMap::new(),
        }
    }

    /// Full logging everywhere.
    pub fn full() -> Self {
        Self::new(ExecutionLogMode::Full)
    }

    pub fn with_override(mut self, specification: ValueSpecification, mode: ExecutionLogMode) -> Self {
        self.overrides.insert(specification, mode);
        self
    }

    pub fn mode(&self, specification: &ValueSpecification) -> ExecutionLogMode {
        self.overrides
            .get(specification)
            .copied()
            .unwrap_or(self.default_mode)
    }

    /// `Full` if any of the node's outputs asks for it.
    pub fn mode_for<'a>(
        &self,
        outputs: impl IntoIterator<Item = &'a ValueSpecification>,
    ) -> ExecutionLogMode {
        if outputs
            .into_iter()
            .any(|output| self.mode(output) == ExecutionLogMode::Full)
        {
            ExecutionLogMode::Full
        } else {
            ExecutionLogMode::Indicators
        }
    }
}

/// A log with the function and target that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogWithContext {
    pub function: ParameterizedFunction,
    pub target: ComputationTargetSpecification,
    pub log: ExecutionLog,
}

impl ExecutionLogWithContext {
    pub fn new(
        function: ParameterizedFunction,
        target: ComputationTargetSpecification,
        log: ExecutionLog,
    ) -> Self {
        Self {
            function,
            target,
            log,
        }
    }
}

/// A node's log combined with the logs of everything it consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedExecutionLog {
    mode: ExecutionLogMode,
    levels: BTreeSet<LogLevel>,
    /// `None` when events were not captured.
    logs: Option<Vec<ExecutionLogWithContext>>,
}

impl AggregatedExecutionLog {
    /// An aggregate with no levels and no captured events.
    pub fn empty(mode: ExecutionLogMode) -> Self {
        Self {
            mode,
            levels: BTreeSet::new(),
            logs: None,
        }
    }

    /// Combine `node` with the aggregated logs of its inputs.
    ///
    /// `Full` keeps the node's log, synthetic entries for missing inputs and
    /// outputs, then every input's captured logs. `Indicators` unions the level
    /// sets and keeps the node's own events only when it raises a level none of
    /// its inputs carry.
    pub fn aggregate(
        mode: ExecutionLogMode,
        node: ExecutionLogWithContext,
        inputs: &[&AggregatedExecutionLog],
        missing_inputs: &[ValueSpecification],
        missing_outputs: &[ValueSpecification],
    ) -> Self {
        let input_levels: BTreeSet<LogLevel> = inputs
            .iter()
            .flat_map(|input| input.levels.iter().copied())
            .collect();

        match mode {
            ExecutionLogMode::Full => {
                let mut node = node;
                for missing in missing_inputs {
                    node.log.warn(format!("missing input {missing}"));
                }
                for missing in missing_outputs {
                    node.log.info(format!("missing output {missing}"));
                }
                let mut levels = input_levels;
                levels.extend(node.log.levels().iter().copied());

                let mut logs = vec![node];
                for input in inputs {
                    if let Some(input_logs) = &input.logs {
                        logs.extend(input_logs.iter().cloned());
                    }
                }
                Self {
                    mode,
                    levels,
                    logs: Some(logs),
                }
            }
            ExecutionLogMode::Indicators => {
                let mut levels = input_levels.clone();
                levels.extend(node.log.levels().iter().copied());
                if !missing_inputs.is_empty() {
                    levels.insert(LogLevel::Warn);
                }
                if !missing_outputs.is_empty() {
                    levels.insert(LogLevel::Info);
                }

                let introduces_level = node
                    .log
                    .levels()
                    .iter()
                    .any(|level| !input_levels.contains(level));
                let logs = (introduces_level && !node.log.events().is_empty())
                    .then(|| vec![node]);
                Self { mode, levels, logs }
            }
        }
    }

    pub fn mode(&self) -> ExecutionLogMode {
        self.mode
    }

    pub fn levels(&self) -> &BTreeSet<LogLevel> {
        &self.levels
    }

    pub fn logs(&self) -> Option<&[ExecutionLogWithContext]> {
        self.logs.as_deref()
    }

    pub fn has_captured_events(&self) -> bool {
        self.logs.is_some()
    }

    pub fn has_level(&self, level: LogLevel) -> bool {
        self.levels.contains(&level)
    }
}

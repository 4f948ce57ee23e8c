//! Compiled view definitions and per-cycle execution options.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use calcflow_core::{DependencyGraph, FunctionParameters, ValueProperties, ValueSpecification};
use serde::{Deserialize, Serialize};

use crate::market_data::MARKET_DATA_SHIFT;

/// Names a set of market data manipulations within a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketDataSelector(String);

impl MarketDataSelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketDataSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MarketDataSelector {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// User-facing view settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    /// Write every configuration's cache to a temp file on release.
    #[serde(default)]
    pub dump_computation_cache_to_disk: bool,
    /// Dump directory; the system temp dir when unset.
    #[serde(default)]
    pub dump_directory: Option<PathBuf>,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_dump(mut self) -> Self {
        self.dump_computation_cache_to_disk = true;
        self
    }

    pub fn with_cache_dump_in(mut self, directory: impl Into<PathBuf>) -> Self {
        self.dump_computation_cache_to_disk = true;
        self.dump_directory = Some(directory.into());
        self
    }
}

/// A named dependency graph plus its configuration-level settings.
#[derive(Debug, Clone)]
pub struct CompiledCalculationConfiguration {
    name: String,
    graph: Arc<DependencyGraph>,
    default_properties: ValueProperties,
    market_data_selections: HashMap<MarketDataSelector, BTreeSet<ValueSpecification>>,
    selection_parameters: HashMap<MarketDataSelector, FunctionParameters>,
}

impl CompiledCalculationConfiguration {
    /// Configuration named after its graph.
    pub fn new(graph: DependencyGraph) -> Self {
        Self {
            name: graph.calculation_configuration_name().to_string(),
            graph: Arc::new(graph),
            default_properties: ValueProperties::new(),
            market_data_selections: HashMap::new(),
            selection_parameters: HashMap::new(),
        }
    }

    pub fn with_default_properties(mut self, properties: ValueProperties) -> Self {
        self.default_properties = properties;
        self
    }

    /// Shorthand for a `MARKET_DATA_SHIFT` default property.
    pub fn with_market_data_shift(mut self, expression: impl Into<String>) -> Self {
        self.default_properties = self.default_properties.with(MARKET_DATA_SHIFT, expression);
        self
    }

    /// Associate the specifications produced by manipulation nodes with `selector`.
    pub fn with_selection(
        mut self,
        selector: impl Into<MarketDataSelector>,
        specifications: impl IntoIterator<Item = ValueSpecification>,
    ) -> Self {
        self.market_data_selections
            .entry(selector.into())
            .or_default()
            .extend(specifications);
        self
    }

    pub fn with_selection_parameters(
        mut self,
        selector: impl Into<MarketDataSelector>,
        parameters: FunctionParameters,
    ) -> Self {
        self.selection_parameters.insert(selector.into(), parameters);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn default_properties(&self) -> &ValueProperties {
        &self.default_properties
    }

    pub fn market_data_selections(&self) -> &HashMap<MarketDataSelector, BTreeSet<ValueSpecification>> {
        &self.market_data_selections
    }

    pub fn selection_parameters(&self) -> &HashMap<MarketDataSelector, FunctionParameters> {
        &self.selection_parameters
    }

    /// The configured shift expression, if any.
    pub fn market_data_shift(&self) -> Option<&str> {
        self.default_properties.first_value(MARKET_DATA_SHIFT)
    }
}

/// A view definition compiled into one graph per calculation configuration.
#[derive(Debug, Clone)]
pub struct CompiledViewDefinition {
    definition: ViewDefinition,
    configurations: BTreeMap<String, CompiledCalculationConfiguration>,
}

impl CompiledViewDefinition {
    pub fn new(definition: ViewDefinition) -> Self {
        Self {
            definition,
            configurations: BTreeMap::new(),
        }
    }

    pub fn with_configuration(mut self, configuration: CompiledCalculationConfiguration) -> Self {
        self.configurations
            .insert(configuration.name().to_string(), configuration);
        self
    }

    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    pub fn configuration(&self, name: &str) -> Option<&CompiledCalculationConfiguration> {
        self.configurations.get(name)
    }

    /// Configurations in name order.
    pub fn configurations(&self) -> impl Iterator<Item = &CompiledCalculationConfiguration> {
        self.configurations.values()
    }

    pub fn configuration_names(&self) -> impl Iterator<Item = &str> {
        self.configurations.keys().map(String::as_str)
    }
}

/// Per-cycle inputs chosen by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewCycleExecutionOptions {
    /// Valuation instant, epoch milliseconds.
    pub valuation_time: u64,
    /// Overrides `CompiledCalculationConfiguration::selection_parameters`.
    #[serde(default)]
    pub function_parameters: HashMap<MarketDataSelector, FunctionParameters>,
}

impl ViewCycleExecutionOptions {
    pub fn at(valuation_time: u64) -> Self {
        Self {
            valuation_time,
            function_parameters: HashMap::new(),
        }
    }

    pub fn with_function_parameters(
        mut self,
        selector: impl Into<MarketDataSelector>,
        parameters: FunctionParameters,
    ) -> Self {
        self.function_parameters.insert(selector.into(), parameters);
        self
    }
}

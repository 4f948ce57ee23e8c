//! Process-wide collaborators shared by every cycle.

use std::sync::Arc;

use calcflow_function::{EmptyFunctionBlacklist, FunctionBlacklistQuery};

use crate::cache::{InMemoryViewComputationCacheSource, ViewComputationCacheSource};
use crate::graph_executor::DependencyGraphExecutor;
use crate::local::LocalGraphExecutor;
use crate::log::ExecutionLogModeSource;
use crate::market_data::{OverrideOperationCompiler, ShiftOperationCompiler};

#[derive(Clone)]
pub struct ViewProcessContext {
    cache_source: Arc<dyn ViewComputationCacheSource>,
    graph_executor: Arc<dyn DependencyGraphExecutor>,
    blacklist: Arc<dyn FunctionBlacklistQuery>,
    override_compiler: Arc<dyn OverrideOperationCompiler>,
    log_mode_source: ExecutionLogModeSource,
}

impl ViewProcessContext {
    pub fn new(graph_executor: Arc<dyn DependencyGraphExecutor>) -> Self {
        Self {
            cache_source: Arc::new(InMemoryViewComputationCacheSource::new()),
            graph_executor,
            blacklist: Arc::new(EmptyFunctionBlacklist),
            override_compiler: Arc::new(ShiftOperationCompiler),
            log_mode_source: ExecutionLogModeSource::default(),
        }
    }

    pub fn with_cache_source(mut self, cache_source: Arc<dyn ViewComputationCacheSource>) -> Self {
        self.cache_source = cache_source;
        self
    }

    pub fn with_blacklist(mut self, blacklist: Arc<dyn FunctionBlacklistQuery>) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn with_override_compiler(mut self, compiler: Arc<dyn OverrideOperationCompiler>) -> Self {
        self.override_compiler = compiler;
        self
    }

    pub fn with_log_mode_source(mut self, source: ExecutionLogModeSource) -> Self {
        self.log_mode_source = source;
        self
    }

    pub fn cache_source(&self) -> &Arc<dyn ViewComputationCacheSource> {
        &self.cache_source
    }

    pub fn graph_executor(&self) -> &Arc<dyn DependencyGraphExecutor> {
        &self.graph_executor
    }

    pub fn blacklist(&self) -> &Arc<dyn FunctionBlacklistQuery> {
        &self.blacklist
    }

    pub fn override_compiler(&self) -> &Arc<dyn OverrideOperationCompiler> {
        &self.override_compiler
    }

    pub fn log_mode_source(&self) -> &ExecutionLogModeSource {
        &self.log_mode_source
    }
}

impl Default for ViewProcessContext {
    fn default() -> Self {
        Self::new(Arc::new(LocalGraphExecutor::default()))
    }
}

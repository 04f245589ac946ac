//! Orchestration layer: worker registry, assignment strategies, the
//! execution seam and the coordination loop that ties them together.

mod assignment;
mod coordinator;
mod executor;
mod registry;

pub use assignment::{
    cost_efficiency, skill_score, Assignment, AssignmentContext, AssignmentPlan, AssignmentStatus,
    CostBudget, ProjectRequirements, Strategy, StrategyRegistry, EXECUTION_TIME_CAP_MS,
    HIGH_PRIORITY_THRESHOLD,
};
pub use coordinator::{
    Blocker, BlockerCategory, Coordinator, CoordinatorConfig, CycleSummary, ProjectPhase,
    ProjectReport, DEFAULT_MAX_ITERATIONS, INIT_TASK_TYPE,
};
pub use executor::{
    ExecutionOutcome, ExecutionRequest, Executor, ProcessExecutor, TokenUsage,
    DEFAULT_EXECUTION_TIMEOUT, DEFAULT_INIT_TIMEOUT, PROMPT_PLACEHOLDER,
};
pub use registry::{
    AvailableAgent, WorkerCapability, WorkerInstance, WorkerRegistry, WorkerStatus, ANY_TASK_TYPE,
    DEFAULT_LIVENESS_WINDOW, DEFAULT_SWEEP_INTERVAL,
};

//! Assignment strategies mapping ready work items to available workers.
//!
//! Every strategy shares one eligibility rule: the worker's capability
//! supports the item's task type (and any skills the project requires), and
//! the worker still has a free concurrency slot in the plan being built.
//! Items nobody can take produce warnings, never errors.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::core::ids::WorkerId;
use crate::core::item::{Priority, WorkItem, WorkItemId};
use crate::error::{Error, Result};
use crate::orchestration::registry::AvailableAgent;

/// Execution time at which the speed part of the skill score reaches zero.
pub const EXECUTION_TIME_CAP_MS: f64 = 300_000.0;

/// Items at or above this priority get the best-scoring worker under
/// priority-first assignment.
pub const HIGH_PRIORITY_THRESHOLD: Priority = Priority::High;

/// Completion estimate for workers without execution history.
const DEFAULT_EXECUTION_ESTIMATE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    LoadBalanced,
    SkillMatched,
    PriorityFirst,
    CostOptimized,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::LoadBalanced,
        Strategy::SkillMatched,
        Strategy::PriorityFirst,
        Strategy::CostOptimized,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::LoadBalanced => "load-balanced",
            Strategy::SkillMatched => "skill-matched",
            Strategy::PriorityFirst => "priority-first",
            Strategy::CostOptimized => "cost-optimized",
        }
    }

    pub fn assign(&self, context: &AssignmentContext) -> AssignmentPlan {
        let mut planner = Planner::new(context);
        match self {
            Strategy::LoadBalanced => planner.load_balanced(),
            Strategy::SkillMatched => planner.skill_matched(),
            Strategy::PriorityFirst => planner.priority_first(),
            Strategy::CostOptimized => match context.requirements.budget {
                Some(budget) => planner.cost_optimized(budget),
                None => {
                    planner.recommendations.push(
                        "cost-optimized assignment needs a budget; used load-balanced instead".to_string(),
                    );
                    planner.load_balanced();
                }
            },
        }
        planner.finish()
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StrategyRegistry::default().get(s)
    }
}

/// Named strategies. Lookups of unknown names fail.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    by_name: HashMap<String, Strategy>,
}

impl StrategyRegistry {
    pub fn register(&mut self, name: &str, strategy: Strategy) {
        self.by_name.insert(normalize(name), strategy);
    }

    pub fn get(&self, name: &str) -> Result<Strategy> {
        self.by_name
            .get(&normalize(name))
            .copied()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_name: HashMap::new(),
        };
        for strategy in Strategy::ALL {
            registry.register(strategy.name(), strategy);
        }
        registry
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

/// Token ceiling for cost-optimized assignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBudget {
    pub max_tokens: u64,
    pub cost_per_token: f64,
}

impl CostBudget {
    pub fn limit(&self) -> f64 {
        self.max_tokens as f64 * self.cost_per_token
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectRequirements {
    /// Treat every item as high priority under priority-first assignment.
    pub urgent: bool,
    /// Specializations a worker must have to be eligible.
    pub required_skills: BTreeSet<String>,
    pub budget: Option<CostBudget>,
}

/// Input to a strategy.
#[derive(Debug, Clone)]
pub struct AssignmentContext {
    pub agents: Vec<AvailableAgent>,
    /// Ready items in queue order.
    pub items: Vec<WorkItem>,
    pub requirements: ProjectRequirements,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    #[default]
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// One execution attempt of a work item bound to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub item_id: WorkItemId,
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    /// Copied from the item at assignment time.
    pub priority: Priority,
    pub status: AssignmentStatus,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentPlan {
    pub assignments: Vec<Assignment>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub estimated_cost: f64,
    /// Assigned items over considered items.
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
}

impl AssignmentPlan {
    pub fn worker_for(&self, item: &WorkItemId) -> Option<WorkerId> {
        self.assignments
            .iter()
            .find(|a| &a.item_id == item)
            .map(|a| a.worker_id)
    }
}

/// Weighted success and speed score in [0, 1].
pub fn skill_score(agent: &AvailableAgent) -> f64 {
    let speed = 1.0 - (agent.capability.average_execution_ms / EXECUTION_TIME_CAP_MS).clamp(0.0, 1.0);
    0.7 * agent.capability.success_rate + 0.3 * speed
}

/// Successes per second of execution.
pub fn cost_efficiency(agent: &AvailableAgent) -> f64 {
    let seconds = agent.capability.average_execution_ms.max(1.0) / 1000.0;
    agent.capability.success_rate / seconds
}

/// Builds one plan while tracking slots handed out so far.
struct Planner<'a> {
    context: &'a AssignmentContext,
    load: HashMap<WorkerId, usize>,
    plan: AssignmentPlan,
    recommendations: Vec<String>,
    cost_per_token: f64,
}

impl<'a> Planner<'a> {
    fn new(context: &'a AssignmentContext) -> Self {
        Self {
            context,
            load: context.agents.iter().map(|a| (a.worker_id, a.load)).collect(),
            plan: AssignmentPlan::default(),
            recommendations: Vec::new(),
            cost_per_token: context.requirements.budget.map_or(1.0, |b| b.cost_per_token),
        }
    }

    fn eligible(&self, item: &WorkItem) -> Vec<&'a AvailableAgent> {
        let required = &self.context.requirements.required_skills;
        self.context
            .agents
            .iter()
            .filter(|a| a.capability.supports(&item.task_type))
            .filter(|a| required.is_subset(&a.capability.specializations))
            .filter(|a| self.load.get(&a.worker_id).copied().unwrap_or(a.load) < a.capability.max_concurrent_tasks)
            .collect()
    }

    fn current_load(&self, agent: &AvailableAgent) -> usize {
        self.load.get(&agent.worker_id).copied().unwrap_or(agent.load)
    }

    fn item_cost(&self, item: &WorkItem) -> f64 {
        item.estimated_tokens as f64 * self.cost_per_token
    }

    fn warn_unassignable(&mut self, item: &WorkItem) {
        self.plan.warnings.push(format!(
            "No eligible worker for item {} (task type '{}')",
            item.id.short(),
            item.task_type
        ));
    }

    fn push(&mut self, item: &WorkItem, agent: &AvailableAgent) {
        let now = self.context.now;
        let estimate_ms = item
            .estimated_duration_ms
            .map(|ms| ms as i64)
            .or_else(|| {
                (agent.capability.average_execution_ms > 0.0)
                    .then(|| agent.capability.average_execution_ms.round() as i64)
            })
            .unwrap_or(DEFAULT_EXECUTION_ESTIMATE_MS);
        let estimated_cost = self.item_cost(item);

        *self.load.entry(agent.worker_id).or_insert(agent.load) += 1;
        self.plan.estimated_cost += estimated_cost;
        self.plan.assignments.push(Assignment {
            item_id: item.id,
            worker_id: agent.worker_id,
            assigned_at: now,
            estimated_completion: now + ChronoDuration::milliseconds(estimate_ms),
            priority: item.priority,
            status: AssignmentStatus::Assigned,
            estimated_cost,
        });
    }

    fn load_balanced(&mut self) {
        for item in &self.context.items {
            let pick = self
                .eligible(item)
                .into_iter()
                .min_by_key(|a| self.current_load(a));
            match pick {
                Some(agent) => self.push(item, agent),
                None => self.warn_unassignable(item),
            }
        }
    }

    fn best_scoring(&self, item: &WorkItem) -> Option<&'a AvailableAgent> {
        // Ties go to the earlier worker.
        self.eligible(item)
            .into_iter()
            .rev()
            .max_by(|a, b| skill_score(a).total_cmp(&skill_score(b)))
    }

    fn skill_matched(&mut self) {
        for item in &self.context.items {
            match self.best_scoring(item) {
                Some(agent) => self.push(item, agent),
                None => self.warn_unassignable(item),
            }
        }
    }

    fn priority_first(&mut self) {
        let mut items: Vec<&WorkItem> = self.context.items.iter().collect();
        items.sort_by_key(|item| std::cmp::Reverse(item.priority));
        let urgent = self.context.requirements.urgent;

        for item in items {
            let pick = if urgent || item.priority >= HIGH_PRIORITY_THRESHOLD {
                self.best_scoring(item)
            } else {
                self.eligible(item).into_iter().next()
            };
            match pick {
                Some(agent) => self.push(item, agent),
                None => self.warn_unassignable(item),
            }
        }
    }

    fn cost_optimized(&mut self, budget: CostBudget) {
        let limit = budget.limit();
        for item in &self.context.items {
            let pick = self
                .eligible(item)
                .into_iter()
                .rev()
                .max_by(|a, b| cost_efficiency(a).total_cmp(&cost_efficiency(b)));
            let Some(agent) = pick else {
                self.warn_unassignable(item);
                continue;
            };

            let cost = self.item_cost(item);
            if self.plan.estimated_cost + cost > limit {
                self.plan.warnings.push(format!(
                    "Item {} exceeds budget: estimated cost {:.2} with {:.2} committed (limit {:.2})",
                    item.id.short(),
                    cost,
                    self.plan.estimated_cost,
                    limit
                ));
                continue;
            }
            self.push(item, agent);
        }
    }

    fn finish(mut self) -> AssignmentPlan {
        let total = self.context.items.len();
        let assigned = self.plan.assignments.len();
        self.plan.confidence = if total == 0 {
            1.0
        } else {
            assigned as f64 / total as f64
        };
        self.plan.estimated_completion = self
            .plan
            .assignments
            .iter()
            .map(|a| a.estimated_completion)
            .max();

        if self.context.agents.is_empty() && total > 0 {
            self.recommendations
                .push("No workers are available; register or restart workers".to_string());
        } else if assigned < total && self.plan.warnings.iter().any(|w| w.starts_with("No eligible")) {
            self.recommendations
                .push("Some items have no eligible worker; register workers for their task types or wait for free slots".to_string());
        }
        self.plan.recommendations = self.recommendations;
        self.plan
    }
}

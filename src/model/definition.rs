use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::asset::AssetDeclaration;

/// A single attempt/backoff policy attached to a job or service step.
///
/// `max_attempts: None` means unbounded retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub strategy: RetryStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    1_800_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(1),
            strategy: RetryStrategy::None,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    None,
    Fixed,
    Exponential,
}

/// Discriminated union of step kinds, tagged on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDefinition {
    Job(JobStepDefinition),
    Service(ServiceStepDefinition),
    Fanout(FanOutStepDefinition),
}

impl StepDefinition {
    pub fn id(&self) -> &str {
        match self {
            StepDefinition::Job(j) => &j.id,
            StepDefinition::Service(s) => &s.id,
            StepDefinition::Fanout(f) => &f.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StepDefinition::Job(j) => j.name.as_deref().unwrap_or(&j.id),
            StepDefinition::Service(s) => s.id.as_str(),
            StepDefinition::Fanout(f) => f.id.as_str(),
        }
    }

    pub fn depends_on(&self) -> &[String] {
        match self {
            StepDefinition::Job(j) => &j.depends_on,
            StepDefinition::Service(s) => &s.depends_on,
            StepDefinition::Fanout(f) => &f.depends_on,
        }
    }

    pub fn produces(&self) -> &[AssetDeclaration] {
        match self {
            StepDefinition::Job(j) => &j.produces,
            StepDefinition::Service(s) => &s.produces,
            StepDefinition::Fanout(f) => &f.produces,
        }
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            StepDefinition::Job(j) => j.retry_policy.as_ref(),
            StepDefinition::Service(s) => s.retry_policy.as_ref(),
            StepDefinition::Fanout(_) => None,
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            StepDefinition::Job(j) => j.timeout_ms,
            StepDefinition::Service(s) => s.timeout_ms,
            StepDefinition::Fanout(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobStepDefinition {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub job_slug: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub produces: Vec<AssetDeclaration>,
    #[serde(default)]
    pub consumes: Vec<AssetDeclaration>,
    #[serde(default)]
    pub store_result_as: Option<String>,
    #[serde(default)]
    pub bundle: Option<BundleRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleRef {
    pub slug: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub export_name: Option<String>,
    #[serde(default = "default_bundle_strategy")]
    pub strategy: String,
}

fn default_bundle_strategy() -> String {
    "latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequestSpec {
    #[serde(default)]
    pub method: Option<String>,
    pub path: String,
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub headers: Option<Value>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStepDefinition {
    pub id: String,
    pub service_slug: String,
    pub request: ServiceRequestSpec,
    #[serde(default)]
    pub require_healthy: bool,
    #[serde(default)]
    pub allow_degraded: bool,
    #[serde(default = "default_true")]
    pub capture_response: bool,
    #[serde(default)]
    pub store_response_as: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub produces: Vec<AssetDeclaration>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// `StepDefinition` minus the `fanout` variant, used as a fan-out template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FanOutTemplate {
    Job(JobStepDefinition),
    Service(ServiceStepDefinition),
}

impl FanOutTemplate {
    pub fn id(&self) -> &str {
        match self {
            FanOutTemplate::Job(j) => &j.id,
            FanOutTemplate::Service(s) => &s.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FanOutTemplate::Job(j) => j.name.as_deref().unwrap_or(&j.id),
            FanOutTemplate::Service(s) => s.id.as_str(),
        }
    }

    /// Materializes one concrete child `StepDefinition` for fan-out index `i`.
    pub fn instantiate(&self, parent_id: &str, index: usize) -> StepDefinition {
        let sanitize = |raw: &str| -> String {
            raw.chars()
                .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.') { c } else { '_' })
                .collect()
        };
        match self {
            FanOutTemplate::Job(template) => {
                let mut child = template.clone();
                let child_id = sanitize(&format!("{}:{}:{}", parent_id, template.id, index + 1));
                child.name = Some(format!("{} [{}]", self.name(), index + 1));
                child.id = child_id;
                StepDefinition::Job(child)
            }
            FanOutTemplate::Service(template) => {
                let mut child = template.clone();
                child.id = sanitize(&format!("{}:{}:{}", parent_id, template.id, index + 1));
                StepDefinition::Service(child)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FanOutStepDefinition {
    pub id: String,
    /// Template expression resolved against the runtime scope; must yield an array.
    pub collection: String,
    pub template: FanOutTemplate,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub store_results_as: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub produces: Vec<AssetDeclaration>,
}

/// Adjacency, topological order and edge count over a definition's steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    pub adjacency: HashMap<String, Vec<String>>,
    pub topological_order: Vec<String>,
    pub roots: Vec<String>,
    pub edge_count: usize,
}

impl Dag {
    /// Builds a `Dag` from a step list, deriving adjacency from `dependsOn`
    /// edges (dependency -> dependents) and computing a topological order
    /// via Kahn's algorithm.
    pub fn build(steps: &[StepDefinition]) -> Self {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut edge_count = 0usize;
        for step in steps {
            indegree.entry(step.id().to_string()).or_insert(0);
            for dep in step.depends_on() {
                adjacency.entry(dep.clone()).or_default().push(step.id().to_string());
                *indegree.entry(step.id().to_string()).or_insert(0) += 1;
                edge_count += 1;
            }
        }
        let mut roots: Vec<String> = steps
            .iter()
            .filter(|s| s.depends_on().is_empty())
            .map(|s| s.id().to_string())
            .collect();
        roots.sort();

        let mut queue: std::collections::VecDeque<String> = roots.clone().into();
        let mut order = Vec::with_capacity(steps.len());
        let mut indegree_work = indegree.clone();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            order.push(id.clone());
            if let Some(children) = adjacency.get(&id) {
                for child in children {
                    if let Some(d) = indegree_work.get_mut(child) {
                        *d = d.saturating_sub(1);
                        if *d == 0 {
                            queue.push_back(child.clone());
                        }
                    }
                }
            }
        }
        // Any steps not reached (cycle, or disconnected with nonzero indegree
        // at build time) are appended in declaration order so `topological_order`
        // always covers every step id.
        for step in steps {
            if !order.contains(&step.id().to_string()) {
                order.push(step.id().to_string());
            }
        }

        Self { adjacency, topological_order: order, roots, edge_count }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub slug: String,
    pub version: i64,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub triggers: Vec<Value>,
    #[serde(default)]
    pub parameters_schema: Option<Value>,
    #[serde(default)]
    pub default_parameters: Value,
    #[serde(default)]
    pub metadata: Value,
    pub dag: Dag,
}

impl WorkflowDefinition {
    pub fn new(id: String, slug: String, version: i64, steps: Vec<StepDefinition>) -> Self {
        let dag = Dag::build(&steps);
        Self {
            id,
            slug,
            version,
            steps,
            triggers: Vec::new(),
            parameters_schema: None,
            default_parameters: Value::Null,
            metadata: Value::Null,
            dag,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id() == id)
    }
}

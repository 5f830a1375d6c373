//! Execution plans and the job-document sources that produce them.
//!
//! The kernel does not define a job-definition grammar; it consumes an
//! already-structured [`ExecutionPlan`]. [`YamlJobDoc`] and [`StreamJobDoc`]
//! are thin serde front-ends over that structure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use crate::error::{BatchError, Result};

pub type Properties = BTreeMap<String, String>;

/// Partition numbers are `i32`, with -1 reserved for the top-level thread.
pub const MAX_PARTITIONS: u32 = i32::MAX as u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub job_name: String,
    #[serde(default)]
    pub elements: Vec<PlanElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanElement {
    Step(StepDef),
    Split(SplitDef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    /// Registered handler name; defaults to the step name.
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub partition: Option<PartitionPlan>,
    /// Re-run the step on restart even if it completed before.
    #[serde(default)]
    pub allow_start_if_complete: bool,
    /// Maximum number of starts across restarts; 0 = unlimited.
    #[serde(default)]
    pub start_limit: u32,
}

impl StepDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            properties: Properties::new(),
            partition: None,
            allow_start_if_complete: false,
            start_limit: 0,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn partitioned(mut self, plan: PartitionPlan) -> Self {
        self.partition = Some(plan);
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn start_limit(mut self, limit: u32) -> Self {
        self.start_limit = limit;
        self
    }

    pub fn handler_name(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub partitions: u32,
    /// Maximum partitions running at once; defaults to all of them.
    #[serde(default)]
    pub threads: Option<u32>,
    /// Per-partition properties, indexed by partition number.
    #[serde(default)]
    pub properties: Vec<Properties>,
    /// Hand partitions to the configured transport instead of running them here.
    #[serde(default)]
    pub remote: bool,
}

impl PartitionPlan {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions,
            threads: None,
            properties: Vec::new(),
            remote: false,
        }
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_partition_properties(mut self, properties: Vec<Properties>) -> Self {
        self.properties = properties;
        self
    }

    pub fn remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    pub fn properties_for(&self, partition: u32) -> Properties {
        self.properties
            .get(partition as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub fn concurrency(&self) -> usize {
        self.threads
            .unwrap_or(self.partitions)
            .clamp(1, self.partitions.max(1)) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitDef {
    pub name: String,
    pub flows: Vec<FlowDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
    pub name: String,
    pub steps: Vec<StepDef>,
}

impl FlowDef {
    pub fn new(name: impl Into<String>, steps: Vec<StepDef>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

impl ExecutionPlan {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            elements: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepDef) -> Self {
        self.elements.push(PlanElement::Step(step));
        self
    }

    pub fn split(mut self, name: impl Into<String>, flows: Vec<FlowDef>) -> Self {
        self.elements.push(PlanElement::Split(SplitDef {
            name: name.into(),
            flows,
        }));
        self
    }

    /// Every step in the plan, including those nested in split flows.
    pub fn all_steps(&self) -> Vec<&StepDef> {
        let mut steps = Vec::new();
        for element in &self.elements {
            match element {
                PlanElement::Step(step) => steps.push(step),
                PlanElement::Split(split) => {
                    for flow in &split.flows {
                        steps.extend(flow.steps.iter());
                    }
                }
            }
        }
        steps
    }

    pub fn find_step(&self, name: &str) -> Option<&StepDef> {
        self.all_steps().into_iter().find(|s| s.name == name)
    }

    /// Reject plans the kernel cannot run: duplicate step or flow names,
    /// empty or oversized partition plans.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(BatchError::JobDocument("job name is empty".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for step in self.all_steps() {
            if !seen.insert(step.name.as_str()) {
                return Err(BatchError::JobDocument(format!(
                    "step {} defined more than once",
                    step.name
                )));
            }
            if let Some(plan) = &step.partition {
                if plan.partitions == 0 {
                    return Err(BatchError::JobDocument(format!(
                        "step {} has an empty partition plan",
                        step.name
                    )));
                }
                if plan.partitions > MAX_PARTITIONS {
                    return Err(BatchError::JobDocument(format!(
                        "step {} asks for {} partitions, at most {} allowed",
                        step.name, plan.partitions, MAX_PARTITIONS
                    )));
                }
            }
        }
        // flow records are keyed by job execution and flow name, so names
        // must be unique across every split of the job
        let mut flows = std::collections::HashSet::new();
        for element in &self.elements {
            if let PlanElement::Split(split) = element {
                for flow in &split.flows {
                    if !flows.insert(flow.name.as_str()) {
                        return Err(BatchError::JobDocument(format!(
                            "flow {} defined more than once (split {})",
                            flow.name, split.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let plan: ExecutionPlan = serde_yaml::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }
}

/// Source of a job's execution plan.
pub trait JobDocSource: Send + Sync {
    /// Document text. Sources backed by a stream may only be read once.
    fn read_text(&self) -> Result<String>;

    fn plan(&self) -> Result<ExecutionPlan> {
        ExecutionPlan::from_yaml(&self.read_text()?)
    }
}

impl JobDocSource for ExecutionPlan {
    fn read_text(&self) -> Result<String> {
        self.to_yaml()
    }

    fn plan(&self) -> Result<ExecutionPlan> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// YAML job document held as text; readable any number of times.
#[derive(Debug, Clone)]
pub struct YamlJobDoc {
    text: Arc<str>,
}

impl YamlJobDoc {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Arc::from(text.into()),
        }
    }
}

impl JobDocSource for YamlJobDoc {
    fn read_text(&self) -> Result<String> {
        Ok(self.text.to_string())
    }
}

/// YAML job document backed by a reader; consumed by the first read.
pub struct StreamJobDoc {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl StreamJobDoc {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
        }
    }
}

impl JobDocSource for StreamJobDoc {
    fn read_text(&self) -> Result<String> {
        let reader = self
            .reader
            .lock()
            .map_err(|_| BatchError::internal("job document lock poisoned"))?
            .take();
        let mut reader = reader
            .ok_or_else(|| BatchError::JobDocument("job document stream already consumed".to_string()))?;
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIGHTLY: &str = r#"
job_name: nightlyLoad
elements:
  - step:
      name: extract
      properties:
        source: s3
  - split:
      name: fanout
      flows:
        - name: left
          steps:
            - name: left-a
        - name: right
          steps:
            - name: right-a
              handler: generic
  - step:
      name: load
      allow_start_if_complete: true
      partition:
        partitions: 3
        threads: 2
"#;

    #[test]
    fn test_parse_yaml_plan() {
        let plan = YamlJobDoc::new(NIGHTLY).plan().unwrap();
        assert_eq!(plan.job_name, "nightlyLoad");
        assert_eq!(plan.elements.len(), 3);
        assert_eq!(plan.all_steps().len(), 4);

        let load = plan.find_step("load").unwrap();
        assert!(load.allow_start_if_complete);
        let partitions = load.partition.as_ref().unwrap();
        assert_eq!(partitions.partitions, 3);
        assert_eq!(partitions.concurrency(), 2);

        assert_eq!(plan.find_step("right-a").unwrap().handler_name(), "generic");
        assert_eq!(plan.find_step("extract").unwrap().handler_name(), "extract");
    }

    #[test]
    fn test_plan_round_trips_through_text() {
        let plan = ExecutionPlan::new("job")
            .step(StepDef::new("a").with_property("k", "v"))
            .split(
                "s",
                vec![FlowDef {
                    name: "f".into(),
                    steps: vec![StepDef::new("b")],
                }],
            );
        let text = plan.read_text().unwrap();
        assert_eq!(YamlJobDoc::new(text).plan().unwrap(), plan);
    }

    #[test]
    fn test_stream_source_reads_once() {
        let doc = StreamJobDoc::new(std::io::Cursor::new(NIGHTLY.as_bytes().to_vec()));
        assert!(doc.plan().is_ok());
        assert!(matches!(doc.read_text(), Err(BatchError::JobDocument(_))));
    }

    #[test]
    fn test_validation_rejects_duplicates() {
        let plan = ExecutionPlan::new("job")
            .step(StepDef::new("a"))
            .step(StepDef::new("a"));
        assert!(matches!(plan.validate(), Err(BatchError::JobDocument(_))));

        let plan = ExecutionPlan::new("job").step(StepDef::new("p").partitioned(PartitionPlan::new(0)));
        assert!(plan.validate().is_err());

        let plan = ExecutionPlan::new("job").step(StepDef::new("p").partitioned(PartitionPlan::new(u32::MAX)));
        assert!(matches!(plan.validate(), Err(BatchError::JobDocument(_))));
        let plan = ExecutionPlan::new("job").step(StepDef::new("p").partitioned(PartitionPlan::new(MAX_PARTITIONS)));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_flow_names_unique_across_splits() {
        let plan = ExecutionPlan::new("job")
            .split("first", vec![FlowDef::new("main", vec![StepDef::new("a")])])
            .split("second", vec![FlowDef::new("main", vec![StepDef::new("b")])]);
        assert!(matches!(plan.validate(), Err(BatchError::JobDocument(_))));

        let plan = ExecutionPlan::new("job")
            .split("first", vec![FlowDef::new("main", vec![StepDef::new("a")])])
            .split("second", vec![FlowDef::new("side", vec![StepDef::new("b")])]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_partition_concurrency_bounds() {
        assert_eq!(PartitionPlan::new(5).concurrency(), 5);
        assert_eq!(PartitionPlan::new(5).with_threads(0).concurrency(), 1);
        assert_eq!(PartitionPlan::new(2).with_threads(8).concurrency(), 2);
    }
}

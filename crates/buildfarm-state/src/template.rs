//! Stack templates understood by the local control plane.
//!
//! Templates are JSON documents shaped like declarative infrastructure
//! templates:
//!
//! ```json
//! {
//!   "Description": "...",
//!   "Metadata": {"BuildFarm": {"TaskFamilySuffix": "-BuildFarm-Server", "PublicNetwork": true}},
//!   "Parameters": {"StackName": {"Type": "String"}, "Debug": {"Type": "String", "Default": ""}},
//!   "Outputs": {"ClusterName": {"Value": "${AWS::StackName}-cluster"}}
//! }
//! ```
//!
//! A template with a `TaskFamilySuffix` describes a task fleet whose size
//! is its `InstanceDesiredCount` parameter.

use std::collections::BTreeMap;

use bf_core::{BackendError, BackendResult, DESIRED_COUNT_PARAMETER};
use serde::Deserialize;

/// Parameter naming the stack whose cluster a fleet runs in.
pub const CLUSTER_STACK_PARAMETER: &str = "StackName";

/// Output holding a cluster name.
pub const CLUSTER_OUTPUT: &str = "ClusterName";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: TemplateMetadata,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateMetadata {
    #[serde(rename = "BuildFarm", default)]
    pub build_farm: FarmMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FarmMetadata {
    #[serde(default)]
    pub task_family_suffix: Option<String>,
    /// Tasks get a public address.
    #[serde(default)]
    pub public_network: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterSpec {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputSpec {
    pub value: String,
}

impl Template {
    pub fn parse(body: &str) -> BackendResult<Self> {
        serde_json::from_str(body)
            .map_err(|e| BackendError::Validation(format!("template format error: {e}")))
    }

    /// Reject unknown parameters, missing required ones and non-numeric
    /// values for `Number` parameters.
    pub fn check_parameters(&self, params: &BTreeMap<String, String>) -> BackendResult<()> {
        if let Some(unknown) = params.keys().find(|k| !self.parameters.contains_key(*k)) {
            return Err(BackendError::Validation(format!(
                "parameters: [{unknown}] do not exist in the template"
            )));
        }
        for (name, spec) in &self.parameters {
            match params.get(name) {
                None if spec.default.is_none() => {
                    return Err(BackendError::Validation(format!(
                        "parameters: [{name}] must have values"
                    )));
                }
                Some(value) if spec.kind == "Number" && value.parse::<i64>().is_err() => {
                    return Err(BackendError::Validation(format!(
                        "parameter '{name}' must be a number"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Task family launched by this template, if it describes a fleet.
    pub fn task_family(&self, stack_name: &str) -> Option<String> {
        self.metadata
            .build_farm
            .task_family_suffix
            .as_ref()
            .map(|suffix| format!("{stack_name}{suffix}"))
    }

    /// Declared fleet size, `0` when the parameter is absent.
    pub fn desired_count(params: &BTreeMap<String, String>) -> u32 {
        params
            .get(DESIRED_COUNT_PARAMETER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Evaluate outputs, substituting `${AWS::StackName}` and `${Param}`.
    pub fn resolve_outputs(
        &self,
        stack_name: &str,
        params: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .map(|(name, output)| {
                let mut value = output.value.replace("${AWS::StackName}", stack_name);
                for (param, spec) in &self.parameters {
                    let actual = params.get(param).or(spec.default.as_ref());
                    if let Some(actual) = actual {
                        value = value.replace(&format!("${{{param}}}"), actual);
                    }
                }
                (name.clone(), value)
            })
            .collect()
    }
}

//! `BucketParameterResolver`: expands a connection's requested bucket set
//! against [`CompiledRules`], executing dynamic parameter queries through a
//! storage-provided [`ParameterRowSource`] and enforcing the per-query
//! result cap (§4.5).

use async_trait::async_trait;

use crate::config::PipelineConfig;
use crate::error::SyncStreamError;
use crate::model::{ParameterRow, Priority};

use super::{CompiledRules, ConnectionParameters};

/// The storage-side capability the resolver needs: running one parameter
/// query and returning its resolved rows. Implemented by the embedding
/// service's storage adapter, not by this crate (§4.5 Non-goals: no query
/// planner/executor here).
#[async_trait]
pub trait ParameterRowSource: Send + Sync {
    async fn run_parameter_query(
        &self,
        group_id: &str,
        query: &super::ParameterQuery,
        params: &ConnectionParameters,
    ) -> crate::Result<Vec<ParameterRow>>;
}

pub struct BucketParameterResolver<'a> {
    rules: &'a CompiledRules,
    source: &'a dyn ParameterRowSource,
    config: &'a PipelineConfig,
}

impl<'a> BucketParameterResolver<'a> {
    pub fn new(rules: &'a CompiledRules, source: &'a dyn ParameterRowSource, config: &'a PipelineConfig) -> Self {
        Self { rules, source, config }
    }

    /// Resolve the full bucket set visible to a connection: every static
    /// bucket, plus every dynamic bucket instance produced by evaluating
    /// each dynamic definition's parameter query against `params`. Each
    /// bucket carries the priority its definition declared (§3 item iv),
    /// which the orchestrator groups by when streaming (§4.7).
    pub async fn resolve(&self, params: &ConnectionParameters) -> crate::Result<Vec<(String, Priority)>> {
        let mut buckets: Vec<(String, Priority)> = self
            .rules
            .static_buckets
            .iter()
            .map(|b| (b.bucket.clone(), b.priority))
            .collect();

        for dynamic in &self.rules.dynamic_buckets {
            let rows = self
                .source
                .run_parameter_query(&self.rules.group_id, &dynamic.parameter_query, params)
                .await?;

            if rows.len() > self.config.max_parameter_query_results {
                return Err(SyncStreamError::TooManyParameterResults {
                    returned: rows.len(),
                    limit: self.config.max_parameter_query_results,
                }
                .into());
            }

            for row in rows {
                buckets.push((instantiate_bucket_name(&dynamic.bucket_template, &row), dynamic.priority));
            }
        }

        Ok(buckets)
    }
}

fn instantiate_bucket_name(template: &str, row: &ParameterRow) -> String {
    match template.split_once('[') {
        Some((prefix, _)) => format!("{prefix}[{}]", row.bucket_parameters),
        None => template.to_string(),
    }
}

use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

/// Which agents one changed file affects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImpact {
    pub path: String,
    pub agents: Vec<String>,
}

/// Result of a change-impact analysis. The orchestrator only reads
/// `affected_agents`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub affected_agents: Vec<String>,
    pub change_analysis: Vec<FileImpact>,
    /// Suggested order, most affected first.
    pub execution_priority: Vec<String>,
}

/// Maps changed file paths to the agents that must re-run.
#[async_trait]
pub trait ImpactAnalyzer: Send + Sync {
    async fn perform_impact_analysis(
        &self,
        changed_files: &[String],
    ) -> ConductorResult<ImpactAnalysis>;
}

struct WatchRule {
    agent: String,
    patterns: GlobSet,
}

/// Impact analyzer driven by per-agent glob patterns.
///
/// Patterns use `globset` syntax with literal separators: `**` spans any
/// number of path segments, `*` and `?` never match `/`. Paths are compared
/// with `/` separators and without a leading `./`.
#[derive(Default)]
pub struct PathRuleAnalyzer {
    rules: Vec<WatchRule>,
}

impl PathRuleAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Affect `agent` whenever a changed path matches one of `patterns`.
    pub fn watch<S: AsRef<str>>(
        mut self,
        agent: impl Into<String>,
        patterns: &[S],
    ) -> ConductorResult<Self> {
        let mut set = GlobSetBuilder::new();
        for pattern in patterns {
            set.add(compile(pattern.as_ref())?);
        }
        let patterns = set
            .build()
            .map_err(|e| ConductorError::Config(format!("Invalid watch patterns: {e}")))?;
        self.rules.push(WatchRule {
            agent: agent.into(),
            patterns,
        });
        Ok(self)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn agents_for(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        self.rules
            .iter()
            .filter(|rule| rule.patterns.is_match(&path))
            .map(|rule| rule.agent.clone())
            .collect()
    }
}

#[async_trait]
impl ImpactAnalyzer for PathRuleAnalyzer {
    async fn perform_impact_analysis(
        &self,
        changed_files: &[String],
    ) -> ConductorResult<ImpactAnalysis> {
        let change_analysis: Vec<FileImpact> = changed_files
            .iter()
            .map(|path| FileImpact {
                path: path.clone(),
                agents: self.agents_for(path),
            })
            .collect();

        // (rule index, hit count) per affected agent
        let mut hits: Vec<(usize, &str, usize)> = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            let count = change_analysis
                .iter()
                .filter(|f| f.agents.contains(&rule.agent))
                .count();
            if count > 0 && !hits.iter().any(|(_, a, _)| *a == rule.agent) {
                hits.push((idx, &rule.agent, count));
            }
        }

        let affected_agents: Vec<String> = hits.iter().map(|(_, a, _)| a.to_string()).collect();
        hits.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        let execution_priority = hits.iter().map(|(_, a, _)| a.to_string()).collect();

        Ok(ImpactAnalysis {
            affected_agents,
            change_analysis,
            execution_priority,
        })
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

fn compile(pattern: &str) -> ConductorResult<globset::Glob> {
    let pattern = normalize(pattern);
    GlobBuilder::new(&pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| ConductorError::Config(format!("Invalid watch pattern '{pattern}': {e}")))
}

// ============================================================================
// METRIC IDENTIFIER EXTRACTION
// ============================================================================
// Rewrites dashboard template placeholders into literal durations, parses the
// result and collects the metric names of every vector selector.
//
//   query ──> placeholders (aho-corasick) ──> [$var] / [$a:$b] (regex)
//         ──> parse ──> walk selectors ──> MetricNames
// ============================================================================

pub mod ast;
pub mod lexer;
pub mod parser;

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;

use crate::config::ExtractorConfig;
use crate::constants::{METRIC_NAME_LABEL, METRIC_NAME_PATTERN, VARIABLE_RANGE_PATTERN, VARIABLE_SUBQUERY_PATTERN};
use crate::error::{ConfigError, EngineResult, ParseError};
use crate::model::{MetricName, MetricNames};

use self::ast::MatchOp;

/// Immutable extraction context. Build once per invocation and share it
/// between analyses; every method takes `&self`.
#[derive(Debug, Clone)]
pub struct MetricExtractor {
    placeholders: AhoCorasick,
    literals: Vec<String>,
    range_pattern: Regex,
    subquery_pattern: Regex,
    range_literal: String,
    subquery_literal: String,
    metric_name: Regex,
}

impl MetricExtractor {
    pub fn new(config: &ExtractorConfig) -> EngineResult<Self> {
        let placeholders = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostFirst)
            .build(config.substitutions.iter().map(|s| s.placeholder.as_str()))
            .map_err(|e| ConfigError::invalid_value("extractor.substitutions", e.to_string()))?;

        Ok(Self {
            placeholders,
            literals: config.substitutions.iter().map(|s| s.literal.clone()).collect(),
            range_pattern: compile(VARIABLE_RANGE_PATTERN)?,
            subquery_pattern: compile(VARIABLE_SUBQUERY_PATTERN)?,
            range_literal: config.range_literal.clone(),
            subquery_literal: config.subquery_literal.clone(),
            metric_name: compile(METRIC_NAME_PATTERN)?,
        })
    }

    /// Apply the textual substitution pass. Lossy; only meant to make a
    /// templated query parseable.
    pub fn substitute(&self, query: &str) -> String {
        let replaced = self.placeholders.replace_all(query, &self.literals);
        let ranged = self.range_pattern.replace_all(&replaced, regex::NoExpand(&self.range_literal));
        self.subquery_pattern
            .replace_all(&ranged, regex::NoExpand(&self.subquery_literal))
            .into_owned()
    }

    /// Metric identifiers referenced by `query`.
    ///
    /// A selector without an explicit name contributes only when it carries an
    /// exact `__name__="..."` matcher whose value is a valid metric name.
    /// Error positions refer to the substituted text.
    pub fn extract(&self, query: &str) -> Result<MetricNames, ParseError> {
        let prepared = self.substitute(query);
        let expr = parser::parse(&prepared)?;

        let mut names = MetricNames::new();
        expr.walk_selectors(&mut |selector| match &selector.name {
            Some(name) => {
                names.insert(MetricName::new(name));
            }
            None => {
                let exact = selector
                    .matchers
                    .iter()
                    .find(|m| m.name == METRIC_NAME_LABEL && m.op == MatchOp::Equal);
                if let Some(m) = exact {
                    if self.metric_name.is_match(&m.value) {
                        names.insert(MetricName::new(&m.value));
                    }
                }
            }
        });
        Ok(names)
    }
}

fn compile(pattern: &str) -> EngineResult<Regex> {
    Regex::new(pattern).map_err(|e| ConfigError::invalid_value("extractor", format!("{pattern}: {e}")).into())
}

// ============================================================================
// TESTS
// ============================================================================

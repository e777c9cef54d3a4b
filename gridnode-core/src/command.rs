//! Command grammar of the inbound control channel.
//!
//! A message is either `VERB:VALUE` or a bare keyword (`OPEN`). Verbs are
//! matched case-sensitively against the node's declared verb list, first
//! match wins. Unknown verbs produce no command. Numeric values that do not
//! parse read as zero, and text values are taken literally.

use crate::metrics::{MetricKind, MetricValue};
use crate::numeric::{parse_float, parse_int};
use crate::profile::{NodeProfile, VerbForm};

/// A parsed control message
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Write a metric (`LOAD:85`, `SOURCE:GENERATOR`)
    Set {
        verb: &'static str,
        metric: &'static str,
        value: MetricValue,
    },
    /// Raw `STATUS:` override, not validated against the node's state set
    Override { state: String },
    /// Bare keyword such as `OPEN` or `CLOSE`
    Keyword(&'static str),
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Set { verb, .. } => verb,
            Command::Override { .. } => "STATUS",
            Command::Keyword(keyword) => keyword,
        }
    }

    pub fn is_override(&self) -> bool {
        matches!(self, Command::Override { .. })
    }
}

/// Parses one inbound message against the verbs `profile` declares
pub fn parse(profile: &NodeProfile, text: &str) -> Option<Command> {
    profile.verbs.iter().find_map(|spec| {
        let argument = || text.strip_prefix(spec.keyword).and_then(|rest| rest.strip_prefix(':'));

        match spec.form {
            VerbForm::Keyword => (text == spec.keyword).then_some(Command::Keyword(spec.keyword)),
            VerbForm::Number(metric) => argument().map(|raw| {
                let value = match metric_kind(profile, metric) {
                    MetricKind::Int => MetricValue::Int(parse_int(raw)),
                    _ => MetricValue::Float(parse_float(raw)),
                };
                Command::Set { verb: spec.keyword, metric, value }
            }),
            VerbForm::Text(metric) => argument().map(|raw| Command::Set {
                verb: spec.keyword,
                metric,
                value: MetricValue::Text(raw.to_string()),
            }),
            VerbForm::Status => argument().map(|raw| Command::Override { state: raw.to_string() }),
        }
    })
}

fn metric_kind(profile: &NodeProfile, metric: &str) -> MetricKind {
    profile
        .metric_schema
        .iter()
        .find(|spec| spec.name == metric)
        .map(|spec| spec.kind())
        .unwrap_or(MetricKind::Float)
}

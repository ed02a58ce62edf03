//! # Boundary Policy
//!
//! Decides which messages may cross from one process to another.
//!
//! ## Philosophy
//!
//! - **Privilege flows downward**: Messages towards a less privileged process
//!   are unrestricted; messages that climb towards a more privileged one are
//!   denied unless a rule allows them
//! - **Checked twice**: The sender checks to fail fast; the receiver checks
//!   because it cannot trust the sender
//! - **Deterministic and side-effect free**: Same inputs, same decision
//! - **Pluggable and removable**: The bridge works without a policy
//!
//! ## Core Concepts
//!
//! - [`BoundaryPolicy`]: trait for evaluating a message against a direction
//! - [`PolicyDecision`]: Allow or Deny
//! - [`PayloadShape`]: what the policy may look at (never the values)
//! - [`ErrorExposure`]: whether error stacks may reach the other side

use core_types::ProcessRole;
use ipc::{is_reserved_channel, MessageKind, ValueKind, WireValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Sender and receiver roles of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Direction {
    pub from: ProcessRole,
    pub to: ProcessRole,
}

impl Direction {
    pub fn new(from: ProcessRole, to: ProcessRole) -> Self {
        Self { from, to }
    }

    /// True when the receiver is more privileged than the sender
    pub fn escalates(&self) -> bool {
        self.to > self.from
    }

    /// True when the receiver is less privileged than the sender
    pub fn descends(&self) -> bool {
        self.to < self.from
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Structural summary of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadShape {
    pub kind: MessageKind,
    pub arity: usize,
    pub arg_kinds: Vec<ValueKind>,
    pub transfers_ports: bool,
}

impl PayloadShape {
    /// Describes an encoded argument list
    pub fn from_wire(kind: MessageKind, args: &[WireValue], transfers_ports: bool) -> Self {
        Self {
            kind,
            arity: args.len(),
            arg_kinds: args.iter().map(WireValue::kind).collect(),
            transfers_ports,
        }
    }

    /// Shape of a message with no arguments
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            arity: 0,
            arg_kinds: Vec::new(),
            transfers_ports: false,
        }
    }
}

/// Policy decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self::Allow
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Deny { reason } => Some(reason),
            Self::Allow => None,
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "Allow"),
            Self::Deny { reason } => write!(f, "Deny: {}", reason),
        }
    }
}

/// How much of an error may cross the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorExposure {
    /// Name, message and stack
    Full,
    /// Name and message only
    Redacted,
}

impl ErrorExposure {
    pub fn most_restrictive(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Boundary policy trait
///
/// Policies must be deterministic and side-effect free.
pub trait BoundaryPolicy: Send + Sync {
    fn evaluate(&self, direction: Direction, channel: &str, shape: &PayloadShape)
        -> PolicyDecision;

    fn is_allowed(&self, direction: Direction, channel: &str, shape: &PayloadShape) -> bool {
        self.evaluate(direction, channel, shape).is_allow()
    }

    /// Exposure for errors travelling in `direction`
    fn error_exposure(&self, _direction: Direction) -> ErrorExposure {
        ErrorExposure::Full
    }

    /// Name of this policy (for logging)
    fn name(&self) -> &str;
}

/// Allows everything and exposes full errors
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl BoundaryPolicy for AllowAll {
    fn evaluate(&self, _: Direction, _: &str, _: &PayloadShape) -> PolicyDecision {
        PolicyDecision::Allow
    }

    fn name(&self) -> &str {
        "AllowAll"
    }
}

/// What one channel may carry towards a more privileged process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRule {
    pub channel: String,
    /// Allowed message kinds; empty allows none
    pub kinds: Vec<MessageKind>,
    #[serde(default)]
    pub max_args: Option<usize>,
    /// Expected kind of each leading argument
    #[serde(default)]
    pub arg_kinds: Vec<ValueKind>,
    #[serde(default)]
    pub allow_ports: bool,
}

impl ChannelRule {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            kinds: Vec::new(),
            max_args: None,
            arg_kinds: Vec::new(),
            allow_ports: false,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn with_max_args(mut self, max_args: usize) -> Self {
        self.max_args = Some(max_args);
        self
    }

    pub fn with_arg_kinds(mut self, arg_kinds: Vec<ValueKind>) -> Self {
        self.arg_kinds = arg_kinds;
        self
    }

    pub fn with_ports(mut self) -> Self {
        self.allow_ports = true;
        self
    }

    /// Checks a payload against this rule
    pub fn check(&self, shape: &PayloadShape) -> Result<(), String> {
        if !self.kinds.contains(&shape.kind) {
            return Err(format!(
                "{} messages are not allowed on '{}'",
                shape.kind, self.channel
            ));
        }
        if let Some(max) = self.max_args {
            if shape.arity > max {
                return Err(format!(
                    "'{}' accepts at most {} arguments, got {}",
                    self.channel, max, shape.arity
                ));
            }
        }
        for (index, expected) in self.arg_kinds.iter().enumerate() {
            let actual = shape.arg_kinds.get(index).copied().unwrap_or(ValueKind::Undefined);
            if actual != *expected {
                return Err(format!(
                    "argument {} of '{}' must be {}, got {}",
                    index, self.channel, expected, actual
                ));
            }
        }
        if shape.transfers_ports && !self.allow_ports {
            return Err(format!("'{}' may not transfer ports", self.channel));
        }
        Ok(())
    }
}

/// Default-deny policy for escalating messages
///
/// Messages that do not climb in privilege are always allowed. Replies and
/// port messages are allowed in every direction: replies answer requests the
/// receiver made itself, and ports are handed out explicitly.
#[derive(Debug, Clone)]
pub struct AllowListPolicy {
    rules: BTreeMap<String, ChannelRule>,
    allow_framework_channels: bool,
    redact_downward: bool,
}

impl AllowListPolicy {
    pub fn new() -> Self {
        Self {
            rules: BTreeMap::new(),
            allow_framework_channels: true,
            redact_downward: true,
        }
    }

    pub fn with_rule(mut self, rule: ChannelRule) -> Self {
        self.rules.insert(rule.channel.clone(), rule);
        self
    }

    /// Subjects the bridge's own channels to the rules as well
    pub fn without_framework_channels(mut self) -> Self {
        self.allow_framework_channels = false;
        self
    }

    /// Sends full error stacks to less privileged processes too
    pub fn with_full_errors(mut self) -> Self {
        self.redact_downward = false;
        self
    }

    pub fn rule(&self, channel: &str) -> Option<&ChannelRule> {
        self.rules.get(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

impl Default for AllowListPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundaryPolicy for AllowListPolicy {
    fn evaluate(&self, direction: Direction, channel: &str, shape: &PayloadShape) -> PolicyDecision {
        if !direction.escalates() {
            return PolicyDecision::Allow;
        }
        if matches!(shape.kind, MessageKind::Reply | MessageKind::Port) {
            return PolicyDecision::Allow;
        }
        if self.allow_framework_channels && is_reserved_channel(channel) {
            return PolicyDecision::Allow;
        }
        match self.rules.get(channel) {
            Some(rule) => match rule.check(shape) {
                Ok(()) => PolicyDecision::Allow,
                Err(reason) => PolicyDecision::deny(reason),
            },
            None => PolicyDecision::deny(format!(
                "channel '{}' is not allowed from {}",
                channel, direction
            )),
        }
    }

    fn error_exposure(&self, direction: Direction) -> ErrorExposure {
        if self.redact_downward && direction.descends() {
            ErrorExposure::Redacted
        } else {
            ErrorExposure::Full
        }
    }

    fn name(&self) -> &str {
        "AllowListPolicy"
    }
}

/// Composed policy
///
/// Evaluates policies in order; the first Deny wins. Error exposure is the
/// most restrictive of all members.
#[derive(Default)]
pub struct ComposedPolicy {
    policies: Vec<Arc<dyn BoundaryPolicy>>,
}

impl ComposedPolicy {
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    pub fn add_policy(mut self, policy: Arc<dyn BoundaryPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Evaluates every member and records each decision
    pub fn evaluate_with_report(
        &self,
        direction: Direction,
        channel: &str,
        shape: &PayloadShape,
    ) -> PolicyDecisionReport {
        let mut evaluated = Vec::with_capacity(self.policies.len());
        let mut decision = PolicyDecision::Allow;
        for policy in &self.policies {
            let result = policy.evaluate(direction, channel, shape);
            if decision.is_allow() && result.is_deny() {
                decision = result.clone();
            }
            evaluated.push(PolicyEvaluation {
                policy_name: policy.name().to_string(),
                decision: result,
            });
        }
        PolicyDecisionReport {
            decision,
            evaluated_policies: evaluated,
        }
    }
}

impl BoundaryPolicy for ComposedPolicy {
    fn evaluate(&self, direction: Direction, channel: &str, shape: &PayloadShape) -> PolicyDecision {
        for policy in &self.policies {
            let decision = policy.evaluate(direction, channel, shape);
            if decision.is_deny() {
                return decision;
            }
        }
        PolicyDecision::Allow
    }

    fn error_exposure(&self, direction: Direction) -> ErrorExposure {
        self.policies
            .iter()
            .map(|policy| policy.error_exposure(direction))
            .fold(ErrorExposure::Full, ErrorExposure::most_restrictive)
    }

    fn name(&self) -> &str {
        "ComposedPolicy"
    }
}

/// Policy decision report with per-policy decisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecisionReport {
    pub decision: PolicyDecision,
    pub evaluated_policies: Vec<PolicyEvaluation>,
}

/// Single policy evaluation record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub policy_name: String,
    pub decision: PolicyDecision,
}

//! Configuration for the chaos proxy.
//!
//! Defines the listener/backend addresses and the ordered rule list, plus
//! one action type per fault strategy.

use crate::frame::Direction;
use crate::injector::InjectorType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Main configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Address the proxy listens on
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Real backend the proxy forwards to
    #[serde(default)]
    pub backend: BackendConfig,

    /// Rules, evaluated in declaration order
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl ProxyConfig {
    /// Load configuration from a YAML file.
    ///
    /// Parsing only; rule-level problems are left to [`ProxyConfig::validate`]
    /// and to the engine's per-rule compilation.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Write the configuration back to `path`.
    pub fn write_file(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listener.address.is_empty() {
            anyhow::bail!("listener.address cannot be empty");
        }
        if self.backend.address.is_empty() {
            anyhow::bail!("backend.address cannot be empty");
        }

        let mut seen = HashSet::new();
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate()
                .map_err(|e| anyhow::anyhow!("Rule {} ({}): {}", i, rule.name, e))?;
            if !seen.insert(rule.name.as_str()) {
                anyhow::bail!("Rule {}: duplicate rule name {:?}", i, rule.name);
            }
        }
        Ok(())
    }

    /// Rules that take part in compilation.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &RuleSpec> {
        self.rules.iter().filter(|r| !r.disabled)
    }

    /// Flip the `disabled` flag of the rule called `name`.
    pub fn set_rule_enabled(&mut self, name: &str, enabled: bool) -> anyhow::Result<()> {
        let rule = self
            .rules
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| anyhow::anyhow!("rule {} not found", name))?;
        rule.disabled = !enabled;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub address: String,
}

/// A single rule definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Unique name, used by `rule enable` / `rule disable`
    pub name: String,

    /// Which calls the rule applies to
    #[serde(rename = "match", default)]
    pub matcher: MatchSpec,

    /// What to do with matched calls (exactly one field populated)
    #[serde(default)]
    pub action: ActionSpec,

    /// Disabled rules are invisible to the engine
    #[serde(default)]
    pub disabled: bool,
}

impl RuleSpec {
    /// Validate the rule definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Rule name cannot be empty");
        }
        self.matcher.validate()?;
        match self.action.populated() {
            0 => anyhow::bail!("Rule has no action"),
            1 => Ok(()),
            n => anyhow::bail!("Rule has {} actions, exactly one is allowed", n),
        }
    }
}

/// Call matching: service equality plus optional method regex.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MatchSpec {
    /// Service name (case-insensitive, empty = any)
    #[serde(default)]
    pub service: String,

    /// Regex over the method name (case-sensitive, absent = any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_regex: Option<String>,
}

impl MatchSpec {
    /// Validate the match spec.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(pattern) = self.method_regex.as_deref().filter(|p| !p.is_empty()) {
            regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
        }
        Ok(())
    }
}

/// Tagged union of actions, as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spammer: Option<SpammerAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<DisconnectAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptAction>,
}

impl ActionSpec {
    /// Number of populated action fields.
    pub fn populated(&self) -> usize {
        [
            self.delay.is_some(),
            self.abort.is_some(),
            self.chaos.is_some(),
            self.spammer.is_some(),
            self.network.is_some(),
            self.header.is_some(),
            self.rate_limiter.is_some(),
            self.disconnect.is_some(),
            self.code.is_some(),
            self.script.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    /// The populated action, if any.
    pub fn resolve(&self) -> Option<ActionConfig> {
        if let Some(a) = &self.delay {
            return Some(ActionConfig::Delay(a.clone()));
        }
        if let Some(a) = &self.abort {
            return Some(ActionConfig::Abort(a.clone()));
        }
        if let Some(a) = &self.chaos {
            return Some(ActionConfig::Chaos(a.clone()));
        }
        if let Some(a) = &self.spammer {
            return Some(ActionConfig::Spammer(a.clone()));
        }
        if let Some(a) = &self.network {
            return Some(ActionConfig::Network(a.clone()));
        }
        if let Some(a) = &self.header {
            return Some(ActionConfig::Header(a.clone()));
        }
        if let Some(a) = &self.rate_limiter {
            return Some(ActionConfig::RateLimiter(a.clone()));
        }
        if let Some(a) = &self.disconnect {
            return Some(ActionConfig::Disconnect(a.clone()));
        }
        if let Some(a) = &self.code {
            return Some(ActionConfig::Code(a.clone()));
        }
        self.script.clone().map(ActionConfig::Script)
    }
}

/// A resolved action: the raw configuration handed to an injector factory.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionConfig {
    Delay(DelayAction),
    Abort(AbortAction),
    Chaos(ChaosAction),
    Spammer(SpammerAction),
    Network(NetworkAction),
    Header(HeaderAction),
    RateLimiter(RateLimiterAction),
    Disconnect(DisconnectAction),
    Code(CodeAction),
    Script(ScriptAction),
}

impl ActionConfig {
    /// Registry key for this action.
    pub fn kind(&self) -> InjectorType {
        match self {
            ActionConfig::Delay(_) => InjectorType::Delay,
            ActionConfig::Abort(_) => InjectorType::Abort,
            ActionConfig::Chaos(_) => InjectorType::Chaos,
            ActionConfig::Spammer(_) => InjectorType::Spammer,
            ActionConfig::Network(_) => InjectorType::Network,
            ActionConfig::Header(_) => InjectorType::Header,
            ActionConfig::RateLimiter(_) => InjectorType::RateLimit,
            ActionConfig::Disconnect(_) => InjectorType::Disconnect,
            ActionConfig::Code(_) => InjectorType::Code,
            ActionConfig::Script(_) => InjectorType::Script,
        }
    }
}

/// Latency injection: uniform jitter in `[min_ms, max_ms]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DelayAction {
    #[serde(default)]
    pub min_ms: u64,
    #[serde(default)]
    pub max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AbortAction {
    /// gRPC code name, e.g. `UNAVAILABLE`
    #[serde(default)]
    pub code: String,
    /// Percentage of calls to abort (clamped to 0-100)
    #[serde(default)]
    pub percentage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DisconnectAction {
    /// Percentage of calls to drop (must be 0-100)
    #[serde(default)]
    pub percentage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterAction {
    /// Sustained rate, calls per second
    #[serde(default)]
    pub rate_limit: i64,
    /// Extra calls allowed on top of the rate
    #[serde(default)]
    pub burst_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkAction {
    #[serde(default)]
    pub loss_percentage: i64,
    #[serde(default)]
    pub throttle_ms: i64,
}

/// Header rewriting.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeaderAction {
    /// Header name to replacement
    #[serde(default)]
    pub headers: BTreeMap<String, HeaderValueSpec>,

    /// Only rewrite frames travelling in this direction
    #[serde(default)]
    pub direction: Direction,

    /// If non-empty, every other metadata key is removed
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// A header replacement: either a literal value or a prefix/suffix/values set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HeaderValueSpec {
    Literal(String),
    Modified(HeaderModification),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeaderModification {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Status-code injection.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CodeAction {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// Probability to inject (0-100); absent means always
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i64>,
    /// Metadata merged into the frame before failing
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub delay_ms: u64,
    /// Method allow-list (case-insensitive, empty = all)
    #[serde(default, rename = "only_on_methods")]
    pub only_on: Vec<String>,
    /// Stop injecting after this many faults on one frame (0 = unlimited)
    #[serde(default)]
    pub repeat_count: u32,
}

/// External script execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScriptAction {
    /// `sh` or `bash`
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub source: String,
    /// Shell function defined in `source` to invoke with `args`
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Request amplification.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SpammerAction {
    /// Number of replays per original call
    #[serde(default)]
    pub count: i64,
    /// Optional jitter before each replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayAction>,
}

/// Random choice among sub-actions.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChaosAction {
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

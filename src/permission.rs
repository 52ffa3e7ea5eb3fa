// agentry/src/permission.rs

//! Permission rules and their evaluation.
//!
//! Single-mode categories (`edit`, `webfetch`) carry one decision. `bash`
//! carries an ordered list of `(pattern, decision)` rules evaluated strictly
//! first-match in declaration order. An empty rule list denies everything.

use globset::{GlobBuilder, GlobMatcher};
use serde::{
    de::{self, Deserializer, MapAccess, Visitor},
    Deserialize, Serialize,
};
use std::{fmt, str::FromStr};

use crate::{error::RegistryError, ordered_map};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision { Allow, Ask, Deny }

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ask => "ask",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Decision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "ask" => Ok(Self::Ask),
            "deny" => Ok(Self::Deny),
            other => Err(format!("invalid decision `{other}` (expected allow, ask or deny)")),
        }
    }
}

/// A tool action category an agent may be asked to perform.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability { Edit, Write, Bash, WebFetch }

impl Capability {
    /// Key of the structural switch in an agent's `tools` table.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Write => "write",
            Self::Bash => "bash",
            Self::WebFetch => "webfetch",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.tool_name()) }
}

impl FromStr for Capability {
    type Err = RegistryError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edit" => Ok(Self::Edit),
            "write" => Ok(Self::Write),
            "bash" => Ok(Self::Bash),
            "webfetch" => Ok(Self::WebFetch),
            _ => Err(RegistryError::UnknownCapability(s.to_string())),
        }
    }
}

/// A command pattern: exact text, or text where each `*` matches any run of characters.
#[derive(Clone, Debug)]
pub struct CommandPattern {
    source: String,
    glob: Option<GlobMatcher>,
}

impl CommandPattern {
    pub fn new(source: &str) -> Result<Self, String> {
        if !source.contains('*') {
            return Ok(Self { source: source.to_string(), glob: None });
        }
        // Only `*` is special; everything else in a shell command is literal.
        let escaped = source.split('*').map(globset::escape).collect::<Vec<_>>().join("*");
        let glob = GlobBuilder::new(&escaped)
            .literal_separator(false)
            .backslash_escape(false)
            .build()
            .map_err(|e| format!("invalid pattern `{source}`: {e}"))?
            .compile_matcher();
        Ok(Self { source: source.to_string(), glob: Some(glob) })
    }

    pub fn as_str(&self) -> &str { &self.source }

    /// Matches every possible command.
    pub fn is_catch_all(&self) -> bool {
        !self.source.is_empty() && self.source.chars().all(|c| c == '*')
    }

    pub fn matches(&self, command: &str) -> bool {
        if self.is_catch_all() { return true; }
        match &self.glob {
            Some(glob) => glob.is_match(command),
            None => self.source == command,
        }
    }
}

impl PartialEq for CommandPattern {
    fn eq(&self, other: &Self) -> bool { self.source == other.source }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BashRule {
    pub pattern: CommandPattern,
    pub decision: Decision,
}

/// Ordered bash rules. Declaration order is part of the contract.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BashPolicy {
    rules: Vec<BashRule>,
}

impl BashPolicy {
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = (&'a str, Decision)>) -> Result<Self, String> {
        let rules = rules
            .into_iter()
            .map(|(p, decision)| Ok(BashRule { pattern: CommandPattern::new(p)?, decision }))
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[BashRule] { &self.rules }
    pub fn is_empty(&self) -> bool { self.rules.is_empty() }

    /// Every command is decidable: no rules at all (deny), or a catch-all rule exists.
    pub fn is_total(&self) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r.pattern.is_catch_all())
    }

    /// Rules that can never match because an earlier catch-all shadows them.
    pub fn unreachable(&self) -> &[BashRule] {
        match self.rules.iter().position(|r| r.pattern.is_catch_all()) {
            Some(i) => &self.rules[i + 1..],
            None => &[],
        }
    }

    pub fn evaluate(&self, command: &str) -> (Decision, Reason) {
        if self.rules.is_empty() {
            return (Decision::Deny, Reason::NoRules);
        }
        match self.rules.iter().find(|r| r.pattern.matches(command)) {
            Some(rule) => (rule.decision, Reason::MatchedRule { pattern: rule.pattern.as_str().to_string() }),
            None => (Decision::Deny, Reason::NoMatch),
        }
    }
}

impl Serialize for BashPolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.rules.len()))?;
        for r in &self.rules {
            map.serialize_entry(r.pattern.as_str(), &r.decision)?;
        }
        map.end()
    }
}

struct BashPolicyVisitor;

impl<'de> Visitor<'de> for BashPolicyVisitor {
    type Value = BashPolicy;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decision (allow|ask|deny) or an ordered mapping of command pattern to decision")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        let decision = v.parse::<Decision>().map_err(E::custom)?;
        BashPolicy::from_rules([("*", decision)]).map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> { Ok(BashPolicy::default()) }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
        let entries: ordered_map::OrderedMap<Decision> = ordered_map::from_map_access(map)?;
        BashPolicy::from_rules(entries.0.iter().map(|(p, d)| (p.as_str(), *d))).map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for BashPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(BashPolicyVisitor)
    }
}

/// Why a decision came out the way it did.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reason {
    /// The capability is switched off in the agent's `tools` table.
    ToolDisabled,
    /// Single-mode category with a configured decision.
    Mode,
    /// Single-mode category left unconfigured; the host must ask.
    Unconfigured,
    MatchedRule { pattern: String },
    /// Empty bash rule list.
    NoRules,
    /// Non-empty rule list with no match. Unreachable for validated policies.
    NoMatch,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PermissionCheck {
    pub decision: Decision,
    pub reason: Reason,
}

/// Per-category permission table of one agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webfetch: Option<Decision>,
    #[serde(skip_serializing_if = "BashPolicy::is_empty")]
    pub bash: BashPolicy,
}

impl PermissionPolicy {
    pub fn evaluate(&self, capability: Capability, action: &str) -> PermissionCheck {
        let single = |mode: Option<Decision>| match mode {
            Some(decision) => PermissionCheck { decision, reason: Reason::Mode },
            None => PermissionCheck { decision: Decision::Ask, reason: Reason::Unconfigured },
        };
        match capability {
            Capability::Edit | Capability::Write => single(self.edit),
            Capability::WebFetch => single(self.webfetch),
            Capability::Bash => {
                let (decision, reason) = self.bash.evaluate(action.trim());
                PermissionCheck { decision, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rust_dev_bash() -> BashPolicy {
        BashPolicy::from_rules([
            ("git status", Decision::Allow),
            ("git diff", Decision::Allow),
            ("git log*", Decision::Allow),
            ("*", Decision::Ask),
        ])
        .unwrap()
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let p = rust_dev_bash();
        assert_eq!(p.evaluate("git status").0, Decision::Allow);
        assert_eq!(p.evaluate("git log --oneline -5").0, Decision::Allow);
        assert_eq!(p.evaluate("cargo publish").0, Decision::Ask);
        assert_eq!(p.evaluate("git diff").1, Reason::MatchedRule { pattern: "git diff".into() });
    }

    #[test]
    fn exact_patterns_do_not_prefix_match() {
        let p = rust_dev_bash();
        let (d, reason) = p.evaluate("git status --porcelain");
        assert_eq!(d, Decision::Ask);
        assert_eq!(reason, Reason::MatchedRule { pattern: "*".into() });
    }

    #[test]
    fn broad_rule_before_narrow_rule_shadows_it() {
        let p = BashPolicy::from_rules([
            ("git *", Decision::Ask),
            ("git status", Decision::Allow),
            ("*", Decision::Deny),
        ])
        .unwrap();
        assert_eq!(p.evaluate("git status").0, Decision::Ask);
    }

    #[test]
    fn empty_rule_list_fails_closed() {
        let p = BashPolicy::default();
        assert!(p.is_total());
        assert_eq!(p.evaluate("ls"), (Decision::Deny, Reason::NoRules));
    }

    #[test]
    fn totality_requires_catch_all() {
        let p = BashPolicy::from_rules([("git status", Decision::Allow)]).unwrap();
        assert!(!p.is_total());
        assert!(rust_dev_bash().is_total());
    }

    #[test]
    fn rules_after_catch_all_are_unreachable() {
        let p = BashPolicy::from_rules([("*", Decision::Ask), ("ls", Decision::Allow)]).unwrap();
        assert_eq!(p.unreachable().len(), 1);
        assert_eq!(p.unreachable()[0].pattern.as_str(), "ls");
    }

    #[test]
    fn glob_metacharacters_other_than_star_are_literal() {
        let p = CommandPattern::new("rm -rf [a]*").unwrap();
        assert!(p.matches("rm -rf [a]/tmp"));
        assert!(!p.matches("rm -rf a/tmp"));
        let q = CommandPattern::new("echo ?").unwrap();
        assert!(q.matches("echo ?"));
        assert!(!q.matches("echo x"));
    }

    #[test]
    fn backslashes_are_literal() {
        let p = CommandPattern::new(r"grep a\d *").unwrap();
        assert!(p.matches(r"grep a\d file"));
        assert!(!p.matches("grep ad file"));
        let q = CommandPattern::new(r"printf '\n' *").unwrap();
        assert!(q.matches(r"printf '\n' out.txt"));
    }

    #[test]
    fn star_spans_slashes_and_spaces() {
        let p = CommandPattern::new("cat *.rs").unwrap();
        assert!(p.matches("cat src/main.rs"));
        assert!(p.matches("cat a b/c.rs"));
        assert!(!p.matches("cat src/main.toml"));
    }

    #[test]
    fn bash_shorthand_decision_is_a_catch_all() {
        let p: PermissionPolicy = serde_yml::from_str("bash: deny\nedit: allow\n").unwrap();
        assert_eq!(p.bash.rules().len(), 1);
        assert!(p.bash.rules()[0].pattern.is_catch_all());
        assert_eq!(p.evaluate(Capability::Bash, "anything").decision, Decision::Deny);
        assert_eq!(p.evaluate(Capability::Edit, "src/lib.rs").decision, Decision::Allow);
        assert_eq!(p.evaluate(Capability::Write, "new.rs").decision, Decision::Allow);
    }

    #[test]
    fn bash_mapping_keeps_yaml_order() {
        let yaml = "bash:\n  \"*\": ask\n  \"git status\": allow\n";
        let p: PermissionPolicy = serde_yml::from_str(yaml).unwrap();
        let patterns: Vec<_> = p.bash.rules().iter().map(|r| r.pattern.as_str()).collect();
        assert_eq!(patterns, ["*", "git status"]);
        assert_eq!(p.evaluate(Capability::Bash, "git status").decision, Decision::Ask);
    }

    #[test]
    fn unconfigured_single_mode_asks() {
        let p = PermissionPolicy::default();
        let check = p.evaluate(Capability::WebFetch, "https://docs.rs");
        assert_eq!(check, PermissionCheck { decision: Decision::Ask, reason: Reason::Unconfigured });
    }

    #[test]
    fn invalid_decision_is_rejected() {
        let err = serde_yml::from_str::<PermissionPolicy>("edit: maybe\n").unwrap_err();
        assert!(err.to_string().contains("maybe"), "{err}");
    }

    #[test]
    fn capability_parsing() {
        assert_eq!("Bash".parse::<Capability>().unwrap(), Capability::Bash);
        assert_eq!("webfetch".parse::<Capability>().unwrap(), Capability::WebFetch);
        assert!(matches!("network".parse::<Capability>(), Err(RegistryError::UnknownCapability(_))));
    }
}

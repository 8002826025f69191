//! Instrumentation rules
//!
//! A rule set is an ordered list of `pattern : action` entries plus default
//! options. The first rule whose pattern matches a method's qualified name
//! decides whether that method is instrumented; methods no rule matches are
//! left alone.
//!
//! Text formats, as sent over the wire:
//!
//! ```text
//! options:  -access:public -beanprops:on
//! rules:    app::db::*(*) : accept; app::*(*) : reject -access:private;
//! ```
//!
//! Patterns have the shape `class_glob::method_glob(args_glob)` and `*` matches
//! any run of characters.

use super::accessor::{is_accessor_like, Access, MethodSignature, Modifiers};
use crate::domain::RuleParseError;
use regex::Regex;
use std::fmt;

/// Options used when neither the rule nor the default options set a value
pub const BUILTIN_DEFAULT_OPTIONS: &str = "-access:public -beanprops:on";

/// Rule list that rejects everything, used to restore every class
pub const RESTORE_ALL_RULES: &str = "*(*):reject";

/// Regex source for a glob where `*` stands for any run of characters
fn glob_source(glob: &str) -> String {
    glob.split('*').map(regex::escape).collect::<Vec<_>>().join(".*")
}

fn compile(source: &str, pattern: &str) -> Result<Regex, RuleParseError> {
    Regex::new(source).map_err(|_| RuleParseError::InvalidPattern(pattern.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Accept => "accept",
            Action::Reject => "reject",
        })
    }
}

/// Options a rule may override
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleOptions {
    /// Least visible access that is still instrumented
    pub access: Option<Access>,
    /// Whether accessor-like methods are instrumented
    pub beanprops: Option<bool>,
}

impl RuleOptions {
    /// Parse whitespace separated `-key:value` tokens.
    ///
    /// # Errors
    /// `RuleParseError::InvalidOption` for unknown keys or values.
    pub fn parse(text: &str) -> Result<Self, RuleParseError> {
        let mut options = RuleOptions::default();
        for token in text.split_whitespace() {
            let invalid = || RuleParseError::InvalidOption(token.to_string());
            let (key, value) =
                token.strip_prefix('-').and_then(|t| t.split_once(':')).ok_or_else(invalid)?;
            match key.to_ascii_lowercase().as_str() {
                "access" => options.access = Some(value.parse().map_err(|_| invalid())?),
                "beanprops" => options.beanprops = Some(parse_switch(value).ok_or_else(invalid)?),
                _ => return Err(invalid()),
            }
        }
        Ok(options)
    }

    fn or(self, fallback: RuleOptions) -> RuleOptions {
        RuleOptions {
            access: self.access.or(fallback.access),
            beanprops: self.beanprops.or(fallback.beanprops),
        }
    }
}

impl fmt::Display for RuleOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(access) = self.access {
            write!(f, "-access:{access}")?;
            sep = " ";
        }
        if let Some(beanprops) = self.beanprops {
            write!(f, "{sep}-beanprops:{}", if beanprops { "on" } else { "off" })?;
        }
        Ok(())
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Some(true),
        "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    action: Action,
    options: RuleOptions,
    method_regex: Regex,
    class_regex: Regex,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
            && self.action == other.action
            && self.options == other.options
    }
}

impl Eq for Rule {}

impl Rule {
    /// # Errors
    /// `RuleParseError::InvalidPattern` unless the pattern reads `name(args)`.
    pub fn new(
        pattern: impl Into<String>,
        action: Action,
        options: RuleOptions,
    ) -> Result<Self, RuleParseError> {
        let pattern = pattern.into();
        let (head, _) = split_pattern(&pattern)?;

        // The last segment of the head globs the method name, the rest the
        // owning class. Classes are matched as `class::`.
        let class_source = match head.rsplit_once("::") {
            Some((owner, _)) => format!("^{}::.*$", glob_source(owner)),
            None => format!("^{}(::.*)?$", glob_source(head)),
        };
        let class_regex = compile(&class_source, &pattern)?;
        let method_regex = compile(&format!("^{}$", glob_source(&pattern)), &pattern)?;
        Ok(Self { pattern, action, options, method_regex, class_regex })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn action(&self) -> Action {
        self.action
    }

    /// Whether the qualified method name matches the whole pattern
    #[must_use]
    pub fn matches(&self, qualified_name: &str) -> bool {
        self.method_regex.is_match(qualified_name)
    }

    /// Whether methods of `class` can match the pattern
    #[must_use]
    pub fn matches_class(&self, class: &str) -> bool {
        self.class_regex.is_match(&format!("{class}::"))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.pattern, self.action)?;
        if self.options != RuleOptions::default() {
            write!(f, " {}", self.options)?;
        }
        Ok(())
    }
}

fn split_pattern(pattern: &str) -> Result<(&str, &str), RuleParseError> {
    let invalid = || RuleParseError::InvalidPattern(pattern.to_string());
    let open = pattern.find('(').filter(|&p| p > 0).ok_or_else(invalid)?;
    let close = pattern.rfind(')').filter(|&p| p > open).ok_or_else(invalid)?;
    Ok((&pattern[..open], &pattern[open..=close]))
}

/// Ordered rules with their default options.
#[derive(Debug, Clone)]
pub struct RuleSet {
    defaults: RuleOptions,
    rules: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self { defaults: builtin_defaults(), rules: Vec::new() }
    }
}

fn builtin_defaults() -> RuleOptions {
    RuleOptions { access: Some(Access::Public), beanprops: Some(true) }
}

impl RuleSet {
    /// Parse default options and a `;`-separated rule list.
    ///
    /// # Errors
    /// Any malformed option, pattern or action.
    pub fn parse(options: &str, rules: &str) -> Result<Self, RuleParseError> {
        let defaults = RuleOptions::parse(options)?.or(builtin_defaults());
        let rules = rules
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { defaults, rules })
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    #[must_use]
    pub fn defaults(&self) -> RuleOptions {
        self.defaults
    }

    /// Rule list in wire format
    #[must_use]
    pub fn rules_text(&self) -> String {
        self.rules.iter().map(|r| format!("{r}; ")).collect()
    }

    fn first_match(&self, qualified_name: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matches(qualified_name))
    }

    /// Whether a method with this qualified name, signature and modifiers
    /// should be instrumented
    #[must_use]
    pub fn accepts_method(
        &self,
        qualified_name: &str,
        signature: &MethodSignature,
        modifiers: Modifiers,
    ) -> bool {
        let Some(rule) = self.first_match(qualified_name) else {
            return false;
        };
        if rule.action == Action::Reject {
            return false;
        }
        let options = rule.options.or(self.defaults);
        if modifiers.access < options.access.unwrap_or(Access::Public) {
            return false;
        }
        options.beanprops.unwrap_or(true) || !is_accessor_like(signature, modifiers)
    }

    /// Whether the first rule whose class part can match methods of `class`
    /// accepts them
    #[must_use]
    pub fn accepts_class(&self, class: &str) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches_class(class))
            .is_some_and(|rule| rule.action == Action::Accept)
    }
}

fn parse_rule(entry: &str) -> Result<Rule, RuleParseError> {
    // The pattern may itself contain "::", so split on the last " : " or ':'
    // that follows the closing parenthesis.
    let close = entry.rfind(')').ok_or_else(|| RuleParseError::InvalidPattern(entry.to_string()))?;
    let (pattern, tail) = entry.split_at(close + 1);
    let tail = tail.trim_start();
    let tail = tail.strip_prefix(':').ok_or_else(|| RuleParseError::MissingAction(entry.to_string()))?;

    let mut words = tail.split_whitespace();
    let action = match words.next().map(str::to_ascii_lowercase).as_deref() {
        Some("accept") => Action::Accept,
        Some("reject") => Action::Reject,
        Some(other) => return Err(RuleParseError::InvalidAction(other.to_string())),
        None => return Err(RuleParseError::MissingAction(entry.to_string())),
    };
    let options = RuleOptions::parse(&words.collect::<Vec<_>>().join(" "))?;
    Rule::new(pattern.trim(), action, options)
}

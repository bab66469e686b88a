//! Declarative allow/deny rules matching packets by element path and
//! namespace.
//!
//! Rules are written as `[!]/name/name[namespace]`. A leading `!` makes the
//! rule a deny rule. An empty path (`[namespace]`) matches the root element by
//! namespace only, which is how stream-level negotiation elements such as
//! `<starttls/>` or `<auth/>` are described.
//!
//! ```text
//! /iq/query[jabber:iq:auth]      allow legacy auth queries
//! [urn:ietf:params:xml:ns:xmpp-sasl]
//! !/iq/query[jabber:iq:roster]   deny roster access
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::SmError;
use crate::packet::{ns, Packet};

/// A single allow or deny rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementMatcher {
    path: Vec<String>,
    xmlns: Option<String>,
    allow: bool,
}

impl ElementMatcher {
    pub fn new<S: AsRef<str>>(path: &[S], xmlns: Option<&str>, allow: bool) -> Self {
        Self {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            xmlns: xmlns.map(str::to_string),
            allow,
        }
    }

    /// Rule letting matching packets through.
    pub fn allow<S: AsRef<str>>(path: &[S], xmlns: &str) -> Self {
        Self::new(path, Some(xmlns), true)
    }

    /// Rule rejecting matching packets.
    pub fn deny<S: AsRef<str>>(path: &[S], xmlns: &str) -> Self {
        Self::new(path, Some(xmlns), false)
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn xmlns(&self) -> Option<&str> {
        self.xmlns.as_deref()
    }

    /// Verdict of this rule when it matches.
    pub fn is_allow(&self) -> bool {
        self.allow
    }

    /// Whether the packet has the described shape.
    pub fn matches(&self, packet: &Packet) -> bool {
        if self.path.is_empty() {
            return match &self.xmlns {
                Some(xmlns) => packet.element().ns() == *xmlns,
                None => true,
            };
        }
        match packet.element_at_path(&self.path) {
            Some(element) => match &self.xmlns {
                Some(xmlns) => element.ns() == *xmlns,
                None => true,
            },
            None => false,
        }
    }
}

impl FromStr for ElementMatcher {
    type Err = SmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (allow, rest) = match s.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, s),
        };

        let (path_part, xmlns) = match rest.find('[') {
            Some(start) => {
                let xmlns = rest[start + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| SmError::config(format!("unterminated namespace in '{}'", s)))?;
                (&rest[..start], Some(xmlns))
            }
            None => (rest, None),
        };

        let path: Vec<&str> = path_part.split('/').filter(|p| !p.is_empty()).collect();
        if path.is_empty() && xmlns.is_none() {
            return Err(SmError::config(format!("empty element matcher '{}'", s)));
        }

        Ok(Self::new(&path, xmlns.filter(|x| !x.is_empty()), allow))
    }
}

impl fmt::Display for ElementMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.allow {
            write!(f, "!")?;
        }
        for name in &self.path {
            write!(f, "/{}", name)?;
        }
        if let Some(xmlns) = &self.xmlns {
            write!(f, "[{}]", xmlns)?;
        }
        Ok(())
    }
}

/// Ordered rule list; the first matching rule decides, no match denies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherList {
    rules: Vec<ElementMatcher>,
}

impl MatcherList {
    pub fn new(rules: Vec<ElementMatcher>) -> Self {
        Self { rules }
    }

    /// Stream negotiation and account bootstrap allowed before authentication.
    pub fn pre_auth_defaults() -> Self {
        Self::new(vec![
            ElementMatcher::allow::<&str>(&[], ns::TLS),
            ElementMatcher::allow::<&str>(&[], ns::COMPRESS),
            ElementMatcher::allow::<&str>(&[], ns::SASL),
            ElementMatcher::allow::<&str>(&[], ns::SASL2),
            ElementMatcher::allow(&["iq", "query"], ns::IQ_REGISTER),
            ElementMatcher::allow(&["iq", "query"], ns::IQ_AUTH),
        ])
    }

    /// Parse rules from their textual form.
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self, SmError> {
        let rules = rules
            .iter()
            .map(|r| r.as_ref().parse())
            .collect::<Result<Vec<ElementMatcher>, SmError>>()?;
        Ok(Self::new(rules))
    }

    /// Rules are checked in order, so rules added here take precedence.
    pub fn prepend(&mut self, rules: MatcherList) {
        let mut combined = rules.rules;
        combined.append(&mut self.rules);
        self.rules = combined;
    }

    pub fn push(&mut self, rule: ElementMatcher) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ElementMatcher] {
        &self.rules
    }

    /// Verdict of the first matching rule, `false` when nothing matches.
    pub fn is_allowed(&self, packet: &Packet) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matches(packet))
            .map(ElementMatcher::is_allow)
            .unwrap_or(false)
    }
}

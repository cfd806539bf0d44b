//! Redirect policy.
//!
//! A policy is a hop budget plus a list of composable rules; every rule
//! must accept a hop for it to be followed. Exhausting the budget is an
//! error; a rule veto stops following and surfaces the redirect
//! response itself.

use http::StatusCode;
use url::Url;

/// One redirect hop under consideration.
#[derive(Debug)]
pub struct Attempt<'a> {
    pub status: StatusCode,
    /// The target of the Location header, already resolved.
    pub next: &'a Url,
    pub previous: &'a Url,
    /// Hops already followed for this request.
    pub chain_len: usize,
}

/// What a rule decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Follow,
    Stop,
}

/// A single predicate over an [`Attempt`].
#[derive(Clone)]
pub enum Rule {
    /// Follow only when the host is unchanged.
    SameHost,
    /// Follow only within the same registrable-ish domain (exact host
    /// or parent-domain match).
    SameDomain,
    /// Follow only to one of these hosts.
    AllowedHosts(Vec<String>),
    /// Follow only to these domains (or their subdomains).
    AllowedDomains(Vec<String>),
    /// Custom predicate.
    Custom(std::sync::Arc<dyn Fn(&Attempt<'_>) -> Action + Send + Sync>),
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameHost => f.write_str("SameHost"),
            Self::SameDomain => f.write_str("SameDomain"),
            Self::AllowedHosts(hosts) => f.debug_tuple("AllowedHosts").field(hosts).finish(),
            Self::AllowedDomains(domains) => {
                f.debug_tuple("AllowedDomains").field(domains).finish()
            }
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host.eq_ignore_ascii_case(domain)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
}

impl Rule {
    fn evaluate(&self, attempt: &Attempt<'_>) -> Action {
        let next_host = attempt.next.host_str().unwrap_or_default();
        let prev_host = attempt.previous.host_str().unwrap_or_default();
        match self {
            Self::SameHost => {
                if next_host.eq_ignore_ascii_case(prev_host) {
                    Action::Follow
                } else {
                    Action::Stop
                }
            }
            Self::SameDomain => {
                if next_host.eq_ignore_ascii_case(prev_host)
                    || domain_matches(next_host, prev_host)
                    || domain_matches(prev_host, next_host)
                {
                    Action::Follow
                } else {
                    Action::Stop
                }
            }
            Self::AllowedHosts(hosts) => {
                if hosts.iter().any(|h| h.eq_ignore_ascii_case(next_host)) {
                    Action::Follow
                } else {
                    Action::Stop
                }
            }
            Self::AllowedDomains(domains) => {
                if domains.iter().any(|d| domain_matches(next_host, d)) {
                    Action::Follow
                } else {
                    Action::Stop
                }
            }
            Self::Custom(rule) => rule(attempt),
        }
    }
}

/// The composed policy: a hop budget gated by rules.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    max_hops: usize,
    rules: Vec<Rule>,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::limited(10)
    }
}

impl RedirectPolicy {
    /// Follow up to `max_hops` redirects, unconditionally.
    #[must_use]
    pub fn limited(max_hops: usize) -> Self {
        Self {
            max_hops,
            rules: Vec::new(),
        }
    }

    /// Never follow a redirect.
    #[must_use]
    pub fn none() -> Self {
        Self::limited(0)
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub(crate) fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// All rules must agree to follow.
    pub(crate) fn evaluate(&self, attempt: &Attempt<'_>) -> Action {
        for rule in &self.rules {
            if rule.evaluate(attempt) == Action::Stop {
                tracing::debug!(
                    "redirect to {} vetoed by {:?}",
                    attempt.next,
                    rule
                );
                return Action::Stop;
            }
        }
        Action::Follow
    }
}

/// True for the statuses that trigger redirect handling at all.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt<'a>(next: &'a Url, previous: &'a Url) -> Attempt<'a> {
        Attempt {
            status: StatusCode::FOUND,
            next,
            previous,
            chain_len: 0,
        }
    }

    #[test]
    fn same_host_rule() {
        let prev = Url::parse("https://api.example.com/a").unwrap();
        let same = Url::parse("https://api.example.com/b").unwrap();
        let other = Url::parse("https://evil.example.net/b").unwrap();

        let policy = RedirectPolicy::limited(10).with_rule(Rule::SameHost);
        assert_eq!(policy.evaluate(&attempt(&same, &prev)), Action::Follow);
        assert_eq!(policy.evaluate(&attempt(&other, &prev)), Action::Stop);
    }

    #[test]
    fn domain_rules_cover_subdomains() {
        let prev = Url::parse("https://example.com/a").unwrap();
        let sub = Url::parse("https://cdn.example.com/b").unwrap();
        let outside = Url::parse("https://example.net/b").unwrap();

        let policy = RedirectPolicy::limited(10).with_rule(Rule::SameDomain);
        assert_eq!(policy.evaluate(&attempt(&sub, &prev)), Action::Follow);
        assert_eq!(policy.evaluate(&attempt(&outside, &prev)), Action::Stop);

        let allow =
            RedirectPolicy::limited(10).with_rule(Rule::AllowedDomains(vec!["example.com".into()]));
        assert_eq!(allow.evaluate(&attempt(&sub, &prev)), Action::Follow);
        assert_eq!(allow.evaluate(&attempt(&outside, &prev)), Action::Stop);
    }

    #[test]
    fn rules_compose_as_conjunction() {
        let prev = Url::parse("https://example.com/a").unwrap();
        let next = Url::parse("https://cdn.example.com/b").unwrap();

        let policy = RedirectPolicy::limited(10)
            .with_rule(Rule::SameDomain)
            .with_rule(Rule::AllowedHosts(vec!["other.host".into()]));
        assert_eq!(policy.evaluate(&attempt(&next, &prev)), Action::Stop);
    }

    #[test]
    fn redirect_statuses() {
        assert!(is_redirect(StatusCode::SEE_OTHER));
        assert!(is_redirect(StatusCode::PERMANENT_REDIRECT));
        assert!(!is_redirect(StatusCode::OK));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
    }
}

use regex::Regex;
use tracing::warn;

use crate::config::RuleSettings;

/// Port assumed for an upstream proxy when the rule names only a host.
const DEFAULT_UPSTREAM_PORT: u16 = 3128;

/// What to do with a flow once its host name is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Connect straight to the host on the flow's target port.
    Direct,
    /// Close the client connection without forwarding.
    Drop,
    /// Tunnel through an upstream HTTP CONNECT proxy.
    Proxy { host: String, port: u16 },
}

#[derive(Debug)]
struct Rule {
    // None when the pattern failed to compile; the rule is inert but keeps
    // its slot so later rules still apply in order.
    pattern: Option<Regex>,
    action: Action,
}

/// Ordered rule list with patterns compiled once at load. Shared read-only
/// across all connection handlers.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn compile(entries: &[RuleSettings]) -> Self {
        let rules = entries
            .iter()
            .map(|entry| {
                let pattern = match Regex::new(&entry.pattern) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        warn!("invalid rule pattern {:?}, rule disabled: {err}", entry.pattern);
                        None
                    }
                };
                Rule {
                    pattern,
                    action: parse_action(&entry.proxy),
                }
            })
            .collect();
        Self { rules }
    }

    /// First matching rule wins; no match falls through to Direct. Host
    /// names here may be plain IP strings (SNI-less fallback), which match
    /// like any other text.
    pub fn resolve(&self, host: &str) -> Action {
        for rule in &self.rules {
            if let Some(ref pattern) = rule.pattern {
                if pattern.is_match(host) {
                    return rule.action.clone();
                }
            }
        }
        Action::Direct
    }
}

fn parse_action(raw: &str) -> Action {
    match raw {
        "DIRECT" => Action::Direct,
        "DROP" => Action::Drop,
        upstream => {
            let (host, port) = parse_upstream_addr(upstream);
            Action::Proxy { host, port }
        }
    }
}

/// Split `host[:port]` on the last colon so bracketed IPv6 hosts survive
/// verbatim. An absent, non-numeric, or out-of-range port becomes 3128.
fn parse_upstream_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|&p| p != 0)
                .unwrap_or(DEFAULT_UPSTREAM_PORT);
            (host.to_string(), port)
        }
        None => (addr.to_string(), DEFAULT_UPSTREAM_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entries: &[(&str, &str)]) -> RuleSet {
        let entries: Vec<RuleSettings> = entries
            .iter()
            .map(|(pattern, proxy)| RuleSettings {
                pattern: pattern.to_string(),
                proxy: proxy.to_string(),
            })
            .collect();
        RuleSet::compile(&entries)
    }

    #[test]
    fn first_match_wins() {
        let set = rules(&[
            (r".*\.example\.com$", "DIRECT"),
            (r".*", "DROP"),
        ]);
        assert_eq!(set.resolve("api.example.com"), Action::Direct);
        assert_eq!(set.resolve("elsewhere.org"), Action::Drop);
    }

    #[test]
    fn no_match_falls_back_to_direct() {
        let set = rules(&[(r"^block\.me$", "DROP")]);
        assert_eq!(set.resolve("pass.me"), Action::Direct);
    }

    #[test]
    fn action_string_grammar() {
        let set = rules(&[
            ("^a$", "DIRECT"),
            ("^b$", "DROP"),
            ("^c$", "squid.internal"),
            ("^d$", "squid.internal:8080"),
            ("^e$", "squid.internal:notaport"),
            ("^f$", "squid.internal:0"),
            ("^g$", "squid.internal:"),
        ]);
        assert_eq!(set.resolve("a"), Action::Direct);
        assert_eq!(set.resolve("b"), Action::Drop);
        assert_eq!(
            set.resolve("c"),
            Action::Proxy { host: "squid.internal".into(), port: 3128 }
        );
        assert_eq!(
            set.resolve("d"),
            Action::Proxy { host: "squid.internal".into(), port: 8080 }
        );
        assert_eq!(
            set.resolve("e"),
            Action::Proxy { host: "squid.internal".into(), port: 3128 }
        );
        assert_eq!(
            set.resolve("f"),
            Action::Proxy { host: "squid.internal".into(), port: 3128 }
        );
        assert_eq!(
            set.resolve("g"),
            Action::Proxy { host: "squid.internal".into(), port: 3128 }
        );
    }

    #[test]
    fn direct_and_drop_are_case_sensitive() {
        let set = rules(&[("^a$", "direct")]);
        assert_eq!(
            set.resolve("a"),
            Action::Proxy { host: "direct".into(), port: 3128 }
        );
    }

    #[test]
    fn bracketed_ipv6_upstream_keeps_brackets() {
        let set = rules(&[(".*", "[::1]:8080")]);
        assert_eq!(
            set.resolve("anything"),
            Action::Proxy { host: "[::1]".into(), port: 8080 }
        );
    }

    #[test]
    fn invalid_pattern_is_skipped_not_fatal() {
        let set = rules(&[
            ("([unclosed", "DROP"),
            (".*", "DIRECT"),
        ]);
        assert_eq!(set.resolve("anything"), Action::Direct);
    }

    #[test]
    fn ip_strings_match_like_host_names() {
        let set = rules(&[
            (r"^192\.0\.2\.", "DIRECT"),
            (".*", "DROP"),
        ]);
        assert_eq!(set.resolve("192.0.2.7"), Action::Direct);
        assert_eq!(set.resolve("198.51.100.1"), Action::Drop);
    }
}

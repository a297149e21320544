// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The network access policy.
//!
//! Statements naming a recognized networking tool get their argument
//! lists scanned for endpoints (URLs, bare `host:port` pairs, and
//! port flags), and the extracted domains and ports are checked
//! against allow and block lists. The policy is conservative: the
//! default is deny, block lists always win, and when an allow list
//! is configured a line whose endpoints cannot be extracted is
//! denied because it cannot be verified.
//!
//! Lines that do not name a networking tool are none of this
//! module's business and always pass.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde_derive::Deserialize;
use shbox_protocol::{Error, ErrorCode, ShellCode};

use crate::parser::Statement;

/// The command names the policy applies to. Everything else is
/// allowed through untouched (and will fail lookup in the registry
/// unless an embedder registered it).
const NETWORK_COMMANDS: [&str; 12] = [
    "curl", "wget", "nc", "ncat", "telnet", "ssh", "scp", "sftp", "ftp", "ping", "dig",
    "nslookup",
];

lazy_static! {
    // scheme://[userinfo@]host[:port], with brackets for IPv6 hosts
    static ref URL_RE: Regex = Regex::new(
        r"^https?://(?:[^/@\s]+@)?(?P<host>\[[^\]]+\]|[^/:?#\s]+)(?::(?P<port>\d+))?"
    )
    .unwrap();
    // a bare host:port argument
    static ref HOST_PORT_RE: Regex =
        Regex::new(r"^(?P<host>\[[^\]]+\]|[A-Za-z0-9._-]+):(?P<port>\d+)$").unwrap();
    // --port=N / -p=N spellings; the space-separated forms are
    // handled by looking at argument pairs
    static ref PORT_FLAG_RE: Regex = Regex::new(r"^(?:-p|--port)=(?P<port>\d+)$").unwrap();
}

pub fn is_network_command(name: &str) -> bool {
    NETWORK_COMMANDS.contains(&name)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    #[default]
    Deny,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct NetworkPolicy {
    /// What happens when nothing else decides. Deny unless the
    /// config says otherwise.
    #[serde(rename = "default", default)]
    pub default_action: PolicyAction,
    #[serde(default)]
    pub allow_domains: BTreeSet<String>,
    #[serde(default)]
    pub block_domains: BTreeSet<String>,
    #[serde(default)]
    pub allow_ports: BTreeSet<u16>,
    #[serde(default)]
    pub block_ports: BTreeSet<u16>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Extracted {
    domains: Vec<String>,
    ports: Vec<u16>,
}

fn extract(args: &[String]) -> Extracted {
    let mut out = Extracted::default();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(caps) = URL_RE.captures(arg) {
            out.domains.push(strip_brackets(&caps["host"]));
            if let Some(port) = caps.name("port") {
                push_port(&mut out.ports, port.as_str());
            }
            continue;
        }
        if let Some(caps) = HOST_PORT_RE.captures(arg) {
            out.domains.push(strip_brackets(&caps["host"]));
            push_port(&mut out.ports, &caps["port"]);
            continue;
        }
        if let Some(caps) = PORT_FLAG_RE.captures(arg) {
            push_port(&mut out.ports, &caps["port"]);
            continue;
        }
        if arg == "-p" || arg == "--port" {
            if let Some(next) = iter.peek() {
                if next.chars().all(|c| c.is_ascii_digit()) && !next.is_empty() {
                    push_port(&mut out.ports, next);
                    iter.next();
                }
            }
        }
    }
    out
}

fn strip_brackets(host: &str) -> String {
    String::from(host.trim_start_matches('[').trim_end_matches(']'))
}

fn push_port(ports: &mut Vec<u16>, raw: &str) {
    // out of range ports are not a policy concern; the tool itself
    // will reject them
    if let Ok(port) = raw.parse::<u16>() {
        ports.push(port);
    }
}

impl NetworkPolicy {
    fn has_allow_lists(&self) -> bool {
        !self.allow_domains.is_empty() || !self.allow_ports.is_empty()
    }

    /// Decide whether one statement may run. First match wins:
    /// block lists, then unverifiable-under-allow-lists, then
    /// allow-list misses, then the default action.
    pub fn check(&self, line: &str, stmt: &Statement) -> Result<(), Error> {
        if !is_network_command(&stmt.command) {
            return Ok(());
        }

        let extracted = extract(&stmt.args);

        for domain in extracted.domains.iter() {
            if self.block_domains.contains(domain) {
                return Err(self.blocked(line, stmt, "domain", domain));
            }
        }
        for port in extracted.ports.iter() {
            if self.block_ports.contains(port) {
                return Err(self.blocked(line, stmt, "port", &port.to_string()));
            }
        }

        if self.has_allow_lists() {
            if extracted.domains.is_empty() && extracted.ports.is_empty() {
                return Err(Error::new(
                    ErrorCode::Shell(ShellCode::NetworkBlocked),
                    format!("network access blocked: no verifiable endpoint in {}", stmt.command),
                )
                .with("line", line)
                .with("command", stmt.command.as_str()));
            }
            if !self.allow_domains.is_empty() {
                for domain in extracted.domains.iter() {
                    if !self.allow_domains.contains(domain) {
                        return Err(self.blocked(line, stmt, "domain", domain));
                    }
                }
            }
            if !self.allow_ports.is_empty() {
                for port in extracted.ports.iter() {
                    if !self.allow_ports.contains(port) {
                        return Err(self.blocked(line, stmt, "port", &port.to_string()));
                    }
                }
            }
            return Ok(());
        }

        match self.default_action {
            PolicyAction::Allow => Ok(()),
            PolicyAction::Deny => Err(Error::new(
                ErrorCode::Shell(ShellCode::NetworkBlocked),
                format!("network access blocked: {} denied by default", stmt.command),
            )
            .with("line", line)
            .with("command", stmt.command.as_str())),
        }
    }

    fn blocked(&self, line: &str, stmt: &Statement, what: &str, value: &str) -> Error {
        Error::new(
            ErrorCode::Shell(ShellCode::NetworkBlocked),
            format!("network access blocked: {what} {value}"),
        )
        .with("line", line)
        .with("command", stmt.command.as_str())
        .with(what, value)
    }
}

//
// Unit Tests
//

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser;

    fn stmt(line: &str) -> Statement {
        parser::parse_single(line).unwrap()
    }

    fn allow_domains(domains: &[&str]) -> NetworkPolicy {
        NetworkPolicy {
            allow_domains: domains.iter().map(|d| String::from(*d)).collect(),
            ..NetworkPolicy::default()
        }
    }

    #[test]
    fn test_extract() {
        let cases = vec![
            ("curl https://example.com", vec!["example.com"], vec![]),
            ("curl http://example.com:8080/path", vec!["example.com"], vec![8080]),
            ("curl https://user:pw@example.com/x", vec!["example.com"], vec![]),
            ("curl https://[::1]:9000/", vec!["::1"], vec![9000]),
            ("nc example.com:4000", vec!["example.com"], vec![4000]),
            ("nc -p 4000 target", vec![], vec![4000]),
            ("nc --port=4000 target", vec![], vec![4000]),
            ("nc -p=4000 target", vec![], vec![4000]),
            ("ping somewhere", vec![], vec![]),
        ];
        for (line, want_domains, want_ports) in cases.into_iter() {
            let s = stmt(line);
            let got = extract(&s.args);
            assert_eq!(got.domains, want_domains, "domains for {line:?}");
            assert_eq!(got.ports, want_ports, "ports for {line:?}");
        }
    }

    #[test]
    fn test_default_deny_blocks_all_network_commands() {
        let policy = NetworkPolicy::default();
        for line in ["curl https://example.com", "wget http://x.dev", "ping host", "dig a.b"] {
            let err = policy.check(line, &stmt(line)).unwrap_err();
            assert_eq!(err.code, ErrorCode::Shell(ShellCode::NetworkBlocked), "{line:?}");
        }
    }

    #[test]
    fn test_non_network_commands_pass() {
        let policy = NetworkPolicy::default();
        for line in ["echo hello", "ls /", "cat /f"] {
            assert!(policy.check(line, &stmt(line)).is_ok(), "{line:?}");
        }
    }

    #[test]
    fn test_allow_domains_subset_allowed() {
        let policy = allow_domains(&["example.com", "docs.example.com"]);
        assert!(policy
            .check("curl https://example.com/x", &stmt("curl https://example.com/x"))
            .is_ok());
        assert!(policy
            .check(
                "scp file docs.example.com:22",
                &stmt("scp file docs.example.com:22")
            )
            .is_ok());
    }

    #[test]
    fn test_allow_domains_miss_denied() {
        let policy = allow_domains(&["example.com"]);
        let line = "curl https://evil.example";
        let err = policy.check(line, &stmt(line)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Shell(ShellCode::NetworkBlocked));
        assert_eq!(err.context.get("domain").map(String::as_str), Some("evil.example"));
        assert_eq!(err.context.get("line").map(String::as_str), Some(line));
    }

    #[test]
    fn test_allow_lists_require_verifiable_endpoint() {
        let policy = allow_domains(&["example.com"]);
        let line = "curl --mystery-flag";
        let err = policy.check(line, &stmt(line)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Shell(ShellCode::NetworkBlocked));
    }

    #[test]
    fn test_block_lists_always_win() {
        let mut policy = allow_domains(&["example.com"]);
        policy.block_domains.insert(String::from("example.com"));
        let line = "curl https://example.com";
        let err = policy.check(line, &stmt(line)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Shell(ShellCode::NetworkBlocked));

        let mut policy = NetworkPolicy {
            default_action: PolicyAction::Allow,
            ..NetworkPolicy::default()
        };
        policy.block_ports.insert(22);
        let line = "ssh host.dev:22";
        let err = policy.check(line, &stmt(line)).unwrap_err();
        assert_eq!(err.context.get("port").map(String::as_str), Some("22"));
    }

    #[test]
    fn test_default_allow_without_lists() {
        let policy = NetworkPolicy {
            default_action: PolicyAction::Allow,
            ..NetworkPolicy::default()
        };
        assert!(policy
            .check("curl https://anywhere.dev", &stmt("curl https://anywhere.dev"))
            .is_ok());
    }

    #[test]
    fn test_allow_ports() {
        let policy = NetworkPolicy {
            allow_ports: [443].into_iter().collect(),
            ..NetworkPolicy::default()
        };
        assert!(policy
            .check("curl https://x.dev:443", &stmt("curl https://x.dev:443"))
            .is_ok());
        let line = "curl https://x.dev:8443";
        assert!(policy.check(line, &stmt(line)).is_err());
    }
}

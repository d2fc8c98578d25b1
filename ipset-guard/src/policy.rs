//! Block/allow list decisions on top of ipset membership tests.
//!
//! A [`Guard`] resolves every configured set once at startup and then answers
//! one membership test per connection. What a failed test means is never
//! implicit: each rule carries a [`FailurePolicy`], defaulting to fail-open
//! for blacklists and fail-closed for whitelists.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;

use ipset_read::{Channel, Connector, IpSetError, Membership, RawConnector, SetHandle};

use crate::config::{Config, Rule};
use crate::error::{Error, Result};

/// Address probed right after resolving a set, to prove tests work.
const SELF_TEST_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// How a rule uses its set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// The guard does not filter
    Off,
    /// Deny addresses in the set
    Blacklist,
    /// Deny addresses not in the set
    Whitelist,
}

impl AccessMode {
    /// Blacklists fail open, whitelists fail closed.
    pub fn default_failure_policy(&self) -> FailurePolicy {
        match self {
            AccessMode::Off | AccessMode::Blacklist => FailurePolicy::Allow,
            AccessMode::Whitelist => FailurePolicy::Deny,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Off => write!(f, "off"),
            AccessMode::Blacklist => write!(f, "blacklist"),
            AccessMode::Whitelist => write!(f, "whitelist"),
        }
    }
}

/// Verdict for connections whose membership test failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Fail open
    Allow,
    /// Fail closed
    Deny,
}

/// The guard's answer for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Allow,
    Deny,
    /// The guard has no opinion (an IPv6 peer)
    Declined,
}

impl Verdict {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Verdict::Deny)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Deny => write!(f, "deny"),
            Verdict::Declined => write!(f, "declined"),
        }
    }
}

/// Map a membership outcome to a verdict.
///
/// `Off` allows regardless of the outcome.
pub fn decide(
    mode: AccessMode,
    outcome: &std::result::Result<Membership, IpSetError>,
    on_failure: FailurePolicy,
) -> Verdict {
    match (mode, outcome) {
        (AccessMode::Off, _) => Verdict::Allow,
        (_, Err(_)) => match on_failure {
            FailurePolicy::Allow => Verdict::Allow,
            FailurePolicy::Deny => Verdict::Deny,
        },
        (AccessMode::Blacklist, Ok(Membership::InSet))
        | (AccessMode::Whitelist, Ok(Membership::NotInSet)) => Verdict::Deny,
        (AccessMode::Blacklist, Ok(Membership::NotInSet))
        | (AccessMode::Whitelist, Ok(Membership::InSet)) => Verdict::Allow,
    }
}

#[derive(Debug, Clone)]
struct ResolvedRule {
    mode: AccessMode,
    set: Option<(String, SetHandle)>,
    on_failure: FailurePolicy,
}

/// Per-server access checks backed by one ipset channel.
pub struct Guard<C: Connector = RawConnector> {
    channel: Channel<C>,
    default: ResolvedRule,
    servers: HashMap<String, ResolvedRule>,
}

impl<C: Connector> Guard<C> {
    /// Resolve every set the configuration references and probe each one.
    ///
    /// Fails on the first set that cannot be resolved or tested, naming it.
    pub fn configure(mut channel: Channel<C>, config: &Config) -> Result<Self> {
        let mut handles: HashMap<String, SetHandle> = HashMap::new();

        let default = Self::resolve_rule(&mut channel, &mut handles, config.default_rule())?;
        let mut servers = HashMap::new();
        for (name, rule) in config.server_rules() {
            let resolved = Self::resolve_rule(&mut channel, &mut handles, rule)?;
            log::debug!("server {}: {}", name, describe_rule(&resolved));
            servers.insert(name.to_string(), resolved);
        }

        log::info!(
            "ipset guard configured: default {}, {} server rule(s), {} set(s)",
            describe_rule(&default),
            servers.len(),
            handles.len()
        );

        Ok(Self {
            channel,
            default,
            servers,
        })
    }

    fn resolve_rule(
        channel: &mut Channel<C>,
        handles: &mut HashMap<String, SetHandle>,
        rule: Rule,
    ) -> Result<ResolvedRule> {
        let set = match (rule.mode, rule.set) {
            (AccessMode::Off, _) | (_, None) => None,
            (_, Some(name)) => {
                let handle = match handles.get(&name) {
                    Some(handle) => *handle,
                    None => {
                        let handle = Self::resolve_and_probe(channel, &name)?;
                        handles.insert(name.clone(), handle);
                        handle
                    }
                };
                Some((name, handle))
            }
        };

        Ok(ResolvedRule {
            mode: if set.is_some() { rule.mode } else { AccessMode::Off },
            set,
            on_failure: rule.on_failure,
        })
    }

    fn resolve_and_probe(channel: &mut Channel<C>, name: &str) -> Result<SetHandle> {
        let handle = channel.resolve(name).map_err(|source| Error::Resolve {
            set: name.to_string(),
            source,
        })?;
        log::debug!("resolved ipset {} to {}", name, handle);

        channel
            .test(handle, SELF_TEST_ADDR)
            .map_err(|source| Error::SelfTest {
                set: name.to_string(),
                source,
            })?;

        Ok(handle)
    }

    /// Decide on a connection from `peer` to `server`.
    ///
    /// Servers without a rule of their own use the default rule. Rules in
    /// `off` mode allow without asking the kernel. IPv6 peers are declined:
    /// the kernel interface only tests IPv4 addresses.
    pub fn check(&mut self, server: Option<&str>, peer: IpAddr) -> Verdict {
        let rule = server
            .and_then(|name| self.servers.get(name))
            .unwrap_or(&self.default);

        let (set, handle) = match (&rule.set, rule.mode) {
            (Some((set, handle)), AccessMode::Blacklist | AccessMode::Whitelist) => (set, *handle),
            _ => return Verdict::Allow,
        };

        let addr = match peer {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return Verdict::Declined,
        };

        let outcome = self.channel.test(handle, addr);
        if let Err(e) = &outcome {
            log::warn!("failed to read {} {}: {}", rule.mode, set, e);
        }

        let verdict = decide(rule.mode, &outcome, rule.on_failure);
        if verdict.is_forbidden() {
            log::info!("access for {} forbidden by {} {}", addr, rule.mode, set);
        }
        verdict
    }

    /// Re-open the channel in a freshly forked worker.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.channel.reinitialize()?;
        Ok(())
    }

    pub fn channel(&mut self) -> &mut Channel<C> {
        &mut self.channel
    }
}

fn describe_rule(rule: &ResolvedRule) -> String {
    match &rule.set {
        Some((name, handle)) => format!("{} {} ({})", rule.mode, name, handle),
        None => rule.mode.to_string(),
    }
}

//! Filter-table chain topology and per-policy rule entries.
//!
//! The manager owns a fixed family of chains hanging off a single root that
//! `FORWARD` and `INPUT` jump into. Policy allow rules mark packets; the
//! drops chains reject whatever is still unmarked, and the root short-circuits
//! marked flows before they reach the drops.

pub mod error;

use crate::exec::CommandRunner;
use crate::metrics::DataplaneMetrics;
use crate::names::{hashed_name, ns_set};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, warn};

use self::error::FilterError;

pub const CHAIN_ROOT: &str = "AZURE-NPM";
pub const CHAIN_KUBE_SYSTEM: &str = "AZURE-NPM-KUBE-SYSTEM";
pub const CHAIN_INGRESS_PORT: &str = "AZURE-NPM-INGRESS-PORT";
pub const CHAIN_INGRESS_FROM: &str = "AZURE-NPM-INGRESS-FROM";
pub const CHAIN_INGRESS_DROPS: &str = "AZURE-NPM-INGRESS-DROPS";
pub const CHAIN_EGRESS_PORT: &str = "AZURE-NPM-EGRESS-PORT";
pub const CHAIN_EGRESS_TO: &str = "AZURE-NPM-EGRESS-TO";
pub const CHAIN_EGRESS_DROPS: &str = "AZURE-NPM-EGRESS-DROPS";

pub const OWNED_CHAINS: [&str; 8] = [
    CHAIN_ROOT,
    CHAIN_KUBE_SYSTEM,
    CHAIN_INGRESS_PORT,
    CHAIN_INGRESS_FROM,
    CHAIN_INGRESS_DROPS,
    CHAIN_EGRESS_PORT,
    CHAIN_EGRESS_TO,
    CHAIN_EGRESS_DROPS,
];

/// Packet marks used as intra-pipeline accept signals.
pub const MARK_INGRESS_ALLOW: &str = "0x2000";
pub const MARK_EGRESS_ALLOW: &str = "0x1000";
pub const MARK_ACCEPT: &str = "0x3000";

const ENTRY_CHAINS: [&str; 2] = ["FORWARD", "INPUT"];
const WAIT_SECONDS: &str = "60";

/// One match+action line destined for an owned chain. `specs` holds the
/// match tokens, the comment and the action, already split into argv tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub chain: &'static str,
    pub specs: Vec<String>,
}

impl RuleEntry {
    pub fn new(chain: &'static str, specs: Vec<String>) -> Self {
        Self { chain, specs }
    }
}

pub struct FilterManager {
    runner: Arc<dyn CommandRunner>,
    metrics: Arc<DataplaneMetrics>,
    chain_sizes: HashMap<&'static str, usize>,
    policies: HashMap<String, Vec<RuleEntry>>,
}

impl FilterManager {
    pub fn new(runner: Arc<dyn CommandRunner>, metrics: Arc<DataplaneMetrics>) -> Self {
        Self {
            runner,
            metrics,
            chain_sizes: HashMap::new(),
            policies: HashMap::new(),
        }
    }

    /// Build the chain topology. Run once per process, after the set sweep
    /// and after the `ns-kube-system` set exists.
    ///
    /// Every owned chain is created (or re-used) and flushed, the base rules
    /// are appended, and `FORWARD`/`INPUT` get a position-1 jump into the
    /// root unless one is already present.
    pub fn init(&mut self) -> Result<(), FilterError> {
        for chain in OWNED_CHAINS {
            self.ensure_chain(chain)?;
            self.run(vec!["-F".into(), chain.into()])?;
            self.chain_sizes.insert(chain, 0);
        }

        let kube_system_match = hashed_name(&ns_set("kube-system"));
        let base_rules: Vec<(&'static str, Vec<String>)> = vec![
            (CHAIN_ROOT, tokens(&["-m", "mark", "--mark", MARK_ACCEPT, "-j", "RETURN"])),
            (
                CHAIN_ROOT,
                tokens(&["-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"]),
            ),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_KUBE_SYSTEM])),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_INGRESS_PORT])),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_INGRESS_FROM])),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_INGRESS_DROPS])),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_EGRESS_PORT])),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_EGRESS_TO])),
            (CHAIN_ROOT, tokens(&["-j", CHAIN_EGRESS_DROPS])),
            (CHAIN_ROOT, tokens(&["-j", "ACCEPT"])),
            (
                CHAIN_KUBE_SYSTEM,
                tokens(&["-m", "set", "--match-set", &kube_system_match, "src", "-j", "ACCEPT"]),
            ),
            (
                CHAIN_KUBE_SYSTEM,
                tokens(&["-m", "set", "--match-set", &kube_system_match, "dst", "-j", "ACCEPT"]),
            ),
        ];
        for (chain, specs) in base_rules {
            let mut args = vec!["-A".to_string(), chain.to_string()];
            args.extend(specs);
            self.run(args)?;
            *self.chain_sizes.entry(chain).or_insert(0) += 1;
        }

        for entry_chain in ENTRY_CHAINS {
            self.ensure_jump(entry_chain)?;
        }
        Ok(())
    }

    /// Flush every owned chain and drop the entry jumps. Used before the set
    /// sweep at startup so no rule references a set about to be destroyed.
    pub fn reset(&mut self) -> Result<(), FilterError> {
        for entry_chain in ENTRY_CHAINS {
            let args = jump_check_args(entry_chain);
            if self.run(args).is_ok() {
                self.run(tokens(&["-D", entry_chain, "-j", CHAIN_ROOT]))?;
            }
        }
        for chain in OWNED_CHAINS {
            if let Err(e) = self.run(vec!["-F".into(), chain.into()]) {
                if !e.is_does_not_exist() {
                    return Err(e);
                }
            }
            self.chain_sizes.insert(chain, 0);
        }
        self.policies.clear();
        Ok(())
    }

    /// Install one policy's rule entries in translator order.
    ///
    /// Within a chain, the first entry ends up at the lowest position among
    /// this policy's entries. Any failure rolls back what was installed under
    /// this key.
    pub fn install_policy(
        &mut self,
        key: &str,
        entries: Vec<RuleEntry>,
    ) -> Result<(), FilterError> {
        let policy_start = Instant::now();
        let mut installed: Vec<RuleEntry> = Vec::with_capacity(entries.len());

        for entry in entries {
            let position = self.chain_sizes.get(entry.chain).copied().unwrap_or(0) + 1;
            let mut args = vec![
                "-I".to_string(),
                entry.chain.to_string(),
                position.to_string(),
            ];
            args.extend(entry.specs.iter().cloned());

            let rule_start = Instant::now();
            let result = self.run(args);
            self.metrics
                .add_iptables_rule_exec_time
                .observe(rule_start.elapsed().as_secs_f64() * 1000.0);

            if let Err(e) = result {
                error!(msg = "rule entry install failed, rolling back policy", policy = key, %e);
                for done in installed.iter().rev() {
                    self.delete_entry(done);
                }
                return Err(e);
            }
            *self.chain_sizes.entry(entry.chain).or_insert(0) += 1;
            self.metrics.num_iptables_rules.inc();
            installed.push(entry);
        }

        self.policies.insert(key.to_string(), installed);
        self.metrics
            .add_policy_exec_time
            .observe(policy_start.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Remove one policy's recorded entries, newest first. Unknown keys are
    /// no-ops; per-entry failures are retried once and then logged, so the
    /// bookkeeping is always cleared.
    pub fn uninstall_policy(&mut self, key: &str) {
        let Some(entries) = self.policies.remove(key) else {
            return;
        };
        for entry in entries.iter().rev() {
            self.delete_entry(entry);
        }
    }

    pub fn has_policy(&self, key: &str) -> bool {
        self.policies.contains_key(key)
    }

    pub fn installed(&self, key: &str) -> Option<&[RuleEntry]> {
        self.policies.get(key).map(Vec::as_slice)
    }

    pub fn chain_size(&self, chain: &str) -> usize {
        self.chain_sizes.get(chain).copied().unwrap_or(0)
    }

    fn delete_entry(&mut self, entry: &RuleEntry) {
        let mut args = vec!["-D".to_string(), entry.chain.to_string()];
        args.extend(entry.specs.iter().cloned());

        let outcome = match self.run(args.clone()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_does_not_exist() => {
                debug!(msg = "rule entry already gone", chain = entry.chain);
                Ok(())
            }
            Err(e) => {
                warn!(msg = "rule entry delete failed, retrying once", chain = entry.chain, %e);
                self.run(args)
            }
        };
        match outcome {
            Ok(()) => {
                if let Some(size) = self.chain_sizes.get_mut(entry.chain) {
                    *size = size.saturating_sub(1);
                }
                self.metrics.num_iptables_rules.dec();
            }
            Err(e) => {
                // rule still present in the kernel, the size counter keeps it
                error!(msg = "rule entry delete failed after retry", chain = entry.chain, %e);
            }
        }
    }

    fn ensure_chain(&self, chain: &str) -> Result<(), FilterError> {
        match self.run(vec!["-N".into(), chain.into()]) {
            Ok(()) => Ok(()),
            Err(e) if e.is_chain_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ensure_jump(&self, entry_chain: &str) -> Result<(), FilterError> {
        if self.run(jump_check_args(entry_chain)).is_ok() {
            return Ok(());
        }
        self.run(tokens(&["-I", entry_chain, "1", "-j", CHAIN_ROOT]))
    }

    fn run(&self, args: Vec<String>) -> Result<(), FilterError> {
        let mut argv = vec!["-w".to_string(), WAIT_SECONDS.to_string()];
        argv.extend(args.into_iter().filter(|token| !token.is_empty()));
        debug!(msg = "running iptables", argv = ?argv);

        let output = self.runner.run("iptables", &argv).map_err(|e| FilterError {
            argv: argv.clone(),
            exit_code: None,
            stderr: e.to_string(),
        })?;

        if output.status.success() {
            return Ok(());
        }
        Err(FilterError {
            argv,
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn jump_check_args(entry_chain: &str) -> Vec<String> {
    tokens(&["-C", entry_chain, "-j", CHAIN_ROOT])
}

//! Cache-backed manager for the kernel's named-set subsystem.
//!
//! The manager owns an in-memory mirror of every set created under the agent
//! prefix and is the sole mutator of that kernel state. Each mutation is one
//! `ipset` invocation; results are classified against [`error::ErrorKind`]
//! and idempotent outcomes are swallowed so reconciliations can replay.

pub mod error;

use crate::exec::CommandRunner;
use crate::metrics::{DataplaneMetrics, SetLabels};
use crate::names::{SET_PREFIX, hashed_name};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::error::{ErrorKind, IpsetError, Op};

/// Kind of a kernel named set, spelled the way `ipset -N` accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SetKind {
    #[default]
    #[serde(rename = "nethash")]
    NetHash,
    #[serde(rename = "hash:ip,port")]
    IpPortHash,
    #[serde(rename = "setlist")]
    SetList,
}

impl SetKind {
    pub fn flag(self) -> &'static str {
        match self {
            SetKind::NetHash => "nethash",
            SetKind::IpPortHash => "hash:ip,port",
            SetKind::SetList => "setlist",
        }
    }
}

/// Mirror of one kernel set.
///
/// `elements` maps each member to its context: the owning pod UID for IP
/// elements of pod-ownership sets, empty otherwise. The context is what lets
/// a late delete for a reused IP lose against the newer owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetEntry {
    pub kind: SetKind,
    pub elements: HashMap<String, String>,
    pub refcount: u32,
}

pub struct SetManager {
    runner: Arc<dyn CommandRunner>,
    metrics: Arc<DataplaneMetrics>,
    sets: HashMap<String, SetEntry>,
    lists: HashMap<String, SetEntry>,
}

impl SetManager {
    pub fn new(runner: Arc<dyn CommandRunner>, metrics: Arc<DataplaneMetrics>) -> Self {
        Self {
            runner,
            metrics,
            sets: HashMap::new(),
            lists: HashMap::new(),
        }
    }

    /// Mirror of all hash-kind sets, keyed by logical name.
    pub fn sets(&self) -> &HashMap<String, SetEntry> {
        &self.sets
    }

    /// Mirror of all set-of-sets, keyed by logical name.
    pub fn lists(&self) -> &HashMap<String, SetEntry> {
        &self.lists
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut SetEntry> {
        match self.sets.get_mut(name) {
            Some(entry) => Some(entry),
            None => self.lists.get_mut(name),
        }
    }

    /// Create a hash-kind set. No-op when already mirrored.
    pub fn create_set(&mut self, name: &str, kind: SetKind) -> Result<(), IpsetError> {
        if self.sets.contains_key(name) {
            return Ok(());
        }
        self.invoke(
            Op::Create,
            vec!["-exist".into(), hashed_name(name), kind.flag().into()],
        )?;
        self.sets.insert(name.to_string(), SetEntry {
            kind,
            ..SetEntry::default()
        });
        self.metrics.num_ipsets.inc();
        self.metrics
            .ipset_counts
            .get_or_create(&self.labels(name))
            .set(0);
        Ok(())
    }

    /// Create a set-of-sets. No-op when already mirrored.
    pub fn create_list(&mut self, name: &str) -> Result<(), IpsetError> {
        if self.lists.contains_key(name) {
            return Ok(());
        }
        self.invoke(
            Op::Create,
            vec![
                "-exist".into(),
                hashed_name(name),
                SetKind::SetList.flag().into(),
            ],
        )?;
        self.lists.insert(name.to_string(), SetEntry {
            kind: SetKind::SetList,
            ..SetEntry::default()
        });
        self.metrics.num_ipsets.inc();
        self.metrics
            .ipset_counts
            .get_or_create(&self.labels(name))
            .set(0);
        Ok(())
    }

    /// Destroy a hash-kind set regardless of remaining elements. No-op when
    /// not mirrored. On "in use by a kernel component" the mirror is kept and
    /// the error surfaces so the caller can retry on a later reconciliation.
    pub fn delete_set(&mut self, name: &str) -> Result<(), IpsetError> {
        if !self.sets.contains_key(name) {
            return Ok(());
        }
        self.invoke(Op::Destroy, vec![hashed_name(name)])?;
        // safe unwrap: checked above, invoke does not touch the mirror
        let entry = self.sets.remove(name).unwrap();
        self.drop_inventory(name, entry.elements.len());
        Ok(())
    }

    /// Destroy a set-of-sets. Same contract as [`Self::delete_set`].
    pub fn delete_list(&mut self, name: &str) -> Result<(), IpsetError> {
        if !self.lists.contains_key(name) {
            return Ok(());
        }
        self.invoke(Op::Destroy, vec![hashed_name(name)])?;
        // safe unwrap: checked above, invoke does not touch the mirror
        let entry = self.lists.remove(name).unwrap();
        self.drop_inventory(name, entry.elements.len());
        Ok(())
    }

    /// Add an element to a hash-kind set, creating the set on first use.
    ///
    /// `element` is a bare IP, an `ip,<proto>:<port>` tuple, or either
    /// followed by the `nomatch` exemption token. When the element is already
    /// mirrored under a different context, only the context is rewritten; the
    /// kernel already holds the element.
    pub fn add_to_set(
        &mut self,
        set: &str,
        element: &str,
        kind: SetKind,
        context: &str,
    ) -> Result<(), IpsetError> {
        if element.is_empty() || element.starts_with(',') {
            return Err(IpsetError::rejected(
                Op::Append,
                ErrorKind::MissingSecondMandatoryArgument,
                format!("refusing empty element for set {set}"),
            ));
        }
        self.create_set(set, kind)?;

        // safe unwrap: created above
        if let Some(existing) = self.sets.get(set).unwrap().elements.get(element) {
            if existing != context {
                info!(
                    msg = "element already present, rewriting ownership context",
                    set, element
                );
                self.sets
                    .get_mut(set)
                    .unwrap()
                    .elements
                    .insert(element.to_string(), context.to_string());
            }
            return Ok(());
        }

        let mut args = vec!["-exist".into(), hashed_name(set)];
        args.extend(element.split_whitespace().map(String::from));
        self.invoke(Op::Append, args)?;

        self.sets
            .get_mut(set)
            .unwrap()
            .elements
            .insert(element.to_string(), context.to_string());
        self.metrics.num_ipset_entries.inc();
        self.metrics
            .ipset_counts
            .get_or_create(&self.labels(set))
            .inc();
        Ok(())
    }

    /// Remove an element from a hash-kind set.
    ///
    /// Unknown sets and unmirrored elements are no-ops, as is a context
    /// mismatch: a stale delete for an IP that has since been re-owned must
    /// not remove the new owner's element. An emptied set with no remaining
    /// references is destroyed immediately.
    pub fn remove_from_set(
        &mut self,
        set: &str,
        element: &str,
        context: &str,
    ) -> Result<(), IpsetError> {
        let Some(entry) = self.sets.get(set) else {
            return Ok(());
        };
        let Some(mirrored) = entry.elements.get(element) else {
            return Ok(());
        };
        if mirrored != context {
            debug!(
                msg = "stale delete, element owned by another context",
                set, element
            );
            return Ok(());
        }

        let mut args = vec!["-exist".into(), hashed_name(set)];
        args.extend(element.split_whitespace().map(String::from));
        self.invoke(Op::Delete, args)?;

        let labels = self.labels(set);
        let entry = self.sets.get_mut(set).unwrap();
        entry.elements.remove(element);
        self.metrics.num_ipset_entries.dec();
        self.metrics.ipset_counts.get_or_create(&labels).dec();
        if entry.elements.is_empty() && entry.refcount == 0 {
            self.delete_set(set)?;
        }
        Ok(())
    }

    /// Add a member set to a set-of-sets, creating the list on first use.
    /// The member must already be mirrored; self-membership is refused.
    pub fn add_to_list(&mut self, list: &str, member: &str) -> Result<(), IpsetError> {
        if list == member {
            return Err(IpsetError::rejected(
                Op::Append,
                ErrorKind::MemberSetDoesNotExist,
                format!("refusing to add list {list} to itself"),
            ));
        }
        if !self.sets.contains_key(member) && !self.lists.contains_key(member) {
            return Err(IpsetError::rejected(
                Op::Append,
                ErrorKind::MemberSetDoesNotExist,
                format!("member set {member} of list {list} is not mirrored"),
            ));
        }
        self.create_list(list)?;

        let hashed_member = hashed_name(member);
        // safe unwrap: created above
        if self
            .lists
            .get(list)
            .unwrap()
            .elements
            .contains_key(&hashed_member)
        {
            return Ok(());
        }

        self.invoke(
            Op::Append,
            vec!["-exist".into(), hashed_name(list), hashed_member.clone()],
        )?;
        self.lists
            .get_mut(list)
            .unwrap()
            .elements
            .insert(hashed_member, String::new());
        self.metrics.num_ipset_entries.inc();
        self.metrics
            .ipset_counts
            .get_or_create(&self.labels(list))
            .inc();
        Ok(())
    }

    /// Remove a member set from a set-of-sets. An emptied list with no
    /// remaining references is destroyed immediately.
    pub fn remove_from_list(&mut self, list: &str, member: &str) -> Result<(), IpsetError> {
        let hashed_member = hashed_name(member);
        let Some(entry) = self.lists.get(list) else {
            return Ok(());
        };
        if !entry.elements.contains_key(&hashed_member) {
            return Ok(());
        }

        self.invoke(
            Op::Delete,
            vec!["-exist".into(), hashed_name(list), hashed_member.clone()],
        )?;

        let labels = self.labels(list);
        let entry = self.lists.get_mut(list).unwrap();
        entry.elements.remove(&hashed_member);
        self.metrics.num_ipset_entries.dec();
        self.metrics.ipset_counts.get_or_create(&labels).dec();
        if entry.elements.is_empty() && entry.refcount == 0 {
            self.delete_list(list)?;
        }
        Ok(())
    }

    /// Record a policy reference, creating the set on first reference.
    pub fn add_reference(&mut self, name: &str, kind: SetKind) -> Result<(), IpsetError> {
        match kind {
            SetKind::SetList => self.create_list(name)?,
            _ => self.create_set(name, kind)?,
        }
        // safe unwrap: created above
        self.entry_mut(name).unwrap().refcount += 1;
        Ok(())
    }

    /// Release a policy reference; the set is destroyed once the last
    /// reference is gone and no elements remain.
    pub fn remove_reference(&mut self, name: &str) -> Result<(), IpsetError> {
        let Some(entry) = self.entry_mut(name) else {
            return Ok(());
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 && entry.elements.is_empty() {
            if self.sets.contains_key(name) {
                self.delete_set(name)?;
            } else {
                self.delete_list(name)?;
            }
        }
        Ok(())
    }

    /// `ipset save -file <path>`. No mirror interaction.
    pub fn save(&self, path: &Path) -> Result<(), IpsetError> {
        self.invoke(
            Op::Save,
            vec!["-file".into(), path.display().to_string()],
        )
    }

    /// `ipset restore -file <path>`. No mirror interaction; reconciliation
    /// rebuilds the mirror from informer state.
    pub fn restore(&self, path: &Path) -> Result<(), IpsetError> {
        self.invoke(
            Op::Restore,
            vec!["-file".into(), path.display().to_string()],
        )
    }

    /// Flush and destroy every kernel set carrying the agent prefix.
    ///
    /// Used at process start to sweep leftovers of a previous agent. Per-set
    /// failures are logged and do not abort the sweep.
    pub fn destroy_all_prefixed(&mut self) -> Result<(), IpsetError> {
        let listing = self.invoke_capture(Op::List, Vec::new())?;
        let owned: Vec<String> = listing
            .lines()
            .filter_map(|line| line.strip_prefix("Name: "))
            .map(str::trim)
            .filter(|name| name.starts_with(SET_PREFIX))
            .map(String::from)
            .collect();

        for hashed in &owned {
            if let Err(e) = self.invoke(Op::Flush, vec![hashed.clone()]) {
                warn!(msg = "failed to flush leftover set", set = %hashed, %e);
            }
        }
        for hashed in &owned {
            if let Err(e) = self.invoke(Op::Destroy, vec![hashed.clone()]) {
                warn!(msg = "failed to destroy leftover set", set = %hashed, %e);
            }
        }
        self.sets.clear();
        self.lists.clear();
        Ok(())
    }

    fn labels(&self, name: &str) -> SetLabels {
        SetLabels {
            set_name: name.to_string(),
            set_hash: hashed_name(name),
        }
    }

    fn drop_inventory(&self, name: &str, element_count: usize) {
        self.metrics.num_ipsets.dec();
        self.metrics
            .num_ipset_entries
            .dec_by(element_count as i64);
        self.metrics.ipset_counts.remove(&self.labels(name));
    }

    fn invoke(&self, op: Op, trailing: Vec<String>) -> Result<(), IpsetError> {
        self.invoke_capture(op, trailing).map(|_| ())
    }

    fn invoke_capture(&self, op: Op, trailing: Vec<String>) -> Result<String, IpsetError> {
        let mut argv = vec![op.flag().to_string()];
        argv.extend(trailing.into_iter().filter(|token| !token.is_empty()));
        debug!(msg = "running ipset", op = %op, argv = ?argv);

        let start = Instant::now();
        let output = self.runner.run("ipset", &argv);
        self.metrics
            .add_ipset_exec_time
            .observe(start.elapsed().as_secs_f64() * 1000.0);

        let output = output.map_err(|e| IpsetError {
            kind: ErrorKind::Unknown,
            op,
            argv: argv.clone(),
            exit_code: None,
            stderr: e.to_string(),
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let kind = ErrorKind::classify(&stderr);
        let exit_code = output.status.code();
        if exit_code == Some(1) && kind.is_idempotent_success(op) {
            debug!(msg = "ipset already in requested state", op = %op, argv = ?argv);
            return Ok(String::new());
        }
        Err(IpsetError {
            kind,
            op,
            argv,
            exit_code,
            stderr,
        })
    }
}

use thiserror::Error;

/// Outcome of a failed `iptables` invocation.
#[derive(Debug, Error)]
#[error("iptables failed (exit {exit_code:?}): {stderr:?} (argv {argv:?})")]
pub struct FilterError {
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl FilterError {
    /// Deleting a rule or chain that is already gone is not a failure.
    pub fn is_does_not_exist(&self) -> bool {
        self.stderr.contains("does not exist")
            || self.stderr.contains("No chain/target/match by that name")
            || self.stderr.contains("Bad rule")
    }

    pub fn is_chain_exists(&self) -> bool {
        self.stderr.contains("Chain already exists")
    }
}

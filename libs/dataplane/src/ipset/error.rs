use std::fmt;

use thiserror::Error;

/// The `ipset` operation that was attempted, carried in every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Append,
    Delete,
    Destroy,
    Flush,
    Test,
    List,
    Save,
    Restore,
}

impl Op {
    /// Leading argv token for the operation.
    pub fn flag(self) -> &'static str {
        match self {
            Op::Create => "-N",
            Op::Append => "-A",
            Op::Delete => "-D",
            Op::Destroy => "-X",
            Op::Flush => "-F",
            Op::Test => "-T",
            Op::List => "-L",
            Op::Save => "save",
            Op::Restore => "restore",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Create => "create",
            Op::Append => "append",
            Op::Delete => "delete",
            Op::Destroy => "destroy",
            Op::Flush => "flush",
            Op::Test => "test",
            Op::List => "list",
            Op::Save => "save",
            Op::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Closed classification of `ipset` failures, decided by stderr substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SetCannotBeDestroyedInUse,
    ElemSeparatorNotSupported,
    SetWithGivenNameDoesNotExist,
    SecondElementIsMissing,
    MissingSecondMandatoryArgument,
    MaximalNumberOfSetsReached,
    SetWithSameNameAlreadyExists,
    MemberSetDoesNotExist,
    Unknown,
}

const CLASSIFIER_TABLE: &[(&str, ErrorKind)] = &[
    (
        "Set cannot be destroyed: it is in use by a kernel component",
        ErrorKind::SetCannotBeDestroyedInUse,
    ),
    (
        "Syntax error: Elem separator",
        ErrorKind::ElemSeparatorNotSupported,
    ),
    (
        "The set with the given name does not exist",
        ErrorKind::SetWithGivenNameDoesNotExist,
    ),
    (
        "Second element is missing from",
        ErrorKind::SecondElementIsMissing,
    ),
    (
        "Missing second mandatory argument to command",
        ErrorKind::MissingSecondMandatoryArgument,
    ),
    (
        "Kernel error received: maximal number of sets reached",
        ErrorKind::MaximalNumberOfSetsReached,
    ),
    (
        "Set cannot be created: set with the same name already exists",
        ErrorKind::SetWithSameNameAlreadyExists,
    ),
    (
        "Set to be added/deleted/tested as element does not exist",
        ErrorKind::MemberSetDoesNotExist,
    ),
];

impl ErrorKind {
    /// First matching substring wins; anything else is [`ErrorKind::Unknown`].
    pub fn classify(stderr: &str) -> Self {
        CLASSIFIER_TABLE
            .iter()
            .find(|(needle, _)| stderr.contains(needle))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Stable numeric code, kept for log and snapshot continuity.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::SetCannotBeDestroyedInUse => 1,
            ErrorKind::ElemSeparatorNotSupported => 2,
            ErrorKind::SetWithGivenNameDoesNotExist => 3,
            ErrorKind::SecondElementIsMissing => 4,
            ErrorKind::MissingSecondMandatoryArgument => 5,
            ErrorKind::MaximalNumberOfSetsReached => 6,
            ErrorKind::SetWithSameNameAlreadyExists => 7,
            ErrorKind::MemberSetDoesNotExist => 8,
            ErrorKind::Unknown => 999,
        }
    }

    /// Whether the failed operation is expected to succeed on a later
    /// reconciliation without any intervention.
    pub fn is_retriable(self, op: Op) -> bool {
        matches!(
            (self, op),
            (ErrorKind::SetCannotBeDestroyedInUse, Op::Destroy)
                | (
                    ErrorKind::MaximalNumberOfSetsReached,
                    Op::Create | Op::Append
                )
        )
    }

    /// Exit code 1 with these classifications means the kernel already is in
    /// the requested state.
    pub(crate) fn is_idempotent_success(self, op: Op) -> bool {
        matches!(
            (self, op),
            (ErrorKind::SetWithSameNameAlreadyExists, Op::Create)
                | (
                    ErrorKind::SetWithGivenNameDoesNotExist,
                    Op::Delete | Op::Destroy | Op::Flush
                )
        )
    }
}

/// Structured outcome of a failed `ipset` invocation.
#[derive(Debug, Error)]
#[error(
    "ipset {op} failed: {stderr:?} (classified {kind:?}/{code}, exit {exit_code:?}, argv {argv:?})",
    code = kind.code()
)]
pub struct IpsetError {
    pub kind: ErrorKind,
    pub op: Op,
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl IpsetError {
    /// Error raised before any kernel contact, for input the manager refuses
    /// to pass on.
    pub(crate) fn rejected(op: Op, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            argv: Vec::new(),
            exit_code: None,
            stderr: detail.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable(self.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case(
        "ipset v7.15: Set cannot be destroyed: it is in use by a kernel component",
        ErrorKind::SetCannotBeDestroyedInUse,
        1
    )]
    #[case("Syntax error: Elem separator", ErrorKind::ElemSeparatorNotSupported, 2)]
    #[case(
        "The set with the given name does not exist",
        ErrorKind::SetWithGivenNameDoesNotExist,
        3
    )]
    #[case(
        "Second element is missing from 1.2.3.4",
        ErrorKind::SecondElementIsMissing,
        4
    )]
    #[case(
        "Missing second mandatory argument to command add",
        ErrorKind::MissingSecondMandatoryArgument,
        5
    )]
    #[case(
        "Kernel error received: maximal number of sets reached, cannot create more",
        ErrorKind::MaximalNumberOfSetsReached,
        6
    )]
    #[case(
        "Set cannot be created: set with the same name already exists",
        ErrorKind::SetWithSameNameAlreadyExists,
        7
    )]
    #[case(
        "Set to be added/deleted/tested as element does not exist",
        ErrorKind::MemberSetDoesNotExist,
        8
    )]
    fn classifies_known_stderr(
        #[case] stderr: &str,
        #[case] expected: ErrorKind,
        #[case] code: u16,
    ) {
        let kind = ErrorKind::classify(stderr);
        assert_eq!(kind, expected);
        assert_eq!(kind.code(), code);
    }

    #[test]
    fn unmatched_stderr_is_unknown() {
        assert_eq!(
            ErrorKind::classify("some novel kernel complaint"),
            ErrorKind::Unknown
        );
        assert_eq!(ErrorKind::classify(""), ErrorKind::Unknown);
        assert_eq!(ErrorKind::Unknown.code(), 999);
    }

    #[test]
    fn retriability_is_keyed_by_operation() {
        assert!(
            ErrorKind::SetCannotBeDestroyedInUse.is_retriable(Op::Destroy)
        );
        assert!(!ErrorKind::SetCannotBeDestroyedInUse.is_retriable(Op::Create));
        assert!(ErrorKind::MaximalNumberOfSetsReached.is_retriable(Op::Create));
        assert!(!ErrorKind::ElemSeparatorNotSupported.is_retriable(Op::Append));
        assert!(!ErrorKind::Unknown.is_retriable(Op::Destroy));
    }

    #[test]
    fn idempotent_pairs() {
        assert!(ErrorKind::SetWithSameNameAlreadyExists.is_idempotent_success(Op::Create));
        assert!(ErrorKind::SetWithGivenNameDoesNotExist.is_idempotent_success(Op::Destroy));
        assert!(ErrorKind::SetWithGivenNameDoesNotExist.is_idempotent_success(Op::Delete));
        assert!(!ErrorKind::SetWithSameNameAlreadyExists.is_idempotent_success(Op::Append));
        assert!(!ErrorKind::Unknown.is_idempotent_success(Op::Create));
    }
}

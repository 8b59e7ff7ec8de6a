use std::fmt;

/// Machine-readable error codes for fatal and operator-facing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    InputNotFound,
    RevisionListUnreadable,
    UnknownMilestone,
    RevisionOutOfRange,
    NoBrowserBinary,
    BrowserSetupFailed,
    DriverProtocol,
    LockContention,
    OutputLocked,
    SnapshotWriteFailed,
    InternalUnexpected,
}

impl ErrorCode {
    pub const ALL: [Self; 12] = [
        Self::ConfigParseError,
        Self::InputNotFound,
        Self::RevisionListUnreadable,
        Self::UnknownMilestone,
        Self::RevisionOutOfRange,
        Self::NoBrowserBinary,
        Self::BrowserSetupFailed,
        Self::DriverProtocol,
        Self::LockContention,
        Self::OutputLocked,
        Self::SnapshotWriteFailed,
        Self::InternalUnexpected,
    ];

    /// Look up a code by its `E####` identifier.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Find the first `E####:` prefix in an error message.
    #[must_use]
    pub fn find_in(message: &str) -> Option<Self> {
        message
            .match_indices('E')
            .filter_map(|(at, _)| message.get(at..at + 5))
            .find_map(Self::from_code)
    }

    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::InputNotFound => "E1002",
            Self::RevisionListUnreadable => "E2001",
            Self::UnknownMilestone => "E2002",
            Self::RevisionOutOfRange => "E2003",
            Self::NoBrowserBinary => "E3001",
            Self::BrowserSetupFailed => "E3002",
            Self::DriverProtocol => "E3003",
            Self::LockContention => "E5001",
            Self::OutputLocked => "E5002",
            Self::SnapshotWriteFailed => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::InputNotFound => "Input directory not found",
            Self::RevisionListUnreadable => "Revision list unreadable",
            Self::UnknownMilestone => "Unknown browser milestone",
            Self::RevisionOutOfRange => "Revision outside the known revision list",
            Self::NoBrowserBinary => "No browser binary available",
            Self::BrowserSetupFailed => "Browser failed to start",
            Self::DriverProtocol => "Browser driver protocol error",
            Self::LockContention => "Lock contention",
            Self::OutputLocked => "Output directory in use",
            Self::SnapshotWriteFailed => "Queue snapshot write failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in metamong.toml and retry."),
            Self::InputNotFound => Some("Pass a directory containing seed .html test cases."),
            Self::RevisionListUnreadable => {
                Some("Point --revisions at a comma-separated list of build numbers.")
            }
            Self::UnknownMilestone => Some("Use a milestone covered by the built-in tables."),
            Self::RevisionOutOfRange => None,
            Self::NoBrowserBinary => {
                Some("Configure provisioning.fetch_command or populate provisioning.browser_dir.")
            }
            Self::BrowserSetupFailed => Some("Check the driver command and its logs."),
            Self::DriverProtocol => Some("Make sure the driver speaks the JSON-lines protocol."),
            Self::LockContention => Some("Transient; the operation is retried automatically."),
            Self::OutputLocked => Some("Wait for the other run to finish or pick another output."),
            Self::SnapshotWriteFailed => Some("Check disk space and write permissions."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ErrorCode::ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn codes_are_found_in_messages() {
        assert_eq!(ErrorCode::from_code("E3001"), Some(ErrorCode::NoBrowserBinary));
        assert_eq!(ErrorCode::from_code("E0000"), None);
        assert_eq!(
            ErrorCode::find_in("preflight: E3001: No browser binary available for revision 7"),
            Some(ErrorCode::NoBrowserBinary)
        );
        assert_eq!(ErrorCode::find_in("Everything failed"), None);
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::NoBrowserBinary.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }
}

use std::{
    error::Error,
    fmt::{self, Display},
    time::Duration,
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a corral-related operation.
pub type CorralResult<T> = Result<T, CorralError>;

/// An error that occurred while orchestrating the fleet.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// A record serialization/deserialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration document parse error.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// A malformed parameter or request field.
    #[error("validation error: {0}")]
    Validation(String),

    /// A machine description that failed one or more validation checks.
    #[error("machine spec validation failed: {}", .0.join("; "))]
    SpecValidation(Vec<String>),

    /// A fleet configuration that failed one or more consistency checks.
    #[error("config validation failed: {}", .0.join("; "))]
    ConfigValidation(Vec<String>),

    /// A duplicate name, port, or snapshot-graph cycle.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An operation attempted from a state the lifecycle machine forbids.
    #[error("vm '{name}' is {status}, cannot {operation}")]
    InvalidState {
        /// The name of the VM.
        name: String,
        /// The status the VM was in.
        status: String,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// System or owner capacity was insufficient to admit a request.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(QuotaExceededError),

    /// The address pool has no free addresses left.
    #[error("address pool exhausted for subnet {subnet}")]
    AddressPoolExhausted {
        /// The subnet whose pool is exhausted.
        subnet: String,
    },

    /// The hypervisor did not reach the expected state in time.
    #[error("vm '{name}' failed to boot: {reason}")]
    BootFailed {
        /// The name of the VM.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// An operation exceeded its deadline.
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The hypervisor process crashed or returned a protocol error.
    #[error("fatal hypervisor error: {0}")]
    FatalInfra(String),

    /// A host network command failed.
    #[error("host network command failed: `{command}`: {stderr}")]
    HostNetworkCommand {
        /// The command that failed.
        command: String,
        /// Captured stderr of the failed command.
        stderr: String,
    },

    /// A snapshot artifact no longer matches its recorded checksum.
    #[error("snapshot '{snapshot}' integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// The id of the snapshot.
        snapshot: String,
        /// The checksum recorded at capture time.
        expected: String,
        /// The checksum recomputed from the artifact.
        actual: String,
    },

    /// A VM lookup by name or id that matched nothing.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// A snapshot lookup by name or id that matched nothing.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

/// Details of a rejected admission request.
#[derive(Debug, Error)]
#[error("{scope} {resource} limit reached: requested {requested}, available {available}")]
pub struct QuotaExceededError {
    /// Whether the system pool or an owner's tier rejected the request.
    pub scope: QuotaScope,

    /// The resource that ran out.
    pub resource: &'static str,

    /// The amount requested.
    pub requested: u64,

    /// The amount still available at the rejecting scope.
    pub available: u64,
}

/// The scope at which an admission request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaScope {
    /// The system-wide capacity pool.
    System,

    /// A specific owner's quota tier.
    Owner(String),
}

/// The upward-facing code each error maps to.
///
/// Callers routing results over a network boundary use this instead of
/// matching on the full error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed parameters or machine description.
    Validation,

    /// Duplicate name, port, graph cycle, or forbidden state transition.
    Conflict,

    /// System or owner capacity insufficient.
    QuotaExceeded,

    /// Address pool exhausted.
    ResourceExhausted,

    /// Boot failure or exceeded deadline.
    BootFailure,

    /// Hypervisor process crash or protocol fault.
    FatalInfra,

    /// Snapshot checksum mismatch.
    Integrity,

    /// Unknown VM or snapshot.
    NotFound,

    /// An internal fault with no more specific code.
    Internal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CorralError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> CorralError {
        CorralError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Maps this error onto the upward-facing code taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            CorralError::Validation(_)
            | CorralError::SpecValidation(_)
            | CorralError::ConfigValidation(_) => ErrorCode::Validation,
            CorralError::Conflict(_) | CorralError::InvalidState { .. } => ErrorCode::Conflict,
            CorralError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            CorralError::AddressPoolExhausted { .. } => ErrorCode::ResourceExhausted,
            CorralError::BootFailed { .. } | CorralError::Timeout { .. } => ErrorCode::BootFailure,
            CorralError::FatalInfra(_) => ErrorCode::FatalInfra,
            CorralError::Integrity { .. } => ErrorCode::Integrity,
            CorralError::VmNotFound(_) | CorralError::SnapshotNotFound(_) => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `CorralResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> CorralResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

impl Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::System => write!(f, "system"),
            QuotaScope::Owner(owner) => write!(f, "owner '{}'", owner),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            CorralError::Validation("bad".into()).code(),
            ErrorCode::Validation
        );
        assert_eq!(
            CorralError::InvalidState {
                name: "vm1".into(),
                status: "running".into(),
                operation: "destroy",
            }
            .code(),
            ErrorCode::Conflict
        );
        assert_eq!(
            CorralError::AddressPoolExhausted {
                subnet: "10.1.0.0/24".into()
            }
            .code(),
            ErrorCode::ResourceExhausted
        );
        assert_eq!(
            CorralError::Timeout {
                operation: "boot",
                timeout: Duration::from_secs(10),
            }
            .code(),
            ErrorCode::BootFailure
        );
        assert_eq!(
            CorralError::Io(std::io::Error::other("disk gone")).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn test_quota_exceeded_display() {
        let err = CorralError::QuotaExceeded(QuotaExceededError {
            scope: QuotaScope::Owner("acme".into()),
            resource: "vcpus",
            requested: 8,
            available: 4,
        });
        let rendered = err.to_string();
        assert!(rendered.contains("owner 'acme'"));
        assert!(rendered.contains("requested 8"));
        assert!(rendered.contains("available 4"));
    }
}

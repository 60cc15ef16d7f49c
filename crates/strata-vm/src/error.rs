use strata_types::ReturnCode;
use thiserror::Error;

/// Errors raised by the host while executing contracts.
///
/// Most variants are contract-visible and end up as a [`ReturnCode`] on the
/// failing frame. The fatal ones (see [`VmError::is_fatal`]) mean the engine
/// itself is inconsistent and abort the whole transaction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("Out of gas: requested {requested}, remaining {remaining}")]
    OutOfGas { requested: u64, remaining: u64 },

    #[error("Gas ledger invariant violated: {0}")]
    GasLedgerInvariant(String),

    #[error("Invalid gas schedule: {0}")]
    InvalidGasSchedule(String),

    #[error("Contract invalid: {0}")]
    ContractInvalid(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Call depth exceeded: {depth}")]
    CallDepthExceeded { depth: usize },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Malformed call data: {0}")]
    MalformedCallData(String),

    #[error("Sync execution request is not in the same shard: {0}")]
    SyncCallCrossShard(String),

    #[error("Async call group not found: {0}")]
    AsyncGroupNotFound(String),

    #[error("Async call group '{0}' already has a callback")]
    GroupCallbackAlreadySet(String),

    #[error("Async context callback already set")]
    ContextCallbackAlreadySet,

    #[error("Async context is finalized")]
    AsyncContextFinalized,

    #[error("Async calls are not allowed in {0}")]
    AsyncNotAllowed(String),

    #[error("Multi-level async calls are not allowed")]
    AsyncNoMultiLevel,

    #[error("Invalid callback name: {0}")]
    InvalidCallbackName(String),

    #[error("No callback closure outside an async call callback")]
    NoCallbackForClosure,

    #[error("Storage key is protected")]
    ProtectedStorageKey,

    #[error("Builtin function failed: {0}")]
    BuiltinFunctionFailed(String),

    #[error("Corrupted async context: {0}")]
    CorruptedAsyncContext(String),

    #[error("Unknown async call: {0}")]
    UnknownAsyncCall(String),

    #[error("Blockchain hook error: {0}")]
    Blockchain(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Fatal errors abort the transaction without committing any output.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VmError::GasLedgerInvariant(_)
                | VmError::CorruptedAsyncContext(_)
                | VmError::UnknownAsyncCall(_)
                | VmError::Blockchain(_)
                | VmError::Internal(_)
        )
    }

    /// Return code reported for a frame that failed with this error.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            VmError::OutOfGas { .. } => ReturnCode::OutOfGas,
            VmError::FunctionNotFound(_) => ReturnCode::FunctionNotFound,
            VmError::ContractInvalid(_) => ReturnCode::ContractInvalid,
            VmError::CallDepthExceeded { .. } => ReturnCode::CallStackOverflow,
            VmError::InsufficientFunds(_) => ReturnCode::OutOfFunds,
            _ => ReturnCode::ExecutionFailed,
        }
    }
}

/// Error returned by contract code to the host.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    /// Explicit failure signaled by the contract.
    #[error("{0}")]
    UserError(String),

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl ExecutionError {
    pub fn user(message: impl Into<String>) -> Self {
        ExecutionError::UserError(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Vm(e) if e.is_fatal())
    }

    pub fn return_code(&self) -> ReturnCode {
        match self {
            ExecutionError::UserError(_) => ReturnCode::UserError,
            ExecutionError::Vm(e) => e.return_code(),
        }
    }
}

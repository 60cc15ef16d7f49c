//! Strata VM - contract host with synchronous and asynchronous calls.
//!
//! This crate provides:
//! - The transaction host driving contract code through an [`Executor`]
//! - Gas schedule and per-frame gas ledgers with locked callback gas
//! - Async call contexts, grouped callbacks and their persistence
//! - Cross-shard transfers carrying async calls and their callbacks
//! - Call graphs describing expected execution order
//! - In-memory mocks of the blockchain and the executor (`mock` feature)

pub mod async_call;
pub mod async_context;
pub mod call_args;
pub mod call_graph;
pub mod call_stack;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gas_metering;
mod hooks;
pub mod host;
pub mod interface;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod output;
mod resolver;
pub mod runtime;
pub mod telemetry;
pub mod transfer;

pub use async_call::{AsyncCall, AsyncCallGroup, AsyncCallStatus, AsyncExecutionMode, CallbackInfo};
pub use async_context::AsyncContext;
pub use call_graph::{CallGraph, CallGraphError, NodeId};
pub use config::HostConfig;
pub use dispatcher::ShardCoordinator;
pub use error::{ExecutionError, VmError};
pub use gas_metering::{GasLedger, GasSchedule, GasTable};
pub use host::{CallIsolation, VmHost};
pub use interface::{
    AsyncCallRequest, BlockchainHook, Executor, Instance, SyncCallRequest, SyncCallResult, UserAccount, VmHooks,
};
pub use runtime::{
    AsyncArguments, ContractCallInput, ContractCreateInput, LogEntry, OutputAccount, OutputTransfer, VmInput,
    VmOutput,
};

/// VM version constant
pub const VM_VERSION: u32 = 1;

/// Maximum depth of the call stack, counting the top frame
pub const MAX_CALL_DEPTH: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_constants() {
        assert_eq!(VM_VERSION, 1);
        assert_eq!(MAX_CALL_DEPTH, 64);
        assert_eq!(HostConfig::default().max_call_depth, MAX_CALL_DEPTH);
    }
}

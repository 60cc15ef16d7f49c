//! Seams between the host and its collaborators: the contract executor,
//! the blockchain state layer, and the host API offered to contract code.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use strata_types::{Address, CallType, Hash, ReturnCode};

use crate::error::{ExecutionError, VmError};
use crate::runtime::{ContractCallInput, OutputAccount, VmOutput};

/// Account state as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserAccount {
    pub address: Address,
    pub balance: BigUint,
    pub nonce: u64,
    pub code: Option<Vec<u8>>,
}

/// Read access to world state plus builtin functions.
pub trait BlockchainHook {
    fn get_user_account(&self, address: &Address) -> Option<UserAccount>;

    fn get_code(&self, address: &Address) -> Option<Vec<u8>> {
        self.get_user_account(address).and_then(|account| account.code)
    }

    /// Committed storage value; empty when absent.
    fn get_storage(&self, address: &Address, key: &[u8]) -> Vec<u8>;

    fn is_builtin_function(&self, function: &str) -> bool;

    /// Run a builtin function. `Err` is a contract-visible failure.
    fn process_builtin_function(&self, input: &ContractCallInput) -> Result<VmOutput, VmError>;

    fn new_address(&self, creator: &Address, nonce: u64) -> Address;

    /// Apply the output accounts of a finished transaction.
    fn update_accounts(&mut self, accounts: &BTreeMap<Address, OutputAccount>) -> Result<(), VmError>;
}

/// A loaded contract ready to run functions.
pub trait Instance {
    fn exported_functions(&self) -> Vec<String>;

    fn call_function(&mut self, function: &str, hooks: &mut dyn VmHooks) -> Result<(), ExecutionError>;

    /// Opcode gas budget for the next call.
    fn set_points_limit(&mut self, limit: u64);

    /// Opcode gas consumed by the last call.
    fn points_used(&self) -> u64;
}

/// Turns contract code into instances.
pub trait Executor {
    /// Rejected code is reported as [`VmError::ContractInvalid`].
    fn new_instance(&self, code: &[u8]) -> Result<Box<dyn Instance>, VmError>;
}

/// Synchronous nested call requested by contract code.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncCallRequest {
    pub destination: Address,
    pub function: String,
    pub arguments: Vec<Vec<u8>>,
    pub value: BigUint,
    pub gas_limit: u64,
}

impl SyncCallRequest {
    pub fn new(destination: Address, function: impl Into<String>, gas_limit: u64) -> Self {
        Self {
            destination,
            function: function.into(),
            gas_limit,
            ..Self::default()
        }
    }
}

/// Result of a synchronous nested call, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncCallResult {
    pub return_code: ReturnCode,
    pub return_data: Vec<Vec<u8>>,
    pub return_message: String,
}

/// Async call requested by contract code.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AsyncCallRequest {
    pub destination: Address,
    pub function: String,
    pub arguments: Vec<Vec<u8>>,
    pub value: BigUint,
    pub gas_limit: u64,
    /// Gas locked for the callback on top of the mandatory extra lock.
    pub extra_gas_for_callback: u64,
    pub success_callback: String,
    pub error_callback: String,
    /// Returned by [`VmHooks::callback_closure`] inside the callback.
    pub callback_closure: Vec<u8>,
}

impl AsyncCallRequest {
    pub fn new(destination: Address, function: impl Into<String>, gas_limit: u64) -> Self {
        Self {
            destination,
            function: function.into(),
            gas_limit,
            ..Self::default()
        }
    }
}

/// Host API available to contract code while it runs.
pub trait VmHooks {
    fn use_gas(&mut self, amount: u64) -> Result<(), ExecutionError>;
    fn gas_left(&self) -> u64;

    fn context_address(&self) -> Address;
    fn caller(&self) -> Address;
    fn call_value(&self) -> BigUint;
    fn arguments(&self) -> Vec<Vec<u8>>;
    fn function(&self) -> String;
    fn call_type(&self) -> CallType;

    fn finish(&mut self, data: &[u8]) -> Result<(), ExecutionError>;
    fn write_log(&mut self, topics: &[Vec<u8>], data: &[u8]) -> Result<(), ExecutionError>;
    fn storage_store(&mut self, key: &[u8], value: &[u8]) -> Result<(), ExecutionError>;
    fn storage_load(&mut self, key: &[u8]) -> Result<Vec<u8>, ExecutionError>;
    fn transfer_value(&mut self, destination: &Address, value: &BigUint, data: &[u8]) -> Result<(), ExecutionError>;

    /// Run `destination` with its own storage context.
    fn execute_on_dest_context(&mut self, request: SyncCallRequest) -> Result<SyncCallResult, ExecutionError>;
    /// Run the code of `destination` against the caller's storage context.
    fn execute_on_same_context(&mut self, request: SyncCallRequest) -> Result<SyncCallResult, ExecutionError>;

    /// Register an async call in `group_id`; returns the new call id.
    fn register_async_call(&mut self, group_id: &str, request: AsyncCallRequest) -> Result<Hash, ExecutionError>;
    fn set_group_callback(&mut self, group_id: &str, callback: &str, data: &[u8], gas: u64) -> Result<(), ExecutionError>;
    fn set_context_callback(&mut self, callback: &str, data: &[u8], gas: u64) -> Result<(), ExecutionError>;
    /// Closure registered with the async call this callback answers. Fails
    /// in any other frame, group and context callbacks included.
    fn callback_closure(&mut self) -> Result<Vec<u8>, ExecutionError>;
}

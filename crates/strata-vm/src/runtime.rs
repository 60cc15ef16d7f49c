//! Inputs and outputs exchanged between the host and its callers.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use num_bigint::{BigInt, BigUint};
use strata_types::{Address, CallType, Hash, ReturnCode};

/// Correlation data carried by async calls and their callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct AsyncArguments {
    /// Identifier of the call being executed.
    pub call_id: Hash,
    /// Identifier of the context (or call) that issued it.
    pub caller_call_id: Hash,
    /// For callbacks: the context that registered the original async call.
    pub callback_initiator_call_id: Option<Hash>,
}

/// Fields common to calls and deployments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmInput {
    pub caller: Address,
    pub arguments: Vec<Vec<u8>>,
    pub call_value: BigUint,
    pub call_type: CallType,
    pub gas_provided: u64,
    /// Gas reserved for a callback. Only spendable by callback frames.
    pub gas_locked: u64,
    pub original_tx_hash: Hash,
    pub current_tx_hash: Hash,
    pub async_arguments: Option<AsyncArguments>,
}

/// Input for calling a function of a deployed contract.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContractCallInput {
    pub vm_input: VmInput,
    pub recipient: Address,
    pub function: String,
}

impl ContractCallInput {
    /// Direct call with no arguments and no value.
    pub fn new(caller: Address, recipient: Address, function: impl Into<String>, gas_provided: u64) -> Self {
        Self {
            vm_input: VmInput {
                caller,
                gas_provided,
                ..VmInput::default()
            },
            recipient,
            function: function.into(),
        }
    }
}

/// Input for deploying a new contract.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContractCreateInput {
    pub vm_input: VmInput,
    pub code: Vec<u8>,
}

/// A single log entry (event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Contract address that emitted the log
    pub address: Address,
    /// Topics (event identifier first)
    pub topics: Vec<Vec<u8>>,
    /// Non-indexed payload
    pub data: Vec<u8>,
}

/// Value, data and gas moving to another account as part of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTransfer {
    pub sender: Address,
    pub receiver: Address,
    pub value: BigUint,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_locked: u64,
    pub call_type: CallType,
    pub async_arguments: Option<AsyncArguments>,
}

/// Changes to one account produced by an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputAccount {
    pub address: Address,
    pub balance_delta: BigInt,
    /// Empty value means deletion.
    pub storage_updates: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Set for freshly deployed contracts.
    pub code: Option<Vec<u8>>,
    /// Transfers received by this account, in emission order.
    pub output_transfers: Vec<OutputTransfer>,
}

impl OutputAccount {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance_delta: BigInt::default(),
            storage_updates: BTreeMap::new(),
            code: None,
            output_transfers: Vec::new(),
        }
    }
}

/// Result of one top-level host invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmOutput {
    pub return_data: Vec<Vec<u8>>,
    pub return_code: ReturnCode,
    pub return_message: String,
    pub gas_remaining: u64,
    pub output_accounts: BTreeMap<Address, OutputAccount>,
    pub logs: Vec<LogEntry>,
}

impl VmOutput {
    /// Output carrying only a failure.
    pub fn failure(return_code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            return_code,
            return_message: message.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.return_code.is_ok()
    }

    /// All transfers, ordered by receiver then emission.
    pub fn transfers(&self) -> impl Iterator<Item = &OutputTransfer> {
        self.output_accounts
            .values()
            .flat_map(|account| account.output_transfers.iter())
    }

    pub fn balance_delta(&self, address: &Address) -> BigInt {
        self.output_accounts
            .get(address)
            .map(|account| account.balance_delta.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_input_defaults() {
        let caller = Address::derive(b"user", 0);
        let recipient = Address::derive(b"contract", 0);
        let input = ContractCallInput::new(caller, recipient, "run", 1_000);
        assert_eq!(input.vm_input.call_type, CallType::DirectCall);
        assert_eq!(input.vm_input.gas_provided, 1_000);
        assert_eq!(input.vm_input.gas_locked, 0);
        assert_eq!(input.function, "run");
    }

    #[test]
    fn test_failure_output() {
        let output = VmOutput::failure(ReturnCode::OutOfGas, "not enough gas");
        assert!(!output.is_success());
        assert!(output.output_accounts.is_empty());
        assert_eq!(output.gas_remaining, 0);
    }

    #[test]
    fn test_transfers_iterate_all_accounts() {
        let a = Address::derive(b"a", 0);
        let b = Address::derive(b"b", 0);
        let transfer = |receiver| OutputTransfer {
            sender: a,
            receiver,
            value: BigUint::from(1u8),
            data: vec![],
            gas_limit: 0,
            gas_locked: 0,
            call_type: CallType::DirectCall,
            async_arguments: None,
        };
        let mut output = VmOutput::default();
        for receiver in [a, b] {
            let mut account = OutputAccount::new(receiver);
            account.output_transfers.push(transfer(receiver));
            output.output_accounts.insert(receiver, account);
        }
        assert_eq!(output.transfers().count(), 2);
        assert_eq!(output.balance_delta(&a), BigInt::default());
    }
}

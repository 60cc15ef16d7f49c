//! Accumulated effects of a transaction.
//!
//! Frames push a snapshot on entry; a successful frame merges into its
//! parent, a failed one is discarded so none of its effects (or those of
//! its children) survive.

use std::collections::BTreeMap;

use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use strata_types::{Address, ReturnCode};

use crate::error::VmError;
use crate::runtime::{LogEntry, OutputAccount, OutputTransfer, VmOutput};

#[derive(Debug, Clone, Default)]
struct OutputState {
    accounts: BTreeMap<Address, OutputAccount>,
    logs: Vec<LogEntry>,
    return_data: Vec<Vec<u8>>,
    /// First callback failure; overrides a successful return code.
    failure: Option<(ReturnCode, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputContext {
    state: OutputState,
    snapshots: Vec<OutputState>,
}

impl OutputContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state = OutputState::default();
        self.snapshots.clear();
    }

    pub fn push_state(&mut self) {
        self.snapshots.push(self.state.clone());
    }

    /// Keep the effects since the last push. Returns the return data
    /// produced since then.
    pub fn pop_merge(&mut self) -> Result<Vec<Vec<u8>>, VmError> {
        let snapshot = self
            .snapshots
            .pop()
            .ok_or_else(|| VmError::Internal("output snapshot stack is empty".to_string()))?;
        Ok(self.state.return_data[snapshot.return_data.len()..].to_vec())
    }

    /// Drop the effects since the last push.
    pub fn pop_discard(&mut self) -> Result<(), VmError> {
        self.state = self
            .snapshots
            .pop()
            .ok_or_else(|| VmError::Internal("output snapshot stack is empty".to_string()))?;
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.snapshots.len()
    }

    fn account_mut(&mut self, address: Address) -> &mut OutputAccount {
        self.state
            .accounts
            .entry(address)
            .or_insert_with(|| OutputAccount::new(address))
    }

    pub fn account(&self, address: &Address) -> Option<&OutputAccount> {
        self.state.accounts.get(address)
    }

    pub fn finish(&mut self, data: Vec<u8>) {
        self.state.return_data.push(data);
    }

    pub fn write_log(&mut self, entry: LogEntry) {
        self.state.logs.push(entry);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.state.logs
    }

    pub fn storage_update(&mut self, address: Address, key: Vec<u8>, value: Vec<u8>) {
        self.account_mut(address).storage_updates.insert(key, value);
    }

    /// Value written earlier in this transaction, if any.
    pub fn storage_value(&self, address: &Address, key: &[u8]) -> Option<&Vec<u8>> {
        self.state
            .accounts
            .get(address)
            .and_then(|account| account.storage_updates.get(key))
    }

    pub fn balance_delta(&self, address: &Address) -> BigInt {
        self.state
            .accounts
            .get(address)
            .map(|account| account.balance_delta.clone())
            .unwrap_or_default()
    }

    pub fn credit(&mut self, address: Address, value: &BigUint) {
        if value.is_zero() {
            return;
        }
        self.account_mut(address).balance_delta += BigInt::from(value.clone());
    }

    pub fn debit(&mut self, address: Address, value: &BigUint) {
        if value.is_zero() {
            return;
        }
        self.account_mut(address).balance_delta -= BigInt::from(value.clone());
    }

    /// Record a transfer on its receiver's account.
    pub fn add_transfer(&mut self, transfer: OutputTransfer) {
        self.account_mut(transfer.receiver).output_transfers.push(transfer);
    }

    pub fn deploy(&mut self, address: Address, code: Vec<u8>) {
        self.account_mut(address).code = Some(code);
    }

    /// Fold the output of a builtin function into the current state.
    pub fn merge_vm_output(&mut self, output: &VmOutput) {
        for (address, account) in &output.output_accounts {
            let target = self.account_mut(*address);
            target.balance_delta += &account.balance_delta;
            for (key, value) in &account.storage_updates {
                target.storage_updates.insert(key.clone(), value.clone());
            }
            if account.code.is_some() {
                target.code = account.code.clone();
            }
            target.output_transfers.extend(account.output_transfers.iter().cloned());
        }
        self.state.logs.extend(output.logs.iter().cloned());
        self.state.return_data.extend(output.return_data.iter().cloned());
    }

    /// Mark the transaction as failed by a callback. The first failure wins.
    pub fn mark_failure(&mut self, return_code: ReturnCode, message: impl Into<String>) {
        if self.state.failure.is_none() {
            self.state.failure = Some((return_code, message.into()));
        }
    }

    pub fn failure(&self) -> Option<&(ReturnCode, String)> {
        self.state.failure.as_ref()
    }

    /// Move the accumulated effects into a [`VmOutput`]. Return code and gas
    /// are left for the caller to fill in.
    pub fn take_output(&mut self) -> VmOutput {
        let state = std::mem::take(&mut self.state);
        self.snapshots.clear();
        VmOutput {
            return_data: state.return_data,
            output_accounts: state.accounts,
            logs: state.logs,
            ..VmOutput::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::build_value_transfer;

    #[test]
    fn test_merge_keeps_child_effects() {
        let a = Address::derive(b"a", 0);
        let mut output = OutputContext::new();
        output.finish(b"parent".to_vec());
        output.push_state();
        output.finish(b"child".to_vec());
        output.storage_update(a, b"k".to_vec(), b"v".to_vec());

        let data = output.pop_merge().unwrap();
        assert_eq!(data, vec![b"child".to_vec()]);
        assert_eq!(output.storage_value(&a, b"k"), Some(&b"v".to_vec()));
        assert_eq!(output.depth(), 0);
    }

    #[test]
    fn test_discard_drops_nested_effects() {
        let a = Address::derive(b"a", 0);
        let mut output = OutputContext::new();
        output.credit(a, &BigUint::from(5u8));
        output.push_state();
        output.debit(a, &BigUint::from(3u8));
        output.push_state();
        output.write_log(LogEntry {
            address: a,
            topics: vec![],
            data: vec![],
        });
        output.pop_merge().unwrap();
        output.pop_discard().unwrap();

        assert_eq!(output.balance_delta(&a), BigInt::from(5));
        assert!(output.logs().is_empty());
        assert!(output.pop_discard().is_err());
    }

    #[test]
    fn test_first_failure_wins_and_is_reverted_with_state() {
        let mut output = OutputContext::new();
        output.push_state();
        output.mark_failure(ReturnCode::UserError, "first");
        output.mark_failure(ReturnCode::OutOfGas, "second");
        assert_eq!(output.failure(), Some(&(ReturnCode::UserError, "first".to_string())));
        output.pop_discard().unwrap();
        assert_eq!(output.failure(), None);
    }

    #[test]
    fn test_transfers_land_on_receiver() {
        let a = Address::derive(b"a", 0);
        let b = Address::derive(b"b", 0);
        let mut output = OutputContext::new();
        output.add_transfer(build_value_transfer(a, b, BigUint::from(1u8), vec![]));
        let vm_output = output.take_output();
        assert_eq!(vm_output.output_accounts[&b].output_transfers.len(), 1);
        assert!(!vm_output.output_accounts.contains_key(&a));
    }

    #[test]
    fn test_merge_vm_output() {
        let a = Address::derive(b"a", 0);
        let mut builtin = VmOutput::default();
        let mut account = OutputAccount::new(a);
        account.balance_delta = BigInt::from(-2);
        account.storage_updates.insert(b"x".to_vec(), b"1".to_vec());
        builtin.output_accounts.insert(a, account);
        builtin.return_data.push(b"ok".to_vec());

        let mut output = OutputContext::new();
        output.credit(a, &BigUint::from(10u8));
        output.merge_vm_output(&builtin);
        assert_eq!(output.balance_delta(&a), BigInt::from(8));
        assert_eq!(output.storage_value(&a, b"x"), Some(&b"1".to_vec()));
        assert_eq!(output.take_output().return_data, vec![b"ok".to_vec()]);
    }
}

//! Per-frame registry of async calls.
//!
//! A context collects the async calls a contract registers while it runs,
//! grouped by caller-chosen group ids, plus optional group callbacks and one
//! context callback. Once the contract function returns the context is
//! finalized: local calls are executed and resolved, remote ones leave as
//! output transfers and the context is persisted until their callbacks
//! arrive.

use borsh::{BorshDeserialize, BorshSerialize};
use strata_types::{Address, Hash, ReturnCode};

use crate::async_call::{AsyncCall, AsyncCallGroup, AsyncCallStatus, CallbackInfo};
use crate::error::VmError;
use crate::gas_metering::GasLedger;

/// Group used when contract code does not name one.
pub const DEFAULT_GROUP_ID: &str = "default";

/// Storage key prefix for persisted contexts. Not accessible to contracts.
pub const ASYNC_DATA_PREFIX: &[u8] = b"STRATA@ASYNC@";

/// Version byte of the persisted format.
pub const ASYNC_CONTEXT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AsyncContext {
    address: Address,
    call_id: Hash,
    caller: Address,
    caller_call_id: Option<Hash>,
    groups: Vec<AsyncCallGroup>,
    callback: Option<CallbackInfo>,
    calls_counter: u64,
    #[borsh(skip)]
    finalized: bool,
}

impl AsyncContext {
    pub fn new(address: Address, call_id: Hash, caller: Address, caller_call_id: Option<Hash>) -> Self {
        Self {
            address,
            call_id,
            caller,
            caller_call_id,
            groups: Vec::new(),
            callback: None,
            calls_counter: 0,
            finalized: false,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn call_id(&self) -> Hash {
        self.call_id
    }

    pub fn caller(&self) -> Address {
        self.caller
    }

    pub fn caller_call_id(&self) -> Option<Hash> {
        self.caller_call_id
    }

    pub fn groups(&self) -> &[AsyncCallGroup] {
        &self.groups
    }

    pub fn group(&self, group_id: &str) -> Option<&AsyncCallGroup> {
        self.groups.iter().find(|group| group.id == group_id)
    }

    pub fn context_callback(&self) -> Option<&CallbackInfo> {
        self.callback.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Derive a fresh identifier for a call issued from this context.
    pub fn next_call_id(&mut self) -> Hash {
        let id = self.call_id.derive_call_id(self.calls_counter);
        self.calls_counter += 1;
        id
    }

    /// Register `call` in `group_id`, forwarding its gas limit and locking
    /// its callback gas in `ledger`. Returns the assigned call id.
    pub fn register_async_call(
        &mut self,
        group_id: &str,
        mut call: AsyncCall,
        ledger: &mut GasLedger,
    ) -> Result<Hash, VmError> {
        if self.finalized {
            return Err(VmError::AsyncContextFinalized);
        }
        let remaining = ledger.remaining();
        let total = call
            .gas_limit
            .checked_add(call.gas_locked)
            .filter(|total| *total <= remaining)
            .ok_or(VmError::OutOfGas {
                requested: call.gas_limit.saturating_add(call.gas_locked),
                remaining,
            })?;

        ledger.charge(call.gas_limit)?;
        ledger.lock(call.gas_locked)?;

        call.call_id = self.next_call_id();
        call.status = AsyncCallStatus::Pending;
        let call_id = call.call_id;

        tracing::trace!(
            target: "strata::async",
            group = group_id,
            destination = %call.destination,
            gas_total = total,
            mode = ?call.execution_mode,
            "async call registered"
        );

        match self.groups.iter_mut().find(|group| group.id == group_id) {
            Some(group) => group.calls.push(call),
            None => {
                let mut group = AsyncCallGroup::new(group_id);
                group.calls.push(call);
                self.groups.push(group);
            }
        }
        Ok(call_id)
    }

    /// Attach a callback to an existing group and lock its gas.
    pub fn set_group_callback(
        &mut self,
        group_id: &str,
        callback: CallbackInfo,
        ledger: &mut GasLedger,
    ) -> Result<(), VmError> {
        if self.finalized {
            return Err(VmError::AsyncContextFinalized);
        }
        let group = self
            .groups
            .iter_mut()
            .find(|group| group.id == group_id)
            .ok_or_else(|| VmError::AsyncGroupNotFound(group_id.to_string()))?;
        if group.callback.is_some() {
            return Err(VmError::GroupCallbackAlreadySet(group_id.to_string()));
        }
        ledger.lock(callback.gas_locked)?;
        group.callback = Some(callback);
        Ok(())
    }

    /// Attach the context callback and lock its gas.
    pub fn set_context_callback(&mut self, callback: CallbackInfo, ledger: &mut GasLedger) -> Result<(), VmError> {
        if self.finalized {
            return Err(VmError::AsyncContextFinalized);
        }
        if self.callback.is_some() {
            return Err(VmError::ContextCallbackAlreadySet);
        }
        ledger.lock(callback.gas_locked)?;
        self.callback = Some(callback);
        Ok(())
    }

    /// Close the context for registrations.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Location of a call as `(group index, call index)`.
    pub fn find_call(&self, call_id: &Hash) -> Option<(usize, usize)> {
        self.groups
            .iter()
            .enumerate()
            .find_map(|(g, group)| group.find_call(call_id).map(|c| (g, c)))
    }

    pub fn call(&self, call_id: &Hash) -> Option<&AsyncCall> {
        self.find_call(call_id).map(|(g, c)| &self.groups[g].calls[c])
    }

    /// Pending calls to run in this round, in group then registration order.
    pub fn local_pending_calls(&self) -> Vec<Hash> {
        self.pending_calls(true)
    }

    /// Pending calls that leave the transaction.
    pub fn remote_pending_calls(&self) -> Vec<Hash> {
        self.pending_calls(false)
    }

    fn pending_calls(&self, local: bool) -> Vec<Hash> {
        self.groups
            .iter()
            .flat_map(|group| group.calls.iter())
            .filter(|call| call.is_pending() && call.is_local() == local)
            .map(|call| call.call_id)
            .collect()
    }

    pub fn has_pending_calls(&self) -> bool {
        self.groups.iter().any(AsyncCallGroup::has_pending_calls)
    }

    /// Move a call from Pending to Resolved. Returns the group index.
    pub fn resolve_call(&mut self, call_id: &Hash, return_code: ReturnCode) -> Result<usize, VmError> {
        let (g, c) = self
            .find_call(call_id)
            .ok_or_else(|| VmError::UnknownAsyncCall(call_id.to_string()))?;
        let call = &mut self.groups[g].calls[c];
        if !call.is_pending() {
            return Err(VmError::CorruptedAsyncContext(format!("call {} resolved twice", call_id)));
        }
        call.resolve(return_code);
        Ok(g)
    }

    /// Finalize group `index` if all its calls are resolved. Returns
    /// `Some(callback)` the first time the group completes, where the inner
    /// option is the group callback to run.
    pub fn complete_group(&mut self, index: usize) -> Option<Option<CallbackInfo>> {
        let group = self.groups.get_mut(index)?;
        if group.finalized || !group.is_complete() {
            return None;
        }
        group.finalized = true;
        Some(group.callback.clone())
    }

    /// Hand out the context callback once every group is finalized.
    pub fn take_context_callback(&mut self) -> Option<CallbackInfo> {
        if self.groups.iter().all(|group| group.finalized) {
            self.callback.take()
        } else {
            None
        }
    }

    /// Nothing left to resolve or fire.
    pub fn is_complete(&self) -> bool {
        self.callback.is_none() && self.groups.iter().all(|group| group.finalized)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.callback.is_none()
    }

    /// Locked gas of callbacks that have not fired yet.
    pub fn escrowed_gas(&self) -> u64 {
        let groups: u64 = self
            .groups
            .iter()
            .filter(|group| !group.finalized)
            .filter_map(|group| group.callback.as_ref())
            .map(|callback| callback.gas_locked)
            .sum();
        groups + self.callback.as_ref().map_or(0, |callback| callback.gas_locked)
    }

    /// Drop finalized groups before persisting.
    pub fn prune(&mut self) {
        self.groups.retain(|group| !group.finalized);
    }

    /// Storage key of the context identified by `call_id`.
    pub fn storage_key(call_id: &Hash) -> Vec<u8> {
        [ASYNC_DATA_PREFIX, call_id.as_bytes().as_slice()].concat()
    }

    pub fn is_protected_key(key: &[u8]) -> bool {
        key.starts_with(ASYNC_DATA_PREFIX)
    }

    /// Versioned binary form: one version byte followed by the borsh body.
    pub fn serialize(&self) -> Result<Vec<u8>, VmError> {
        let body = borsh::to_vec(self).map_err(|e| VmError::Internal(e.to_string()))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(ASYNC_CONTEXT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, VmError> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| VmError::CorruptedAsyncContext("empty context".to_string()))?;
        if *version != ASYNC_CONTEXT_VERSION {
            return Err(VmError::CorruptedAsyncContext(format!("unsupported version {}", version)));
        }
        borsh::from_slice(body).map_err(|e| VmError::CorruptedAsyncContext(e.to_string()))
    }
}

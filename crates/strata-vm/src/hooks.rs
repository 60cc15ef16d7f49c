//! Host API exposed to running contract code.

use num_bigint::BigUint;
use strata_types::{Address, CallType, Hash};

use crate::async_call::CallbackInfo;
use crate::async_context::{AsyncContext, DEFAULT_GROUP_ID};
use crate::call_stack::FrameKind;
use crate::error::{ExecutionError, VmError};
use crate::host::{CallIsolation, VmHost};
use crate::interface::{
    AsyncCallRequest, BlockchainHook, Executor, SyncCallRequest, SyncCallResult, VmHooks,
};
use crate::runtime::LogEntry;
use crate::transfer::build_value_transfer;

impl<B: BlockchainHook, E: Executor> VmHost<B, E> {
    fn charge(&mut self, amount: u64) -> Result<(), VmError> {
        self.current_mut()?.ledger.charge(amount)
    }

    /// Async registration is only possible from a plain call frame with no
    /// async frame below it.
    fn check_async_allowed(&self) -> Result<(), VmError> {
        let frame = self.current()?;
        if frame.kind == FrameKind::Init {
            return Err(VmError::AsyncNotAllowed("init".to_string()));
        }
        if self.stack.has_async_frame() {
            return Err(VmError::AsyncNoMultiLevel);
        }
        Ok(())
    }

    fn callback_info(&self, function: &str, data: &[u8], gas: u64) -> Result<CallbackInfo, VmError> {
        let frame = self.current()?;
        if function.is_empty() {
            return Err(VmError::InvalidCallbackName(String::new()));
        }
        self.dispatcher().check_callback_name(function, &frame.exported)?;
        Ok(CallbackInfo {
            function: function.to_string(),
            data: data.to_vec(),
            gas_locked: gas.saturating_add(self.schedule.extra_gas_locked_for_async(frame.code_size)),
        })
    }
}

fn group_or_default(group_id: &str) -> &str {
    if group_id.is_empty() {
        DEFAULT_GROUP_ID
    } else {
        group_id
    }
}

impl<B: BlockchainHook, E: Executor> VmHooks for VmHost<B, E> {
    fn use_gas(&mut self, amount: u64) -> Result<(), ExecutionError> {
        Ok(self.charge(amount)?)
    }

    fn gas_left(&self) -> u64 {
        self.stack.current().map_or(0, |frame| frame.ledger.remaining())
    }

    fn context_address(&self) -> Address {
        self.stack.current().map(|frame| frame.context_address).unwrap_or_default()
    }

    fn caller(&self) -> Address {
        self.stack
            .current()
            .map(|frame| frame.input.vm_input.caller)
            .unwrap_or_default()
    }

    fn call_value(&self) -> BigUint {
        self.stack
            .current()
            .map(|frame| frame.input.vm_input.call_value.clone())
            .unwrap_or_default()
    }

    fn arguments(&self) -> Vec<Vec<u8>> {
        self.stack
            .current()
            .map(|frame| frame.input.vm_input.arguments.clone())
            .unwrap_or_default()
    }

    fn function(&self) -> String {
        self.stack
            .current()
            .map(|frame| frame.function().to_string())
            .unwrap_or_default()
    }

    fn call_type(&self) -> CallType {
        self.stack.current().map(|frame| frame.call_type()).unwrap_or_default()
    }

    fn finish(&mut self, data: &[u8]) -> Result<(), ExecutionError> {
        let cost = self
            .schedule
            .finish
            .saturating_add(self.schedule.data_copy_per_byte.saturating_mul(data.len() as u64));
        self.charge(cost)?;
        self.output.finish(data.to_vec());
        Ok(())
    }

    fn write_log(&mut self, topics: &[Vec<u8>], data: &[u8]) -> Result<(), ExecutionError> {
        let bytes = data.len() + topics.iter().map(Vec::len).sum::<usize>();
        let cost = self
            .schedule
            .log
            .saturating_add(self.schedule.data_copy_per_byte.saturating_mul(bytes as u64));
        self.charge(cost)?;
        let address = self.context_address();
        self.output.write_log(LogEntry {
            address,
            topics: topics.to_vec(),
            data: data.to_vec(),
        });
        Ok(())
    }

    fn storage_store(&mut self, key: &[u8], value: &[u8]) -> Result<(), ExecutionError> {
        if AsyncContext::is_protected_key(key) {
            return Err(VmError::ProtectedStorageKey.into());
        }
        let cost = self
            .schedule
            .storage_store
            .saturating_add(self.schedule.store_per_byte.saturating_mul(value.len() as u64));
        self.charge(cost)?;
        let address = self.context_address();
        self.output.storage_update(address, key.to_vec(), value.to_vec());
        Ok(())
    }

    fn storage_load(&mut self, key: &[u8]) -> Result<Vec<u8>, ExecutionError> {
        if AsyncContext::is_protected_key(key) {
            return Err(VmError::ProtectedStorageKey.into());
        }
        self.charge(self.schedule.storage_load)?;
        let address = self.context_address();
        let value = match self.output.storage_value(&address, key) {
            Some(pending) => pending.clone(),
            None => self.blockchain.get_storage(&address, key),
        };
        Ok(value)
    }

    fn transfer_value(&mut self, destination: &Address, value: &BigUint, data: &[u8]) -> Result<(), ExecutionError> {
        self.charge(self.schedule.transfer_value)?;
        let sender = self.context_address();
        self.debit(sender, value)?;
        self.output.credit(*destination, value);
        self.output
            .add_transfer(build_value_transfer(sender, *destination, value.clone(), data.to_vec()));
        Ok(())
    }

    fn execute_on_dest_context(&mut self, request: SyncCallRequest) -> Result<SyncCallResult, ExecutionError> {
        self.execute_sync_call(request, CallIsolation::DestContext)
    }

    fn execute_on_same_context(&mut self, request: SyncCallRequest) -> Result<SyncCallResult, ExecutionError> {
        self.execute_sync_call(request, CallIsolation::SameContext)
    }

    fn register_async_call(&mut self, group_id: &str, request: AsyncCallRequest) -> Result<Hash, ExecutionError> {
        let cost = self
            .schedule
            .create_async_call
            .saturating_add(self.schedule.async_call_step);
        self.charge(cost)?;
        self.check_async_allowed()?;

        let frame = self.current()?;
        let call = self.dispatcher().prepare_async_call(
            &frame.context_address,
            request,
            &frame.exported,
            frame.code_size,
            &self.schedule,
        )?;

        let frame = self.current_mut()?;
        let call_id = frame
            .async_context
            .register_async_call(group_or_default(group_id), call, &mut frame.ledger)?;
        Ok(call_id)
    }

    fn set_group_callback(&mut self, group_id: &str, callback: &str, data: &[u8], gas: u64) -> Result<(), ExecutionError> {
        self.charge(self.schedule.set_async_group_callback)?;
        self.check_async_allowed()?;
        let info = self.callback_info(callback, data, gas)?;
        let frame = self.current_mut()?;
        frame
            .async_context
            .set_group_callback(group_or_default(group_id), info, &mut frame.ledger)?;
        Ok(())
    }

    fn callback_closure(&mut self) -> Result<Vec<u8>, ExecutionError> {
        self.charge(self.schedule.get_callback_closure)?;
        let closure = self
            .current()?
            .callback_closure
            .clone()
            .ok_or(VmError::NoCallbackForClosure)?;
        let copy = self.schedule.data_copy_per_byte.saturating_mul(closure.len() as u64);
        self.charge(copy)?;
        Ok(closure)
    }

    fn set_context_callback(&mut self, callback: &str, data: &[u8], gas: u64) -> Result<(), ExecutionError> {
        self.charge(self.schedule.set_async_context_callback)?;
        self.check_async_allowed()?;
        let info = self.callback_info(callback, data, gas)?;
        let frame = self.current_mut()?;
        frame.async_context.set_context_callback(info, &mut frame.ledger)?;
        Ok(())
    }
}


//! Async execution and callback resolution.
//!
//! When a frame's function returns, its async context is finalized here:
//! local calls run in group and registration order, each one is resolved
//! right away (callback, then group callback once the group completes, the
//! context callback last) and whatever is still pending leaves as output
//! transfers together with the persisted context. The callback round of a
//! cross-shard call reloads that context and resolves through the same path.

use strata_types::{Address, CallType, Hash, ReturnCode};
use tracing::{debug, trace};

use crate::async_call::{AsyncCall, AsyncExecutionMode};
use crate::async_context::AsyncContext;
use crate::call_args::data_len;
use crate::call_stack::{Frame, FrameKind};
use crate::error::VmError;
use crate::gas_metering::GasLedger;
use crate::host::{FrameOutcome, FrameSetup, VmHost};
use crate::interface::{BlockchainHook, Executor};
use crate::runtime::{AsyncArguments, ContractCallInput, VmInput, VmOutput};
use crate::transfer::build_async_call_transfer;

impl<B: BlockchainHook, E: Executor> VmHost<B, E> {
    /// Finalize the async context of the current frame.
    pub(crate) fn execute_async_context(&mut self) -> Result<(), VmError> {
        let frame = self.current_mut()?;
        frame.async_context.finalize();
        if frame.async_context.is_empty() {
            return Ok(());
        }
        let placeholder = AsyncContext::new(
            frame.async_context.address(),
            frame.async_context.call_id(),
            frame.async_context.caller(),
            frame.async_context.caller_call_id(),
        );
        let mut context = std::mem::replace(&mut frame.async_context, placeholder);

        for call_id in context.local_pending_calls() {
            let call = context
                .call(&call_id)
                .cloned()
                .ok_or_else(|| VmError::UnknownAsyncCall(call_id.to_string()))?;
            let outcome = self.execute_local_async_call(&context, &call)?;
            self.resolve_async_call(&mut context, &call_id, outcome)?;
        }
        self.fire_context_callback(&mut context)?;

        self.emit_remote_calls(&context)?;
        self.persist_async_context(&mut context, false)?;

        self.current_mut()?.async_context = context;
        Ok(())
    }

    fn execute_local_async_call(&mut self, context: &AsyncContext, call: &AsyncCall) -> Result<FrameOutcome, VmError> {
        let (function, arguments) = match call.function_and_args() {
            Ok(parsed) => parsed,
            Err(e) => return Ok(FrameOutcome::failed(&e)),
        };
        let parent = self.current()?;
        let input = ContractCallInput {
            vm_input: VmInput {
                caller: context.address(),
                arguments,
                call_value: call.value.clone(),
                call_type: CallType::AsynchronousCall,
                gas_provided: call.gas_limit,
                gas_locked: call.gas_locked,
                original_tx_hash: parent.input.vm_input.original_tx_hash,
                current_tx_hash: parent.input.vm_input.current_tx_hash,
                async_arguments: Some(AsyncArguments {
                    call_id: call.call_id,
                    caller_call_id: context.call_id(),
                    callback_initiator_call_id: None,
                }),
            },
            recipient: call.destination,
            function,
        };
        debug!(
            target: "strata::async",
            function = %input.function,
            destination = %call.destination,
            gas_limit = call.gas_limit,
            "executing local async call"
        );

        match call.execution_mode {
            AsyncExecutionMode::BuiltinFunctionIntraShard => self.execute_builtin(input),
            AsyncExecutionMode::SyncExecution => {
                self.execute_frame(FrameSetup::call(input, call.call_id, Some(context.call_id())))
            }
            AsyncExecutionMode::Remote => Err(VmError::Internal(format!(
                "remote call {} scheduled for local execution",
                call.call_id
            ))),
        }
    }

    /// Pending → Resolved for one call, then everything that completion
    /// unlocks, all on the current frame's ledger.
    pub(crate) fn resolve_async_call(
        &mut self,
        context: &mut AsyncContext,
        call_id: &Hash,
        outcome: FrameOutcome,
    ) -> Result<(), VmError> {
        let group_index = context.resolve_call(call_id, outcome.return_code)?;
        let call = context
            .call(call_id)
            .cloned()
            .ok_or_else(|| VmError::UnknownAsyncCall(call_id.to_string()))?;

        let ledger = &mut self.current_mut()?.ledger;
        ledger.unlock(call.gas_locked)?;
        ledger.restore(outcome.gas_remaining)?;
        let budget = call.gas_locked.saturating_add(outcome.gas_remaining);

        let callback = call.callback_name().unwrap_or_default().to_string();
        trace!(
            target: "strata::async",
            call_id = %call_id,
            return_code = %outcome.return_code,
            callback = %callback,
            budget,
            "async call resolved"
        );
        if !callback.is_empty() {
            let mut arguments = vec![outcome.return_code.to_bytes()];
            arguments.extend(outcome.callback_arguments());
            let closure = Some(call.callback_closure);
            self.run_callback(context, &callback, arguments, budget, call.destination, closure)?;
        }

        if let Some(Some(group_callback)) = context.complete_group(group_index) {
            self.current_mut()?.ledger.unlock(group_callback.gas_locked)?;
            let arguments = callback_data_arguments(&group_callback.data);
            let caller = context.address();
            self.run_callback(
                context,
                &group_callback.function,
                arguments,
                group_callback.gas_locked,
                caller,
                None,
            )?;
        }
        self.fire_context_callback(context)
    }

    fn fire_context_callback(&mut self, context: &mut AsyncContext) -> Result<(), VmError> {
        let Some(callback) = context.take_context_callback() else {
            return Ok(());
        };
        self.current_mut()?.ledger.unlock(callback.gas_locked)?;
        let arguments = callback_data_arguments(&callback.data);
        let caller = context.address();
        self.run_callback(context, &callback.function, arguments, callback.gas_locked, caller, None)
    }

    /// Run `function` on the context's contract with `budget` gas, which the
    /// current ledger must hold as remaining. Failures only mark the
    /// transaction. `closure` is set for the callback of an async call.
    fn run_callback(
        &mut self,
        context: &mut AsyncContext,
        function: &str,
        arguments: Vec<Vec<u8>>,
        budget: u64,
        caller: Address,
        closure: Option<Vec<u8>>,
    ) -> Result<(), VmError> {
        let overhead = self.schedule.callback_overhead(data_len(function, &arguments));
        if overhead > budget {
            self.current_mut()?.ledger.charge(budget)?;
            let error = VmError::OutOfGas {
                requested: overhead,
                remaining: budget,
            };
            debug!(target: "strata::async", callback = function, "callback cannot pay its overhead");
            self.output.mark_failure(error.return_code(), error.to_string());
            return Ok(());
        }
        let gas = budget - overhead;
        let frame = self.current_mut()?;
        frame.ledger.charge(overhead)?;
        frame.ledger.charge(gas)?;
        let code_address = frame.code_address;
        let original_tx_hash = frame.input.vm_input.original_tx_hash;
        let current_tx_hash = frame.input.vm_input.current_tx_hash;

        let call_id = context.next_call_id();
        let input = ContractCallInput {
            vm_input: VmInput {
                caller,
                arguments,
                call_type: CallType::AsynchronousCallBack,
                gas_provided: gas,
                original_tx_hash,
                current_tx_hash,
                async_arguments: Some(AsyncArguments {
                    call_id,
                    caller_call_id: context.call_id(),
                    callback_initiator_call_id: None,
                }),
                ..VmInput::default()
            },
            recipient: context.address(),
            function: function.to_string(),
        };
        let outcome = self.execute_frame(FrameSetup {
            input,
            context_address: context.address(),
            code_address,
            code: None,
            kind: FrameKind::Call,
            call_id,
            caller_call_id: Some(context.call_id()),
            callback_closure: closure,
        })?;
        self.current_mut()?.ledger.restore(outcome.gas_remaining)?;
        if !outcome.is_ok() {
            self.output.mark_failure(outcome.return_code, outcome.return_message);
        }
        Ok(())
    }

    /// Turn every still-pending call into an outgoing transfer.
    fn emit_remote_calls(&mut self, context: &AsyncContext) -> Result<(), VmError> {
        let sender = context.address();
        for call_id in context.remote_pending_calls() {
            let call = context
                .call(&call_id)
                .ok_or_else(|| VmError::UnknownAsyncCall(call_id.to_string()))?;
            self.debit(sender, &call.value)?;
            self.current_mut()?.ledger.spend_locked(call.gas_locked)?;
            let transfer = build_async_call_transfer(sender, call, context.call_id());
            debug!(
                target: "strata::async",
                receiver = %transfer.receiver,
                gas_limit = transfer.gas_limit,
                gas_locked = transfer.gas_locked,
                "async call transfer emitted"
            );
            self.output.add_transfer(transfer);
        }
        Ok(())
    }

    /// Save an unfinished context (escrowing its callback gas) or delete a
    /// finished one that was saved by an earlier round.
    fn persist_async_context(&mut self, context: &mut AsyncContext, previously_saved: bool) -> Result<(), VmError> {
        let address = context.address();
        let key = AsyncContext::storage_key(&context.call_id());
        if context.is_complete() {
            if previously_saved {
                self.output.storage_update(address, key, Vec::new());
                debug!(target: "strata::async", call_id = %context.call_id(), "async context deleted");
            }
            return Ok(());
        }

        let escrow = context.escrowed_gas();
        self.current_mut()?.ledger.spend_locked(escrow)?;
        context.prune();
        let bytes = context.serialize()?;
        debug!(
            target: "strata::async",
            call_id = %context.call_id(),
            escrow,
            bytes = bytes.len(),
            "async context saved"
        );
        self.output.storage_update(address, key, bytes);
        Ok(())
    }

    /// Caller side of a cross-shard call: resolve the answered call against
    /// the persisted context of the contract that registered it.
    pub(crate) fn run_callback_round(&mut self, input: ContractCallInput) -> Result<VmOutput, VmError> {
        let Some(arguments) = input.vm_input.async_arguments.clone() else {
            return Ok(VmOutput::failure(ReturnCode::ExecutionFailed, "callback without async arguments"));
        };
        let Some(initiator) = arguments.callback_initiator_call_id else {
            return Ok(VmOutput::failure(ReturnCode::ExecutionFailed, "callback without initiator"));
        };
        let Some((code_bytes, callback_arguments)) = input.vm_input.arguments.split_first() else {
            return Ok(VmOutput::failure(ReturnCode::ExecutionFailed, "callback without return code"));
        };
        let return_code = match ReturnCode::from_bytes(code_bytes) {
            Ok(code) => code,
            Err(e) => return Ok(VmOutput::failure(ReturnCode::ExecutionFailed, e.to_string())),
        };

        let address = input.recipient;
        let stored = self.blockchain.get_storage(&address, &AsyncContext::storage_key(&initiator));
        if stored.is_empty() {
            return Err(VmError::UnknownAsyncCall(format!("no async context {} at {}", initiator, address)));
        }
        let mut context = AsyncContext::deserialize(&stored)?;
        let call_id = arguments.caller_call_id;
        if context.call(&call_id).is_none() {
            return Err(VmError::UnknownAsyncCall(call_id.to_string()));
        }

        let gas_provided = input.vm_input.gas_provided;
        let gas_locked = input.vm_input.gas_locked;
        let total = gas_provided
            .checked_add(gas_locked)
            .ok_or_else(|| VmError::GasLedgerInvariant("callback gas overflows".to_string()))?;
        let escrow = context.escrowed_gas();
        let mut ledger = GasLedger::new(total);
        ledger.charge(gas_provided)?;
        ledger.lock(gas_locked)?;
        ledger.credit(escrow)?;
        ledger.lock(escrow)?;

        let code_size = self.blockchain.get_code(&address).map_or(0, |code| code.len() as u64);
        let frame = Frame {
            async_context: AsyncContext::new(address, context.call_id(), context.caller(), context.caller_call_id()),
            input: input.clone(),
            context_address: address,
            code_address: address,
            code_size,
            exported: Default::default(),
            kind: FrameKind::Resolution,
            ledger,
            depth: 0,
            callback_closure: None,
        };
        self.stack.enter(frame)?;
        self.output.push_state();
        self.output.credit(address, &input.vm_input.call_value);

        debug!(
            target: "strata::async",
            call_id = %call_id,
            return_code = %return_code,
            gas_provided,
            gas_locked,
            escrow,
            "resolving cross-shard callback"
        );
        let outcome = FrameOutcome {
            return_code,
            return_message: if return_code.is_ok() {
                String::new()
            } else {
                callback_arguments
                    .first()
                    .map(|message| String::from_utf8_lossy(message).into_owned())
                    .unwrap_or_default()
            },
            return_data: callback_arguments.to_vec(),
            gas_remaining: gas_provided,
        };
        self.resolve_async_call(&mut context, &call_id, outcome)?;
        self.persist_async_context(&mut context, true)?;

        let frame = self.stack.exit()?;
        frame.ledger.check()?;
        if frame.ledger.locked() != 0 {
            return Err(VmError::GasLedgerInvariant(format!(
                "callback round finished with {} gas still locked",
                frame.ledger.locked()
            )));
        }
        self.output.pop_merge()?;

        let failure = self.output.failure().cloned();
        let mut output = self.output.take_output();
        output.gas_remaining = frame.ledger.remaining();
        if let Some((code, message)) = failure {
            output.return_code = code;
            output.return_message = message;
        }
        Ok(output)
    }
}

fn callback_data_arguments(data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        Vec::new()
    } else {
        vec![data.to_vec()]
    }
}

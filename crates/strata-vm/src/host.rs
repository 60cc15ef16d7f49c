//! The contract host.
//!
//! [`VmHost`] runs one transaction at a time: it builds the top frame,
//! executes contract functions through the [`Executor`], routes nested calls,
//! drives async resolution and assembles the [`VmOutput`].

use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use strata_types::{Address, CallType, Hash, ReturnCode};
use tracing::{debug, info, warn, Dispatch};

use crate::async_context::AsyncContext;
use crate::call_stack::{CallStack, Frame, FrameKind};
use crate::config::HostConfig;
use crate::dispatcher::{CallDispatcher, ShardCoordinator};
use crate::error::{ExecutionError, VmError};
use crate::gas_metering::{GasLedger, GasSchedule, GasTable};
use crate::interface::{BlockchainHook, Executor, SyncCallRequest, SyncCallResult};
use crate::output::OutputContext;
use crate::runtime::{AsyncArguments, ContractCallInput, ContractCreateInput, VmInput, VmOutput};
use crate::transfer::{build_callback_transfer, CallbackTransfer};

/// Isolation of a synchronous nested call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallIsolation {
    /// The callee works on its own storage and balance.
    DestContext,
    /// The callee's code works on the caller's storage and balance.
    SameContext,
}

/// Result of running one frame, as reported to whoever started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FrameOutcome {
    pub return_code: ReturnCode,
    pub return_message: String,
    pub return_data: Vec<Vec<u8>>,
    pub gas_remaining: u64,
}

impl FrameOutcome {
    pub fn failed(error: &VmError) -> Self {
        Self {
            return_code: error.return_code(),
            return_message: error.to_string(),
            return_data: Vec::new(),
            gas_remaining: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code.is_ok()
    }

    /// Arguments handed to the callback of an async call with this outcome.
    pub fn callback_arguments(&self) -> Vec<Vec<u8>> {
        if self.is_ok() {
            self.return_data.clone()
        } else {
            vec![self.return_message.clone().into_bytes()]
        }
    }
}

/// Everything needed to start a frame.
pub(crate) struct FrameSetup {
    pub input: ContractCallInput,
    pub context_address: Address,
    pub code_address: Address,
    /// Code of a contract being deployed; loaded from the blockchain otherwise.
    pub code: Option<Vec<u8>>,
    pub kind: FrameKind,
    pub call_id: Hash,
    pub caller_call_id: Option<Hash>,
    pub callback_closure: Option<Vec<u8>>,
}

impl FrameSetup {
    pub fn call(input: ContractCallInput, call_id: Hash, caller_call_id: Option<Hash>) -> Self {
        let address = input.recipient;
        Self {
            input,
            context_address: address,
            code_address: address,
            code: None,
            kind: FrameKind::Call,
            call_id,
            caller_call_id,
            callback_closure: None,
        }
    }
}

/// Executes contract calls against a blockchain view.
pub struct VmHost<B: BlockchainHook, E: Executor> {
    pub(crate) blockchain: B,
    pub(crate) executor: E,
    config: HostConfig,
    pub(crate) schedule: GasSchedule,
    pub(crate) shards: ShardCoordinator,
    logger: Dispatch,
    pub(crate) stack: CallStack,
    pub(crate) output: OutputContext,
    errors: Vec<String>,
}

impl<B: BlockchainHook, E: Executor> VmHost<B, E> {
    /// Create a host. `logger` receives every event emitted during runs.
    pub fn new(blockchain: B, executor: E, config: HostConfig, logger: Dispatch) -> Result<Self, VmError> {
        let schedule = config.schedule()?;
        let shards = config.shard_coordinator()?;
        let stack = CallStack::with_max_depth(config.max_call_depth);
        Ok(Self {
            blockchain,
            executor,
            config,
            schedule,
            shards,
            logger,
            stack,
            output: OutputContext::new(),
            errors: Vec::new(),
        })
    }

    pub fn blockchain(&self) -> &B {
        &self.blockchain
    }

    pub fn blockchain_mut(&mut self) -> &mut B {
        &mut self.blockchain
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn gas_schedule(&self) -> &GasSchedule {
        &self.schedule
    }

    pub fn shard_coordinator(&self) -> ShardCoordinator {
        self.shards
    }

    /// Replace the gas schedule between transactions.
    pub fn update_gas_schedule(&mut self, table: &GasTable) -> Result<(), VmError> {
        self.schedule = GasSchedule::from_table(table)?;
        self.config.gas_schedule = table.clone();
        info!(target: "strata::host", "gas schedule updated");
        Ok(())
    }

    /// Failures of every frame in the last transaction, outermost last.
    pub fn all_errors(&self) -> &[String] {
        &self.errors
    }

    /// Execute a call transaction.
    ///
    /// Contract failures are reported through the output's return code.
    /// `Err` means the engine detected an inconsistency and nothing from
    /// this transaction may be committed.
    pub fn run_smart_contract_call(&mut self, input: ContractCallInput) -> Result<VmOutput, VmError> {
        let logger = self.logger.clone();
        tracing::dispatcher::with_default(&logger, || {
            self.reset();
            let result = match input.vm_input.call_type {
                CallType::AsynchronousCallBack => self.run_callback_round(input),
                CallType::AsynchronousCall => self.run_async_call_round(input),
                CallType::DirectCall => self.run_direct_call(input),
            };
            self.log_result(&result);
            result
        })
    }

    /// Deploy a contract and run its `init` function.
    pub fn run_smart_contract_create(&mut self, input: ContractCreateInput) -> Result<VmOutput, VmError> {
        let logger = self.logger.clone();
        tracing::dispatcher::with_default(&logger, || {
            self.reset();
            let result = self.run_create(input);
            self.log_result(&result);
            result
        })
    }

    fn reset(&mut self) {
        self.stack = CallStack::with_max_depth(self.config.max_call_depth);
        self.output.reset();
        self.errors.clear();
    }

    fn log_result(&self, result: &Result<VmOutput, VmError>) {
        match result {
            Ok(output) => debug!(
                target: "strata::host",
                return_code = %output.return_code,
                gas_remaining = output.gas_remaining,
                accounts = output.output_accounts.len(),
                "transaction finished"
            ),
            Err(e) => warn!(target: "strata::host", error = %e, "transaction aborted"),
        }
    }

    fn run_direct_call(&mut self, input: ContractCallInput) -> Result<VmOutput, VmError> {
        let call_id = input.vm_input.current_tx_hash;
        let gas_provided = input.vm_input.gas_provided;
        let outcome = self.execute_frame(FrameSetup::call(input, call_id, None))?;
        Ok(self.finish_transaction(outcome, gas_provided))
    }

    /// Callee side of a cross-shard async call: run it, then answer the
    /// caller with a callback transfer whatever the outcome.
    fn run_async_call_round(&mut self, input: ContractCallInput) -> Result<VmOutput, VmError> {
        let Some(incoming) = input.vm_input.async_arguments.clone() else {
            return Ok(VmOutput::failure(ReturnCode::ExecutionFailed, "async call without async arguments"));
        };
        let callee = input.recipient;
        let caller = input.vm_input.caller;
        let gas_locked = input.vm_input.gas_locked;
        let call_value = input.vm_input.call_value.clone();

        let outcome = self.execute_frame(FrameSetup::call(input, incoming.call_id, Some(incoming.caller_call_id)))?;

        let refund = if outcome.is_ok() { BigUint::default() } else { call_value };
        let transfer = build_callback_transfer(
            callee,
            caller,
            &incoming,
            CallbackTransfer {
                return_code: outcome.return_code,
                arguments: outcome.callback_arguments(),
                gas_limit: outcome.gas_remaining,
                gas_locked,
                value: refund,
            },
        );
        debug!(
            target: "strata::async",
            receiver = %caller,
            return_code = %outcome.return_code,
            gas_limit = transfer.gas_limit,
            "callback transfer emitted"
        );
        self.output.add_transfer(transfer);

        let mut output = self.finish_transaction(outcome, 0);
        output.gas_remaining = 0;
        Ok(output)
    }

    fn run_create(&mut self, input: ContractCreateInput) -> Result<VmOutput, VmError> {
        let creator = input.vm_input.caller;
        let nonce = self
            .blockchain
            .get_user_account(&creator)
            .map(|account| account.nonce)
            .unwrap_or_default();
        let address = self.blockchain.new_address(&creator, nonce);
        if self.blockchain.get_code(&address).is_some() {
            return Ok(VmOutput::failure(ReturnCode::AccountCollision, address.to_string()));
        }

        let call_id = input.vm_input.current_tx_hash;
        let gas_provided = input.vm_input.gas_provided;
        let setup = FrameSetup {
            input: ContractCallInput {
                vm_input: input.vm_input,
                recipient: address,
                function: "init".to_string(),
            },
            context_address: address,
            code_address: address,
            code: Some(input.code),
            kind: FrameKind::Init,
            call_id,
            caller_call_id: None,
            callback_closure: None,
        };
        let outcome = self.execute_frame(setup)?;
        let mut output = self.finish_transaction(outcome, gas_provided);
        if output.is_success() {
            output.return_data.insert(0, address.as_bytes().to_vec());
        }
        Ok(output)
    }

    /// Turn the outcome of the top frame into the transaction output.
    fn finish_transaction(&mut self, outcome: FrameOutcome, gas_provided: u64) -> VmOutput {
        let failure = self.output.failure().cloned();
        let mut output = self.output.take_output();
        output.gas_remaining = outcome.gas_remaining.min(gas_provided);
        match failure {
            Some((code, message)) if outcome.is_ok() => {
                output.return_code = code;
                output.return_message = message;
            }
            _ => {
                output.return_code = outcome.return_code;
                output.return_message = outcome.return_message;
            }
        }
        output
    }

    pub(crate) fn current(&self) -> Result<&Frame, VmError> {
        self.stack
            .current()
            .ok_or_else(|| VmError::Internal("no active frame".to_string()))
    }

    pub(crate) fn current_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.stack
            .current_mut()
            .ok_or_else(|| VmError::Internal("no active frame".to_string()))
    }

    pub(crate) fn dispatcher(&self) -> CallDispatcher<'_, B> {
        CallDispatcher::new(&self.blockchain, self.shards)
    }

    /// Spendable balance of `address` including this transaction's changes.
    pub(crate) fn balance_of(&self, address: &Address) -> BigInt {
        let committed = self
            .blockchain
            .get_user_account(address)
            .map(|account| account.balance)
            .unwrap_or_default();
        BigInt::from(committed) + self.output.balance_delta(address)
    }

    pub(crate) fn debit(&mut self, address: Address, value: &BigUint) -> Result<(), VmError> {
        if self.balance_of(&address) < BigInt::from(value.clone()) {
            return Err(VmError::InsufficientFunds(format!("{} cannot pay {}", address, value)));
        }
        self.output.debit(address, value);
        Ok(())
    }

    /// Push a frame, run it and pop it again.
    ///
    /// Contract-visible failures come back as a failed [`FrameOutcome`] with
    /// every effect of the frame reverted; only fatal errors are `Err`.
    pub(crate) fn execute_frame(&mut self, setup: FrameSetup) -> Result<FrameOutcome, VmError> {
        let vm_input = &setup.input.vm_input;
        let mut provided = vm_input.gas_provided;
        if vm_input.call_type == CallType::AsynchronousCallBack {
            provided = provided
                .checked_add(vm_input.gas_locked)
                .ok_or_else(|| VmError::GasLedgerInvariant("callback gas overflows".to_string()))?;
        }
        let caller = vm_input.caller;

        let frame = Frame {
            async_context: AsyncContext::new(setup.context_address, setup.call_id, caller, setup.caller_call_id),
            input: setup.input,
            context_address: setup.context_address,
            code_address: setup.code_address,
            code_size: 0,
            exported: Default::default(),
            kind: setup.kind,
            ledger: GasLedger::new(provided),
            depth: 0,
            callback_closure: setup.callback_closure,
        };
        debug!(
            target: "strata::host",
            function = frame.function(),
            address = %frame.context_address,
            call_type = %frame.call_type(),
            gas = provided,
            "entering frame"
        );
        if let Err(e) = self.stack.enter(frame) {
            self.errors.push(e.to_string());
            return Ok(FrameOutcome::failed(&e));
        }
        self.output.push_state();

        let result = self.run_frame_body(setup.code);
        let frame = self.stack.exit()?;
        self.complete_frame(frame, result)
    }

    fn run_frame_body(&mut self, code: Option<Vec<u8>>) -> Result<(), ExecutionError> {
        let (code_address, context_address, function, kind) = {
            let frame = self.current()?;
            (frame.code_address, frame.context_address, frame.function().to_string(), frame.kind)
        };

        let code = match code {
            Some(code) => code,
            None => self
                .blockchain
                .get_code(&code_address)
                .filter(|code| !code.is_empty())
                .ok_or_else(|| VmError::ContractInvalid(format!("no code at {}", code_address)))?,
        };
        let code_size = code.len() as u64;
        let mut load_cost = self.schedule.code_load_cost(code_size);
        if kind == FrameKind::Init {
            load_cost = load_cost
                .saturating_add(self.schedule.create_contract)
                .saturating_add(code_size.saturating_mul(self.schedule.compile_per_byte));
            self.output.deploy(context_address, code.clone());
        }
        self.current_mut()?.code_size = code_size;
        self.current_mut()?.ledger.charge(load_cost)?;

        self.transfer_call_value()?;

        let mut instance = self.executor.new_instance(&code)?;
        let exported = instance.exported_functions().into_iter().collect();
        self.current_mut()?.exported = exported;
        if !self.current()?.exported.contains(&function) {
            if kind == FrameKind::Init {
                return Ok(());
            }
            return Err(VmError::FunctionNotFound(function).into());
        }

        let points_limit = self.current()?.ledger.remaining();
        instance.set_points_limit(points_limit);
        instance.call_function(&function, self)?;
        let points = instance.points_used();
        self.current_mut()?.ledger.charge(points)?;

        self.execute_async_context()?;
        Ok(())
    }

    /// Move the frame's call value from its caller to its context.
    ///
    /// The top frame's value was already taken from the sender by whoever
    /// submitted the transaction, so it is only credited.
    fn transfer_call_value(&mut self) -> Result<(), VmError> {
        let frame = self.current()?;
        let value = frame.input.vm_input.call_value.clone();
        if value.is_zero() {
            return Ok(());
        }
        let caller = frame.input.vm_input.caller;
        let context = frame.context_address;
        let top_level = self.stack.depth() == 1;
        if caller == context && !top_level {
            return Ok(());
        }
        if !top_level {
            self.debit(caller, &value)?;
        }
        self.output.credit(context, &value);
        Ok(())
    }

    fn complete_frame(&mut self, mut frame: Frame, result: Result<(), ExecutionError>) -> Result<FrameOutcome, VmError> {
        match result {
            Ok(()) => {
                frame.ledger.check()?;
                if frame.ledger.locked() != 0 {
                    return Err(VmError::GasLedgerInvariant(format!(
                        "frame '{}' finished with {} gas still locked",
                        frame.function(),
                        frame.ledger.locked()
                    )));
                }
                let return_data = self.output.pop_merge()?;
                Ok(FrameOutcome {
                    return_code: ReturnCode::Ok,
                    return_message: String::new(),
                    return_data,
                    gas_remaining: frame.ledger.remaining(),
                })
            }
            Err(ExecutionError::Vm(e)) if e.is_fatal() => {
                warn!(target: "strata::host", function = frame.function(), error = %e, "fatal error");
                Err(e)
            }
            Err(e) => {
                self.output.pop_discard()?;
                frame.ledger.consume_all();
                let message = e.to_string();
                debug!(
                    target: "strata::host",
                    function = frame.function(),
                    return_code = %e.return_code(),
                    error = %message,
                    "frame failed"
                );
                self.errors.push(format!("{}: {}", frame.function(), message));
                Ok(FrameOutcome {
                    return_code: e.return_code(),
                    return_message: message,
                    return_data: Vec::new(),
                    gas_remaining: 0,
                })
            }
        }
    }

    /// Synchronous nested call on behalf of the current frame.
    pub(crate) fn execute_sync_call(
        &mut self,
        request: SyncCallRequest,
        isolation: CallIsolation,
    ) -> Result<SyncCallResult, ExecutionError> {
        let api_cost = match isolation {
            CallIsolation::DestContext => self.schedule.execute_on_dest_context,
            CallIsolation::SameContext => self.schedule.execute_on_same_context,
        };
        self.current_mut()?.ledger.charge(api_cost)?;
        crate::call_args::validate_function_name(&request.function)?;

        let caller_address = self.current()?.context_address;
        self.dispatcher().check_sync_call(&caller_address, &request.destination)?;

        let frame = self.current_mut()?;
        let gas = frame.ledger.bound(request.gas_limit);
        frame.ledger.charge(gas)?;
        let call_id = frame.async_context.next_call_id();
        let parent_call_id = frame.async_context.call_id();
        let vm_input = VmInput {
            caller: caller_address,
            arguments: request.arguments,
            call_value: request.value,
            call_type: CallType::DirectCall,
            gas_provided: gas,
            gas_locked: 0,
            original_tx_hash: frame.input.vm_input.original_tx_hash,
            current_tx_hash: frame.input.vm_input.current_tx_hash,
            async_arguments: Some(AsyncArguments {
                call_id,
                caller_call_id: parent_call_id,
                callback_initiator_call_id: None,
            }),
        };
        let input = ContractCallInput {
            vm_input,
            recipient: request.destination,
            function: request.function,
        };

        let outcome = if self.blockchain.is_builtin_function(&input.function) {
            self.execute_builtin(input)?
        } else {
            let context_address = match isolation {
                CallIsolation::DestContext => request.destination,
                CallIsolation::SameContext => caller_address,
            };
            self.execute_frame(FrameSetup {
                input,
                context_address,
                code_address: request.destination,
                code: None,
                kind: FrameKind::Call,
                call_id,
                caller_call_id: Some(parent_call_id),
                callback_closure: None,
            })?
        };

        self.current_mut()?.ledger.restore(outcome.gas_remaining)?;
        Ok(SyncCallResult {
            return_code: outcome.return_code,
            return_data: outcome.return_data,
            return_message: outcome.return_message,
        })
    }

    /// Run a builtin function through the blockchain hook.
    pub(crate) fn execute_builtin(&mut self, input: ContractCallInput) -> Result<FrameOutcome, VmError> {
        let gas_provided = input.vm_input.gas_provided;
        self.output.push_state();
        match self.blockchain.process_builtin_function(&input) {
            Ok(output) if output.is_success() => {
                self.output.merge_vm_output(&output);
                let return_data = self.output.pop_merge()?;
                Ok(FrameOutcome {
                    return_code: ReturnCode::Ok,
                    return_message: String::new(),
                    return_data,
                    gas_remaining: output.gas_remaining.min(gas_provided),
                })
            }
            Ok(output) => {
                self.output.pop_discard()?;
                self.errors.push(format!("{}: {}", input.function, output.return_message));
                Ok(FrameOutcome {
                    return_code: output.return_code,
                    return_message: output.return_message,
                    return_data: Vec::new(),
                    gas_remaining: 0,
                })
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.output.pop_discard()?;
                let e = VmError::BuiltinFunctionFailed(e.to_string());
                self.errors.push(format!("{}: {}", input.function, e));
                Ok(FrameOutcome::failed(&e))
            }
        }
    }
}

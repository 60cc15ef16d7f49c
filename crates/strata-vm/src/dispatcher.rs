//! Routing of nested calls.
//!
//! Decides whether a call runs in the current transaction (sync execution or
//! an intra-shard builtin) or must leave as an output transfer, and checks
//! the constraints that differ between synchronous and asynchronous calls.

use std::collections::BTreeSet;

use strata_types::{Address, Hash};

use crate::async_call::{AsyncCall, AsyncCallStatus, AsyncExecutionMode};
use crate::call_args::{encode_call_data, validate_function_name};
use crate::error::VmError;
use crate::gas_metering::GasSchedule;
use crate::interface::{AsyncCallRequest, BlockchainHook};

/// Shard layout as seen by this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardCoordinator {
    num_shards: u32,
    self_shard: u32,
}

impl ShardCoordinator {
    pub fn new(num_shards: u32, self_shard: u32) -> Result<Self, VmError> {
        if num_shards == 0 || self_shard >= num_shards {
            return Err(VmError::Internal(format!(
                "shard {} outside of {} shards",
                self_shard, num_shards
            )));
        }
        Ok(Self { num_shards, self_shard })
    }

    pub fn single() -> Self {
        Self {
            num_shards: 1,
            self_shard: 0,
        }
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn self_shard(&self) -> u32 {
        self.self_shard
    }

    pub fn shard_of(&self, address: &Address) -> u32 {
        address.shard_id(self.num_shards)
    }

    pub fn same_shard(&self, a: &Address, b: &Address) -> bool {
        self.shard_of(a) == self.shard_of(b)
    }

    pub fn is_self(&self, address: &Address) -> bool {
        self.shard_of(address) == self.self_shard
    }
}

/// Borrowed view used while routing a single call.
pub struct CallDispatcher<'a, B: BlockchainHook + ?Sized> {
    blockchain: &'a B,
    shards: ShardCoordinator,
}

impl<'a, B: BlockchainHook + ?Sized> CallDispatcher<'a, B> {
    pub fn new(blockchain: &'a B, shards: ShardCoordinator) -> Self {
        Self { blockchain, shards }
    }

    fn has_code(&self, address: &Address) -> bool {
        self.blockchain.get_code(address).map_or(false, |code| !code.is_empty())
    }

    /// Where an async call from `caller` to `destination` runs.
    pub fn async_execution_mode(&self, caller: &Address, destination: &Address, function: &str) -> AsyncExecutionMode {
        if !self.shards.same_shard(caller, destination) {
            return AsyncExecutionMode::Remote;
        }
        if self.blockchain.is_builtin_function(function) {
            AsyncExecutionMode::BuiltinFunctionIntraShard
        } else if self.has_code(destination) {
            AsyncExecutionMode::SyncExecution
        } else {
            AsyncExecutionMode::Remote
        }
    }

    /// Synchronous calls never leave the shard.
    pub fn check_sync_call(&self, caller: &Address, destination: &Address) -> Result<(), VmError> {
        if self.shards.same_shard(caller, destination) {
            Ok(())
        } else {
            Err(VmError::SyncCallCrossShard(destination.to_string()))
        }
    }

    /// A callback must be an exported, user-callable function. Empty names
    /// mean "no callback" and are accepted.
    pub fn check_callback_name(&self, name: &str, exported: &BTreeSet<String>) -> Result<(), VmError> {
        if name.is_empty() {
            return Ok(());
        }
        if name == "init" || self.blockchain.is_builtin_function(name) || !exported.contains(name) {
            return Err(VmError::InvalidCallbackName(name.to_string()));
        }
        Ok(())
    }

    /// Turn a contract request into a pending call. The call id is assigned
    /// at registration.
    pub fn prepare_async_call(
        &self,
        caller: &Address,
        request: AsyncCallRequest,
        exported: &BTreeSet<String>,
        code_size: u64,
        schedule: &GasSchedule,
    ) -> Result<AsyncCall, VmError> {
        validate_function_name(&request.function)?;
        self.check_callback_name(&request.success_callback, exported)?;
        self.check_callback_name(&request.error_callback, exported)?;

        let has_callback = !request.success_callback.is_empty() || !request.error_callback.is_empty();
        let mut gas_locked = request.extra_gas_for_callback;
        if has_callback {
            gas_locked = gas_locked.saturating_add(schedule.extra_gas_locked_for_async(code_size));
        }

        let execution_mode = self.async_execution_mode(caller, &request.destination, &request.function);
        Ok(AsyncCall {
            call_id: Hash::ZERO,
            destination: request.destination,
            data: encode_call_data(&request.function, &request.arguments),
            value: request.value,
            gas_limit: request.gas_limit,
            gas_locked,
            success_callback: request.success_callback,
            error_callback: request.error_callback,
            callback_closure: request.callback_closure,
            status: AsyncCallStatus::Pending,
            execution_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWorld;

    fn world() -> (MockWorld, Address, Address, Address) {
        let mut world = MockWorld::new();
        let caller = Address::derive(b"caller", 0);
        let local = Address::derive(b"local", 2);
        let remote = Address::derive(b"remote", 1);
        world.add_contract(caller, b"code-a".to_vec(), 0);
        world.add_contract(local, b"code-b".to_vec(), 0);
        world.add_contract(remote, b"code-c".to_vec(), 0);
        world.register_builtin("ESDTTransfer", |_| Ok(Default::default()));
        (world, caller, local, remote)
    }

    #[test]
    fn test_shard_coordinator() {
        let shards = ShardCoordinator::new(2, 0).unwrap();
        assert!(shards.same_shard(&Address::derive(b"x", 0), &Address::derive(b"y", 2)));
        assert!(!shards.same_shard(&Address::derive(b"x", 0), &Address::derive(b"y", 1)));
        assert!(ShardCoordinator::new(2, 2).is_err());
        assert!(ShardCoordinator::new(0, 0).is_err());
    }

    #[test]
    fn test_async_execution_mode() {
        let (world, caller, local, remote) = world();
        let dispatcher = CallDispatcher::new(&world, ShardCoordinator::new(2, 0).unwrap());
        assert_eq!(
            dispatcher.async_execution_mode(&caller, &local, "work"),
            AsyncExecutionMode::SyncExecution
        );
        assert_eq!(
            dispatcher.async_execution_mode(&caller, &remote, "work"),
            AsyncExecutionMode::Remote
        );
        assert_eq!(
            dispatcher.async_execution_mode(&caller, &local, "ESDTTransfer"),
            AsyncExecutionMode::BuiltinFunctionIntraShard
        );
        // same shard, no code
        let user = Address::derive(b"user", 0);
        assert_eq!(
            dispatcher.async_execution_mode(&caller, &user, "work"),
            AsyncExecutionMode::Remote
        );
    }

    #[test]
    fn test_sync_call_must_stay_in_shard() {
        let (world, caller, local, remote) = world();
        let dispatcher = CallDispatcher::new(&world, ShardCoordinator::new(2, 0).unwrap());
        assert!(dispatcher.check_sync_call(&caller, &local).is_ok());
        assert!(matches!(
            dispatcher.check_sync_call(&caller, &remote),
            Err(VmError::SyncCallCrossShard(_))
        ));
    }

    #[test]
    fn test_callback_names() {
        let (world, ..) = world();
        let dispatcher = CallDispatcher::new(&world, ShardCoordinator::single());
        let exported: BTreeSet<String> = ["init", "onDone", "ESDTTransfer"].iter().map(|s| s.to_string()).collect();
        assert!(dispatcher.check_callback_name("", &exported).is_ok());
        assert!(dispatcher.check_callback_name("onDone", &exported).is_ok());
        for bad in ["init", "ESDTTransfer", "missing"] {
            assert_eq!(
                dispatcher.check_callback_name(bad, &exported),
                Err(VmError::InvalidCallbackName(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_prepare_adds_extra_lock_only_with_callback() {
        let (world, caller, local, _) = world();
        let dispatcher = CallDispatcher::new(&world, ShardCoordinator::single());
        let schedule = GasSchedule::default();
        let exported: BTreeSet<String> = ["onDone".to_string()].into_iter().collect();

        let mut request = AsyncCallRequest::new(local, "work", 1_000);
        request.extra_gas_for_callback = 10;
        let call = dispatcher
            .prepare_async_call(&caller, request.clone(), &exported, 64, &schedule)
            .unwrap();
        assert_eq!(call.gas_locked, 10);
        assert_eq!(call.data, b"work".to_vec());

        request.success_callback = "onDone".to_string();
        let call = dispatcher
            .prepare_async_call(&caller, request, &exported, 64, &schedule)
            .unwrap();
        assert_eq!(call.gas_locked, 10 + schedule.extra_gas_locked_for_async(64));
    }

    #[test]
    fn test_prepare_rejects_bad_function() {
        let (world, caller, local, _) = world();
        let dispatcher = CallDispatcher::new(&world, ShardCoordinator::single());
        let request = AsyncCallRequest::new(local, "bad@name", 1_000);
        assert!(matches!(
            dispatcher.prepare_async_call(&caller, request, &BTreeSet::new(), 0, &GasSchedule::default()),
            Err(VmError::MalformedCallData(_))
        ));
    }
}

//! In-memory collaborators for exercising the host.
//!
//! [`MockWorld`] is a map-backed [`BlockchainHook`], [`MockExecutor`] hands
//! out instances of scripted [`MockContract`]s keyed by their code, and
//! [`MockNetwork`] plays the role of the transaction pipeline: it applies
//! outputs and delivers async transfers as follow-up transactions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use num_bigint::{BigInt, BigUint, Sign};
use parking_lot::Mutex;
use strata_types::{Address, Hash};

use crate::call_graph::{CallGraph, EdgeKind};
use crate::config::HostConfig;
use crate::error::{ExecutionError, VmError};
use crate::host::VmHost;
use crate::interface::{
    AsyncCallRequest, BlockchainHook, Executor, Instance, SyncCallRequest, UserAccount, VmHooks,
};
use crate::runtime::{ContractCallInput, OutputAccount, VmOutput};
use crate::telemetry;
use crate::transfer::transfer_to_call_input;

/// Scripted contract function.
pub type MockFunction = Arc<dyn Fn(&mut dyn VmHooks) -> Result<(), ExecutionError> + Send + Sync>;

/// Scripted builtin function.
pub type BuiltinFunction = Arc<dyn Fn(&ContractCallInput) -> Result<VmOutput, VmError> + Send + Sync>;

/// Address of a named test account pinned to `shard`.
pub fn test_address(name: &str, shard: u8) -> Address {
    Address::derive(name.as_bytes(), shard)
}

#[derive(Clone, Default)]
pub struct MockContract {
    functions: BTreeMap<String, MockFunction>,
}

impl MockContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&mut dyn VmHooks) -> Result<(), ExecutionError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }
}

struct MockInstance {
    contract: Arc<MockContract>,
}

impl Instance for MockInstance {
    fn exported_functions(&self) -> Vec<String> {
        self.contract.function_names()
    }

    fn call_function(&mut self, function: &str, hooks: &mut dyn VmHooks) -> Result<(), ExecutionError> {
        let body = self
            .contract
            .functions
            .get(function)
            .cloned()
            .ok_or_else(|| VmError::FunctionNotFound(function.to_string()))?;
        body(hooks)
    }

    /// Scripted functions charge through `use_gas` only.
    fn set_points_limit(&mut self, _limit: u64) {}

    fn points_used(&self) -> u64 {
        0
    }
}

#[derive(Default)]
pub struct MockExecutor {
    contracts: BTreeMap<Vec<u8>, Arc<MockContract>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `contract` for accounts whose code is `code`.
    pub fn register(&mut self, code: &[u8], contract: MockContract) {
        self.contracts.insert(code.to_vec(), Arc::new(contract));
    }
}

impl Executor for MockExecutor {
    fn new_instance(&self, code: &[u8]) -> Result<Box<dyn Instance>, VmError> {
        let contract = self
            .contracts
            .get(code)
            .cloned()
            .ok_or_else(|| VmError::ContractInvalid(format!("unknown code {}", hex::encode(code))))?;
        Ok(Box::new(MockInstance { contract }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockAccount {
    pub balance: BigUint,
    pub nonce: u64,
    pub code: Option<Vec<u8>>,
    pub storage: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Default)]
pub struct MockWorld {
    accounts: BTreeMap<Address, MockAccount>,
    builtins: BTreeMap<String, BuiltinFunction>,
}

impl MockWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&mut self, address: Address, balance: u64) {
        self.accounts.entry(address).or_default().balance = BigUint::from(balance);
    }

    pub fn add_contract(&mut self, address: Address, code: Vec<u8>, balance: u64) {
        let account = self.accounts.entry(address).or_default();
        account.code = Some(code);
        account.balance = BigUint::from(balance);
    }

    pub fn register_builtin<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&ContractCallInput) -> Result<VmOutput, VmError> + Send + Sync + 'static,
    {
        self.builtins.insert(name.to_string(), Arc::new(function));
    }

    pub fn account(&self, address: &Address) -> Option<&MockAccount> {
        self.accounts.get(address)
    }

    pub fn balance(&self, address: &Address) -> BigUint {
        self.accounts
            .get(address)
            .map(|account| account.balance.clone())
            .unwrap_or_default()
    }

    pub fn storage(&self, address: &Address, key: &[u8]) -> Option<Vec<u8>> {
        self.accounts
            .get(address)
            .and_then(|account| account.storage.get(key))
            .cloned()
    }

    pub fn set_storage(&mut self, address: Address, key: &[u8], value: &[u8]) {
        self.accounts
            .entry(address)
            .or_default()
            .storage
            .insert(key.to_vec(), value.to_vec());
    }
}

impl BlockchainHook for MockWorld {
    fn get_user_account(&self, address: &Address) -> Option<UserAccount> {
        self.accounts.get(address).map(|account| UserAccount {
            address: *address,
            balance: account.balance.clone(),
            nonce: account.nonce,
            code: account.code.clone(),
        })
    }

    fn get_storage(&self, address: &Address, key: &[u8]) -> Vec<u8> {
        self.storage(address, key).unwrap_or_default()
    }

    fn is_builtin_function(&self, function: &str) -> bool {
        self.builtins.contains_key(function)
    }

    fn process_builtin_function(&self, input: &ContractCallInput) -> Result<VmOutput, VmError> {
        let builtin = self
            .builtins
            .get(&input.function)
            .ok_or_else(|| VmError::FunctionNotFound(input.function.clone()))?;
        builtin(input)
    }

    fn new_address(&self, creator: &Address, nonce: u64) -> Address {
        let seed = [creator.as_bytes().as_slice(), &nonce.to_be_bytes()].concat();
        Address::derive(&seed, creator.as_bytes()[Address::LEN - 1])
    }

    fn update_accounts(&mut self, accounts: &BTreeMap<Address, OutputAccount>) -> Result<(), VmError> {
        // Validate first so a bad delta leaves the world untouched.
        let mut balances = Vec::with_capacity(accounts.len());
        for (address, output) in accounts {
            let current = BigInt::from(self.balance(address));
            let updated = current + &output.balance_delta;
            if updated.sign() == Sign::Minus {
                return Err(VmError::Blockchain(format!("negative balance for {}", address)));
            }
            balances.push((*address, updated.magnitude().clone()));
        }

        for ((address, output), (_, balance)) in accounts.iter().zip(balances) {
            let account = self.accounts.entry(*address).or_default();
            account.balance = balance;
            for (key, value) in &output.storage_updates {
                if value.is_empty() {
                    account.storage.remove(key);
                } else {
                    account.storage.insert(key.clone(), value.clone());
                }
            }
            if output.code.is_some() {
                account.code = output.code.clone();
            }
        }
        Ok(())
    }
}

/// A transaction processed by [`MockNetwork`].
#[derive(Debug, Clone)]
pub struct ExecutedTransaction {
    pub hash: Hash,
    pub input: ContractCallInput,
    pub output: VmOutput,
}

/// Sequential transaction pipeline over a single world shared by all shards.
pub struct MockNetwork {
    host: VmHost<MockWorld, MockExecutor>,
    tx_counter: u64,
}

impl MockNetwork {
    pub fn new(world: MockWorld, executor: MockExecutor, config: HostConfig) -> Result<Self, VmError> {
        Ok(Self {
            host: VmHost::new(world, executor, config, telemetry::silent())?,
            tx_counter: 0,
        })
    }

    pub fn host(&self) -> &VmHost<MockWorld, MockExecutor> {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut VmHost<MockWorld, MockExecutor> {
        &mut self.host
    }

    pub fn world(&self) -> &MockWorld {
        self.host.blockchain()
    }

    fn next_tx_hash(&mut self) -> Hash {
        self.tx_counter += 1;
        Hash::compute(b"mock-tx").derive_call_id(self.tx_counter)
    }

    /// Run `input` and every async transfer it causes, in FIFO order.
    pub fn execute(&mut self, mut input: ContractCallInput) -> Result<Vec<ExecutedTransaction>, VmError> {
        let original = self.next_tx_hash();
        input.vm_input.original_tx_hash = original;
        input.vm_input.current_tx_hash = original;

        let mut queue = VecDeque::from([input]);
        let mut executed = Vec::new();
        while let Some(input) = queue.pop_front() {
            let output = self.host.run_smart_contract_call(input.clone())?;
            self.host.blockchain_mut().update_accounts(&output.output_accounts)?;

            for transfer in output.transfers() {
                if !transfer.call_type.is_async() {
                    continue;
                }
                let hash = self.next_tx_hash();
                queue.push_back(transfer_to_call_input(transfer, original, hash)?);
            }
            executed.push(ExecutedTransaction {
                hash: input.vm_input.current_tx_hash,
                input,
                output,
            });
        }
        Ok(executed)
    }
}

/// Scripted contracts executing `graph`, recording `contract.function` into
/// `trace` each time a node runs. Contract `name` lives at
/// `test_address(name, 0)` with code `name`.
pub fn graph_contracts(graph: &CallGraph, trace: Arc<Mutex<Vec<String>>>) -> (MockWorld, MockExecutor) {
    let mut contracts: BTreeMap<String, MockContract> = BTreeMap::new();

    for (index, node) in graph.nodes().iter().enumerate() {
        let id = crate::call_graph::NodeId(index);
        let label = format!("{}.{}", node.contract, node.function);
        let gas_used = node.gas_used;
        let fails = node.fails;
        let edges: Vec<(Address, String, EdgeKind)> = graph
            .outgoing(id)
            .map(|edge| {
                let target = graph.node(edge.to);
                (test_address(&target.contract, 0), target.function.clone(), edge.kind.clone())
            })
            .collect();
        let group_callbacks = node.group_callbacks.clone();
        let context_callback = node.context_callback.clone();
        let trace = Arc::clone(&trace);

        let function = move |hooks: &mut dyn VmHooks| -> Result<(), ExecutionError> {
            trace.lock().push(label.clone());
            hooks.use_gas(gas_used)?;
            if fails {
                return Err(ExecutionError::user(format!("{} failed", label)));
            }
            for (destination, function, kind) in &edges {
                match kind {
                    EdgeKind::Sync { gas_limit } => {
                        hooks.execute_on_dest_context(SyncCallRequest::new(*destination, function.clone(), *gas_limit))?;
                    }
                    EdgeKind::Async {
                        group,
                        gas_limit,
                        gas_locked,
                        success_callback,
                        error_callback,
                    } => {
                        let mut request = AsyncCallRequest::new(*destination, function.clone(), *gas_limit);
                        request.extra_gas_for_callback = *gas_locked;
                        request.success_callback = success_callback.clone();
                        request.error_callback = error_callback.clone();
                        hooks.register_async_call(group, request)?;
                    }
                }
            }
            for (group, callback) in &group_callbacks {
                hooks.set_group_callback(group, &callback.function, &[], callback.gas)?;
            }
            if let Some(callback) = &context_callback {
                hooks.set_context_callback(&callback.function, &[], callback.gas)?;
            }
            Ok(())
        };
        contracts
            .entry(node.contract.clone())
            .or_default()
            .add_function(&node.function, function);
    }

    let mut world = MockWorld::new();
    let mut executor = MockExecutor::new();
    for (name, contract) in contracts {
        world.add_contract(test_address(&name, 0), name.as_bytes().to_vec(), 0);
        executor.register(name.as_bytes(), contract);
    }
    (world, executor)
}

//! Intra-shard async calls: gas accounting, callback selection and the
//! order in which calls and callbacks run.

mod common;

use std::sync::Arc;

use num_bigint::BigUint;
use proptest::prelude::*;
use strata_types::ReturnCode;
use strata_vm::call_graph::CallGraph;
use strata_vm::mock::{graph_contracts, test_address, MockContract, MockExecutor, MockWorld};
use strata_vm::{AsyncCallRequest, ContractCallInput, ExecutionError, GasSchedule, HostConfig, VmHost};

use common::{async_edge, labels, network, priced_network, trace};

fn request(destination: strata_types::Address, function: &str, gas: u64, locked: u64) -> AsyncCallRequest {
    let mut request = AsyncCallRequest::new(destination, function, gas);
    request.extra_gas_for_callback = locked;
    request.success_callback = "onOk".to_string();
    request.error_callback = "onErr".to_string();
    request
}

/// A caller whose callbacks store the arguments they receive.
fn recording_caller(run: impl Fn(&mut dyn strata_vm::VmHooks) -> Result<(), ExecutionError> + Send + Sync + 'static) -> MockContract {
    let mut caller = MockContract::new();
    caller.add_function("run", run);
    caller.add_function("onOk", |hooks| {
        hooks.use_gas(20)?;
        let args = hooks.arguments();
        hooks.storage_store(b"code", &args[0])?;
        hooks.storage_store(b"result", &args[1])?;
        Ok(())
    });
    caller.add_function("onErr", |hooks| {
        hooks.use_gas(20)?;
        let args = hooks.arguments();
        hooks.storage_store(b"code", &args[0])?;
        hooks.storage_store(b"error", &args[1])?;
        let vault = test_address("vault", 0);
        hooks.transfer_value(&vault, &BigUint::from(5u8), b"")?;
        Ok(())
    });
    caller
}

#[test]
fn test_single_async_call_returns_unused_gas() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);
    let user = test_address("user", 0);

    let caller = recording_caller(move |hooks| {
        hooks.use_gas(100)?;
        hooks.register_async_call("", request(b, "work", 200, 50))?;
        Ok(())
    });
    let mut callee = MockContract::new();
    callee.add_function("work", |hooks| {
        hooks.use_gas(30)?;
        hooks.finish(b"done")
    });

    let mut world = MockWorld::new();
    world.add_contract(a, b"A".to_vec(), 0);
    world.add_contract(b, b"B".to_vec(), 0);
    let mut executor = MockExecutor::new();
    executor.register(b"A", caller);
    executor.register(b"B", callee);

    let mut network = network(world, executor);
    let executed = network.execute(ContractCallInput::new(user, a, "run", 1_000)).unwrap();

    assert_eq!(executed.len(), 1);
    let output = &executed[0].output;
    assert!(output.is_success(), "{}", output.return_message);
    assert_eq!(output.gas_remaining, 1_000 - 100 - 30 - 20);
    assert_eq!(network.world().storage(&a, b"code"), Some(ReturnCode::Ok.to_bytes()));
    assert_eq!(network.world().storage(&a, b"result"), Some(b"done".to_vec()));
}

#[test]
fn test_failed_child_runs_error_callback() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);
    let vault = test_address("vault", 0);
    let user = test_address("user", 0);

    let caller = recording_caller(move |hooks| {
        hooks.use_gas(100)?;
        hooks.register_async_call("", request(b, "fail", 200, 50))?;
        Ok(())
    });
    let mut callee = MockContract::new();
    callee.add_function("fail", |hooks| {
        hooks.use_gas(10)?;
        hooks.storage_store(b"touched", b"yes")?;
        Err(ExecutionError::user("boom"))
    });

    let mut world = MockWorld::new();
    world.add_contract(a, b"A".to_vec(), 100);
    world.add_contract(b, b"B".to_vec(), 0);
    let mut executor = MockExecutor::new();
    executor.register(b"A", caller);
    executor.register(b"B", callee);

    let mut network = network(world, executor);
    let executed = network.execute(ContractCallInput::new(user, a, "run", 1_000)).unwrap();

    let output = &executed[0].output;
    assert!(output.is_success(), "{}", output.return_message);
    // The failed child burns its whole gas limit.
    assert_eq!(output.gas_remaining, 1_000 - 100 - 200 - 20);
    assert!(network.host().all_errors().iter().any(|e| e == "fail: boom"));

    let world = network.world();
    assert_eq!(world.storage(&a, b"code"), Some(ReturnCode::UserError.to_bytes()));
    assert_eq!(world.storage(&a, b"error"), Some(b"boom".to_vec()));
    assert_eq!(world.storage(&b, b"touched"), None);
    assert_eq!(world.balance(&vault), BigUint::from(5u8));
    assert_eq!(world.balance(&a), BigUint::from(95u8));
}

#[test]
fn test_fan_out_fires_group_and_context_callbacks_once() {
    let a = test_address("A", 0);
    let user = test_address("user", 0);
    let children = ["B", "C", "D"];
    let trace = trace();

    let mut caller = MockContract::new();
    caller.add_function("run", move |hooks| {
        hooks.use_gas(50)?;
        for name in children {
            let mut call = AsyncCallRequest::new(test_address(name, 0), "work", 100);
            call.extra_gas_for_callback = 10;
            call.success_callback = "onOk".to_string();
            hooks.register_async_call("", call)?;
        }
        hooks.set_group_callback("", "groupDone", b"payload", 30)?;
        hooks.set_context_callback("allDone", b"", 20)
    });
    let t = Arc::clone(&trace);
    caller.add_function("onOk", move |hooks| {
        t.lock().push("A.onOk".to_string());
        hooks.use_gas(5)
    });
    let t = Arc::clone(&trace);
    caller.add_function("groupDone", move |hooks| {
        let args = hooks.arguments();
        t.lock().push(format!("A.groupDone {}", String::from_utf8_lossy(&args[0])));
        hooks.use_gas(7)
    });
    let t = Arc::clone(&trace);
    caller.add_function("allDone", move |hooks| {
        t.lock().push(format!("A.allDone {}", hooks.arguments().len()));
        hooks.use_gas(3)
    });

    let mut world = MockWorld::new();
    let mut executor = MockExecutor::new();
    world.add_contract(a, b"A".to_vec(), 0);
    executor.register(b"A", caller);
    for (i, name) in children.iter().enumerate() {
        let mut child = MockContract::new();
        let t = Arc::clone(&trace);
        let label = format!("{}.work", name);
        let used = 10 * (i as u64 + 1);
        child.add_function("work", move |hooks| {
            t.lock().push(label.clone());
            hooks.use_gas(used)
        });
        world.add_contract(test_address(name, 0), name.as_bytes().to_vec(), 0);
        executor.register(name.as_bytes(), child);
    }

    let mut network = network(world, executor);
    let executed = network.execute(ContractCallInput::new(user, a, "run", 1_000)).unwrap();

    let output = &executed[0].output;
    assert!(output.is_success(), "{}", output.return_message);
    assert_eq!(output.gas_remaining, 1_000 - 50 - (10 + 20 + 30) - 3 * 5 - 7 - 3);
    assert_eq!(
        *trace.lock(),
        [
            "B.work",
            "A.onOk",
            "C.work",
            "A.onOk",
            "D.work",
            "A.onOk",
            "A.groupDone payload",
            "A.allDone 0"
        ]
    );
}

#[test]
fn test_host_follows_graph_order() {
    let mut graph = CallGraph::new();
    let a = graph.add_node("A", "run", 10);
    let b = graph.add_node("B", "work", 5);
    let c = graph.add_node("C", "work", 5);
    let d = graph.add_node("D", "work", 5);
    graph.add_node("A", "onOk", 1);
    graph.add_node("A", "onErr", 1);
    graph.set_start(a);
    graph.add_async_edge(a, b, async_edge("g1", 100, 50, "onOk", "onErr"));
    graph.add_async_edge(a, c, async_edge("g2", 100, 50, "onOk", "onErr"));
    graph.add_async_edge(a, d, async_edge("g1", 100, 50, "onOk", "onErr"));
    graph.set_group_callback(a, "g1", "g1Done", 10, 2);
    graph.set_context_callback(a, "allDone", 10, 3);
    graph.node_mut(c).fails = true;

    let trace = trace();
    let (world, executor) = graph_contracts(&graph, Arc::clone(&trace));
    let mut network = network(world, executor);
    let user = test_address("user", 0);
    let executed = network
        .execute(ContractCallInput::new(user, test_address("A", 0), "run", 100_000))
        .unwrap();

    assert!(executed[0].output.is_success());
    let expected = labels(&graph, &graph.execution_order().unwrap());
    assert_eq!(*trace.lock(), expected);
}

#[test]
fn test_gas_of_nested_graph_matches_expectation() {
    let mut graph = CallGraph::new();
    let a = graph.add_node("A", "run", 10);
    let b = graph.add_node("B", "run", 20);
    let c = graph.add_node("C", "work", 7);
    let d = graph.add_node("D", "work", 9);
    graph.add_node("B", "cb", 4);
    graph.add_node("A", "onOk", 1);
    graph.set_start(a);
    graph.add_sync_edge(a, b, 500);
    graph.add_async_edge(b, c, async_edge("", 100, 20, "cb", "cb"));
    graph.add_async_edge(a, d, async_edge("g", 100, 20, "onOk", ""));
    graph.set_group_callback(a, "g", "gDone", 10, 2);
    graph.set_context_callback(a, "end", 10, 1);

    let trace = trace();
    let (world, executor) = graph_contracts(&graph, Arc::clone(&trace));
    let mut network = network(world, executor);
    let user = test_address("user", 0);
    let executed = network
        .execute(ContractCallInput::new(user, test_address("A", 0), "run", 10_000))
        .unwrap();

    let output = &executed[0].output;
    assert!(output.is_success(), "{}", output.return_message);
    assert_eq!(output.gas_remaining, 10_000 - graph.expected_gas_used().unwrap());
    assert_eq!(
        *trace.lock(),
        ["A.run", "B.run", "C.work", "B.cb", "D.work", "A.onOk", "A.gDone", "A.end"]
    );
}

#[test]
fn test_failing_callback_fails_transaction() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);
    let user = test_address("user", 0);

    let mut caller = MockContract::new();
    caller.add_function("run", move |hooks| {
        hooks.storage_store(b"before", b"1")?;
        hooks.register_async_call("", request(b, "work", 100, 10))?;
        Ok(())
    });
    caller.add_function("onOk", |hooks| {
        hooks.storage_store(b"callback", b"1")?;
        Err(ExecutionError::user("callback refused"))
    });
    caller.add_function("onErr", |_| Ok(()));
    let mut callee = MockContract::new();
    callee.add_function("work", |_| Ok(()));

    let mut world = MockWorld::new();
    world.add_contract(a, b"A".to_vec(), 0);
    world.add_contract(b, b"B".to_vec(), 0);
    let mut executor = MockExecutor::new();
    executor.register(b"A", caller);
    executor.register(b"B", callee);

    let mut network = network(world, executor);
    let executed = network.execute(ContractCallInput::new(user, a, "run", 1_000)).unwrap();

    let output = &executed[0].output;
    assert_eq!(output.return_code, ReturnCode::UserError);
    assert_eq!(output.return_message, "callback refused");
    // Only the callback's own effects are dropped.
    assert_eq!(network.world().storage(&a, b"before"), Some(b"1".to_vec()));
    assert_eq!(network.world().storage(&a, b"callback"), None);
}

#[test]
fn test_callback_reads_closure_of_its_call() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);
    let user = test_address("user", 0);

    let mut caller = MockContract::new();
    caller.add_function("run", move |hooks| {
        let outside = hooks.callback_closure().unwrap_err();
        hooks.storage_store(b"outside", outside.to_string().as_bytes())?;
        for closure in [b"first".to_vec(), b"second".to_vec()] {
            let mut request = AsyncCallRequest::new(b, "work", 100);
            request.success_callback = "onOk".to_string();
            request.callback_closure = closure;
            hooks.register_async_call("g", request)?;
        }
        hooks.set_group_callback("g", "gDone", b"", 0)
    });
    caller.add_function("onOk", |hooks| {
        let closure = hooks.callback_closure()?;
        hooks.storage_store(&closure, b"seen")
    });
    caller.add_function("gDone", |hooks| {
        let error = hooks.callback_closure().unwrap_err();
        hooks.storage_store(b"group", error.to_string().as_bytes())
    });
    let mut callee = MockContract::new();
    callee.add_function("work", |_| Ok(()));

    let mut world = MockWorld::new();
    world.add_contract(a, b"A".to_vec(), 0);
    world.add_contract(b, b"B".to_vec(), 0);
    let mut executor = MockExecutor::new();
    executor.register(b"A", caller);
    executor.register(b"B", callee);

    let mut network = network(world, executor);
    let executed = network.execute(ContractCallInput::new(user, a, "run", 1_000)).unwrap();
    assert!(executed[0].output.is_success(), "{}", executed[0].output.return_message);

    let world = network.world();
    let missing = b"No callback closure outside an async call callback".to_vec();
    assert_eq!(world.storage(&a, b"first"), Some(b"seen".to_vec()));
    assert_eq!(world.storage(&a, b"second"), Some(b"seen".to_vec()));
    assert_eq!(world.storage(&a, b"outside"), Some(missing.clone()));
    assert_eq!(world.storage(&a, b"group"), Some(missing));
}

fn priced_world(callees: &[(&str, MockContract)], caller: MockContract) -> (MockWorld, MockExecutor) {
    let mut world = MockWorld::new();
    let mut executor = MockExecutor::new();
    world.add_contract(test_address("A", 0), b"A".to_vec(), 0);
    executor.register(b"A", caller);
    for (name, contract) in callees {
        world.add_contract(test_address(name, 0), name.as_bytes().to_vec(), 0);
        executor.register(name.as_bytes(), contract.clone());
    }
    (world, executor)
}

#[test]
fn test_callback_out_of_gas_keeps_sibling_effects() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);
    let c = test_address("C", 0);

    let caller = recording_caller(move |hooks| {
        hooks.storage_store(b"before", b"yes")?;
        hooks.register_async_call("", request(b, "burn", 100, 0))?;
        hooks.register_async_call("", request(c, "work", 50, 20))?;
        Ok(())
    });
    let mut burner = MockContract::new();
    burner.add_function("burn", |hooks| hooks.use_gas(100));
    let mut worker = MockContract::new();
    worker.add_function("work", |hooks| {
        hooks.use_gas(5)?;
        hooks.finish(b"fine")
    });
    let (world, executor) = priced_world(&[("B", burner), ("C", worker)], caller);
    let schedule = GasSchedule {
        async_call_step: 10,
        ..GasSchedule::zero()
    };
    let mut network = priced_network(world, executor, schedule);

    let executed = network
        .execute(ContractCallInput::new(test_address("user", 0), a, "run", 1_000))
        .unwrap();

    // B's callback gets only its extra lock, which the overhead eats whole.
    let output = &executed[0].output;
    assert_eq!(output.return_code, ReturnCode::OutOfGas);
    assert!(output.return_message.starts_with("Out of gas"));
    assert_eq!(output.gas_remaining, 1_000 - 2 * 10 - 100 - 5 - 2 * 10 - 20);

    let world = network.world();
    assert_eq!(world.storage(&a, b"before"), Some(b"yes".to_vec()));
    assert_eq!(world.storage(&a, b"code"), Some(ReturnCode::Ok.to_bytes()));
    assert_eq!(world.storage(&a, b"result"), Some(b"fine".to_vec()));
}

#[test]
fn test_callback_that_cannot_pay_overhead_is_skipped() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);

    let caller = recording_caller(move |hooks| {
        hooks.register_async_call("", request(b, "burn", 100, 0))?;
        Ok(())
    });
    let mut burner = MockContract::new();
    burner.add_function("burn", |hooks| hooks.use_gas(100));
    let (world, executor) = priced_world(&[("B", burner)], caller);
    let schedule = GasSchedule {
        async_call_step: 10,
        data_copy_per_byte: 1,
        ..GasSchedule::zero()
    };
    let mut network = priced_network(world, executor, schedule);

    let executed = network
        .execute(ContractCallInput::new(test_address("user", 0), a, "run", 1_000))
        .unwrap();

    // Overhead is 10 plus the copy of "onOk@00" (7 bytes); only the 10 locked are there.
    let output = &executed[0].output;
    assert_eq!(output.return_code, ReturnCode::OutOfGas);
    assert_eq!(output.return_message, "Out of gas: requested 17, remaining 10");
    assert_eq!(output.gas_remaining, 1_000 - 10 - 100 - 10);
    assert_eq!(network.world().storage(&a, b"code"), None);
}

#[test_log::test]
fn test_run_with_ambient_subscriber() {
    let a = test_address("A", 0);
    let b = test_address("B", 0);
    let mut caller = MockContract::new();
    caller.add_function("run", move |hooks| {
        hooks.register_async_call("", AsyncCallRequest::new(b, "work", 100))?;
        hooks.write_log(&[b"started".to_vec()], b"")
    });
    let mut callee = MockContract::new();
    callee.add_function("work", |hooks| hooks.finish(b"ok"));

    let mut world = MockWorld::new();
    world.add_contract(a, b"A".to_vec(), 0);
    world.add_contract(b, b"B".to_vec(), 0);
    let mut executor = MockExecutor::new();
    executor.register(b"A", caller);
    executor.register(b"B", callee);

    let logger = tracing::dispatcher::get_default(|dispatch| dispatch.clone());
    let mut host = VmHost::new(world, executor, HostConfig::zero_cost(), logger).unwrap();
    let output = host
        .run_smart_contract_call(ContractCallInput::new(test_address("user", 0), a, "run", 500))
        .unwrap();

    assert!(output.is_success());
    assert_eq!(output.gas_remaining, 500);
    assert_eq!(output.logs.len(), 1);
    assert_eq!(output.logs[0].address, a);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_siblings_run_in_group_then_registration_order(
        children in prop::collection::vec((0u64..50, any::<bool>(), 0u8..2), 1..6)
    ) {
        let mut graph = CallGraph::new();
        let a = graph.add_node("A", "run", 1);
        graph.add_node("A", "onOk", 1);
        graph.add_node("A", "onErr", 2);
        graph.set_start(a);
        for (i, (gas_used, fails, group)) in children.iter().enumerate() {
            let child = graph.add_node(&format!("C{}", i), "work", *gas_used);
            graph.node_mut(child).fails = *fails;
            let group = format!("g{}", group);
            graph.add_async_edge(a, child, async_edge(&group, 1_000, 100, "onOk", "onErr"));
        }

        let trace = trace();
        let (world, executor) = graph_contracts(&graph, Arc::clone(&trace));
        let mut network = network(world, executor);
        let executed = network
            .execute(ContractCallInput::new(test_address("user", 0), test_address("A", 0), "run", 1_000_000))
            .unwrap();

        prop_assert!(executed[0].output.is_success());
        let expected = labels(&graph, &graph.execution_order().unwrap());
        prop_assert_eq!(trace.lock().clone(), expected);
    }
}

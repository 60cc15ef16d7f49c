//! Shared helpers for host integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use strata_vm::call_graph::{CallGraph, EdgeKind, NodeId};
use strata_vm::mock::{MockExecutor, MockNetwork, MockWorld};
use strata_vm::{GasSchedule, HostConfig};

pub type Trace = Arc<Mutex<Vec<String>>>;

pub fn trace() -> Trace {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn network(world: MockWorld, executor: MockExecutor) -> MockNetwork {
    MockNetwork::new(world, executor, HostConfig::zero_cost()).unwrap()
}

pub fn sharded_network(world: MockWorld, executor: MockExecutor, num_shards: u32) -> MockNetwork {
    let mut config = HostConfig::zero_cost();
    config.shards.num_shards = num_shards;
    MockNetwork::new(world, executor, config).unwrap()
}

pub fn priced_network(world: MockWorld, executor: MockExecutor, schedule: GasSchedule) -> MockNetwork {
    let config = HostConfig {
        gas_schedule: schedule.to_table(),
        ..HostConfig::default()
    };
    MockNetwork::new(world, executor, config).unwrap()
}

pub fn async_edge(group: &str, gas_limit: u64, gas_locked: u64, success: &str, error: &str) -> EdgeKind {
    EdgeKind::Async {
        group: group.to_string(),
        gas_limit,
        gas_locked,
        success_callback: success.to_string(),
        error_callback: error.to_string(),
    }
}

pub fn labels(graph: &CallGraph, order: &[NodeId]) -> Vec<String> {
    order
        .iter()
        .map(|id| {
            let node = graph.node(*id);
            format!("{}.{}", node.contract, node.function)
        })
        .collect()
}

//! Frame stack of a running transaction.
//!
//! Every contract invocation (top-level call, nested sync call, locally
//! executed async call, callback) pushes a [`Frame`] holding its input, its
//! gas ledger and its async context. The stack enforces the maximum depth
//! and answers the questions async registration depends on.

use std::collections::BTreeSet;

use strata_types::{Address, CallType};

use crate::async_context::AsyncContext;
use crate::error::VmError;
use crate::gas_metering::GasLedger;
use crate::runtime::ContractCallInput;
use crate::MAX_CALL_DEPTH;

/// What a frame is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A contract function.
    Call,
    /// The constructor of a contract being deployed.
    Init,
    /// Synthetic frame resolving a cross-shard callback.
    Resolution,
}

/// A single execution frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub input: ContractCallInput,
    /// Account whose storage and balance the frame works on.
    pub context_address: Address,
    /// Account whose code runs.
    pub code_address: Address,
    pub code_size: u64,
    pub exported: BTreeSet<String>,
    pub kind: FrameKind,
    pub ledger: GasLedger,
    pub async_context: AsyncContext,
    pub depth: usize,
    /// Closure of the async call whose callback this frame runs.
    pub callback_closure: Option<Vec<u8>>,
}

impl Frame {
    pub fn call_type(&self) -> CallType {
        self.input.vm_input.call_type
    }

    pub fn function(&self) -> &str {
        &self.input.function
    }

    pub fn is_async(&self) -> bool {
        self.call_type().is_async()
    }
}

#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<Frame>,
    max_depth: usize,
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStack {
    pub fn new() -> Self {
        Self::with_max_depth(MAX_CALL_DEPTH)
    }

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_depth,
        }
    }

    /// Push a frame, assigning its depth.
    ///
    /// # Errors
    /// [`VmError::CallDepthExceeded`] when the stack is full.
    pub fn enter(&mut self, mut frame: Frame) -> Result<usize, VmError> {
        let depth = self.frames.len();
        if depth >= self.max_depth {
            return Err(VmError::CallDepthExceeded { depth });
        }
        frame.depth = depth;
        self.frames.push(frame);
        Ok(depth)
    }

    pub fn exit(&mut self) -> Result<Frame, VmError> {
        self.frames
            .pop()
            .ok_or_else(|| VmError::Internal("call stack is empty".to_string()))
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn root(&self) -> Option<&Frame> {
        self.frames.first()
    }

    /// Whether `address` has a frame on the stack.
    pub fn contains(&self, address: &Address) -> bool {
        self.frames.iter().any(|frame| &frame.context_address == address)
    }

    /// Any frame running an async call or callback.
    pub fn has_async_frame(&self) -> bool {
        self.frames.iter().any(Frame::is_async)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

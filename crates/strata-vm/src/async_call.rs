//! Async calls and the groups they are registered in.

use std::io::{Read, Write};

use borsh::{BorshDeserialize, BorshSerialize};
use num_bigint::BigUint;
use strata_types::{Address, Hash, ReturnCode};

use crate::call_args::parse_call_data;
use crate::error::VmError;

/// Where an async call will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum AsyncExecutionMode {
    /// Same shard, destination has code: runs right after the caller finishes.
    SyncExecution,
    /// Same shard builtin function.
    BuiltinFunctionIntraShard,
    /// Leaves the transaction as an output transfer.
    Remote,
}

impl AsyncExecutionMode {
    pub fn is_local(self) -> bool {
        self != AsyncExecutionMode::Remote
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum AsyncCallStatus {
    Pending,
    /// Matched to a result with the given return code.
    Resolved(ReturnCode),
}

/// A registered async call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCall {
    pub call_id: Hash,
    pub destination: Address,
    /// `function@hex(arg)…`
    pub data: Vec<u8>,
    pub value: BigUint,
    pub gas_limit: u64,
    pub gas_locked: u64,
    pub success_callback: String,
    pub error_callback: String,
    /// Opaque bytes handed back to whichever callback answers this call.
    pub callback_closure: Vec<u8>,
    pub status: AsyncCallStatus,
    pub execution_mode: AsyncExecutionMode,
}

impl AsyncCall {
    pub fn is_pending(&self) -> bool {
        self.status == AsyncCallStatus::Pending
    }

    pub fn is_local(&self) -> bool {
        self.execution_mode.is_local()
    }

    pub fn has_callback(&self) -> bool {
        !self.success_callback.is_empty() || !self.error_callback.is_empty()
    }

    /// Callback selected by the resolved return code. `None` while pending.
    pub fn callback_name(&self) -> Option<&str> {
        match self.status {
            AsyncCallStatus::Pending => None,
            AsyncCallStatus::Resolved(code) if code.is_ok() => Some(&self.success_callback),
            AsyncCallStatus::Resolved(_) => Some(&self.error_callback),
        }
    }

    pub fn resolve(&mut self, return_code: ReturnCode) {
        self.status = AsyncCallStatus::Resolved(return_code);
    }

    pub fn function_and_args(&self) -> Result<(String, Vec<Vec<u8>>), VmError> {
        parse_call_data(&self.data)
    }
}

impl BorshSerialize for AsyncCall {
    fn serialize<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.call_id.serialize(writer)?;
        self.destination.serialize(writer)?;
        self.data.serialize(writer)?;
        self.value.to_bytes_be().serialize(writer)?;
        self.gas_limit.serialize(writer)?;
        self.gas_locked.serialize(writer)?;
        self.success_callback.serialize(writer)?;
        self.error_callback.serialize(writer)?;
        self.callback_closure.serialize(writer)?;
        self.status.serialize(writer)?;
        self.execution_mode.serialize(writer)
    }
}

impl BorshDeserialize for AsyncCall {
    fn deserialize_reader<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            call_id: Hash::deserialize_reader(reader)?,
            destination: Address::deserialize_reader(reader)?,
            data: Vec::<u8>::deserialize_reader(reader)?,
            value: BigUint::from_bytes_be(&Vec::<u8>::deserialize_reader(reader)?),
            gas_limit: u64::deserialize_reader(reader)?,
            gas_locked: u64::deserialize_reader(reader)?,
            success_callback: String::deserialize_reader(reader)?,
            error_callback: String::deserialize_reader(reader)?,
            callback_closure: Vec::<u8>::deserialize_reader(reader)?,
            status: AsyncCallStatus::deserialize_reader(reader)?,
            execution_mode: AsyncExecutionMode::deserialize_reader(reader)?,
        })
    }
}

/// Callback attached to a group or to the whole context.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CallbackInfo {
    pub function: String,
    pub data: Vec<u8>,
    /// Gas reserved for running the callback.
    pub gas_locked: u64,
}

/// Named bucket of async calls sharing one completion callback.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AsyncCallGroup {
    pub id: String,
    /// Registration order.
    pub calls: Vec<AsyncCall>,
    pub callback: Option<CallbackInfo>,
    /// Set once the group completed and its callback (if any) ran.
    pub finalized: bool,
}

impl AsyncCallGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            calls: Vec::new(),
            callback: None,
            finalized: false,
        }
    }

    /// All calls resolved.
    pub fn is_complete(&self) -> bool {
        self.calls.iter().all(|call| !call.is_pending())
    }

    pub fn has_pending_calls(&self) -> bool {
        !self.is_complete()
    }

    pub fn find_call(&self, call_id: &Hash) -> Option<usize> {
        self.calls.iter().position(|call| &call.call_id == call_id)
    }
}

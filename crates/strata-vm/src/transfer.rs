//! Output transfers that carry async calls and callbacks between rounds.
//!
//! A remote async call leaves its originating transaction as an
//! [`OutputTransfer`] of type `AsynchronousCall`; the callee answers with an
//! `AsynchronousCallBack` transfer whose data starts with the return code.
//! [`encode_transfer`] gives the borsh wire form used between shards.

use borsh::{BorshDeserialize, BorshSerialize};
use num_bigint::BigUint;
use strata_types::{Address, CallType, Hash, ReturnCode};

use crate::async_call::AsyncCall;
use crate::call_args::{encode_callback_data, parse_call_data};
use crate::error::VmError;
use crate::runtime::{AsyncArguments, ContractCallInput, OutputTransfer, VmInput};

/// Transfer for a remote async call registered by the context `caller_call_id`.
pub fn build_async_call_transfer(sender: Address, call: &AsyncCall, caller_call_id: Hash) -> OutputTransfer {
    OutputTransfer {
        sender,
        receiver: call.destination,
        value: call.value.clone(),
        data: call.data.clone(),
        gas_limit: call.gas_limit,
        gas_locked: call.gas_locked,
        call_type: CallType::AsynchronousCall,
        async_arguments: Some(AsyncArguments {
            call_id: call.call_id,
            caller_call_id,
            callback_initiator_call_id: None,
        }),
    }
}

/// Fields of a callback transfer besides its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTransfer {
    pub return_code: ReturnCode,
    /// Return data on success, the error message on failure.
    pub arguments: Vec<Vec<u8>>,
    pub gas_limit: u64,
    pub gas_locked: u64,
    /// Call value refunded when the call failed.
    pub value: BigUint,
}

/// Callback answering the async call described by `incoming`.
pub fn build_callback_transfer(
    sender: Address,
    receiver: Address,
    incoming: &AsyncArguments,
    callback: CallbackTransfer,
) -> OutputTransfer {
    OutputTransfer {
        sender,
        receiver,
        value: callback.value,
        data: encode_callback_data(callback.return_code, &callback.arguments),
        gas_limit: callback.gas_limit,
        gas_locked: callback.gas_locked,
        call_type: CallType::AsynchronousCallBack,
        async_arguments: Some(AsyncArguments {
            call_id: incoming.call_id.callback_call_id(),
            caller_call_id: incoming.call_id,
            callback_initiator_call_id: Some(incoming.caller_call_id),
        }),
    }
}

/// Plain value (and data) transfer issued by contract code.
pub fn build_value_transfer(sender: Address, receiver: Address, value: BigUint, data: Vec<u8>) -> OutputTransfer {
    OutputTransfer {
        sender,
        receiver,
        value,
        data,
        gas_limit: 0,
        gas_locked: 0,
        call_type: CallType::DirectCall,
        async_arguments: None,
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct WireTransfer {
    sender: Address,
    receiver: Address,
    value: Vec<u8>,
    data: Vec<u8>,
    gas_limit: u64,
    gas_locked: u64,
    call_type: CallType,
    async_arguments: Option<AsyncArguments>,
}

/// Serialize a transfer for delivery to another shard.
pub fn encode_transfer(transfer: &OutputTransfer) -> Result<Vec<u8>, VmError> {
    let wire = WireTransfer {
        sender: transfer.sender,
        receiver: transfer.receiver,
        value: transfer.value.to_bytes_be(),
        data: transfer.data.clone(),
        gas_limit: transfer.gas_limit,
        gas_locked: transfer.gas_locked,
        call_type: transfer.call_type,
        async_arguments: transfer.async_arguments.clone(),
    };
    borsh::to_vec(&wire).map_err(|e| VmError::Internal(e.to_string()))
}

pub fn decode_transfer(bytes: &[u8]) -> Result<OutputTransfer, VmError> {
    let wire: WireTransfer =
        borsh::from_slice(bytes).map_err(|e| VmError::MalformedCallData(format!("transfer: {}", e)))?;
    Ok(OutputTransfer {
        sender: wire.sender,
        receiver: wire.receiver,
        value: BigUint::from_bytes_be(&wire.value),
        data: wire.data,
        gas_limit: wire.gas_limit,
        gas_locked: wire.gas_locked,
        call_type: wire.call_type,
        async_arguments: wire.async_arguments,
    })
}

/// Input of the transaction that delivers `transfer` on its receiver's shard.
///
/// Callback transfers keep an empty function name; their arguments start
/// with the return code.
pub fn transfer_to_call_input(
    transfer: &OutputTransfer,
    original_tx_hash: Hash,
    current_tx_hash: Hash,
) -> Result<ContractCallInput, VmError> {
    let (function, arguments) = match transfer.call_type {
        CallType::DirectCall if transfer.data.is_empty() => (String::new(), Vec::new()),
        _ => parse_call_data(&transfer.data)?,
    };
    Ok(ContractCallInput {
        vm_input: VmInput {
            caller: transfer.sender,
            arguments,
            call_value: transfer.value.clone(),
            call_type: transfer.call_type,
            gas_provided: transfer.gas_limit,
            gas_locked: transfer.gas_locked,
            original_tx_hash,
            current_tx_hash,
            async_arguments: transfer.async_arguments.clone(),
        },
        recipient: transfer.receiver,
        function,
    })
}

//! Call data codec.
//!
//! Calls travel as `function@hex(arg)@hex(arg)…`; callback payloads use an
//! empty function name and put the return code first:
//! `@<hex(return code)>@<hex(arg)>…`. Both encodings are consensus-relevant.

use strata_types::ReturnCode;

use crate::error::VmError;

pub const ARGS_SEPARATOR: char = '@';

/// Encode a function call.
pub fn encode_call_data(function: &str, args: &[Vec<u8>]) -> Vec<u8> {
    let mut data = String::with_capacity(function.len() + args.iter().map(|a| 1 + 2 * a.len()).sum::<usize>());
    data.push_str(function);
    for arg in args {
        data.push(ARGS_SEPARATOR);
        data.push_str(&hex::encode(arg));
    }
    data.into_bytes()
}

/// Split call data into function name and decoded arguments.
pub fn parse_call_data(data: &[u8]) -> Result<(String, Vec<Vec<u8>>), VmError> {
    if data.is_empty() {
        return Err(VmError::MalformedCallData("empty call data".to_string()));
    }
    let text = std::str::from_utf8(data)
        .map_err(|_| VmError::MalformedCallData("call data is not valid UTF-8".to_string()))?;

    let mut tokens = text.split(ARGS_SEPARATOR);
    let function = tokens.next().unwrap_or_default().to_string();
    let args = tokens
        .map(|token| {
            hex::decode(token)
                .map_err(|e| VmError::MalformedCallData(format!("argument '{}': {}", token, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((function, args))
}

/// A name that can be carried in call data without ambiguity.
pub fn validate_function_name(name: &str) -> Result<(), VmError> {
    if name.is_empty() {
        return Err(VmError::MalformedCallData("empty function name".to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(VmError::MalformedCallData(format!("invalid function name '{}'", name)));
    }
    Ok(())
}

/// Encode the payload of a callback transfer.
pub fn encode_callback_data(return_code: ReturnCode, args: &[Vec<u8>]) -> Vec<u8> {
    let mut all = Vec::with_capacity(args.len() + 1);
    all.push(return_code.to_bytes());
    all.extend(args.iter().cloned());
    encode_call_data("", &all)
}

/// Decode a callback payload into return code and arguments.
pub fn decode_callback_data(data: &[u8]) -> Result<(ReturnCode, Vec<Vec<u8>>), VmError> {
    let (function, mut args) = parse_call_data(data)?;
    if !function.is_empty() {
        return Err(VmError::MalformedCallData(format!(
            "callback payload starts with function '{}'",
            function
        )));
    }
    if args.is_empty() {
        return Err(VmError::MalformedCallData("callback payload has no return code".to_string()));
    }
    let code_bytes = args.remove(0);
    let return_code = ReturnCode::from_bytes(&code_bytes)
        .map_err(|e| VmError::MalformedCallData(e.to_string()))?;
    Ok((return_code, args))
}

/// Length used to price copying callback data: `len(function) + Σ(1 + 2·len(arg))`.
pub fn data_len(function: &str, args: &[Vec<u8>]) -> u64 {
    let args_len: usize = args.iter().map(|arg| 1 + 2 * arg.len()).sum();
    (function.len() + args_len) as u64
}

use crate::error::TypesError;
use std::fmt;

/// Contract-visible outcome of an execution.
///
/// Numeric values are consensus-relevant: they travel inside callback
/// payloads as the first argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ReturnCode {
    #[default]
    Ok,
    FunctionNotFound,
    FunctionWrongSignature,
    ContractNotFound,
    UserError,
    OutOfGas,
    AccountCollision,
    OutOfFunds,
    CallStackOverflow,
    ContractInvalid,
    ExecutionFailed,
}

impl ReturnCode {
    pub const ALL: [ReturnCode; 11] = [
        ReturnCode::Ok,
        ReturnCode::FunctionNotFound,
        ReturnCode::FunctionWrongSignature,
        ReturnCode::ContractNotFound,
        ReturnCode::UserError,
        ReturnCode::OutOfGas,
        ReturnCode::AccountCollision,
        ReturnCode::OutOfFunds,
        ReturnCode::CallStackOverflow,
        ReturnCode::ContractInvalid,
        ReturnCode::ExecutionFailed,
    ];

    pub fn as_u64(self) -> u64 {
        match self {
            ReturnCode::Ok => 0,
            ReturnCode::FunctionNotFound => 1,
            ReturnCode::FunctionWrongSignature => 2,
            ReturnCode::ContractNotFound => 3,
            ReturnCode::UserError => 4,
            ReturnCode::OutOfGas => 5,
            ReturnCode::AccountCollision => 6,
            ReturnCode::OutOfFunds => 7,
            ReturnCode::CallStackOverflow => 8,
            ReturnCode::ContractInvalid => 9,
            ReturnCode::ExecutionFailed => 10,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }

    /// Minimal big-endian encoding; `Ok` encodes as a single zero byte.
    pub fn to_bytes(self) -> Vec<u8> {
        let value = self.as_u64();
        if value == 0 {
            return vec![0];
        }
        let bytes = value.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        bytes[first..].to_vec()
    }

    /// Decode a big-endian unsigned return code. An empty buffer decodes as `Ok`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        let significant: Vec<u8> = bytes.iter().copied().skip_while(|&b| b == 0).collect();
        if significant.len() > 8 {
            return Err(TypesError::UnknownReturnCode(u64::MAX));
        }
        let value = significant
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
        Self::try_from(value)
    }
}

impl TryFrom<u64> for ReturnCode {
    type Error = TypesError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_u64() == value)
            .ok_or(TypesError::UnknownReturnCode(value))
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReturnCode::Ok => "ok",
            ReturnCode::FunctionNotFound => "function not found",
            ReturnCode::FunctionWrongSignature => "wrong signature for function",
            ReturnCode::ContractNotFound => "contract not found",
            ReturnCode::UserError => "user error",
            ReturnCode::OutOfGas => "out of gas",
            ReturnCode::AccountCollision => "account collision",
            ReturnCode::OutOfFunds => "out of funds",
            ReturnCode::CallStackOverflow => "call stack overflow",
            ReturnCode::ContractInvalid => "contract invalid",
            ReturnCode::ExecutionFailed => "execution failed",
        };
        f.write_str(text)
    }
}

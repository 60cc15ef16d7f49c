use crate::error::TypesError;
use std::fmt;

/// How a contract invocation reached the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallType {
    /// Ordinary transaction or synchronous nested call.
    #[default]
    DirectCall,
    /// Destination side of an async call.
    AsynchronousCall,
    /// Callback returning the result of an async call to its originator.
    AsynchronousCallBack,
}

impl CallType {
    pub fn as_u8(self) -> u8 {
        match self {
            CallType::DirectCall => 0,
            CallType::AsynchronousCall => 1,
            CallType::AsynchronousCallBack => 2,
        }
    }

    pub fn is_async(self) -> bool {
        self != CallType::DirectCall
    }
}

impl TryFrom<u8> for CallType {
    type Error = TypesError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CallType::DirectCall),
            1 => Ok(CallType::AsynchronousCall),
            2 => Ok(CallType::AsynchronousCallBack),
            other => Err(TypesError::UnknownCallType(other)),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CallType::DirectCall => "DirectCall",
            CallType::AsynchronousCall => "AsynchronousCall",
            CallType::AsynchronousCallBack => "AsynchronousCallBack",
        };
        f.write_str(text)
    }
}

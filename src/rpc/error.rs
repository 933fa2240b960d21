use serde::{Deserialize, Serialize};

use super::codec::CodecError;

/// Why a remote call did not produce a value.
///
/// Call errors travel over the wire inside error replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CallError {
    /// The target node has nothing exposed under this pair.
    #[error("no function {function} exposed under protocol {protocol}")]
    NotFound { protocol: u64, function: u64 },
    /// The arguments or the reply could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The exposed function itself failed.
    #[error("target failed: {0}")]
    TargetFailed(String),
    #[error("call timed out")]
    Timeout,
    /// The call could not reach the target or lost its connection.
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("node shut down")]
    Shutdown,
}

impl From<CodecError> for CallError {
    fn from(error: CodecError) -> Self {
        CallError::Malformed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::codec::{from_bytes, to_bytes};

    #[test]
    fn errors_cross_the_wire() {
        for error in [
            CallError::NotFound {
                protocol: 7,
                function: 99,
            },
            CallError::TargetFailed("boom".into()),
            CallError::Timeout,
            CallError::Unreachable("no route".into()),
            CallError::Shutdown,
        ] {
            let decoded: CallError = from_bytes(&to_bytes(&error).unwrap()).unwrap();
            assert_eq!(decoded, error);
        }
    }

    #[test]
    fn display_names_the_missing_function() {
        let error = CallError::NotFound {
            protocol: 7,
            function: 99,
        };
        assert_eq!(
            error.to_string(),
            "no function 99 exposed under protocol 7"
        );
    }
}

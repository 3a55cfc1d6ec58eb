// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while constructing a buffer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("partition count must be greater than 0")]
    InvalidPartitionCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            BufferError::InvalidPartitionCount.to_string(),
            "partition count must be greater than 0"
        );
    }
}

// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::extent::Extent3;
use crate::layout::StrategyId;
use crate::library::ErrorCode;
use dynamo_memory::StorageError;

pub type Result<T> = std::result::Result<T, StrideError>;

#[derive(Debug, thiserror::Error)]
pub enum StrideError {
    #[error("copy extent {copy} does not fit in allocation extent {alloc}")]
    InvalidExtent { copy: Extent3, alloc: Extent3 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("strategy {strategy} is not applicable: {reason}")]
    NotApplicable {
        strategy: StrategyId,
        reason: String,
    },

    #[error("message library call failed: {0}")]
    Library(ErrorCode),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrideError {
    /// The library error class reported to the application for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StrideError::InvalidExtent { .. } | StrideError::InvalidArgument(_) => {
                ErrorCode::ERR_ARG
            }
            StrideError::NotApplicable { .. } => ErrorCode::ERR_TYPE,
            StrideError::Library(code) => *code,
            StrideError::Storage(_) => ErrorCode::ERR_INTERN,
            StrideError::Config(_) | StrideError::Other(_) => ErrorCode::ERR_OTHER,
        }
    }

    pub(crate) fn not_applicable(strategy: StrategyId, reason: impl Into<String>) -> Self {
        StrideError::NotApplicable {
            strategy,
            reason: reason.into(),
        }
    }
}

impl From<ErrorCode> for StrideError {
    fn from(code: ErrorCode) -> Self {
        StrideError::Library(code)
    }
}

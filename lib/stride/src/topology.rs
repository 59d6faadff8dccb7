// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer placement lookup.

use crate::engine::Placement;
use crate::error::{Result, StrideError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;

/// Answers where an application buffer lives.
pub trait Topology: Send + Sync + fmt::Debug {
    fn placement(&self, addr: usize) -> Placement;
}

/// Every buffer is host memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostTopology;

impl Topology for HostTopology {
    fn placement(&self, _addr: usize) -> Placement {
        Placement::Host
    }
}

/// Device ranges registered explicitly; everything else is host memory.
#[derive(Debug, Default)]
pub struct RegisteredTopology {
    // start -> (len, device id)
    ranges: RwLock<BTreeMap<usize, (usize, u32)>>,
}

impl RegisteredTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `[addr, addr + len)` as memory of `device_id`.
    pub fn register(&self, addr: usize, len: usize, device_id: u32) -> Result<()> {
        if len == 0 {
            return Err(StrideError::InvalidArgument("empty device range".into()));
        }
        let end = addr
            .checked_add(len)
            .ok_or_else(|| StrideError::InvalidArgument("device range overflows".into()))?;
        let mut ranges = self.ranges.write();
        let overlaps_prev = ranges
            .range(..end)
            .next_back()
            .is_some_and(|(&start, &(l, _))| start + l > addr);
        if overlaps_prev {
            return Err(StrideError::InvalidArgument(format!(
                "device range {addr:#x}+{len} overlaps a registered range"
            )));
        }
        ranges.insert(addr, (len, device_id));
        Ok(())
    }

    /// Forget the range starting at `addr`. Returns false if none was registered.
    pub fn unregister(&self, addr: usize) -> bool {
        self.ranges.write().remove(&addr).is_some()
    }
}

impl Topology for RegisteredTopology {
    fn placement(&self, addr: usize) -> Placement {
        let ranges = self.ranges.read();
        match ranges.range(..=addr).next_back() {
            Some((&start, &(len, device_id))) if addr < start + len => Placement::Device(device_id),
            _ => Placement::Host,
        }
    }
}

/// Placement from the CUDA driver's pointer attributes.
#[cfg(feature = "cuda")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CudaTopology;

#[cfg(feature = "cuda")]
impl CudaTopology {
    unsafe fn attribute(attr: cudarc::driver::sys::CUpointer_attribute, addr: usize) -> Option<u32> {
        use cudarc::driver::sys::{self, CUresult};
        let mut value: u32 = 0;
        let result = unsafe {
            sys::cuPointerGetAttribute(
                &mut value as *mut u32 as *mut std::ffi::c_void,
                attr,
                addr as sys::CUdeviceptr,
            )
        };
        (result == CUresult::CUDA_SUCCESS).then_some(value)
    }
}

#[cfg(feature = "cuda")]
impl Topology for CudaTopology {
    fn placement(&self, addr: usize) -> Placement {
        use cudarc::driver::sys::{CUmemorytype, CUpointer_attribute};
        // pointers unknown to the driver are plain host memory
        let memory_type = unsafe {
            Self::attribute(CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE, addr)
        };
        if memory_type != Some(CUmemorytype::CU_MEMORYTYPE_DEVICE as u32) {
            return Placement::Host;
        }
        match unsafe { Self::attribute(CUpointer_attribute::CU_POINTER_ATTRIBUTE_DEVICE_ORDINAL, addr) } {
            Some(ordinal) => Placement::Device(ordinal),
            None => Placement::Host,
        }
    }
}

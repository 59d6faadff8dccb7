// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridges between layout descriptors and library datatypes.
//!
//! [`construct`] turns a [`LayoutDescriptor`](crate::layout::LayoutDescriptor) into a committed
//! native datatype; [`decode`] goes the other way, recovering a [`StridedBlock`] from the
//! constructor calls that produced an application datatype.

pub mod construct;
pub mod decode;

pub use construct::{NativeType, construct};
pub use decode::{StridedBlock, TypeRecord, decode};

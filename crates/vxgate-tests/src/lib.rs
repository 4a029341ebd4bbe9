// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-tests
//!
//! Shared harness for VXGATE integration tests: an in-process gateway
//! launcher, a minimal VXI-11 wire client, and mock backend instruments.

#![deny(unsafe_code)]

pub mod common;

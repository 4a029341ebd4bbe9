// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared test infrastructure.

pub mod client;
pub mod harness;
pub mod mocks;

pub use client::Vxi11TestClient;
pub use harness::spawn_gateway;
pub use mocks::{MockModbusSlave, MockScpiInstrument};

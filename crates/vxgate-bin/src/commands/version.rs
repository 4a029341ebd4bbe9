// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The `version` command.

/// Prints version information.
pub fn execute() {
    println!("vxgate {}", vxgate_core::VERSION);
    println!("  VXI-11 DEVICE_CORE program 0x0607AF v1");
    println!(
        "  backends: scpi-tcp scpi-serial modbus-tcp modbus-rtu modbus-ascii usbtmc loopback generic-regex"
    );
}

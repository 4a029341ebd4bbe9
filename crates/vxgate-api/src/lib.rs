// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # vxgate-api
//!
//! The management REST server for VXGATE: configuration retrieval and
//! overwrite, runtime reload, and lock-table inspection, as consumed by the
//! web configuration UI.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use server::ApiServer;
pub use state::AppState;

// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Domain types for BB-Pipeline's shared infrastructure: errors, value
//! objects, entities, and the port traits that `bb_pipeline_core` and
//! `bb_pipeline_orchestrator` implement. Free of I/O — no tokio, no
//! filesystem, no network.

pub mod entities;
pub mod error;
pub mod services;
pub mod value_objects;

pub use error::{CoreError, RecoverableErrorKind, Severity as ErrorSeverity};

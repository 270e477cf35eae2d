// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tidyfold: sort a directory's files into category folders
//!
//! Files are fingerprinted, classified by a local zero-shot model and
//! optionally a remote one, cached, then moved into `<root>/<label>/`.
//! Every move is logged first so a batch can be undone.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod credentials;
pub mod error;
pub mod extract;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod reorganize;
pub mod run;
pub mod web;

pub use config::AppConfig;
pub use error::{Result, TidyfoldError};

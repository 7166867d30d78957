/*
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! Template and package management for containers.
//!
//! OS templates describe a distribution release; application templates
//! add software on top of one.  Operations resolve a [`template::TemplateSet`],
//! refresh its repository metadata, and drive a package manager through a
//! [`pm::Transaction`] inside a container, recording the outcome in the
//! container's package record.  [`ops::Vztt`] is the entry point.

pub mod cache;
pub mod cmdutils;
pub mod config;
pub mod container;
pub mod errors;
pub mod lock;
pub mod metadata;
pub mod names;
pub mod ops;
pub mod packages;
pub mod pm;
pub mod scripts;
pub mod sigint;
pub mod template;

#[cfg(test)]
mod testutils;

pub use errors::{error_code, ErrorCode, VzttError};
pub use ops::{Options, Vztt};

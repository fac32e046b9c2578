// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Copy-on-write VM control plane
//!
//! This crate implements facilities shared by the per-host agent
//! (`cowvm_host_agent`) and the request gateway (`cowvm_controller`):
//!
//! * the [`api::Error`] type used across every component,
//! * the instance model, including the metadata tag contract other
//!   components rely on to infer lifecycle state,
//! * the messages exchanged between hosts,
//! * the capability interfaces consumed from external collaborators
//!   ([`services`]) and in-memory implementations of each of them
//!   ([`sim`]),
//! * the dispatch facade that resolves which host queue a request goes to
//!   ([`dispatch`]).

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod api;
pub mod backoff;
pub mod cmd;
pub mod dispatch;
pub mod services;
pub mod sim;

/// The topic every host agent listens on unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "cowvm";

/// A type that allows adding file and line numbers to log messages
/// automatically. It should be instantiated at the root logger of each
/// executable that desires this functionality, as in the following example.
/// ```ignore
///     slog::Logger::root(drain, o!(FileKv))
/// ```
pub struct FileKv;

impl slog::KV for FileKv {
    fn serialize(
        &self,
        record: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        // Only log file information when severity is at least info level
        if record.level() > slog::Level::Info {
            return Ok(());
        }
        serializer.emit_arguments(
            "file".into(),
            &format_args!("{}:{}", record.file(), record.line()),
        )
    }
}

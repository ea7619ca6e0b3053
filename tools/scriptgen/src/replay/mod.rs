//! Recording of browser actions and their replay as a standalone script.
//!
//! # Overview
//!
//! Every browser action the client sends through the proxy is reduced to a
//! [`action::RecordedAction`] and appended to a persisted action log
//! ([`log::ActionLog`]). When the client calls the local script-generation
//! tool, the log is handed to a [`emitter::ScriptEmitter`], which writes a
//! Node.js program that starts the same browser service and replays the
//! actions as JSON-RPC calls.
//!
//! The log is a JSON array on disk so a restarted proxy keeps what was
//! recorded before it stopped.

pub mod action;
pub mod emitter;
pub mod log;

#![cfg_attr(docsrs, feature(doc_cfg))]
//! # pylonbms_lib
//!
//! This crate provides a library for interacting with Pylontech-compatible
//! BMS (Battery Management System) devices over their ASCII-hex RS232/RS485
//! console protocol. It offers both synchronous and asynchronous clients
//! for communication.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the client you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `pylonbms` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** client using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing the decoded data structures.
//! - `bin-dependencies`: Enables all features required by the `pylonbms` binary executable.

/// Contains error types for the library.
mod error;
/// Defines the frame codec and payload decoders for the Pylontech protocol.
pub mod protocol;

pub use error::Error;

/// Synchronous client for Pylontech BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for Pylontech BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;

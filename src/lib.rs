//! # libkobold
//!
//! `libkobold` is a hardened parser for the Portable Executable (PE) format used by
//! Windows images, written for tools that must digest untrusted, truncated or hostile
//! input without panicking.
//!
//! Every read goes through a bounded [`cursor::Cursor`], and no count taken from the
//! file sizes an allocation before it is checked against the buffer. A damaged data
//! directory does not sink the whole parse: the failure is recorded on the returned
//! [`pe::Binary`] and the other directories are still decoded.
//!
//! # Example
//!
//! ```rust
//! use kobold::pe;
//!
//! fn run() -> kobold::error::Result<()> {
//!     # #[cfg(feature = "std")] {
//!     let path = "/path/to/some/image.dll";
//!     match pe::parse_file(path) {
//!         Ok(pe) => {
//!             println!("{} imports from {:?}", pe.name, pe.libraries);
//!             for failure in &pe.failures {
//!                 println!("could not parse {}: {}", failure.component, failure.error);
//!             }
//!         }
//!         Err(err) => println!("not a PE image: {err}"),
//!     }
//!     # }
//!     Ok(())
//! }
//! ```
//!
//! # Feature Usage
//!
//! `libkobold` is `no_std` with `alloc`. The `std` feature (on by default) adds
//! [`pe::parse_file`] and `std::error::Error` for [`error::Error`]; `codesign` adds the
//! SHA-256 authentihash.
//!
//! ```toml
//! [dependencies]
//! kobold = { version = "0.1", default-features = false }
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate core;

#[macro_use]
extern crate alloc;

pub mod cursor;
pub mod error;
pub mod options;
pub mod strtab;

pub mod pe;

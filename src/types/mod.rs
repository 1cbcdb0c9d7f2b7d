//! Core type definitions shared across the VM.
//!
//! - [`bytes::Bytes`]: reference-counted immutable byte buffer with
//!   copy-on-write semantics, used for script bodies and byte-string
//!   stack items.

pub mod bytes;

//! Fundamental types and the control plane: errors, the on-disk store,
//! hardened sqlite access, the rule loader, and the structural parser.

pub mod db;
pub mod error;
pub mod parse;
pub mod rules;
pub mod store;

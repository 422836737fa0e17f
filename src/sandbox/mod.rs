//! Sandbox: namespace orchestration, filesystem composition, capability
//! dropping, id-mapping, private networking, and build-step execution
//! (SPEC_FULL.md §4.1-§4.5, §4.7).

pub mod capabilities;
pub mod exec;
pub mod idmap;
pub mod mount;
pub mod namespace;
pub mod network;

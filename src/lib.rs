#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod exercise;
pub mod logging;
pub mod orchestrator;
pub mod overlay;
pub mod paths;
pub mod progress;
pub mod provision;
pub mod registry;
pub mod remote;
pub mod report;
pub mod scaffold;
pub mod store;
pub mod template;
pub mod vm;
pub mod vm_state;

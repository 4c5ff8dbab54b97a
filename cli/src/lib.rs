//! ctr-remote CLI - lazy image pulls for a snapshotter.

pub mod commands;
pub mod output;

//! Backup, restore and upgrade lifecycle for self-hosted n8n stacks

pub mod core;
pub mod utils;

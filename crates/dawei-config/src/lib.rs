// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{dawei_home, load_workspace_config};
pub use schema::{
    AgentConfig, CheckpointConfig, LlmProviderConfig, LoggingConfig, SchedulerConfig,
    ToolsConfig, WorkspaceConfig,
};

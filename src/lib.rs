// Copyright 2025 ModerRAS
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Wish Agent
//!
//! Turns a natural-language wish into a concrete proposal, waits for the
//! user to confirm it, then drives a checkpointed browser automation.
//!
//! Executions record every step in a durable ledger, suspend when they
//! need credentials, and pick up one-time passcodes from forwarded SMS or
//! email. Failures come back with ranked alternatives.
//!
//! ## Example
//!
//! ```rust,no_run
//! use wish_agent::EngineSettings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = EngineSettings::load();
//!     let orchestrator = settings.build_orchestrator()?;
//!
//!     let task = orchestrator.submit_wish("buy a kettle", "alice").await?;
//!     println!("{}", task.proposal_text);
//!
//!     let task = orchestrator.confirm(&task.id).await?;
//!     println!("Task is {}", task.status);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod browser;
pub mod config;
pub mod executor;
pub mod ledger;
pub mod model;
pub mod otp;
pub mod search;
pub mod settings;
pub mod store;
pub mod vault;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{OrchestratorError, Task, TaskCategory, TaskOrchestrator, TaskStatus};
pub use executor::{ExecutionResult, FailureKind};
pub use ledger::{ExecutionState, ExecutionStatus};
pub use model::{ModelClient, ModelConfig};
pub use otp::InboundMessage;
pub use settings::EngineSettings;
pub use vault::Secrets;

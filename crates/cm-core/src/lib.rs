pub mod binding;
pub mod config;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod validation;

pub mod types;

pub use crate::binding::{BindingState, IntegrationBinding};
pub use crate::config::CodeModeConfig;
pub use crate::diff::DiffApplicator;
pub use crate::error::{CodeModeError, ConfigError, DiffError, OrchestratorError};
pub use crate::orchestrator::{MockOrchestrator, MockScript, Orchestrator, OrchestratorAdapter};
pub use crate::service::CodeModeService;
pub use crate::validation::{SyntaxValidator, ValidatorRegistry};

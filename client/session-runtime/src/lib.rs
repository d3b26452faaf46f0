//! Client-side runtime for a proctored assessment session.
//!
//! [`SessionRuntime`] owns the integrity monitor, the local-first answer
//! store, the countdown and break manager, the batch submitter and the
//! completion controller. The presentation layer feeds it signals and edits
//! and listens to [`SessionEvent`]s.

pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use error::{Result, SessionError};
pub use models::SessionEvent;
pub use services::http_client::HttpAssessmentClient;
pub use services::remote::{AuditLogApi, DraftApi, RemoteApis, SessionApi};
pub use services::{SessionOverview, SessionRuntime};
pub use storage::{open_store, LocalStore};

//! Coordinator for a fixed pool of browser-backed proxy children.
//!
//! This library provides:
//! - Profile hydration from a local directory or an object store
//! - A slot manager that pins children to stable port triplets and recycles
//!   profiles through a rotation queue
//! - A child registry with round-robin dispatch and background health recovery
//! - An OpenAI-compatible HTTP front-end with retry-on-unhealthy failover
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use proxy_coordinator::{discover_profiles, ChildRegistry, Result, SlotManager};
//! use proxy_coordinator::launcher::LaunchConfig;
//! use proxy_coordinator::types::ProfileQueue;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let profiles = discover_profiles("auth_profiles/active".as_ref())?;
//!     let ports = proxy_coordinator::ports::assign_ports(profiles.len(), 3100, 3200, 9222, 1)?;
//!     let manager = Arc::new(SlotManager::new(
//!         ports,
//!         ProfileQueue::new(),
//!         LaunchConfig {
//!             command: "./child-proxy".into(),
//!             env: Default::default(),
//!             headless: true,
//!             log_dir: "logs/coordinator".into(),
//!         },
//!     ));
//!     let children = manager.bootstrap(&profiles)?;
//!     let registry = ChildRegistry::new(children);
//!     registry.set_slot_manager(manager);
//!     registry.start_monitoring().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod health;
pub mod launcher;
pub mod manager;
pub mod ports;
pub mod profiles;
pub mod routing;
pub mod server;
pub mod types;
pub mod watchdog;

// Re-export main types for library users
pub use manager::{ChildRegistry, SlotManager};
pub use profiles::{discover_profiles, HydrationResult};
pub use routing::ChildRequestError;
pub use server::{create_router, AppState, ChatCompletionRequest};
pub use types::{AuthProfile, CancelResult, ChildPorts, ChildProcess, ProfileQueue, ProfileSlot};

// Re-export common types
pub type Result<T> = std::result::Result<T, anyhow::Error>;

//! vSphere backend client for VMops controllers
//!
//! Provides the keyed session cache shared by concurrent reconciles and
//! the service contracts the controllers drive the backend through.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vsphere_client::{RestAuthenticator, SessionManager, SessionParams};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SessionManager::new(Arc::new(RestAuthenticator::new()?));
//!
//! let session = manager
//!     .get_or_create(SessionParams {
//!         server: "vc.example.com".to_string(),
//!         datacenter: "dc0".to_string(),
//!         username: "admin".to_string(),
//!         password: "secret".to_string(),
//!         thumbprint: None,
//!     })
//!     .await?;
//! assert!(session.is_healthy());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod models;
pub mod rest;
pub mod service;
pub mod session;
#[cfg(feature = "test-util")]
pub mod mock;

pub use error::VsphereError;
pub use models::*;
pub use rest::RestClient;
pub use service::{InventoryService, VmService};
pub use session::{Authenticate, RestAuthenticator, Session, SessionKey, SessionManager, SessionParams};
#[cfg(feature = "test-util")]
pub use mock::{MockAuthenticator, MockInventory, MockVmService};

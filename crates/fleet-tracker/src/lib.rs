//! fleet-tracker - HTTP adapters for the fleet relay's external collaborators
//!
//! - [`HttpSessionProvider`] - logs in to the tracking backend and hands the
//!   relay its session cookie for the upstream stream
//! - [`HttpDeviceRegistry`] - asks the dashboard which tenant owns a device
//!
//! # Usage
//!
//! ```ignore
//! use fleet_tracker::{HttpDeviceRegistry, HttpSessionProvider};
//!
//! let session =
//!     HttpSessionProvider::new("https://tracker.example.com", "relay@example.com", "secret")?;
//! let registry = HttpDeviceRegistry::with_bearer_token(
//!     "https://dashboard.example.com/internal",
//!     Some("token"),
//! )?;
//! ```

pub mod error;
pub mod registry;
pub mod session;
pub mod testing;

pub use error::{TrackerError, TrackerResult};
pub use registry::HttpDeviceRegistry;
pub use session::{HttpSessionProvider, SESSION_COOKIE};

use url::Url;

/// Make relative joins append to the base path instead of replacing its last segment
pub(crate) fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

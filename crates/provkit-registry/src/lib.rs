mod cache;
mod escape;
mod layout;
mod lock;
mod profile;
mod registry;
mod store;

pub use escape::{escape_profile_id, unescape_profile_id};
pub use layout::RegistryLayout;
pub use lock::{LockToken, ProfileLockManager};
pub use profile::Profile;
pub use registry::{ProfileRegistry, RegistryOptions};

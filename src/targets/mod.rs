//! Analysis targets: the host and, in container mode, each image and
//! container, with their identities and filesystem mounts.

pub mod docker;
pub mod identity;
pub mod mount;

pub use docker::{build_group_metadata, discover_targets, display_name, image_links, SystemLink, TargetArchive};
pub use identity::{derived_id, determine_hostname, IdentityStore};
pub use mount::{open_target, AtomicMount, BindMount, HostRoot, MountpointProvider};

// Resource identity and handles
//
// Every GPU resource is named by a ResourceId and handed out as a
// ResourceHandle. Two handles for the same id share the same resource.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

/// Stable identity of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// A fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Id derived from the resource's contents
    ///
    /// The same bytes always produce the same id.
    pub fn from_content(data: &[u8]) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, data))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.braced())
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    /// Accepts braced, hyphenated and simple forms
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Load progress of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// No resource with this id exists
    Unloaded,
    /// Created, uploads queued but not yet submitted
    LoadRequested,
    /// Uploads are on the transfer queue
    Loading,
    Loaded,
}

/// Common interface of everything the ResourceManager tracks
pub trait GpuResource: Send + Sync {
    fn id(&self) -> ResourceId;

    /// True once every buffer and image owned by this resource has
    /// received its upload
    fn is_loaded(&self) -> bool;

    /// Transfer jobs this resource submitted
    fn transfer_jobs(&self) -> &[crate::TransferJobId] {
        &[]
    }
}

/// A shared reference to a resource
///
/// Handles compare equal when they point at the same resource.
pub struct ResourceHandle<T> {
    rh_inner: Arc<T>,
}

impl<T: GpuResource> ResourceHandle<T> {
    pub(crate) fn new(resource: T) -> Self {
        Self {
            rh_inner: Arc::new(resource),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.rh_inner.id()
    }

    /// Number of handles alive for this resource
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.rh_inner)
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            rh_inner: self.rh_inner.clone(),
        }
    }
}

impl<T> Deref for ResourceHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.rh_inner
    }
}

impl<T> PartialEq for ResourceHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rh_inner, &other.rh_inner)
    }
}

impl<T> Eq for ResourceHandle<T> {}

impl<T: GpuResource> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.rh_inner.id())
            .field("loaded", &self.rh_inner.is_loaded())
            .finish()
    }
}

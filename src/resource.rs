//! Resource variants registered on a Responder: static, in-memory,
//! computed, and list.
//!
//! Resource access never suspends — handlers run synchronously inside the
//! responder's dispatch task, matching the rule that only transport
//! operations are suspension points. `Resource` is a plain trait object
//! (tagged variants would work just as well per the design notes; trait
//! objects are used here because `ComputedResource`'s user callables are
//! naturally closures).

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{success_response_header, PeHeader};
use crate::error::{CiError, CiResult};

pub trait Resource: Send + Sync {
    fn get(&self, header: &PeHeader) -> CiResult<Vec<u8>>;
    fn set(&self, header: &PeHeader, body: &[u8]) -> CiResult<Vec<u8>>;
    fn supports_subscription(&self) -> bool;

    /// Header to attach to a successful reply; overridable for resources
    /// that want to report e.g. `totalCount` alongside the body.
    fn response_header(&self, _header: &PeHeader, _body: &[u8]) -> PeHeader {
        success_response_header()
    }
}

/// Fixed bytes. `set` always fails with `readOnly`.
pub struct StaticResource {
    bytes: Vec<u8>,
    supports_subscription: bool,
}

impl StaticResource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            supports_subscription: false,
        }
    }

    pub fn with_subscription(mut self, supported: bool) -> Self {
        self.supports_subscription = supported;
        self
    }
}

impl Resource for StaticResource {
    fn get(&self, _header: &PeHeader) -> CiResult<Vec<u8>> {
        Ok(self.bytes.clone())
    }

    fn set(&self, _header: &PeHeader, _body: &[u8]) -> CiResult<Vec<u8>> {
        Err(CiError::ReadOnly("static resource".to_string()))
    }

    fn supports_subscription(&self) -> bool {
        self.supports_subscription
    }
}

/// Mutable bytes guarded by a mutex. `update` mutates out-of-band (not
/// through a PE SET), e.g. when the owning application changes state on
/// its own and wants the next GET to see it.
pub struct InMemoryResource {
    data: Mutex<Vec<u8>>,
    supports_subscription: bool,
    read_only: bool,
}

impl InMemoryResource {
    pub fn new(initial: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Mutex::new(initial.into()),
            supports_subscription: false,
            read_only: false,
        }
    }

    pub fn with_subscription(mut self, supported: bool) -> Self {
        self.supports_subscription = supported;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn update(&self, bytes: impl Into<Vec<u8>>) {
        *self.data.lock().unwrap() = bytes.into();
    }
}

impl Resource for InMemoryResource {
    fn get(&self, _header: &PeHeader) -> CiResult<Vec<u8>> {
        Ok(self.data.lock().unwrap().clone())
    }

    fn set(&self, _header: &PeHeader, body: &[u8]) -> CiResult<Vec<u8>> {
        if self.read_only {
            return Err(CiError::ReadOnly("in-memory resource".to_string()));
        }
        *self.data.lock().unwrap() = body.to_vec();
        Ok(body.to_vec())
    }

    fn supports_subscription(&self) -> bool {
        self.supports_subscription
    }
}

pub type GetFn = Arc<dyn Fn(&PeHeader) -> CiResult<Vec<u8>> + Send + Sync>;
pub type SetFn = Arc<dyn Fn(&PeHeader, &[u8]) -> CiResult<Vec<u8>> + Send + Sync>;

/// User-supplied GET/SET callables. A resource with no SET handler is
/// read-only.
pub struct ComputedResource {
    get_fn: GetFn,
    set_fn: Option<SetFn>,
    supports_subscription: bool,
}

impl ComputedResource {
    pub fn new(get_fn: GetFn) -> Self {
        Self {
            get_fn,
            set_fn: None,
            supports_subscription: false,
        }
    }

    pub fn with_set(mut self, set_fn: SetFn) -> Self {
        self.set_fn = Some(set_fn);
        self
    }

    pub fn with_subscription(mut self, supported: bool) -> Self {
        self.supports_subscription = supported;
        self
    }
}

impl Resource for ComputedResource {
    fn get(&self, header: &PeHeader) -> CiResult<Vec<u8>> {
        (self.get_fn)(header)
    }

    fn set(&self, header: &PeHeader, body: &[u8]) -> CiResult<Vec<u8>> {
        match &self.set_fn {
            Some(f) => f(header, body),
            None => Err(CiError::ReadOnly("computed resource has no SET handler".to_string())),
        }
    }

    fn supports_subscription(&self) -> bool {
        self.supports_subscription
    }
}

/// Ordered sequence of JSON-encodable items, sliced by `offset`/`limit` on
/// GET; SET replaces the entire sequence.
pub struct ListResource<T> {
    items: Mutex<Vec<T>>,
    supports_subscription: bool,
    read_only: bool,
}

impl<T> ListResource<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            supports_subscription: false,
            read_only: false,
        }
    }

    pub fn with_items(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items),
            supports_subscription: false,
            read_only: false,
        }
    }

    pub fn with_subscription(mut self, supported: bool) -> Self {
        self.supports_subscription = supported;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn append(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn remove_all(&self) {
        self.items.lock().unwrap().clear();
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }
}

impl<T> Default for ListResource<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Resource for ListResource<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn get(&self, header: &PeHeader) -> CiResult<Vec<u8>> {
        let items = self.items.lock().unwrap();
        let offset = header.offset.unwrap_or(0) as usize;
        let limit = header.limit.map(|l| l as usize).unwrap_or(items.len());
        let slice: Vec<&T> = items.iter().skip(offset).take(limit).collect();
        serde_json::to_vec(&slice).map_err(|e| CiError::InvalidData(e.to_string()))
    }

    fn set(&self, _header: &PeHeader, body: &[u8]) -> CiResult<Vec<u8>> {
        if self.read_only {
            return Err(CiError::ReadOnly("list resource".to_string()));
        }
        let replacement: Vec<T> = serde_json::from_slice(body).map_err(|e| CiError::InvalidData(e.to_string()))?;
        *self.items.lock().unwrap() = replacement;
        Ok(body.to_vec())
    }

    fn supports_subscription(&self) -> bool {
        self.supports_subscription
    }

    fn response_header(&self, _header: &PeHeader, _body: &[u8]) -> PeHeader {
        success_response_header().with_total_count(self.items.lock().unwrap().len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resource_rejects_set() {
        let resource = StaticResource::new(b"fixed".to_vec());
        assert_eq!(resource.get(&PeHeader::default()).unwrap(), b"fixed");
        assert!(resource.set(&PeHeader::default(), b"x").is_err());
    }

    #[test]
    fn in_memory_resource_roundtrips() {
        let resource = InMemoryResource::new(b"{\"level\":10}".to_vec());
        resource.set(&PeHeader::default(), b"{\"level\":50}").unwrap();
        assert_eq!(resource.get(&PeHeader::default()).unwrap(), b"{\"level\":50}");
    }

    #[test]
    fn in_memory_resource_honors_read_only() {
        let resource = InMemoryResource::new(b"x".to_vec()).with_read_only(true);
        assert!(resource.set(&PeHeader::default(), b"y").is_err());
    }

    #[test]
    fn computed_resource_without_set_is_read_only() {
        let resource = ComputedResource::new(Arc::new(|_h| Ok(b"computed".to_vec())));
        assert_eq!(resource.get(&PeHeader::default()).unwrap(), b"computed");
        assert!(resource.set(&PeHeader::default(), b"x").is_err());
    }

    #[test]
    fn list_resource_slices_by_offset_and_limit() {
        let list = ListResource::with_items(vec![1, 2, 3, 4, 5]);
        let header = PeHeader::default().with_offset_limit(1, 2);
        let body = list.get(&header).unwrap();
        let decoded: Vec<i32> = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, vec![2, 3]);
    }

    #[test]
    fn list_resource_set_replaces_entirely() {
        let list: ListResource<i32> = ListResource::new();
        list.append(1);
        list.set(&PeHeader::default(), b"[9,8,7]").unwrap();
        assert_eq!(list.snapshot(), vec![9, 8, 7]);
    }
}

//! Process-wide security store for KNX installations.
//!
//! Holds the keys the management client and the secure connection types
//! need: device tool keys by individual address, group keys, and the
//! device authentication and user keys of secure servers by endpoint.
//! The store is created explicitly; components receive a shared handle
//! instead of reading global state. A process default can be installed
//! once for applications that manage a single installation.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::net::EndpointAddress;

static DEFAULT: OnceLock<Arc<Security>> = OnceLock::new();

/// Security keys of one KNX installation.
#[derive(Default)]
pub struct Security {
    device_tool_keys: Mutex<HashMap<IndividualAddress, [u8; 16]>>,
    group_keys: Mutex<HashMap<GroupAddress, [u8; 16]>>,
    device_auth_keys: Mutex<HashMap<EndpointAddress, [u8; 16]>>,
    user_keys: Mutex<HashMap<(EndpointAddress, u8), [u8; 16]>>,
}

impl std::fmt::Debug for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of debug output
        f.debug_struct("Security")
            .field("device_tool_keys", &self.device_tool_keys.lock().len())
            .field("group_keys", &self.group_keys.lock().len())
            .field("device_auth_keys", &self.device_auth_keys.lock().len())
            .field("user_keys", &self.user_keys.lock().len())
            .finish()
    }
}

impl Security {
    /// Create an empty security store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Install a store as the process default. Fails if a default was
    /// already installed.
    pub fn init_default(security: Arc<Self>) -> Result<(), Arc<Self>> {
        DEFAULT.set(security)
    }

    /// The process default store, creating an empty one on first use.
    pub fn default_instance() -> &'static Arc<Self> {
        DEFAULT.get_or_init(Self::new)
    }

    /// The tool key of a device, if known
    pub fn device_tool_key(&self, device: IndividualAddress) -> Option<[u8; 16]> {
        self.device_tool_keys.lock().get(&device).copied()
    }

    /// Store the tool key of a device; returns the previous key
    pub fn set_device_tool_key(
        &self,
        device: IndividualAddress,
        key: [u8; 16],
    ) -> Option<[u8; 16]> {
        self.device_tool_keys.lock().insert(device, key)
    }

    /// Remove the tool key of a device
    pub fn remove_device_tool_key(&self, device: IndividualAddress) -> Option<[u8; 16]> {
        self.device_tool_keys.lock().remove(&device)
    }

    /// The group key of a group address, if known
    pub fn group_key(&self, group: GroupAddress) -> Option<[u8; 16]> {
        self.group_keys.lock().get(&group).copied()
    }

    /// Store the key of a group address
    pub fn set_group_key(&self, group: GroupAddress, key: [u8; 16]) {
        self.group_keys.lock().insert(group, key);
    }

    /// The device authentication key of a secure server, if known
    pub fn device_auth_key(&self, server: &EndpointAddress) -> Option<[u8; 16]> {
        self.device_auth_keys.lock().get(server).copied()
    }

    /// Store the device authentication key of a secure server
    pub fn set_device_auth_key(&self, server: EndpointAddress, key: [u8; 16]) {
        self.device_auth_keys.lock().insert(server, key);
    }

    /// The key of a user on a secure server, if known
    pub fn user_key(&self, server: &EndpointAddress, user_id: u8) -> Option<[u8; 16]> {
        self.user_keys.lock().get(&(server.clone(), user_id)).copied()
    }

    /// Store the key of a user on a secure server
    pub fn set_user_key(&self, server: EndpointAddress, user_id: u8, key: [u8; 16]) {
        self.user_keys.lock().insert((server, user_id), key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn server() -> EndpointAddress {
        EndpointAddress::tcp(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 3671))
    }

    #[test]
    fn test_tool_key_store() {
        let security = Security::new();
        let device = IndividualAddress::new(1, 1, 5).unwrap();
        assert_eq!(security.device_tool_key(device), None);

        assert_eq!(security.set_device_tool_key(device, [1; 16]), None);
        assert_eq!(security.device_tool_key(device), Some([1; 16]));

        // replacing returns the old key, used for rollback on failure
        assert_eq!(security.set_device_tool_key(device, [2; 16]), Some([1; 16]));
        assert_eq!(security.remove_device_tool_key(device), Some([2; 16]));
    }

    #[test]
    fn test_group_key_store() {
        let security = Security::new();
        let group = GroupAddress::new(1, 2, 3).unwrap();
        security.set_group_key(group, [7; 16]);
        assert_eq!(security.group_key(group), Some([7; 16]));
    }

    #[test]
    fn test_device_auth_key_store() {
        let security = Security::new();
        assert_eq!(security.device_auth_key(&server()), None);
        security.set_device_auth_key(server(), [3; 16]);
        assert_eq!(security.device_auth_key(&server()), Some([3; 16]));
    }

    #[test]
    fn test_user_key_store() {
        let security = Security::new();
        assert_eq!(security.user_key(&server(), 2), None);
        security.set_user_key(server(), 2, [4; 16]);
        assert_eq!(security.user_key(&server(), 2), Some([4; 16]));
        // keys are per user
        assert_eq!(security.user_key(&server(), 3), None);
    }
}

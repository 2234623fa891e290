//! Process-wide grouping of pools and the device table (§9: no hidden
//! module-scope singletons — everything lives in one explicit value
//! initialized at startup and torn down in reverse order).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::device::Device;

pub struct CoreContext {
    pub request_pool: Arc<crate::pool::Pool<Vec<u8>>>,
    pub ee_pool: Arc<crate::pool::Pool<Vec<u8>>>,
    pub page_pool: Arc<crate::pool::Pool<Vec<u8>>>,
    devices: RwLock<HashMap<u32, Arc<Device>>>,
}

impl CoreContext {
    pub fn new(reserve_pages: usize, page_size: usize) -> Self {
        Self {
            request_pool: Arc::new(crate::pool::Pool::new(reserve_pages, Vec::new)),
            ee_pool: Arc::new(crate::pool::Pool::new(reserve_pages, Vec::new)),
            page_pool: Arc::new(crate::pool::Pool::new(reserve_pages, move || vec![0u8; page_size])),
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_device(&self, minor: u32, device: Arc<Device>) {
        self.devices.write().unwrap().insert(minor, device);
    }

    pub fn device(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices.read().unwrap().get(&minor).cloned()
    }

    /// Tears down every registered device before the context itself is
    /// dropped, matching the source's reverse-order teardown discipline.
    pub async fn shutdown(&self) {
        let devices: Vec<Arc<Device>> = self.devices.write().unwrap().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.shutdown().await;
        }
    }
}

//! Device type to store mapping

use crate::config::LoaderConfig;
use crate::store::{KvStore, MemcacheClient};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Key space a record is routed to
#[derive(Clone)]
pub struct Destination {
    pub device_type: String,
    pub store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("device_type", &self.device_type)
            .field("addr", &self.store.addr())
            .finish()
    }
}

/// Every configured destination, built once per run and shared read-only
#[derive(Debug, Clone, Default)]
pub struct Destinations {
    by_type: BTreeMap<String, Destination>,
}

impl Destinations {
    /// Build memcached clients for the configured addresses
    ///
    /// Device types pointing at the same address share one client and with
    /// it one connection pool. Nothing is connected until the first write.
    pub fn connect(config: &LoaderConfig) -> Self {
        let mut clients: HashMap<&str, Arc<dyn KvStore>> = HashMap::new();
        let mut stores = Vec::with_capacity(config.destinations.len());

        for (device_type, addr) in &config.destinations {
            let store = clients
                .entry(addr.as_str())
                .or_insert_with(|| {
                    Arc::new(MemcacheClient::new(addr.clone(), config.store_timeout))
                        as Arc<dyn KvStore>
                })
                .clone();
            stores.push((device_type.clone(), store));
        }

        Self::from_stores(stores)
    }

    /// Build from already constructed stores
    pub fn from_stores<I, S>(stores: I) -> Self
    where
        I: IntoIterator<Item = (S, Arc<dyn KvStore>)>,
        S: Into<String>,
    {
        let by_type = stores
            .into_iter()
            .map(|(device_type, store)| {
                let device_type = device_type.into();
                let destination = Destination {
                    device_type: device_type.clone(),
                    store,
                };
                (device_type, destination)
            })
            .collect();

        Self { by_type }
    }

    pub fn get(&self, device_type: &str) -> Option<&Destination> {
        self.by_type.get(device_type)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Destinations in device type order
    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.by_type.values()
    }
}

//! Persistent key-value store, NVS-shaped: string keys grouped into
//! namespaces, small typed values, explicit commit. The ESP backend wraps
//! NVS; the host backend is an in-memory map.

use crate::{HardwareError, Result};

pub trait Store: Send + Sync {
    fn get_u8(&self, namespace: &str, key: &str) -> Option<u8>;
    fn get_i8(&self, namespace: &str, key: &str) -> Option<i8>;
    fn get_u16(&self, namespace: &str, key: &str) -> Option<u16>;
    fn get_u32(&self, namespace: &str, key: &str) -> Option<u32>;
    fn get_str(&self, namespace: &str, key: &str) -> Option<String>;

    fn set_u8(&self, namespace: &str, key: &str, value: u8) -> Result<()>;
    fn set_i8(&self, namespace: &str, key: &str, value: i8) -> Result<()>;
    fn set_u16(&self, namespace: &str, key: &str, value: u16) -> Result<()>;
    fn set_u32(&self, namespace: &str, key: &str, value: u32) -> Result<()>;
    fn set_str(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    fn erase_key(&self, namespace: &str, key: &str) -> Result<()>;
    fn erase_all(&self, namespace: &str) -> Result<()>;
    fn commit(&self, namespace: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    U32(u32),
    Str(String),
}

/// In-memory store for host builds and tests.
#[derive(Debug, Default)]
pub struct MemStore {
    map: parking_lot::Mutex<std::collections::HashMap<(String, String), Value>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, ns: &str, key: &str) -> Option<Value> {
        self.map
            .lock()
            .get(&(ns.to_string(), key.to_string()))
            .cloned()
    }

    fn set(&self, ns: &str, key: &str, value: Value) -> Result<()> {
        self.map
            .lock()
            .insert((ns.to_string(), key.to_string()), value);
        Ok(())
    }
}

impl Store for MemStore {
    fn get_u8(&self, ns: &str, key: &str) -> Option<u8> {
        match self.get(ns, key)? {
            Value::U8(v) => Some(v),
            _ => None,
        }
    }

    fn get_i8(&self, ns: &str, key: &str) -> Option<i8> {
        match self.get(ns, key)? {
            Value::I8(v) => Some(v),
            _ => None,
        }
    }

    fn get_u16(&self, ns: &str, key: &str) -> Option<u16> {
        match self.get(ns, key)? {
            Value::U16(v) => Some(v),
            _ => None,
        }
    }

    fn get_u32(&self, ns: &str, key: &str) -> Option<u32> {
        match self.get(ns, key)? {
            Value::U32(v) => Some(v),
            _ => None,
        }
    }

    fn get_str(&self, ns: &str, key: &str) -> Option<String> {
        match self.get(ns, key)? {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    fn set_u8(&self, ns: &str, key: &str, value: u8) -> Result<()> {
        self.set(ns, key, Value::U8(value))
    }

    fn set_i8(&self, ns: &str, key: &str, value: i8) -> Result<()> {
        self.set(ns, key, Value::I8(value))
    }

    fn set_u16(&self, ns: &str, key: &str, value: u16) -> Result<()> {
        self.set(ns, key, Value::U16(value))
    }

    fn set_u32(&self, ns: &str, key: &str, value: u32) -> Result<()> {
        self.set(ns, key, Value::U32(value))
    }

    fn set_str(&self, ns: &str, key: &str, value: &str) -> Result<()> {
        self.set(ns, key, Value::Str(value.to_string()))
    }

    fn erase_key(&self, ns: &str, key: &str) -> Result<()> {
        self.map
            .lock()
            .remove(&(ns.to_string(), key.to_string()));
        Ok(())
    }

    fn erase_all(&self, ns: &str) -> Result<()> {
        self.map.lock().retain(|(n, _), _| n != ns);
        Ok(())
    }

    fn commit(&self, _ns: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "espidf")]
pub use esp::NvsStore;

#[cfg(target_os = "espidf")]
mod esp {
    use std::collections::HashMap;

    use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
    use parking_lot::Mutex;

    use super::Store;
    use crate::{HardwareError, Result};

    /// NVS-backed store. Namespace handles are opened lazily and cached.
    pub struct NvsStore {
        partition: EspNvsPartition<NvsDefault>,
        handles: Mutex<HashMap<String, EspNvs<NvsDefault>>>,
    }

    impl NvsStore {
        pub fn new(partition: EspNvsPartition<NvsDefault>) -> Self {
            Self {
                partition,
                handles: Mutex::new(HashMap::new()),
            }
        }

        fn with<R>(
            &self,
            ns: &str,
            f: impl FnOnce(&mut EspNvs<NvsDefault>) -> R,
        ) -> Option<R> {
            let mut handles = self.handles.lock();
            if !handles.contains_key(ns) {
                let nvs = EspNvs::new(self.partition.clone(), ns, true).ok()?;
                handles.insert(ns.to_string(), nvs);
            }
            handles.get_mut(ns).map(f)
        }
    }

    impl Store for NvsStore {
        fn get_u8(&self, ns: &str, key: &str) -> Option<u8> {
            self.with(ns, |nvs| nvs.get_u8(key).ok().flatten())?
        }

        fn get_i8(&self, ns: &str, key: &str) -> Option<i8> {
            self.with(ns, |nvs| nvs.get_i8(key).ok().flatten())?
        }

        fn get_u16(&self, ns: &str, key: &str) -> Option<u16> {
            self.with(ns, |nvs| nvs.get_u16(key).ok().flatten())?
        }

        fn get_u32(&self, ns: &str, key: &str) -> Option<u32> {
            self.with(ns, |nvs| nvs.get_u32(key).ok().flatten())?
        }

        fn get_str(&self, ns: &str, key: &str) -> Option<String> {
            self.with(ns, |nvs| {
                let mut buf = [0u8; 256];
                nvs.get_str(key, &mut buf)
                    .ok()
                    .flatten()
                    .map(|s| s.to_string())
            })?
        }

        fn set_u8(&self, ns: &str, key: &str, value: u8) -> Result<()> {
            self.with(ns, |nvs| nvs.set_u8(key, value))
                .and_then(|r| r.ok())
                .ok_or(HardwareError::Storage("nvs set_u8"))
        }

        fn set_i8(&self, ns: &str, key: &str, value: i8) -> Result<()> {
            self.with(ns, |nvs| nvs.set_i8(key, value))
                .and_then(|r| r.ok())
                .ok_or(HardwareError::Storage("nvs set_i8"))
        }

        fn set_u16(&self, ns: &str, key: &str, value: u16) -> Result<()> {
            self.with(ns, |nvs| nvs.set_u16(key, value))
                .and_then(|r| r.ok())
                .ok_or(HardwareError::Storage("nvs set_u16"))
        }

        fn set_u32(&self, ns: &str, key: &str, value: u32) -> Result<()> {
            self.with(ns, |nvs| nvs.set_u32(key, value))
                .and_then(|r| r.ok())
                .ok_or(HardwareError::Storage("nvs set_u32"))
        }

        fn set_str(&self, ns: &str, key: &str, value: &str) -> Result<()> {
            self.with(ns, |nvs| nvs.set_str(key, value))
                .and_then(|r| r.ok())
                .ok_or(HardwareError::Storage("nvs set_str"))
        }

        fn erase_key(&self, ns: &str, key: &str) -> Result<()> {
            self.with(ns, |nvs| nvs.remove(key))
                .and_then(|r| r.ok())
                .map(|_| ())
                .ok_or(HardwareError::Storage("nvs erase_key"))
        }

        fn erase_all(&self, _ns: &str) -> Result<()> {
            Err(HardwareError::Storage("erase_all unsupported"))
        }

        fn commit(&self, _ns: &str) -> Result<()> {
            // esp-idf-svc commits on every set
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_values_round_trip() {
        let store = MemStore::new();
        store.set_u8("camera", "mic_en", 1).unwrap();
        store.set_i8("camera", "brightness", -2).unwrap();
        store.set_str("sip", "sip_user", "620").unwrap();

        assert_eq!(store.get_u8("camera", "mic_en"), Some(1));
        assert_eq!(store.get_i8("camera", "brightness"), Some(-2));
        assert_eq!(store.get_str("sip", "sip_user").as_deref(), Some("620"));
        assert_eq!(store.get_u8("sip", "mic_en"), None);
    }

    #[test]
    fn type_mismatch_reads_none() {
        let store = MemStore::new();
        store.set_u8("ns", "k", 3).unwrap();
        assert_eq!(store.get_str("ns", "k"), None);
    }

    #[test]
    fn erase_scopes() {
        let store = MemStore::new();
        store.set_u8("a", "x", 1).unwrap();
        store.set_u8("a", "y", 2).unwrap();
        store.set_u8("b", "x", 3).unwrap();

        store.erase_key("a", "x").unwrap();
        assert_eq!(store.get_u8("a", "x"), None);
        assert_eq!(store.get_u8("a", "y"), Some(2));

        store.erase_all("a").unwrap();
        assert_eq!(store.get_u8("a", "y"), None);
        assert_eq!(store.get_u8("b", "x"), Some(3));
    }
}

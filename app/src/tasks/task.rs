//! Task spawning with a name, stack size, and (on the device) a core pin.
//! Short-lived workers (the RTP sender, the gong) go through this so the
//! FreeRTOS task attributes stay in one place; on the host they are plain
//! named threads.

pub struct TaskMeta {
    pub name: &'static str,
    pub stack_bytes: Option<usize>,
    /// Core to pin to on the dual-core device. Streaming-class tasks go to
    /// core 1, away from Wi-Fi/LwIP on core 0.
    pub pin_to_core: Option<u8>,
}

pub const STREAM_CORE: u8 = 1;

pub trait Spawner {
    fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>);
}

#[cfg(not(target_os = "espidf"))]
mod spawner {
    use super::{Spawner, TaskMeta};

    pub struct HostSpawner;

    impl Spawner for HostSpawner {
        fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>) {
            let mut b = std::thread::Builder::new().name(meta.name.into());
            if let Some(stack_sz) = meta.stack_bytes {
                b = b.stack_size(stack_sz);
            }
            b.spawn(move || f()).expect("spawn failed");
        }
    }
}
#[cfg(not(target_os = "espidf"))]
pub use spawner::HostSpawner as TaskSpawner;

#[cfg(target_os = "espidf")]
mod spawner {
    use esp_idf_svc::sys::{
        esp_err_t, esp_pthread_cfg_t, esp_pthread_get_cfg, esp_pthread_get_default_config,
        esp_pthread_set_cfg, ESP_OK,
    };
    use std::ffi::{c_char, CString};

    use super::{Spawner, TaskMeta};

    pub struct EspSpawner;

    impl Spawner for EspSpawner {
        fn spawn(&self, meta: TaskMeta, f: Box<dyn FnOnce() + Send + 'static>) {
            let b = if let Some(stack_sz) = meta.stack_bytes {
                std::thread::Builder::new().stack_size(stack_sz)
            } else {
                std::thread::Builder::new()
            };

            let _ = with_next_pthread_cfg(meta, || b.spawn(f)).expect("spawn failed");
        }
    }

    fn with_next_pthread_cfg<T>(meta: TaskMeta, f: impl FnOnce() -> T) -> Result<T, esp_err_t> {
        // FreeRTOS task name length is limited
        let cname = CString::new(meta.name).expect("no NULs in thread name");

        unsafe {
            // Save current per-thread config
            let mut prev: esp_pthread_cfg_t = core::mem::zeroed();
            let had_prev = esp_pthread_get_cfg(&mut prev) == ESP_OK;

            let mut cfg = if had_prev {
                prev
            } else {
                esp_pthread_get_default_config()
            };

            cfg.thread_name = cname.as_ptr() as *const c_char;

            if let Some(stack) = meta.stack_bytes {
                cfg.stack_size = stack;
            }
            if let Some(core) = meta.pin_to_core {
                cfg.pin_to_core = core as i32;
            }

            let ret = esp_pthread_set_cfg(&cfg);
            if ret != ESP_OK {
                return Err(ret);
            }

            // Create the pthread while cfg is in effect
            let out = f();

            // Restore previous config for subsequent spawns from this thread.
            let restore = if had_prev {
                prev
            } else {
                esp_pthread_get_default_config()
            };
            let _ = esp_pthread_set_cfg(&restore);

            Ok(out)
        }
    }
}
#[cfg(target_os = "espidf")]
pub use spawner::EspSpawner as TaskSpawner;

//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mcc_mu::{BusFreq, IrqController};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds or `timeout` elapsed
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Calls made on the host's power-management collaborators, in order
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }
}

pub struct RecordingBus(pub CallLog);

impl BusFreq for RecordingBus {
    fn request_bus_high(&self) {
        self.0.push("bus high".into());
    }

    fn release_bus_high(&self) {
        self.0.push("bus release".into());
    }
}

pub struct RecordingIrqs(pub CallLog);

impl IrqController for RecordingIrqs {
    fn can_request(&self, irq: u32) -> bool {
        !self.0.entries().contains(&format!("placeholder {}", irq))
    }

    fn request_placeholder(&self, irq: u32) -> Result<(), i32> {
        self.0.push(format!("placeholder {}", irq));
        Ok(())
    }

    fn enable_irq(&self, irq: u32) {
        self.0.push(format!("enable {}", irq));
    }

    fn disable_irq(&self, irq: u32) {
        self.0.push(format!("disable {}", irq));
    }

    fn register_wake_irq(&self, irq: u32, enable: bool) {
        self.0.push(format!("wake {} {}", irq, enable));
    }
}

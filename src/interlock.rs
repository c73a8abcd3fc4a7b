//! Device-busy interlock: refuses to tear down a device that a process
//! other than the arbiter itself still has open, with a bounded wait and
//! a bounded number of retries so a wedged `lsof`-equivalent can never
//! hang node teardown forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::time::timeout;

use crate::config::ArbiterConfig;
use crate::errors::{ArbiterError, ArbiterResult};
use crate::events::{Event, EventSink};
use crate::types::VolumeId;

/// Inspects whether a block device path is held open by any process. The
/// real implementation shells out to (or reads `/proc` the way) `fuser`/`lsof`
/// would; kept behind a trait so tests can simulate busy/free/slow devices
/// without touching the host's process table.
#[async_trait]
pub trait DeviceInspector: Send + Sync {
    /// Process identifiers (or names) currently holding `device_path` open,
    /// excluding the arbiter's own pid.
    async fn holders(&self, device_path: &str) -> ArbiterResult<Vec<String>>;
}

pub struct DeviceBusyInterlock {
    inspector: Box<dyn DeviceInspector>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
    retries: u32,
}

impl DeviceBusyInterlock {
    pub fn new(inspector: Box<dyn DeviceInspector>, events: Arc<dyn EventSink>, config: &ArbiterConfig) -> Self {
        Self {
            inspector,
            events,
            timeout: config.device_busy_check_timeout,
            retries: config.device_busy_check_retries,
        }
    }

    /// Checks `device_path`, retrying on transient "still busy" results up
    /// to the configured retry budget. Returns `Ok(())` once the device is
    /// free (or the inspector has timed out, treated as "assume not in
    /// use" with a warning, favoring availability over a wedged teardown)
    /// and `Err(DeviceBusy)` once retries are exhausted with holders still
    /// present, emitting a `DeviceBusy` event on that refusal path.
    pub async fn wait_until_free(&self, volume_id: &VolumeId, device_path: &str) -> ArbiterResult<()> {
        let mut attempt = 0;
        loop {
            match timeout(self.timeout, self.inspector.holders(device_path)).await {
                Ok(Ok(holders)) if holders.is_empty() => return Ok(()),
                Ok(Ok(holders)) => {
                    if attempt >= self.retries {
                        self.events.emit(Event::DeviceBusy {
                            volume_id: volume_id.clone(),
                            processes: holders.clone(),
                        });
                        return Err(ArbiterError::DeviceBusy {
                            path: device_path.to_string(),
                            processes: holders,
                        });
                    }
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        "device-busy check on {device_path} timed out after {:?}; assuming not in use",
                        self.timeout
                    );
                    return Ok(());
                }
            }
        }
    }
}

/// A fake inspector for tests: reports a fixed, optionally shrinking list of
/// holders on each successive call.
pub struct FakeDeviceInspector {
    responses: std::sync::Mutex<Vec<Vec<String>>>,
}

impl FakeDeviceInspector {
    /// `responses[i]` is returned on the `i`th call; the last entry repeats
    /// once exhausted.
    pub fn new(responses: Vec<Vec<String>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
        }
    }

    pub fn always_busy(holders: Vec<String>) -> Self {
        Self::new(vec![holders])
    }

    pub fn free() -> Self {
        Self::new(vec![vec![]])
    }
}

#[async_trait]
impl DeviceInspector for FakeDeviceInspector {
    async fn holders(&self, _device_path: &str) -> ArbiterResult<Vec<String>> {
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            Ok(responses.remove(0))
        } else {
            Ok(responses.first().cloned().unwrap_or_default())
        }
    }
}

/// A `DeviceInspector` for hosts with no `lsof`/`fuser`-equivalent wired in
/// yet. Fails closed with `Internal` rather than silently reporting "free",
/// since the real inspection logic is out of this crate's scope and
/// guessing would defeat the whole point of the interlock.
pub struct UnimplementedDeviceInspector;

#[async_trait]
impl DeviceInspector for UnimplementedDeviceInspector {
    async fn holders(&self, device_path: &str) -> ArbiterResult<Vec<String>> {
        Err(ArbiterError::Internal(format!(
            "no device inspector configured to check {device_path}"
        )))
    }
}

/// An inspector that never returns, used to exercise the timeout path.
pub struct HangingDeviceInspector;

#[async_trait]
impl DeviceInspector for HangingDeviceInspector {
    async fn holders(&self, _device_path: &str) -> ArbiterResult<Vec<String>> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;

    fn config() -> ArbiterConfig {
        let mut cfg = ArbiterConfig::default();
        cfg.device_busy_check_timeout = Duration::from_millis(50);
        cfg.device_busy_check_retries = 2;
        cfg
    }

    #[tokio::test]
    async fn a_free_device_succeeds_immediately() {
        let interlock =
            DeviceBusyInterlock::new(Box::new(FakeDeviceInspector::free()), Arc::new(RecordingEventSink::new()), &config());
        interlock
            .wait_until_free(&VolumeId::from("v1"), "/dev/nvme0n1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_device_that_frees_up_within_the_retry_budget_succeeds() {
        let inspector = FakeDeviceInspector::new(vec![
            vec!["pid-1".to_string()],
            vec!["pid-1".to_string()],
            vec![],
        ]);
        let interlock = DeviceBusyInterlock::new(Box::new(inspector), Arc::new(RecordingEventSink::new()), &config());
        interlock
            .wait_until_free(&VolumeId::from("v1"), "/dev/nvme0n1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_device_still_busy_after_retries_fails_and_emits_device_busy() {
        let inspector = FakeDeviceInspector::always_busy(vec!["pid-1".to_string()]);
        let events = Arc::new(RecordingEventSink::new());
        let interlock = DeviceBusyInterlock::new(Box::new(inspector), events.clone(), &config());
        let volume = VolumeId::from("v1");
        let result = interlock.wait_until_free(&volume, "/dev/nvme0n1").await;
        assert!(matches!(result, Err(ArbiterError::DeviceBusy { .. })));

        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert!(matches!(
            &recorded[0].event,
            Event::DeviceBusy { volume_id, processes }
                if *volume_id == volume && processes == &vec!["pid-1".to_string()]
        ));
    }

    #[tokio::test]
    async fn a_hanging_check_times_out_and_assumes_not_in_use() {
        let interlock =
            DeviceBusyInterlock::new(Box::new(HangingDeviceInspector), Arc::new(RecordingEventSink::new()), &config());
        interlock
            .wait_until_free(&VolumeId::from("v1"), "/dev/nvme0n1")
            .await
            .unwrap();
    }
}

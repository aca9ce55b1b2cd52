//! Status polling for migrated resources.
//!
//! Actions that start a long-running operation on a cloud (snapshotting an
//! instance, uploading an image) poll the resource until it reaches the
//! status they need. `wait_for_status` backs off exponentially: it checks,
//! sleeps 1s, checks, sleeps 2s, ... for as long as the next delay is below
//! the timeout. Status comparison ignores case.

use crate::config::{PollingConfig, RetryPolicy};
use crate::error::EngineError;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of a resource's current status
pub trait Resource {
    fn status(&self, id: &str) -> anyhow::Result<String>;
}

impl<F> Resource for F
where
    F: Fn(&str) -> anyhow::Result<String>,
{
    fn status(&self, id: &str) -> anyhow::Result<String> {
        self(id)
    }
}

pub trait Sleeper {
    fn sleep(&self, delay: Duration);
}

/// Sleeps the current thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

#[derive(Debug, Default, Clone)]
pub struct StatusPoller<S = ThreadSleeper> {
    sleeper: S,
}

impl StatusPoller<ThreadSleeper> {
    pub fn new() -> Self {
        Self {
            sleeper: ThreadSleeper,
        }
    }
}

impl<S: Sleeper> StatusPoller<S> {
    pub fn with_sleeper(sleeper: S) -> Self {
        Self { sleeper }
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    /// Poll until `id` reports `desired`, doubling the delay after each
    /// mismatch while the delay stays below `timeout`.
    ///
    /// Fails with [`EngineError::Timeout`] carrying the last observed status;
    /// errors from the status source are returned unchanged.
    pub fn wait_for_status<R>(
        &self,
        id: &str,
        resource: &R,
        desired: &str,
        timeout: Duration,
    ) -> anyhow::Result<()>
    where
        R: Resource + ?Sized,
    {
        let desired_lower = desired.to_lowercase();
        let mut delay = Duration::from_secs(1);
        let mut observed: Option<String> = None;

        while delay < timeout {
            let status = resource.status(id)?.to_lowercase();
            if status == desired_lower {
                debug!("Resource '{}' reached status '{}'", id, desired);
                return Ok(());
            }
            debug!(
                "Resource '{}' is '{}', waiting {:?} for '{}'",
                id, status, delay, desired
            );
            observed = Some(status);
            self.sleeper.sleep(delay);
            delay *= 2;
        }

        let observed = match observed {
            Some(status) => status,
            None => resource.status(id)?.to_lowercase(),
        };
        Err(EngineError::timeout(observed, desired).into())
    }

    /// Like [`wait_for_status`](Self::wait_for_status) but a timeout is only
    /// logged
    pub fn try_wait_for_status<R>(
        &self,
        id: &str,
        resource: &R,
        desired: &str,
        timeout: Duration,
    ) -> anyhow::Result<()>
    where
        R: Resource + ?Sized,
    {
        match self.wait_for_status(id, resource, desired, timeout) {
            Err(err) if is_timeout(&err) => {
                warn!(
                    "Resource '{}' has not changed status to '{}' ({})",
                    id, desired, err
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Poll at a fixed interval, giving up after `policy.retries` sleeps
    pub fn wait_for_status_with_retries<R>(
        &self,
        id: &str,
        resource: &R,
        desired: &str,
        policy: RetryPolicy,
    ) -> anyhow::Result<()>
    where
        R: Resource + ?Sized,
    {
        let desired_lower = desired.to_lowercase();
        let mut attempts: u32 = 0;
        loop {
            let status = resource.status(id)?.to_lowercase();
            if status == desired_lower {
                return Ok(());
            }
            if attempts >= policy.retries {
                return Err(EngineError::timeout(status, desired).into());
            }
            self.sleeper.sleep(policy.interval);
            attempts += 1;
        }
    }

    /// [`wait_for_status`](Self::wait_for_status) bounded by `polling.timeout_secs`
    pub fn wait_for_status_configured<R>(
        &self,
        id: &str,
        resource: &R,
        desired: &str,
        polling: &PollingConfig,
    ) -> anyhow::Result<()>
    where
        R: Resource + ?Sized,
    {
        self.wait_for_status(id, resource, desired, polling.timeout())
    }

    /// [`wait_for_status_with_retries`](Self::wait_for_status_with_retries)
    /// with the configured retry count and interval
    pub fn wait_for_status_with_configured_retries<R>(
        &self,
        id: &str,
        resource: &R,
        desired: &str,
        polling: &PollingConfig,
    ) -> anyhow::Result<()>
    where
        R: Resource + ?Sized,
    {
        self.wait_for_status_with_retries(id, resource, desired, polling.retry_policy())
    }
}

/// True when `err` is a polling timeout
pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Timeout { .. })
    )
}

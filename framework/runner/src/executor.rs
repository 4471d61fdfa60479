use std::future::Future;

use squall_core::prelude::{ShutdownHandle, ShutdownSignalError};
use tokio::runtime::Handle;

/// Access to the async runtime from the synchronous global hooks.
#[derive(Debug)]
pub struct Executor {
    handle: Handle,
    interrupt: ShutdownHandle,
}

impl Executor {
    pub(crate) fn new(handle: Handle, interrupt: ShutdownHandle) -> Self {
        Self { handle, interrupt }
    }

    /// Run async code in place, blocking until it completes.
    ///
    /// The future is cancelled if the run is interrupted. You do not need to do anything special to
    /// handle this, but a future which can't be cancelled may prevent the runner from shutting
    /// down.
    ///
    /// Only call this from the global setup and teardown hooks. It must not be called from inside
    /// an iteration, which is already running on the runtime.
    pub fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let mut interrupt_listener = self.interrupt.new_listener();
        self.handle.block_on(async move {
            tokio::select! {
                result = fut => result,
                _ = interrupt_listener.wait_for_shutdown() => {
                    Err(anyhow::anyhow!(ShutdownSignalError::default()))
                },
            }
        })
    }

    /// Submit async code to be run in the background.
    ///
    /// The future is not cancelled when the run ends, and the runner won't wait for it.
    pub fn spawn(&self, fut: impl Future<Output = ()> + Send + 'static) {
        self.handle.spawn(fut);
    }
}

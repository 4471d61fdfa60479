use squall_core::prelude::ShutdownHandle;
use tokio::signal;

/// Stop signals raised from the keyboard.
pub(crate) struct SignalHandles {
    /// Raised by the first Ctrl-C. Every scenario starts draining.
    pub(crate) run_stop: ShutdownHandle,
    /// Raised by the second Ctrl-C. In-flight iterations and hooks are abandoned.
    pub(crate) interrupt: ShutdownHandle,
}

pub(crate) fn start_shutdown_listener(runtime: &tokio::runtime::Runtime) -> SignalHandles {
    let handles = SignalHandles {
        run_stop: ShutdownHandle::new(),
        interrupt: ShutdownHandle::new(),
    };

    let run_stop = handles.run_stop.clone();
    let interrupt = handles.interrupt.clone();
    runtime.spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        println!("Received shutdown signal, stopping VUs after their current iteration. Press Ctrl-C again to abort.");
        run_stop.shutdown();

        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        println!("Received second shutdown signal, aborting in-flight iterations...");
        interrupt.shutdown();
    });

    handles
}

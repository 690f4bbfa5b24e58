//! The shared network worker
//!
//! One dedicated thread, created the first time any transfer starts, runs a
//! single-threaded tokio runtime for the rest of the process. Every exchange
//! is spawned onto it, so connection state is only ever touched from that
//! thread and a connection never outlives the thread driving it.

use std::future::Future;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use tokio::runtime::Handle;

use crate::session::{self, SessionConfiguration};
use crate::{Error, Result};

const THREAD_NAME: &str = "ferry-network";

static WORKER: OnceLock<std::result::Result<Worker, String>> = OnceLock::new();
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Handle to the network worker and the transport clients living on it.
pub(crate) struct Worker {
    handle: Handle,
    config: SessionConfiguration,
    strict: reqwest::Client,
    permissive: reqwest::Client,
}

/// Whether the worker has been brought up.
pub(crate) fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// The process-wide worker, created on first use.
pub(crate) fn shared() -> Result<&'static Worker> {
    WORKER
        .get_or_init(Worker::spawn)
        .as_ref()
        .map_err(|message| Error::Internal(message.clone()))
}

impl Worker {
    fn spawn() -> std::result::Result<Self, String> {
        RUNNING.store(true, Ordering::Release);
        let config = session::take_configuration();
        let (tx, rx) = mpsc::channel();

        let thread_config = config.clone();
        std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = tx.send(Err(format!("Failed to build network runtime: {}", e)));
                        return;
                    }
                };

                let clients = {
                    let _guard = runtime.enter();
                    build_client(&thread_config, false).and_then(|strict| {
                        build_client(&thread_config, true).map(|permissive| (strict, permissive))
                    })
                };
                let ready = clients.map(|(strict, permissive)| {
                    (runtime.handle().clone(), strict, permissive)
                });
                let failed = ready.is_err();
                let _ = tx.send(ready);
                if failed {
                    return;
                }

                runtime.block_on(std::future::pending::<()>());
            })
            .map_err(|e| format!("Failed to spawn network worker: {}", e))?;

        let (handle, strict, permissive) = rx
            .recv()
            .map_err(|_| "Network worker exited during startup".to_string())??;

        tracing::debug!("Network worker started on thread {}", THREAD_NAME);

        Ok(Self {
            handle,
            config,
            strict,
            permissive,
        })
    }

    /// Run `future` on the worker.
    pub(crate) fn spawn_detached<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Transport for an exchange; `trust_any_certificate` waives validation.
    pub(crate) fn client(&self, trust_any_certificate: bool) -> &reqwest::Client {
        if trust_any_certificate {
            &self.permissive
        } else {
            &self.strict
        }
    }

    pub(crate) fn config(&self) -> &SessionConfiguration {
        &self.config
    }
}

fn build_client(
    config: &SessionConfiguration,
    trust_any_certificate: bool,
) -> std::result::Result<reqwest::Client, String> {
    let headers = config.default_headers().map_err(|e| e.to_string())?;

    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .default_headers(headers);

    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if trust_any_certificate {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| format!("Failed to create reqwest client: {}", e))
}

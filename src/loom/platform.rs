#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn spawn<O, F>(future: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: std::future::Future<Output = O> + Send + 'static,
{
    tokio::spawn(future)
}

#[cfg(target_arch = "wasm32")]
#[inline]
pub fn spawn<F>(future: F)
where
    F: std::future::Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Runs a CPU-bound closure off the async executor.
#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn spawn_blocking<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    _ = tokio::task::spawn_blocking(f);
}

/// Runs a CPU-bound closure off the async executor.
#[cfg(target_arch = "wasm32")]
#[inline]
pub fn spawn_blocking<F>(f: F)
where
    F: FnOnce() + 'static,
{
    spawn(async move { f() });
}

/// Installs a global subscriber forwarding spans to Tracy.
#[cfg(feature = "trace")]
pub fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;

    let registry = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    if let Err(err) = tracing::subscriber::set_global_default(registry) {
        log::warn!("failed to install tracing subscriber: {err}");
    }
}

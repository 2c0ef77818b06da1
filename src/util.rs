use std::backtrace::Backtrace;
use std::sync::Once;
use std::time::Duration;

use rand::Rng;

/// Adds up to 20% jitter to `base`, decorrelating sibling instances' sleep
/// cycles.
pub(crate) fn jittered(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.0..0.2);
    base + base.mul_f64(factor)
}

static INSTALL_PANIC_HOOK: Once = Once::new();

/// Installs a panic hook (once per process) that logs the panic message and
/// a captured backtrace via `tracing`. Run before spawning guarded handler
/// tasks so a panicking handler's stack ends up in the logs even though only
/// the message is threaded back through the returned error.
fn ensure_panic_hook_logs_backtrace() {
    INSTALL_PANIC_HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture();
            tracing::error!(%backtrace, "panic: {info}");
            default_hook(info);
        }));
    });
}

/// Runs `fut` on its own Tokio task and converts a panic inside it into an
/// `anyhow::Error` rather than letting it unwind past the handler
/// invocation boundary. `tokio::spawn` + `JoinError::is_panic` is the
/// catch-unwind boundary for an arbitrary async handler; the panic's
/// backtrace is captured and logged by the process-wide panic hook rather
/// than embedded in the returned error.
pub(crate) async fn run_guarded<F>(fut: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    ensure_panic_hook_logs_backtrace();
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(anyhow::anyhow!("handler panicked: {message}"))
        }
        Err(join_err) => Err(anyhow::anyhow!("handler task failed: {join_err}")),
    }
}

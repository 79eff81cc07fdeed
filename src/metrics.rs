use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder once per process.
///
/// Scraping happens through the API server's `/metrics` route rather than a
/// separate listener. If another recorder is already installed the exporter
/// is disabled and `render` returns an empty body.
pub fn init_metrics() {
    HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder install failed (possibly already installed): {e}");
            None
        }
    });
}

/// Current metrics in the Prometheus text format.
pub fn render() -> String {
    init_metrics();
    HANDLE
        .get()
        .and_then(Option::as_ref)
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

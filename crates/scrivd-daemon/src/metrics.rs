//! Plain-text metrics feed.
//!
//! An unauthenticated HTTP endpoint returning `key value` lines: the
//! global memory figures first, then whatever the aggregate registry
//! contributes per document. The body is assembled on the reactor thread
//! through the callback queue, preserving single-writer semantics; the
//! HTTP serving itself runs on the main runtime.

use std::fmt::Write;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::state::{Admin, AdminHandle};

/// Assemble the metrics body. Reactor-thread-only (reads the registry).
#[must_use]
pub fn metrics_text(admin: &Admin) -> String {
    let available_kb = admin.budget.available_kb();
    let used_kb = admin.total_memory_usage_kb();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "global_host_system_memory_bytes {}",
        admin.budget.total_system_kb * 1024
    );
    let _ = writeln!(
        out,
        "global_host_tcp_connections {}",
        admin.server.max_connections
    );
    let _ = writeln!(out, "global_memory_available_bytes {}", available_kb * 1024);
    let _ = writeln!(out, "global_memory_used_bytes {}", used_kb * 1024);
    let _ = writeln!(
        out,
        "global_memory_free_bytes {}",
        available_kb.saturating_sub(used_kb) * 1024
    );
    out.push('\n');

    admin.registry.write_metrics(&mut out);
    out
}

async fn metrics_handler(State(handle): State<AdminHandle>) -> Response {
    match handle.with_admin(|admin| metrics_text(admin)).await {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Serve the metrics endpoint until the process exits.
pub async fn serve(handle: AdminHandle, port: u16) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(handle);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "metrics endpoint listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use scrivd_core::broker::NullBroker;
    use scrivd_core::config::AdminConfig;
    use scrivd_core::process::SystemProcessControl;

    use super::*;

    #[test]
    fn metrics_body_lists_global_and_registry_lines() {
        let config = AdminConfig::default();
        let mut admin = Admin::new(&config, Rc::new(NullBroker), Rc::new(SystemProcessControl));
        admin
            .registry
            .add_document("doc1", 101, "a.odt", "u", "s1", "ada", "u1", false);

        let body = metrics_text(&admin);
        for key in [
            "global_host_system_memory_bytes ",
            "global_host_tcp_connections ",
            "global_memory_available_bytes ",
            "global_memory_used_bytes ",
            "global_memory_free_bytes ",
            "document_all_count 1",
            "users_active_count 1",
            "lost_kits_terminated_count 0",
        ] {
            assert!(body.contains(key), "missing {key} in:\n{body}");
        }

        // Every non-empty line is a `key value` pair.
        for line in body.lines().filter(|l| !l.is_empty()) {
            assert_eq!(line.split_whitespace().count(), 2, "bad line: {line}");
        }
    }
}

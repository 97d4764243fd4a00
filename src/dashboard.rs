//! ==============================================================================
//! dashboard.rs - /scroll-speeds debug page
//! ==============================================================================
//!
//! purpose:
//!     serves the debug dashboard: live scroll metrics (polled), device
//!     status, motor test buttons and a reconnect button. the page itself is
//!     static/scroll-speeds.html, compiled into the binary; only the poll
//!     period and transport name are filled in per request.
//!
//! ==============================================================================

const TEMPLATE: &str = include_str!("../static/scroll-speeds.html");

pub fn render(poll_interval_ms: u64, transport: &str) -> String {
    TEMPLATE
        .replace("{{POLL_MS}}", &poll_interval_ms.to_string())
        .replace("{{TRANSPORT}}", &html_escape(transport))
}

/// escape html special characters to prevent xss
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

use serde_json::{json, Value};

use crate::devtools::Tab;
use crate::error::Result;

/// Resolve a response status line text. Chrome frequently omits the status
/// text; fall back to the canonical reason phrase for the code.
pub fn status_text(status: u16, reported: Option<&str>) -> String {
    if let Some(text) = reported {
        if !text.is_empty() {
            return text.to_string();
        }
    }
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("No status text available")
        .to_string()
}

/// Software description for the warcinfo payload.
pub fn software_info() -> Value {
    json!({
        "platform": format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        "self": {
            "projectName": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Current layout viewport formatted as `WIDTHxHEIGHT`.
pub async fn viewport_metrics(tab: &Tab) -> Result<String> {
    let metrics = tab.call("Page.getLayoutMetrics", json!({})).await?;
    let viewport = &metrics["layoutViewport"];
    Ok(format!(
        "{}x{}",
        viewport["clientWidth"].as_u64().unwrap_or(0),
        viewport["clientHeight"].as_u64().unwrap_or(0)
    ))
}

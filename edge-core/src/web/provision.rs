//! Provisioning endpoints under `/api/Admin/Provision`.
//!
//! Everything answers HTTP 200 with success encoded in the body: the
//! captive-portal client is often a minimal browser on a degraded
//! transport that cannot reason about status codes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Html;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;

/// HTTP response flushes before this fires; the Wi-Fi transition will
/// kill the client's connection mid-body otherwise.
const CONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "errorMessage", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ApiResponse {
    fn ok(data: Value) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
            error_message: None,
        })
    }

    fn ok_with_message(data: Value, message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            error_message: None,
        })
    }

    fn fail(error: impl ToString) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            message: None,
            error_message: Some(error.to_string()),
        })
    }
}

pub async fn networks(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    let nets: Vec<Value> = state
        .wifi
        .scan_cache()
        .all()
        .iter()
        .map(|n| {
            json!({
                "SSID": n.ssid,
                "Signal": n.signal,
                "Security": n.security,
                "Frequency": n.frequency,
            })
        })
        .collect();
    ApiResponse::ok(Value::Array(nets))
}

#[derive(Debug, Deserialize)]
pub struct ConnectBody {
    #[serde(rename = "SSID")]
    pub ssid: String,
    #[serde(rename = "Password", default)]
    pub password: Option<String>,
    #[serde(rename = "NCBIP")]
    pub ncbip: String,
}

/// Acknowledge immediately, then run the transition on a detached task:
/// a success body must reach the client before its network goes away.
pub async fn connect(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ConnectBody>, JsonRejection>,
) -> Json<ApiResponse> {
    // a broken body still answers 200 with success:false, like
    // everything else on this surface
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return ApiResponse::fail(rejection.body_text()),
    };
    if body.ssid.trim().is_empty() {
        return ApiResponse::fail("SSID must not be empty");
    }

    let wifi = state.wifi.clone();
    tokio::spawn(async move {
        tokio::time::sleep(CONNECT_DELAY).await;
        match wifi
            .connect_to_wifi(&body.ssid, body.password.as_deref(), &body.ncbip)
            .await
        {
            Ok(msg) => tracing::info!(ssid = %body.ssid, %msg, "scheduled connect finished"),
            Err(e) => tracing::warn!(ssid = %body.ssid, error = %e, "scheduled connect failed"),
        }
    });

    ApiResponse::ok_with_message(
        json!({ "scheduled": true }),
        "connection attempt scheduled; this network may drop momentarily",
    )
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    let s = state.wifi.status();
    ApiResponse::ok(json!({
        "IsActive": s.hotspot_active,
        "SSID": s.hotspot_ssid,
        "Password": s.hotspot_password,
        "ConfigUrl": s.config_url,
    }))
}

pub async fn start(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    match state.wifi.start_hotspot(None, None).await {
        Ok(msg) => ApiResponse::ok(Value::String(msg)),
        Err(e) => ApiResponse::fail(e),
    }
}

pub async fn stop(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    match state.wifi.stop_hotspot().await {
        Ok(msg) => ApiResponse::ok(Value::String(msg)),
        Err(e) => ApiResponse::fail(e),
    }
}

/// Minimal self-contained provisioning page, the captive-portal
/// landing target.
pub async fn provision_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let rows: String = state
        .wifi
        .scan_cache()
        .all()
        .iter()
        .map(|n| {
            format!(
                "<tr><td>{}</td><td>{} dBm</td><td>{}</td></tr>",
                escape(&n.ssid),
                n.signal,
                escape(&n.security)
            )
        })
        .collect();

    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>NCB Edge setup</title></head><body>\
         <h1>NCB Edge setup</h1>\
         <p>This device is waiting to be put on your Wi-Fi. Pick a network \
         below, then submit its name, password and the server address you \
         were given.</p>\
         <form id=\"f\" onsubmit=\"return send()\">\
         <label>Network <input id=\"ssid\"></label><br>\
         <label>Password <input id=\"pw\" type=\"password\"></label><br>\
         <label>Server IP <input id=\"ip\"></label><br>\
         <button type=\"submit\">Connect</button></form>\
         <p id=\"out\"></p>\
         <script>function send(){{fetch('/api/Admin/Provision/connect',{{method:'POST',\
         headers:{{'Content-Type':'application/json'}},body:JSON.stringify({{SSID:ssid.value,\
         Password:pw.value,NCBIP:ip.value}})}}).then(r=>r.json()).then(j=>{{\
         out.textContent=j.message||j.errorMessage||'submitted';}});return false;}}</script>\
         <h2>Nearby networks</h2>\
         <table><tr><th>SSID</th><th>Signal</th><th>Security</th></tr>{rows}</table>\
         </body></html>"
    ))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

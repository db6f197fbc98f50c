//! Wire format of the RFCOMM provisioning protocol.
//!
//! Newline-terminated UTF-8 lines, optionally base64-wrapped. JSON
//! payloads carry the request/response envelope; anything else falls
//! into a small plaintext debug dialect handled by the server.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Read the device id; response is signed so the peer can pin it.
pub const MSG_READ_DEVICE_ID: i32 = 10000;
/// Provision Wi-Fi; request data is OAEP ciphertext of the credential.
pub const MSG_PROVISION_WIFI: i32 = 10050;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "MsgId")]
    pub msg_id: String,
    #[serde(rename = "Time", default)]
    pub time: String,
    #[serde(rename = "Type")]
    pub msg_type: i32,
    #[serde(rename = "Data", default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(rename = "MsgId")]
    pub msg_id: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Type")]
    pub msg_type: i32,
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Data", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "Sign", skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
}

impl Response {
    pub fn success(req: &Request, data: impl Into<String>, sign: Option<String>) -> Self {
        Self {
            msg_id: req.msg_id.clone(),
            time: now(),
            msg_type: req.msg_type,
            success: true,
            message: "OK".into(),
            data: Some(data.into()),
            sign,
        }
    }

    pub fn failure(req: &Request, message: impl Into<String>) -> Self {
        Self {
            msg_id: req.msg_id.clone(),
            time: now(),
            msg_type: req.msg_type,
            success: false,
            message: message.into(),
            data: None,
            sign: None,
        }
    }

    /// For frames that never parsed far enough to carry a MsgId.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            msg_id: String::new(),
            time: now(),
            msg_type: 0,
            success: false,
            message: message.into(),
            data: None,
            sign: None,
        }
    }
}

/// Credential triple carried (encrypted) by a 10050 request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WifiCredential {
    #[serde(rename = "SSID")]
    pub ssid: String,
    #[serde(rename = "Password", default)]
    pub password: Option<String>,
    #[serde(rename = "NCBIP")]
    pub ncbip: String,
}

pub fn now() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Some peer stacks base64-wrap every line; if the bytes decode as
/// base64 into UTF-8 use that, otherwise take the raw bytes as text.
pub fn decode_payload(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw).trim().to_string();
    if text.is_empty() {
        return text;
    }
    if let Ok(decoded) = BASE64.decode(text.as_bytes()) {
        if let Ok(inner) = String::from_utf8(decoded) {
            let inner = inner.trim().to_string();
            if !inner.is_empty() {
                return inner;
            }
        }
    }
    text
}

pub fn looks_like_json(payload: &str) -> bool {
    payload.starts_with('{') && payload.ends_with('}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_uses_wire_names() {
        let req: Request = serde_json::from_str(
            r#"{"MsgId":"m1","Time":"2025-01-01T00:00:00","Type":10050,"Data":"abc"}"#,
        )
        .unwrap();
        assert_eq!(req.msg_id, "m1");
        assert_eq!(req.msg_type, MSG_PROVISION_WIFI);
        assert_eq!(req.data, "abc");
    }

    #[test]
    fn response_skips_absent_data_and_sign() {
        let req = Request {
            msg_id: "m2".into(),
            time: String::new(),
            msg_type: 42,
            data: String::new(),
        };
        let json = serde_json::to_string(&Response::failure(&req, "type not supported")).unwrap();
        assert!(json.contains("\"MsgId\":\"m2\""));
        assert!(json.contains("\"Success\":false"));
        assert!(!json.contains("\"Data\""));
        assert!(!json.contains("\"Sign\""));
    }

    #[test]
    fn base64_wrapped_payloads_are_unwrapped() {
        let wrapped = BASE64.encode(b"{\"MsgId\":\"m1\"}");
        assert_eq!(decode_payload(wrapped.as_bytes()), "{\"MsgId\":\"m1\"}");
    }

    #[test]
    fn plain_payloads_pass_through() {
        assert_eq!(decode_payload(b"PING\r\n"), "PING");
        // valid base64 but binary inside: keep the raw text
        assert_eq!(decode_payload(b"////"), "////");
    }

    #[test]
    fn json_detection_needs_both_braces() {
        assert!(looks_like_json(r#"{"a":1}"#));
        assert!(!looks_like_json("PING"));
        assert!(!looks_like_json("{unterminated"));
    }
}

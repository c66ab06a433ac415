//! Control-channel frames.
//!
//! File negotiation uses `{"type": ..., "data": FileTransfer}`; the screen
//! share handshake reuses the relay's key names. Everything else belongs to
//! the application and is passed through untouched.

use super::transfer::FileTransfer;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    FileRequest(FileTransfer),
    FileResponse(FileTransfer),
    FileRejected(FileTransfer),
    ScreenShareTrackId(String),
    StartSendingScreen,
    Application(String),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum FileFrame {
    #[serde(rename = "file_sending_request")]
    Request(FileTransfer),
    #[serde(rename = "file_sending_response")]
    Response(FileTransfer),
    #[serde(rename = "file_sending_rejected")]
    Rejected(FileTransfer),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeFrame {
    screen_share_track_id: Option<String>,
    start_sending_screen: Option<bool>,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Self {
        if let Ok(frame) = serde_json::from_str::<FileFrame>(text) {
            return match frame {
                FileFrame::Request(t) => ControlMessage::FileRequest(t),
                FileFrame::Response(t) => ControlMessage::FileResponse(t),
                FileFrame::Rejected(t) => ControlMessage::FileRejected(t),
            };
        }
        if let Ok(hs) = serde_json::from_str::<HandshakeFrame>(text) {
            match (hs.screen_share_track_id, hs.start_sending_screen) {
                (Some(id), None) => return ControlMessage::ScreenShareTrackId(id),
                (None, Some(true)) => return ControlMessage::StartSendingScreen,
                _ => {}
            }
        }
        ControlMessage::Application(text.to_string())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            ControlMessage::FileRequest(t) => serde_json::to_string(&FileFrame::Request(t.clone()))?,
            ControlMessage::FileResponse(t) => {
                serde_json::to_string(&FileFrame::Response(t.clone()))?
            }
            ControlMessage::FileRejected(t) => {
                serde_json::to_string(&FileFrame::Rejected(t.clone()))?
            }
            ControlMessage::ScreenShareTrackId(id) => {
                serde_json::json!({ "screenShareTrackId": id }).to_string()
            }
            ControlMessage::StartSendingScreen => {
                serde_json::json!({ "startSendingScreen": true }).to_string()
            }
            ControlMessage::Application(text) => text.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_request_frame_shape() {
        let t = FileTransfer::new("photo.jpg", 1024, "alice");
        let json = ControlMessage::FileRequest(t.clone()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "file_sending_request");
        assert_eq!(value["data"]["fileName"], "photo.jpg");
        assert_eq!(ControlMessage::parse(&json), ControlMessage::FileRequest(t));
    }

    #[test]
    fn handshake_frames() {
        assert_eq!(
            ControlMessage::parse(r#"{"screenShareTrackId":"t9"}"#),
            ControlMessage::ScreenShareTrackId("t9".into())
        );
        assert_eq!(
            ControlMessage::parse(r#"{"startSendingScreen":true}"#),
            ControlMessage::StartSendingScreen
        );
    }

    #[test]
    fn unset_start_flag_is_application() {
        let text = r#"{"startSendingScreen":false}"#;
        assert_eq!(ControlMessage::parse(text), ControlMessage::Application(text.to_string()));
    }

    #[test]
    fn everything_else_is_application() {
        for text in [r#"{"chat":"hi"}"#, r#"{"type":"reaction","data":1}"#, "plain", "[1,2]"] {
            assert_eq!(
                ControlMessage::parse(text),
                ControlMessage::Application(text.to_string())
            );
        }
    }
}

use serde::{Deserialize, Serialize};

use crate::Result;

/// Frames sent by the client over the duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    Text { text: String },
    Eos,
    Audio { pcm: Vec<f32> },
    Marker { id: i64 },
}

/// Frames received from the remote streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    Ready,
    Error {
        #[serde(default)]
        message: String,
    },
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        start_s: f64,
        #[serde(default)]
        stop_s: f64,
    },
    Audio {
        #[serde(default)]
        pcm: Vec<f32>,
    },
    Word {
        #[serde(default)]
        text: String,
        #[serde(default)]
        start_time: f64,
    },
    EndWord {
        #[serde(default)]
        stop_time: f64,
    },
    Step {
        #[serde(default)]
        step_idx: u64,
    },
    Marker { id: i64 },
    /// Any frame type this client does not understand.
    #[serde(skip)]
    Unknown { kind: String },
}

impl ServerFrame {
    const KNOWN_TYPES: [&'static str; 8] =
        ["Ready", "Error", "Text", "Audio", "Word", "EndWord", "Step", "Marker"];

    /// The wire `type` discriminant of this frame.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Ready => "Ready",
            Self::Error { .. } => "Error",
            Self::Text { .. } => "Text",
            Self::Audio { .. } => "Audio",
            Self::Word { .. } => "Word",
            Self::EndWord { .. } => "EndWord",
            Self::Step { .. } => "Step",
            Self::Marker { .. } => "Marker",
            Self::Unknown { kind } => kind,
        }
    }

    /// An empty `Text` frame with both timestamps at exactly zero marks the end of synthesis.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_end_of_synthesis(&self) -> bool {
        matches!(self, Self::Text { text, start_s, stop_s }
            if text.is_empty() && *start_s == 0.0 && *stop_s == 0.0)
    }
}

#[derive(Deserialize)]
struct FrameHeader {
    #[serde(rename = "type")]
    kind: String,
}

/// Encode a client frame as a MessagePack map.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn encode_frame(frame: &ClientFrame) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Decode a server frame. Unrecognized `type` values map to [`ServerFrame::Unknown`].
///
/// # Errors
/// Returns [`crate::Error::InvalidFrame`] if the payload has no readable `type`
/// or a known frame carries a malformed body.
pub fn decode_frame(bytes: &[u8]) -> Result<ServerFrame> {
    let header: FrameHeader = rmp_serde::from_slice(bytes)
        .map_err(|e| crate::Error::InvalidFrame(format!("missing frame type: {e}")))?;
    if !ServerFrame::KNOWN_TYPES.contains(&header.kind.as_str()) {
        return Ok(ServerFrame::Unknown { kind: header.kind });
    }
    rmp_serde::from_slice(bytes)
        .map_err(|e| crate::Error::InvalidFrame(format!("malformed {} frame: {e}", header.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pack<T: Serialize>(value: &T) -> Vec<u8> {
        rmp_serde::to_vec_named(value).unwrap()
    }

    #[test]
    fn client_frames_encode_as_tagged_maps() {
        let bytes = encode_frame(&ClientFrame::Text { text: "hello".into() }).unwrap();
        let decoded: BTreeMap<String, String> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.get("type").map(String::as_str), Some("Text"));
        assert_eq!(decoded.get("text").map(String::as_str), Some("hello"));

        let bytes = encode_frame(&ClientFrame::Eos).unwrap();
        let decoded: BTreeMap<String, String> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded["type"], "Eos");
    }

    #[test]
    fn decodes_text_with_integer_timestamps() {
        let mut map = BTreeMap::new();
        map.insert("type", wire::Str("Text"));
        map.insert("text", wire::Str(""));
        map.insert("start_s", wire::Int(0));
        map.insert("stop_s", wire::Int(0));
        let frame = decode_frame(&pack(&map)).unwrap();
        assert!(frame.is_end_of_synthesis());
    }

    #[test]
    fn timed_text_is_not_a_sentinel() {
        let frame = ServerFrame::Text { text: "hi".into(), start_s: 0.2, stop_s: 0.4 };
        assert!(!frame.is_end_of_synthesis());
        let frame = ServerFrame::Text { text: String::new(), start_s: 0.0, stop_s: 0.1 };
        assert!(!frame.is_end_of_synthesis());
    }

    #[test]
    fn unknown_type_is_preserved() {
        let mut map = BTreeMap::new();
        map.insert("type", "Bogus");
        let frame = decode_frame(&pack(&map)).unwrap();
        assert_eq!(frame, ServerFrame::Unknown { kind: "Bogus".into() });
        assert_eq!(frame.kind(), "Bogus");
    }

    #[test]
    fn malformed_body_is_invalid_frame() {
        let mut map = BTreeMap::new();
        map.insert("type", wire::Str("Marker"));
        map.insert("id", wire::Str("not-a-number"));
        let err = decode_frame(&pack(&map)).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn garbage_is_invalid_frame() {
        let err = decode_frame(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidFrame(_)));
    }

    #[test]
    fn audio_frame_decodes_pcm() {
        let bytes = pack(&ServerFrame::Audio { pcm: vec![0.5, -0.25] });
        assert_eq!(decode_frame(&bytes).unwrap(), ServerFrame::Audio { pcm: vec![0.5, -0.25] });
    }

    mod wire {
        use serde::Serialize;

        #[derive(Serialize)]
        #[serde(untagged)]
        pub enum Value {
            Str(&'static str),
            Int(i64),
        }

        pub use Value::{Int, Str};
    }
}

//! JSON wire types for the streaming endpoint.
//!
//! Inbound: `{id, cmd, type, content, predict_mode?, max_face_count?}`.
//! Outbound: `{id, cmd, result, content}` with `content` null on error.

use serde::{Deserialize, Serialize};

use crate::id::{ConnectionId, CorrelationId};

/// Response codes produced locally. Positive codes come from the engine.
pub mod result_code {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_PARAMETERS: i32 = -1;
    pub const RESOURCE_NOT_FOUND: i32 = -2;
    pub const NO_FEATURE: i32 = -3;
}

/// A request as sent by a streaming client.
///
/// Every field is optional on the wire; missing fields take their zero
/// value and are judged later during resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceRequest {
    pub id: String,
    pub cmd: String,
    #[serde(rename = "type")]
    pub kind: i32,
    pub content: String,
    pub predict_mode: i32,
    pub max_face_count: i32,
}

/// How `content` should be turned into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// `content` names a file to read.
    Path,
    /// `content` is standard base64.
    Inline,
}

impl ContentKind {
    pub fn from_wire(kind: i32) -> Option<Self> {
        match kind {
            0 => Some(Self::Path),
            1 => Some(Self::Inline),
            _ => None,
        }
    }
}

/// A parsed request bound to its connection and correlation id.
#[derive(Debug, Clone)]
pub struct Request {
    pub correlation_id: CorrelationId,
    pub connection_id: ConnectionId,
    pub id: String,
    pub cmd: String,
    pub kind: i32,
    /// Cleared as soon as it has been resolved into a buffer.
    pub content: String,
    pub predict_mode: i32,
    pub max_face_count: i32,
}

impl Request {
    pub fn new(
        wire: FaceRequest,
        correlation_id: CorrelationId,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            correlation_id,
            connection_id,
            id: wire.id,
            cmd: wire.cmd,
            kind: wire.kind,
            content: wire.content,
            predict_mode: wire.predict_mode,
            max_face_count: wire.max_face_count,
        }
    }

    /// An error response echoing this request.
    pub fn error(&self, code: i32) -> FaceResponse {
        FaceResponse::error(self.id.clone(), self.cmd.clone(), code)
    }

    /// A successful response echoing this request.
    pub fn success(&self, features: Vec<FaceFeature>) -> FaceResponse {
        FaceResponse {
            id: self.id.clone(),
            cmd: self.cmd.clone(),
            result: result_code::SUCCESS,
            content: Some(features),
        }
    }
}

/// The message written back to a streaming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResponse {
    pub id: String,
    pub cmd: String,
    pub result: i32,
    pub content: Option<Vec<FaceFeature>>,
}

impl FaceResponse {
    pub fn error(id: String, cmd: String, code: i32) -> Self {
        Self {
            id,
            cmd,
            result: code,
            content: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub score: f32,
    pub x1: f32,
    pub x2: f32,
    pub y1: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub pitch: f32,
    pub roll: f32,
    pub yaw: f32,
}

/// A classified attribute (age bracket, gender, glasses, hat).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub classification: i32,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub visible: i32,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub brightness: i32,
    /// Comma-joined quality scores.
    pub scores: String,
}

/// One detected face as serialized to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceFeature {
    pub rect: Rect,
    pub liveness_score: f32,
    pub quality_score: f32,
    pub pose: Pose,
    /// Comma-joined embedding.
    pub metric: String,
    pub age: Attribute,
    pub gender: Attribute,
    pub glass: Attribute,
    pub hat: Attribute,
    pub landmark: Vec<Landmark>,
    pub quality: Quality,
}

/// Join floats with `,` using their shortest round-trip form.
pub fn join_floats(values: &[f32]) -> String {
    let mut out = String::with_capacity(values.len() * 10);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out
}

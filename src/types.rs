use std::{
    sync::{Arc, Mutex},
    time::{Instant, SystemTime},
};

use serde::{Deserialize, Deserializer};

/// A decoded camera frame in packed RGB8.
#[derive(Clone, Debug)]
pub struct Frame {
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    #[allow(dead_code)]
    pub timestamp: Instant,
}

/// Single-slot mailbox holding the most recent frame a stream produced.
///
/// The capture thread publishes into it, the recognition ticker reads from
/// it. Only the newest frame is kept, older ones are overwritten.
#[derive(Clone, Debug, Default)]
pub struct LatestFrame {
    inner: Arc<Mutex<FrameSlot>>,
}

#[derive(Debug, Default)]
struct FrameSlot {
    frame: Option<Frame>,
    fault: Option<String>,
}

impl LatestFrame {
    pub fn publish(&self, frame: Frame) {
        let mut slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.frame = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        let slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.frame.clone()
    }

    /// Records an unrecoverable capture failure. The stream stays attached
    /// until its owner notices and releases it.
    pub fn report_fault(&self, message: impl Into<String>) {
        let mut slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.fault = Some(message.into());
    }

    pub fn fault(&self) -> Option<String> {
        let slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.fault.clone()
    }

    pub fn clear(&self) {
        let mut slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.frame = None;
    }
}

/// Body returned by `POST /camera/recognize`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RecognitionResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub detected_students: Vec<DetectedStudent>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unknown_faces: Vec<UnknownFace>,
    #[serde(default)]
    pub unknown_count: Option<u32>,
    #[serde(default)]
    #[allow(dead_code)]
    pub face_count: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DetectedStudent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub student_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub liveness_score: Option<f32>,
    #[serde(default)]
    pub bbox: Option<[i32; 4]>,
    #[serde(default)]
    pub spoofing_type: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UnknownFace {
    #[serde(default)]
    pub bbox: Option<[i32; 4]>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl RecognitionResponse {
    /// Number of unknown persons the backend reported, falling back to the
    /// length of `unknown_faces` when the count is absent.
    pub fn reported_unknown_count(&self) -> u32 {
        self.unknown_count
            .unwrap_or_else(|| self.unknown_faces.len() as u32)
    }
}

/// Liveness assumed when the backend omits a score.
pub const DEFAULT_LIVENESS: f32 = 1.0;

const SPOOFING_STATUSES: &[&str] = &["spoofing", "spoofing_detected"];

#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedPerson {
    pub student_id: String,
    pub name: String,
    pub status: String,
    pub liveness_score: f32,
    pub spoofing: bool,
    pub spoofing_type: Option<String>,
    pub warning: Option<String>,
    pub bbox: Option<[i32; 4]>,
}

impl From<DetectedStudent> for RecognizedPerson {
    fn from(student: DetectedStudent) -> Self {
        let spoofing = SPOOFING_STATUSES.contains(&student.status.as_str());
        let liveness_score = student
            .liveness_score
            .filter(|score| score.is_finite())
            .unwrap_or(DEFAULT_LIVENESS)
            .clamp(0.0, 1.0);
        RecognizedPerson {
            student_id: student.student_id,
            name: student.name,
            status: student.status,
            liveness_score,
            spoofing,
            spoofing_type: student.spoofing_type,
            warning: student.warning,
            bbox: student.bbox,
        }
    }
}

/// An unresolved face. Its index is only meaningful within one snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownPerson {
    pub index: usize,
    pub bbox: Option<[i32; 4]>,
}

/// The full set of detections from the last applied recognition response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSnapshot {
    pub recognized: Vec<RecognizedPerson>,
    pub unknown: Vec<UnknownPerson>,
    pub captured_at: Option<SystemTime>,
}

impl DetectionSnapshot {
    pub fn from_response(response: RecognitionResponse, captured_at: SystemTime) -> Self {
        let recognized = response
            .detected_students
            .into_iter()
            .map(RecognizedPerson::from)
            .collect();
        let unknown = response
            .unknown_faces
            .into_iter()
            .enumerate()
            .map(|(index, face)| UnknownPerson {
                index,
                bbox: face.bbox,
            })
            .collect();
        DetectionSnapshot {
            recognized,
            unknown,
            captured_at: Some(captured_at),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recognized.is_empty() && self.unknown.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> RecognitionResponse {
        serde_json::from_str(body).expect("valid recognition body")
    }

    #[test]
    fn missing_and_null_arrays_default_to_empty() {
        let missing = parse("{}");
        assert!(missing.detected_students.is_empty());
        assert!(missing.unknown_faces.is_empty());

        let nulls = parse(r#"{"detected_students": null, "unknown_faces": null}"#);
        assert!(nulls.detected_students.is_empty());
        assert!(nulls.unknown_faces.is_empty());
        assert_eq!(nulls.reported_unknown_count(), 0);
    }

    #[test]
    fn backend_extras_are_tolerated_and_kept() {
        let response = parse(
            r#"{
                "success": true,
                "detected_students": [{
                    "student_id": "S9",
                    "name": "Mallory",
                    "bbox": [10, 20, 30, 40],
                    "status": "spoofing_detected",
                    "liveness_score": 0.31,
                    "spoofing_type": "photo",
                    "warning": "Attendance NOT marked - spoofing detected"
                }],
                "unknown_faces": [{"bbox": [1, 2, 3, 4], "status": "unknown", "image_path": "x.jpg"}],
                "face_count": 2,
                "unknown_count": 1
            }"#,
        );
        let snapshot = DetectionSnapshot::from_response(response, SystemTime::UNIX_EPOCH);
        let person = &snapshot.recognized[0];
        assert!(person.spoofing);
        assert_eq!(person.bbox, Some([10, 20, 30, 40]));
        assert_eq!(person.spoofing_type.as_deref(), Some("photo"));
        assert_eq!(snapshot.unknown[0].bbox, Some([1, 2, 3, 4]));
    }

    #[test]
    fn missing_liveness_is_treated_as_live() {
        let response = parse(r#"{"detected_students": [{"name": "Bob", "student_id": "S2", "status": "recognized"}]}"#);
        let snapshot = DetectionSnapshot::from_response(response, SystemTime::UNIX_EPOCH);
        assert_eq!(snapshot.recognized[0].liveness_score, DEFAULT_LIVENESS);
        assert!(!snapshot.recognized[0].spoofing);
    }

    #[test]
    fn unknown_count_falls_back_to_face_list() {
        let response = parse(r#"{"unknown_faces": [{}, {}]}"#);
        assert_eq!(response.reported_unknown_count(), 2);
    }

    #[test]
    fn latest_frame_keeps_only_newest() {
        let slot = LatestFrame::default();
        assert!(slot.latest().is_none());
        for width in [1, 2] {
            slot.publish(Frame {
                rgb: vec![0; (width * 3) as usize],
                width,
                height: 1,
                timestamp: Instant::now(),
            });
        }
        assert_eq!(slot.latest().map(|frame| frame.width), Some(2));
        slot.clear();
        assert!(slot.latest().is_none());
    }
}

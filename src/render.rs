use std::fmt::{self, Write as _};

use crate::types::{DetectionSnapshot, RecognizedPerson};

pub const DEFAULT_LOW_LIVENESS_THRESHOLD: f32 = 0.7;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DetectionFlag {
    Normal,
    LowLiveness { score: f32 },
    Spoofing,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DetectionEntry {
    Recognized {
        name: String,
        student_id: String,
        flag: DetectionFlag,
        detail: Option<String>,
        warning: Option<String>,
        bbox: Option<[i32; 4]>,
    },
    /// `ordinal` is 1-based and only labels the entry within this snapshot.
    Unknown {
        ordinal: usize,
        bbox: Option<[i32; 4]>,
    },
}

/// Face box as the backend reports it: `[x, y, width, height]`.
struct BoxLabel([i32; 4]);

impl fmt::Display for BoxLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, w, h] = self.0;
        write!(f, "@ {x},{y} {w}x{h}")
    }
}

pub fn classify(person: &RecognizedPerson, low_liveness_threshold: f32) -> DetectionFlag {
    if person.spoofing {
        DetectionFlag::Spoofing
    } else if person.liveness_score < low_liveness_threshold {
        DetectionFlag::LowLiveness {
            score: person.liveness_score,
        }
    } else {
        DetectionFlag::Normal
    }
}

pub fn render_entries(snapshot: &DetectionSnapshot, low_liveness_threshold: f32) -> Vec<DetectionEntry> {
    let recognized = snapshot.recognized.iter().map(|person| {
        let flag = classify(person, low_liveness_threshold);
        let detail = match flag {
            DetectionFlag::Spoofing => person
                .spoofing_type
                .as_ref()
                .map(|kind| format!("suspected {kind}")),
            _ => None,
        };
        DetectionEntry::Recognized {
            name: person.name.clone(),
            student_id: person.student_id.clone(),
            flag,
            detail,
            warning: person.warning.clone(),
            bbox: person.bbox,
        }
    });
    let unknown = snapshot
        .unknown
        .iter()
        .map(|face| DetectionEntry::Unknown {
            ordinal: face.index + 1,
            bbox: face.bbox,
        });
    recognized.chain(unknown).collect()
}

impl fmt::Display for DetectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionEntry::Recognized {
                name,
                student_id,
                flag,
                detail,
                warning,
                bbox,
            } => {
                let marker = match flag {
                    DetectionFlag::Spoofing => "✗",
                    DetectionFlag::LowLiveness { .. } => "!",
                    DetectionFlag::Normal => "●",
                };
                write!(f, "{marker} {name} ({student_id})")?;
                match flag {
                    DetectionFlag::Spoofing => write!(f, " ⚠️ SPOOF!")?,
                    DetectionFlag::LowLiveness { score } => {
                        write!(f, " Low liveness: {:.0}%", score * 100.0)?
                    }
                    DetectionFlag::Normal => {}
                }
                if let Some(bbox) = bbox {
                    write!(f, " {}", BoxLabel(*bbox))?;
                }
                if let Some(detail) = detail {
                    write!(f, " [{detail}]")?;
                }
                if let Some(warning) = warning {
                    write!(f, " ({warning})")?;
                }
                Ok(())
            }
            DetectionEntry::Unknown { ordinal, bbox } => {
                write!(f, "● Unknown Person #{ordinal}")?;
                if let Some(bbox) = bbox {
                    write!(f, " {}", BoxLabel(*bbox))?;
                }
                write!(f, " (Logged as suspicious)")
            }
        }
    }
}

/// Text panel listing the current detections, or `None` when there is
/// nothing to show.
pub fn render_text(snapshot: &DetectionSnapshot, low_liveness_threshold: f32) -> Option<String> {
    if snapshot.is_empty() {
        return None;
    }

    let entries = render_entries(snapshot, low_liveness_threshold);
    let mut out = String::new();
    let mut recognized = entries
        .iter()
        .filter(|entry| matches!(entry, DetectionEntry::Recognized { .. }))
        .peekable();
    if recognized.peek().is_some() {
        out.push_str("✓ Detected:\n");
        for entry in recognized {
            let _ = writeln!(out, "  {entry}");
        }
    }

    let mut unknown = entries
        .iter()
        .filter(|entry| matches!(entry, DetectionEntry::Unknown { .. }))
        .peekable();
    if unknown.peek().is_some() {
        out.push_str("⚠️ Unknown Persons Detected:\n");
        for entry in unknown {
            let _ = writeln!(out, "  {entry}");
        }
    }

    Some(out)
}

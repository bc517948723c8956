//! Pick-up / place-back state tracking.
//!
//! The tracker walks a `DetectionMap` in frame order and runs a two-state
//! machine for one object relative to one container. Exactly one object and
//! one container are tracked: the first box carrying each role's label in a
//! frame wins, and further boxes with the same label are ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detect::{Detection, DetectionMap};
use crate::error::{PipelineError, Result};
use crate::frame::FrameId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// The object's centroid lies inside the container box.
    #[default]
    OnTarget,
    OffTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PickedUp,
    PlacedBack,
}

/// A state transition observed at `frame`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub frame: FrameId,
    /// Offset from the start of the video, serialized as seconds.
    #[serde(with = "duration_secs")]
    pub timestamp: Duration,
    pub event: EventKind,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug)]
pub struct StateTracker {
    container_label: String,
    object_label: String,
    initial_state: TrackState,
}

impl StateTracker {
    pub fn new(container_label: impl Into<String>, object_label: impl Into<String>) -> Self {
        Self {
            container_label: container_label.into(),
            object_label: object_label.into(),
            initial_state: TrackState::default(),
        }
    }

    pub fn with_initial_state(mut self, state: TrackState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn track(&self, detections: &DetectionMap, fps: f64) -> Result<Vec<Event>> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(PipelineError::TrackingInput(format!(
                "frame rate must be a positive number, got {fps}"
            )));
        }
        detections.validate()?;

        let mut state = self.initial_state;
        let mut events = Vec::new();
        for (frame, boxes) in detections.iter() {
            let Some(current) = self.classify(boxes) else {
                continue;
            };
            if current == state {
                continue;
            }
            let event = match current {
                TrackState::OffTarget => EventKind::PickedUp,
                TrackState::OnTarget => EventKind::PlacedBack,
            };
            let timestamp = Duration::try_from_secs_f64(f64::from(frame.index()) / fps)
                .map_err(|e| {
                    PipelineError::TrackingInput(format!(
                        "timestamp of {frame} at {fps} fps is out of range: {e}"
                    ))
                })?;
            log::debug!("{}: {:?} at {:?}", frame, event, timestamp);
            events.push(Event {
                frame,
                timestamp,
                event,
            });
            state = current;
        }
        Ok(events)
    }

    /// `None` when either role is missing from the frame.
    fn classify(&self, boxes: &[Detection]) -> Option<TrackState> {
        let container = boxes.iter().find(|d| d.label == self.container_label)?;
        let object = boxes.iter().find(|d| d.label == self.object_label)?;
        let (cx, cy) = object.centroid();
        Some(if container.contains(cx, cy) {
            TrackState::OnTarget
        } else {
            TrackState::OffTarget
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(label: &str, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            confidence: 0.9,
            class_id: 0,
            label: label.to_string(),
        }
    }

    fn tray() -> Detection {
        boxed("tray", 0.0, 0.0, 100.0, 100.0)
    }

    fn cup_at(cx: f32, cy: f32) -> Detection {
        boxed("cup", cx - 5.0, cy - 5.0, cx + 5.0, cy + 5.0)
    }

    fn map(frames: Vec<(u32, Vec<Detection>)>) -> DetectionMap {
        let mut map = DetectionMap::new();
        for (idx, dets) in frames {
            map.insert(FrameId::new(idx), dets);
        }
        map
    }

    fn tracker() -> StateTracker {
        StateTracker::new("tray", "cup")
    }

    #[test]
    fn leaving_and_returning_emit_one_event_each() {
        let m = map(vec![
            (0, vec![tray(), cup_at(50.0, 50.0)]),
            (1, vec![tray(), cup_at(150.0, 50.0)]),
            (2, vec![tray(), cup_at(160.0, 50.0)]),
            (3, vec![cup_at(40.0, 40.0), tray()]),
            (4, vec![tray(), cup_at(45.0, 40.0)]),
        ]);
        let events = tracker().track(&m, 2.0).unwrap();
        assert_eq!(
            events,
            vec![
                Event {
                    frame: FrameId::new(1),
                    timestamp: Duration::from_millis(500),
                    event: EventKind::PickedUp,
                },
                Event {
                    frame: FrameId::new(3),
                    timestamp: Duration::from_millis(1500),
                    event: EventKind::PlacedBack,
                },
            ]
        );
    }

    #[test]
    fn frames_missing_a_role_keep_the_carried_state() {
        let m = map(vec![
            (0, vec![tray(), cup_at(150.0, 50.0)]),
            (1, vec![tray()]),
            (2, vec![cup_at(50.0, 50.0)]),
            (3, vec![]),
            (4, vec![tray(), cup_at(150.0, 60.0)]),
            (5, vec![tray(), cup_at(50.0, 60.0)]),
        ]);
        let events = tracker().track(&m, 1.0).unwrap();
        let kinds: Vec<(u32, EventKind)> = events.iter().map(|e| (e.frame.index(), e.event)).collect();
        assert_eq!(kinds, vec![(0, EventKind::PickedUp), (5, EventKind::PlacedBack)]);
    }

    #[test]
    fn steady_state_emits_nothing() {
        let m = map((0..20).map(|i| (i, vec![tray(), cup_at(50.0, 50.0)])).collect());
        assert!(tracker().track(&m, 30.0).unwrap().is_empty());
        assert!(tracker().track(&DetectionMap::new(), 30.0).unwrap().is_empty());
    }

    #[test]
    fn centroid_on_the_edge_counts_as_inside() {
        let m = map(vec![(0, vec![tray(), cup_at(100.0, 0.0)])]);
        assert!(tracker().track(&m, 1.0).unwrap().is_empty());
    }

    #[test]
    fn frames_are_evaluated_numerically() {
        let m = map(vec![
            (10, vec![tray(), cup_at(50.0, 50.0)]),
            (9, vec![tray(), cup_at(150.0, 50.0)]),
            (2, vec![tray(), cup_at(150.0, 50.0)]),
        ]);
        let events = tracker().track(&m, 1.0).unwrap();
        let frames: Vec<String> = events.iter().map(|e| e.frame.to_string()).collect();
        assert_eq!(frames, ["frame_2", "frame_10"]);
    }

    #[test]
    fn first_box_of_each_role_is_used() {
        let m = map(vec![(
            0,
            vec![tray(), cup_at(150.0, 50.0), cup_at(50.0, 50.0), boxed("tray", 100.0, 0.0, 200.0, 100.0)],
        )]);
        let events = tracker().track(&m, 1.0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::PickedUp);
    }

    #[test]
    fn initial_state_can_be_overridden() {
        let m = map(vec![(0, vec![tray(), cup_at(150.0, 50.0)])]);
        let events = tracker()
            .with_initial_state(TrackState::OffTarget)
            .track(&m, 1.0)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn rejects_bad_frame_rate_and_boxes() {
        let m = map(vec![(0, vec![tray()])]);
        for fps in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                tracker().track(&m, fps),
                Err(PipelineError::TrackingInput(_))
            ));
        }
        let lifted = map(vec![(1, vec![tray(), cup_at(150.0, 50.0)])]);
        assert!(matches!(
            tracker().track(&lifted, 1e-20),
            Err(PipelineError::TrackingInput(ref msg)) if msg.contains("out of range")
        ));
        let bad = map(vec![(0, vec![boxed("tray", 10.0, 0.0, 5.0, 5.0)])]);
        assert!(matches!(
            tracker().track(&bad, 1.0),
            Err(PipelineError::TrackingInput(_))
        ));
    }

    #[test]
    fn events_serialize_with_snake_case_kind_and_seconds() {
        let event = Event {
            frame: FrameId::new(45),
            timestamp: Duration::from_millis(1500),
            event: EventKind::PickedUp,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"frame": "frame_45", "timestamp": 1.5, "event": "picked_up"})
        );
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}

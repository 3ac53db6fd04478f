//! Execution Timeline
//!
//! Records step start/end times for one execution so they can be
//! persisted with it and rendered as a Gantt chart.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of timeline event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Step dispatched
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step condition evaluated false
    Skipped,
    /// Step suspended the execution
    AwaitingInput,
    /// Decision injected for a suspended step
    Resumed,
    /// Step interrupted by execution cancellation
    Cancelled,
}

impl EventType {
    fn ends_step(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::AwaitingInput
                | Self::Resumed
                | Self::Cancelled
        )
    }
}

/// A single event in the execution timeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Ordered step events of one execution.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event for a step at the current time.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.add_event_at(step_id, event_type, Utc::now());
    }

    /// Records an event with an explicit timestamp.
    pub fn add_event_at(
        &mut self,
        step_id: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
    ) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp,
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time between the first and last recorded event, in milliseconds.
    pub fn span_ms(&self) -> i64 {
        let first = self.events.iter().map(|e| e.timestamp).min();
        let last = self.events.iter().map(|e| e.timestamp).max();
        match (first, last) {
            (Some(first), Some(last)) => (last - first).num_milliseconds(),
            _ => 0,
        }
    }

    /// Start/end offsets (ms from the first event) of each step's last run.
    fn step_spans(&self) -> Vec<(String, i64, i64)> {
        let Some(origin) = self.events.iter().map(|e| e.timestamp).min() else {
            return Vec::new();
        };

        let mut spans: HashMap<&str, (i64, Option<i64>)> = HashMap::new();
        for event in &self.events {
            let offset = (event.timestamp - origin).num_milliseconds();
            if event.event_type == EventType::Started {
                spans.insert(event.step_id.as_str(), (offset, None));
            } else if event.event_type.ends_step() {
                if let Some(span) = spans.get_mut(event.step_id.as_str()) {
                    if span.1.is_none() {
                        span.1 = Some(offset);
                    }
                }
            }
        }

        let mut sorted: Vec<_> = spans
            .into_iter()
            .filter_map(|(id, (start, end))| end.map(|end| (id.to_string(), start, end)))
            .collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        sorted
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.span_ms();
        let spans = self.step_spans();
        if spans.is_empty() {
            return output;
        }

        // Scale to 50 characters width
        let scale = if total_time > 0 {
            50.0 / total_time as f64
        } else {
            0.0
        };

        for (step_id, start, end) in spans {
            let start_pos = (start as f64 * scale) as usize;
            let width = (((end - start) as f64 * scale) as usize).max(1);

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{:12} |{:<51}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end - start
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, i64> {
        self.step_spans()
            .into_iter()
            .map(|(id, start, end)| (id, end - start))
            .collect()
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.get_events().is_empty());
        assert_eq!(timeline.span_ms(), 0);
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event_at("step1", EventType::Started, at(0));
        timeline.add_event_at("step2", EventType::Started, at(10));
        timeline.add_event_at("step1", EventType::Completed, at(50));
        timeline.add_event_at("step2", EventType::Failed, at(40));

        let durations = timeline.get_durations();
        assert_eq!(durations.get("step1"), Some(&50));
        assert_eq!(durations.get("step2"), Some(&30));
        assert_eq!(timeline.span_ms(), 50);
    }

    #[test]
    fn test_get_durations_only_started() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("step1", EventType::Started);
        assert!(!timeline.get_durations().contains_key("step1"));
    }

    #[test]
    fn test_paused_step_span_ends_at_suspension() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event_at("approve", EventType::Started, at(0));
        timeline.add_event_at("approve", EventType::AwaitingInput, at(5));
        timeline.add_event_at("approve", EventType::Resumed, at(5000));
        assert_eq!(timeline.get_durations().get("approve"), Some(&5));
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event_at("step1", EventType::Started, at(0));
        timeline.add_event_at("step1", EventType::Completed, at(50));
        timeline.add_event_at("step2", EventType::Started, at(50));
        timeline.add_event_at("step2", EventType::Completed, at(100));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains("step2"));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total"));
    }

    #[test]
    fn test_timeline_serializes() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("s1", EventType::Skipped);
        let json = serde_json::to_string(&timeline).unwrap();
        assert!(json.contains("\"skipped\""));
        let back: ExecutionTimeline = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timeline);
    }

    #[test]
    fn test_truncate_long_names() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a_really_long_step", 8), "a_rea...");
    }
}

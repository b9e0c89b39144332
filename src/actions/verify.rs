//! Geometric verification of worker-drawn outlines.
//!
//! Polygons with self-intersecting edges are invalid. When label criteria
//! are configured, the shapes must also carry the required labels in the
//! required counts. Each verified task/solution pair becomes a verdict
//! record for a forward action.

use crate::actions::{AssignmentEvent, WorkRecord};
use crate::config::{LabelCriterion, VerifyPolygonConfig};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// The polygon-verification action.
#[derive(Debug, Clone)]
pub struct VerifyPolygon {
    pub name: String,
    pub source: String,
    pub forward: Option<String>,
    shapes_variable: String,
    labels: Option<Vec<LabelCriterion>>,
}

impl VerifyPolygon {
    pub fn new(config: VerifyPolygonConfig) -> Self {
        Self {
            name: config.name,
            source: config.source,
            forward: config.forward,
            shapes_variable: config.data,
            labels: config.labels,
        }
    }

    /// Produce one verdict record per task/solution pair of the events.
    pub fn verdicts(&self, events: &[AssignmentEvent]) -> Vec<WorkRecord> {
        let mut records = Vec::new();

        for event in events {
            for (task, solution) in event.assignment.pairs() {
                let Some(answer) = solution.output_values.get(&self.shapes_variable) else {
                    debug!(
                        "Assignment {} has no output '{}'; skipping verification",
                        event.assignment.id, self.shapes_variable
                    );
                    continue;
                };

                let verdict = self.verify_answer(answer);

                let mut input_values = task.input_values.clone();
                input_values.insert(
                    "assignment_id".to_string(),
                    Value::String(event.assignment.id.clone()),
                );
                // Keep the shapes with the record so a forward can push them
                // into a fix-up pool.
                input_values.insert(self.shapes_variable.clone(), answer.clone());

                records.push(WorkRecord {
                    input_values,
                    label: Value::Bool(verdict.valid),
                    message: verdict.message,
                });
            }
        }

        records
    }

    fn verify_answer(&self, answer: &Value) -> Verdict {
        let shapes: Vec<&Value> = answer.as_array().map(|a| a.iter().collect()).unwrap_or_default();

        let polygons: Vec<&Value> = shapes
            .iter()
            .copied()
            .filter(|s| s["shape"] == "polygon")
            .collect();

        for polygon in &polygons {
            if !polygon_is_simple(polygon) {
                return Verdict::invalid(
                    "Your task was rejected, because it contained polygons with lines \
                     that cross each other.",
                );
            }
        }

        if let Some(criteria) = &self.labels {
            let rectangles = shapes.iter().copied().filter(|s| s["shape"] == "rectangle");
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for shape in rectangles.chain(polygons.iter().copied()) {
                if let Some(label) = shape["label"].as_str() {
                    *counts.entry(label).or_default() += 1;
                }
            }

            for criterion in criteria {
                match criterion {
                    LabelCriterion::Name(label) => {
                        if !counts.contains_key(label.as_str()) {
                            return Verdict::invalid(&format!(
                                "Your task was rejected, because it did not contain any \
                                 bounding boxes with the label {label}."
                            ));
                        }
                    }
                    LabelCriterion::Counts(expected) => {
                        for (label, expected_count) in expected {
                            match counts.get(label.as_str()) {
                                None => {
                                    return Verdict::invalid(&format!(
                                        "Your task was rejected, because it did not contain \
                                         any bounding boxes with the label {label}."
                                    ));
                                }
                                Some(count) if count > expected_count => {
                                    return Verdict::invalid(&format!(
                                        "Your task was rejected, because it contained too \
                                         many bounding boxes for the label {label} \
                                         (max. {expected_count})."
                                    ));
                                }
                                Some(count) if count < expected_count => {
                                    return Verdict::invalid(&format!(
                                        "Your task was rejected, because it did not contain \
                                         enough bounding boxes for the label {label} \
                                         ({expected_count} were expected)."
                                    ));
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            }
        }

        Verdict::valid()
    }
}

struct Verdict {
    valid: bool,
    message: String,
}

impl Verdict {
    fn valid() -> Self {
        Self {
            valid: true,
            message: "The outlines you submitted were evaluated as valid. Thank you!"
                .to_string(),
        }
    }

    fn invalid(message: &str) -> Self {
        Self {
            valid: false,
            message: message.to_string(),
        }
    }
}

/// Whether a polygon shape has no self-intersecting edges.
fn polygon_is_simple(polygon: &Value) -> bool {
    let Some(points) = polygon["points"].as_array() else {
        return false;
    };

    let coords: Vec<(f64, f64)> = points
        .iter()
        .filter_map(|p| Some((p["left"].as_f64()?, p["top"].as_f64()?)))
        .collect();

    if coords.len() != points.len() {
        return false;
    }

    is_simple_polygon(&coords)
}

/// Check a closed polygon for self-intersections: no two non-adjacent
/// edges may cross.
fn is_simple_polygon(coords: &[(f64, f64)]) -> bool {
    let n = coords.len();
    if n < 3 {
        return false;
    }

    let edge = |i: usize| (coords[i], coords[(i + 1) % n]);

    for i in 0..n {
        for j in (i + 1)..n {
            // Adjacent edges share a vertex; the first and last edge too.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }

            let (a, b) = edge(i);
            let (c, d) = edge(j);
            if segments_intersect(a, b, c, d) {
                return false;
            }
        }
    }

    true
}

fn segments_intersect(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    let d1 = cross(c, d, a);
    let d2 = cross(c, d, b);
    let d3 = cross(a, b, c);
    let d4 = cross(a, b, d);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(c, d, a))
        || (d2 == 0.0 && on_segment(c, d, b))
        || (d3 == 0.0 && on_segment(a, b, c))
        || (d4 == 0.0 && on_segment(a, b, d))
}

fn cross(origin: (f64, f64), p: (f64, f64), q: (f64, f64)) -> f64 {
    (p.0 - origin.0) * (q.1 - origin.1) - (p.1 - origin.1) * (q.0 - origin.0)
}

fn on_segment(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> bool {
    p.0 >= a.0.min(b.0) && p.0 <= a.0.max(b.0) && p.1 >= a.1.min(b.1) && p.1 <= a.1.max(b.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::EventType;
    use crate::platform::types::{Assignment, AssignmentStatus, Solution, Task};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn verify(labels: Option<&str>) -> VerifyPolygon {
        let labels_yaml = labels.map(|l| format!("labels:\n{l}")).unwrap_or_default();
        let config: VerifyPolygonConfig = serde_yaml::from_str(&format!(
            r#"
name: verify_poly
source: outline
forward: forward_verify
data: outlines
{labels_yaml}
"#
        ))
        .unwrap();
        VerifyPolygon::new(config)
    }

    fn event(shapes: Value) -> AssignmentEvent {
        let mut task = Task::new("pool-1", BTreeMap::new());
        task.input_values
            .insert("url".to_string(), json!("https://example.com/a.png"));

        let mut solution = Solution::default();
        solution.output_values.insert("outlines".to_string(), shapes);

        AssignmentEvent {
            event_type: EventType::Submitted,
            assignment: Assignment {
                id: "assignment-1".to_string(),
                task_suite_id: None,
                pool_id: "pool-1".to_string(),
                user_id: "worker-1".to_string(),
                status: AssignmentStatus::Submitted,
                tasks: vec![task],
                solutions: vec![solution],
            },
        }
    }

    fn square(label: &str) -> Value {
        json!({
            "shape": "polygon",
            "label": label,
            "points": [
                {"left": 0.0, "top": 0.0},
                {"left": 1.0, "top": 0.0},
                {"left": 1.0, "top": 1.0},
                {"left": 0.0, "top": 1.0},
            ],
        })
    }

    fn bowtie(label: &str) -> Value {
        json!({
            "shape": "polygon",
            "label": label,
            "points": [
                {"left": 0.0, "top": 0.0},
                {"left": 1.0, "top": 1.0},
                {"left": 1.0, "top": 0.0},
                {"left": 0.0, "top": 1.0},
            ],
        })
    }

    #[test]
    fn test_simple_polygon_passes() {
        let records = verify(None).verdicts(&[event(json!([square("text")]))]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, json!(true));
        assert!(records[0].message.contains("valid"));
    }

    #[test]
    fn test_self_intersecting_polygon_fails() {
        let records = verify(None).verdicts(&[event(json!([bowtie("text")]))]);
        assert_eq!(records[0].label, json!(false));
        assert!(records[0].message.contains("cross each other"));
    }

    #[test]
    fn test_missing_label_fails() {
        let records =
            verify(Some("  - figure\n")).verdicts(&[event(json!([square("text")]))]);
        assert_eq!(records[0].label, json!(false));
        assert!(records[0].message.contains("label figure"));
    }

    #[test]
    fn test_label_count_criteria() {
        let action = verify(Some("  - text: 2\n"));

        let records = action.verdicts(&[event(json!([square("text")]))]);
        assert_eq!(records[0].label, json!(false));
        assert!(records[0].message.contains("enough bounding boxes"));

        let records = action.verdicts(&[event(json!([square("text"), square("text")]))]);
        assert_eq!(records[0].label, json!(true));

        let records = action.verdicts(&[event(json!([
            square("text"),
            square("text"),
            square("text")
        ]))]);
        assert_eq!(records[0].label, json!(false));
        assert!(records[0].message.contains("too many"));
    }

    #[test]
    fn test_record_carries_shapes_and_assignment_id() {
        let records = verify(None).verdicts(&[event(json!([square("text")]))]);
        assert_eq!(records[0].input_values["assignment_id"], json!("assignment-1"));
        assert!(records[0].input_values["outlines"].is_array());
    }

    #[test]
    fn test_degenerate_polygon_is_invalid() {
        assert!(!is_simple_polygon(&[(0.0, 0.0), (1.0, 1.0)]));
    }

    #[test]
    fn test_rectangles_count_towards_labels() {
        let action = verify(Some("  - text\n"));
        let rect = json!({
            "shape": "rectangle",
            "label": "text",
            "left": 0.1, "top": 0.1, "width": 0.2, "height": 0.2,
        });
        let records = action.verdicts(&[event(json!([rect]))]);
        assert_eq!(records[0].label, json!(true));
    }
}

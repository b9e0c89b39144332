//! Splitting grouped bounding boxes into one task per box.
//!
//! The action consumes rows from a TSV file at pipeline start, assignment
//! events, or records forwarded by another action, and creates one task in
//! the target pool for each bounding box of each incoming image.

use crate::actions::{AssignmentEvent, PoolTarget, WorkRecord};
use crate::config::SeparateBboxesConfig;
use crate::data::DataRow;
use crate::platform::types::Task;
use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The record-splitting action.
#[derive(Debug, Clone)]
pub struct SeparateBboxes {
    pub name: String,
    pub target: String,
    image_variable: String,
    bboxes_variable: String,
    input_file: Option<PathBuf>,
    add_label: Option<String>,
}

impl SeparateBboxes {
    pub fn new(config: SeparateBboxesConfig) -> Self {
        Self {
            name: config.name,
            target: config.target,
            image_variable: config.data.image,
            bboxes_variable: config.data.bboxes,
            input_file: config.data.file,
            add_label: config.add_label,
        }
    }

    /// TSV file read when the action seeds the target pool at start.
    pub fn input_file(&self) -> Option<&PathBuf> {
        self.input_file.as_ref()
    }

    /// Data columns the seed file must provide.
    pub fn file_columns(&self) -> BTreeMap<String, crate::config::DataType> {
        BTreeMap::from([
            (self.image_variable.clone(), crate::config::DataType::Url),
            (self.bboxes_variable.clone(), crate::config::DataType::Json),
        ])
    }

    /// Expand one input-data row into per-box tasks.
    pub fn tasks_from_row(&self, row: &DataRow, target: &PoolTarget) -> Result<Vec<Task>> {
        let image = row.get(&self.image_variable).ok_or_else(|| {
            anyhow::anyhow!(
                "Row is missing the image variable '{}' for action {}",
                self.image_variable,
                self.name
            )
        })?;
        let bboxes = row.get(&self.bboxes_variable).ok_or_else(|| {
            anyhow::anyhow!(
                "Row is missing the bounding-box variable '{}' for action {}",
                self.bboxes_variable,
                self.name
            )
        })?;

        self.expand(image, bboxes, target)
    }

    /// Expand a record forwarded by another action.
    pub fn tasks_from_record(&self, record: &WorkRecord, target: &PoolTarget) -> Result<Vec<Task>> {
        let image = record.input_values.get(&self.image_variable).ok_or_else(|| {
            anyhow::anyhow!(
                "Forwarded record is missing '{}' for action {}",
                self.image_variable,
                self.name
            )
        })?;
        let bboxes = record.input_values.get(&self.bboxes_variable).ok_or_else(|| {
            anyhow::anyhow!(
                "Forwarded record is missing '{}' for action {}",
                self.bboxes_variable,
                self.name
            )
        })?;

        self.expand(image, bboxes, target)
    }

    /// Expand assignment events: images come from task input, boxes from
    /// the worker's solution.
    pub fn tasks_from_events(
        &self,
        events: &[AssignmentEvent],
        target: &PoolTarget,
    ) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();

        for event in events {
            for (task, solution) in event.assignment.pairs() {
                let image = task.input_values.get(&self.image_variable).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Assignment {} is missing the input '{}' for action {}",
                        event.assignment.id,
                        self.image_variable,
                        self.name
                    )
                })?;
                let bboxes =
                    solution.output_values.get(&self.bboxes_variable).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Assignment {} is missing the output '{}' for action {}",
                            event.assignment.id,
                            self.bboxes_variable,
                            self.name
                        )
                    })?;

                tasks.extend(self.expand(image, bboxes, target)?);
            }
        }

        Ok(tasks)
    }

    fn expand(&self, image: &Value, bboxes: &Value, target: &PoolTarget) -> Result<Vec<Task>> {
        let Some(boxes) = bboxes.as_array() else {
            bail!(
                "Action {} expected an array under '{}', found {}",
                self.name,
                self.bboxes_variable,
                bboxes
            );
        };

        let tasks = boxes
            .iter()
            .map(|bbox| {
                let bbox = match &self.add_label {
                    Some(label) => {
                        let mut stamped = bbox.clone();
                        if let Some(object) = stamped.as_object_mut() {
                            object.insert("label".to_string(), json!(label));
                        }
                        stamped
                    }
                    None => bbox.clone(),
                };

                let input_values = BTreeMap::from([
                    (self.image_variable.clone(), image.clone()),
                    (self.bboxes_variable.clone(), Value::Array(vec![bbox])),
                ]);

                let mut task = Task::new(&target.pool_id, input_values);
                task.unavailable_for = target.blocklist.clone();
                task
            })
            .collect();

        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separate(add_label: Option<&str>) -> SeparateBboxes {
        let label_line = match add_label {
            Some(label) => format!("add_label: {label}"),
            None => String::new(),
        };
        let config: SeparateBboxesConfig = serde_yaml::from_str(&format!(
            r#"
name: separate
target: classify
data:
  image: url
  bboxes: outlines
{label_line}
"#
        ))
        .unwrap();
        SeparateBboxes::new(config)
    }

    fn target() -> PoolTarget {
        PoolTarget {
            name: "classify".to_string(),
            pool_id: "pool-3".to_string(),
            blocklist: vec!["banned-1".to_string()],
        }
    }

    #[test]
    fn test_row_expands_to_one_task_per_box() {
        let row: DataRow = BTreeMap::from([
            ("url".to_string(), json!("https://example.com/a.png")),
            (
                "outlines".to_string(),
                json!([
                    {"shape": "rectangle", "left": 0.1, "top": 0.1},
                    {"shape": "rectangle", "left": 0.5, "top": 0.5},
                ]),
            ),
        ]);

        let tasks = separate(None).tasks_from_row(&row, &target()).unwrap();
        assert_eq!(tasks.len(), 2);

        for task in &tasks {
            assert_eq!(task.pool_id, "pool-3");
            assert_eq!(task.unavailable_for, vec!["banned-1"]);
            assert_eq!(task.input_values["outlines"].as_array().unwrap().len(), 1);
            assert_eq!(task.input_values["url"], json!("https://example.com/a.png"));
        }
    }

    #[test]
    fn test_label_stamped_on_boxes() {
        let row: DataRow = BTreeMap::from([
            ("url".to_string(), json!("https://example.com/a.png")),
            ("outlines".to_string(), json!([{"shape": "polygon"}])),
        ]);

        let tasks = separate(Some("text")).tasks_from_row(&row, &target()).unwrap();
        assert_eq!(
            tasks[0].input_values["outlines"][0]["label"],
            json!("text")
        );
    }

    #[test]
    fn test_non_array_boxes_rejected() {
        let row: DataRow = BTreeMap::from([
            ("url".to_string(), json!("https://example.com/a.png")),
            ("outlines".to_string(), json!("not-an-array")),
        ]);

        assert!(separate(None).tasks_from_row(&row, &target()).is_err());
    }

    #[test]
    fn test_record_expansion() {
        let record = WorkRecord {
            input_values: BTreeMap::from([
                ("url".to_string(), json!("https://example.com/b.png")),
                ("outlines".to_string(), json!([{"shape": "rectangle"}])),
            ]),
            label: json!(true),
            message: String::new(),
        };

        let tasks = separate(None).tasks_from_record(&record, &target()).unwrap();
        assert_eq!(tasks.len(), 1);
    }
}

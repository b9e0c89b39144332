//! Task interface construction.
//!
//! Each task kind declares the data types it expects and a worker-facing
//! view built from platform interface components. The builders check the
//! configured `data` section against those expectations and produce the
//! task specification uploaded with the project.

use crate::config::{DataType, InterfaceConfig, TaskConfig, TaskKind};
use crate::platform::types::{FieldKind, FieldSpec, TaskSpec};
use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Interfaces never show more than nine numbered hotkeys.
const MAX_HOTKEY_LABELS: usize = 9;

/// Checked input/output declaration for one task.
#[derive(Debug, Clone)]
pub struct CheckedIo {
    pub input_spec: BTreeMap<String, FieldSpec>,
    pub output_spec: BTreeMap<String, FieldSpec>,
    /// Input data type to variable name.
    pub input_by_type: BTreeMap<DataType, String>,
    /// Output data type to variable name.
    pub output_by_type: BTreeMap<DataType, String>,
}

impl CheckedIo {
    /// Variable receiving the worker's choice: a boolean output when
    /// declared, otherwise the string output.
    pub fn choice_output(&self) -> Option<&str> {
        self.output_by_type
            .get(&DataType::Bool)
            .or_else(|| self.output_by_type.get(&DataType::Str))
            .map(String::as_str)
    }
}

/// Build the task specification for a task kind.
pub fn build_task_spec(kind: TaskKind, config: &TaskConfig) -> Result<TaskSpec> {
    let (io, view_spec) = match kind {
        TaskKind::ImageClassification => image_classification(config)?,
        TaskKind::ImageSegmentation => image_segmentation(config)?,
        TaskKind::SegmentationClassification => segmentation_classification(config)?,
        TaskKind::TextClassification => text_classification(config)?,
        TaskKind::TextAnnotation => text_annotation(config)?,
    };

    Ok(TaskSpec {
        input_spec: io.input_spec,
        output_spec: io.output_spec,
        view_spec,
    })
}

/// Check the configured data section against a kind's expectations.
///
/// Required types must be declared; any declared type must be either
/// required or optional for the kind. Verification flows always get an
/// optional `assignment_id` input for acceptance bookkeeping.
fn check_io(
    config: &TaskConfig,
    required_in: &[DataType],
    optional_in: &[DataType],
    required_out: &[DataType],
    optional_out: &[DataType],
) -> Result<CheckedIo> {
    let input_by_type = collect_by_type(&config.data.input, required_in, optional_in)
        .map_err(|e| anyhow::anyhow!("{} (task {}, data/input)", e, config.name))?;
    let output_by_type = collect_by_type(&config.data.output, required_out, optional_out)
        .map_err(|e| anyhow::anyhow!("{} (task {}, data/output)", e, config.name))?;

    let mut input_spec: BTreeMap<String, FieldSpec> = config
        .data
        .input
        .iter()
        .map(|(name, ty)| (name.clone(), FieldSpec::required(FieldKind::from(*ty))))
        .collect();
    let output_spec: BTreeMap<String, FieldSpec> = config
        .data
        .output
        .iter()
        .map(|(name, ty)| (name.clone(), FieldSpec::required(FieldKind::from(*ty))))
        .collect();

    // Incoming assignment ids ride along as task input so verification
    // pools can accept or reject the original work.
    input_spec.insert(
        "assignment_id".to_string(),
        FieldSpec::optional(FieldKind::String),
    );

    Ok(CheckedIo {
        input_spec,
        output_spec,
        input_by_type,
        output_by_type,
    })
}

fn collect_by_type(
    declared: &BTreeMap<String, DataType>,
    required: &[DataType],
    optional: &[DataType],
) -> Result<BTreeMap<DataType, String>> {
    let mut by_type = BTreeMap::new();
    for (name, ty) in declared {
        if !required.contains(ty) && !optional.contains(ty) {
            bail!("unexpected data type {:?} for variable '{}'", ty, name);
        }
        by_type.insert(*ty, name.clone());
    }

    for ty in required {
        if !by_type.contains_key(ty) {
            bail!("missing a variable of the expected type {:?}", ty);
        }
    }

    Ok(by_type)
}

fn require_labels(interface: &InterfaceConfig, task: &str) -> Result<()> {
    if interface.labels.is_empty() {
        bail!(
            "Task {} needs 'labels' under 'interface': provide output value to \
             display label pairs, e.g. cat: Cat",
            task
        );
    }
    Ok(())
}

fn image_classification(config: &TaskConfig) -> Result<(CheckedIo, Value)> {
    let io = check_io(
        config,
        &[DataType::Url],
        &[],
        &[],
        &[DataType::Bool, DataType::Str],
    )?;
    require_labels(&config.interface, &config.name)?;

    let choice = io
        .choice_output()
        .ok_or_else(|| anyhow::anyhow!("Task {} needs a bool or str output", config.name))?;
    let url_input = &io.input_by_type[&DataType::Url];

    let view = list_view(
        vec![
            image_view(input_data(url_input)),
            text_view(json!(config.interface.prompt)),
            radio_group(choice, &config.interface.labels),
        ],
        None,
    );

    let mut plugins = vec![task_width_plugin()];
    if let Some(hotkeys) = hotkeys_plugin(choice, &config.interface.labels) {
        plugins.push(hotkeys);
    }

    Ok((io, view_spec(view, plugins)))
}

fn image_segmentation(config: &TaskConfig) -> Result<(CheckedIo, Value)> {
    let io = check_io(
        config,
        &[DataType::Url],
        &[DataType::Json, DataType::Bool],
        &[DataType::Json],
        &[DataType::Bool],
    )?;

    let url_input = &io.input_by_type[&DataType::Url];
    let json_output = &io.output_by_type[&DataType::Json];

    // Incoming outlines become the editable default when present.
    let data = match io.input_by_type.get(&DataType::Json) {
        Some(json_input) => output_data_with_default(json_output, input_data(json_input)),
        None => output_data(json_output),
    };

    let shapes: serde_json::Map<String, Value> = match &config.interface.tools {
        Some(tools) => {
            let allowed = ["rectangle", "polygon", "point"];
            for tool in tools {
                if !allowed.contains(&tool.as_str()) {
                    bail!(
                        "Invalid annotation tool '{}' for task {}; valid tools are \
                         rectangle, polygon and point",
                        tool,
                        config.name
                    );
                }
            }
            tools.iter().map(|t| (t.clone(), json!(true))).collect()
        }
        None => ["rectangle", "polygon", "point"]
            .iter()
            .map(|t| (t.to_string(), json!(true)))
            .collect(),
    };

    let annotation = json!({
        "type": "field.image-annotation",
        "data": data,
        "image": input_data(url_input),
        "shapes": shapes,
        "full_height": true,
        "labels": annotation_labels(&config.interface.labels),
    });

    let mut items = vec![annotation, text_view(json!(config.interface.prompt))];
    let mut conditions = vec![json!({
        "type": "condition.required",
        "data": output_data(json_output),
    })];

    if let Some(checkbox_label) = &config.interface.checkbox {
        let bool_output = io.output_by_type.get(&DataType::Bool).ok_or_else(|| {
            anyhow::anyhow!(
                "Task {} uses a checkbox and needs a bool output under 'data'",
                config.name
            )
        })?;
        items.push(json!({
            "type": "field.checkbox",
            "data": output_data_with_default(bool_output, json!(false)),
            "label": checkbox_label,
        }));
        conditions.push(json!({
            "type": "condition.equals",
            "data": output_data(bool_output),
            "to": true,
        }));
    }

    let validation = json!({
        "type": "condition.any",
        "conditions": conditions,
        "hint": "Please draw at least one shape or check the box.",
    });

    let view = list_view(items, Some(validation));
    Ok((io, view_spec(view, vec![annotation_hotkeys_plugin()])))
}

fn segmentation_classification(config: &TaskConfig) -> Result<(CheckedIo, Value)> {
    let io = check_io(
        config,
        &[DataType::Url, DataType::Json],
        &[DataType::Bool, DataType::Str],
        &[],
        &[DataType::Bool, DataType::Str],
    )?;
    require_labels(&config.interface, &config.name)?;

    let choice = io
        .choice_output()
        .ok_or_else(|| anyhow::anyhow!("Task {} needs a bool or str output", config.name))?;
    let url_input = &io.input_by_type[&DataType::Url];
    let json_input = &io.input_by_type[&DataType::Json];

    let seg_labels = config
        .interface
        .segmentation
        .as_ref()
        .map(|seg| annotation_labels(&seg.labels))
        .unwrap_or(Value::Null);

    // Read-only display of the annotation under review.
    let annotation = json!({
        "type": "field.image-annotation",
        "data": internal_data(json_input, input_data(json_input)),
        "image": input_data(url_input),
        "labels": seg_labels,
        "full_height": true,
        "disabled": true,
    });

    let mut items = vec![annotation];

    if let Some(checkbox_label) = &config.interface.checkbox {
        let flag_input = io
            .input_by_type
            .get(&DataType::Bool)
            .or_else(|| io.input_by_type.get(&DataType::Str))
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Task {} uses a checkbox and needs a bool or str input under 'data'",
                    config.name
                )
            })?;
        items.push(json!({
            "type": "field.checkbox",
            "data": internal_data(flag_input, input_data(flag_input)),
            "label": checkbox_label,
            "disabled": true,
        }));
    }

    items.push(text_view(json!(config.interface.prompt)));
    items.push(radio_group(choice, &config.interface.labels));

    let view = list_view(items, None);

    let mut plugins = Vec::new();
    if let Some(hotkeys) = hotkeys_plugin(choice, &config.interface.labels) {
        plugins.push(hotkeys);
    }

    Ok((io, view_spec(view, plugins)))
}

fn text_classification(config: &TaskConfig) -> Result<(CheckedIo, Value)> {
    let io = check_io(
        config,
        &[DataType::Str],
        &[],
        &[],
        &[DataType::Bool, DataType::Str],
    )?;
    require_labels(&config.interface, &config.name)?;

    let choice = io
        .choice_output()
        .ok_or_else(|| anyhow::anyhow!("Task {} needs a bool or str output", config.name))?;
    let text_input = &io.input_by_type[&DataType::Str];

    let view = list_view(
        vec![
            text_view(json!(config.interface.prompt)),
            text_view(input_data(text_input)),
            radio_group(choice, &config.interface.labels),
        ],
        None,
    );

    let mut plugins = vec![task_width_plugin()];
    if let Some(hotkeys) = hotkeys_plugin(choice, &config.interface.labels) {
        plugins.push(hotkeys);
    }

    Ok((io, view_spec(view, plugins)))
}

fn text_annotation(config: &TaskConfig) -> Result<(CheckedIo, Value)> {
    let io = check_io(config, &[DataType::Str], &[], &[DataType::Json], &[])?;
    require_labels(&config.interface, &config.name)?;

    let text_input = &io.input_by_type[&DataType::Str];
    let json_output = &io.output_by_type[&DataType::Json];

    let annotation = json!({
        "type": "field.text-annotation",
        "data": output_data(json_output),
        "content": input_data(text_input),
        "labels": annotation_labels(&config.interface.labels),
        "validation": {
            "type": "condition.required",
            "hint": "You must choose one response.",
        },
    });

    let view = list_view(
        vec![text_view(json!(config.interface.prompt)), annotation],
        None,
    );

    let mut plugins = vec![task_width_plugin()];
    if let Some(hotkeys) = hotkeys_plugin(json_output, &config.interface.labels) {
        plugins.push(hotkeys);
    }

    Ok((io, view_spec(view, plugins)))
}

fn view_spec(view: Value, plugins: Vec<Value>) -> Value {
    json!({ "view": view, "plugins": plugins })
}

fn list_view(items: Vec<Value>, validation: Option<Value>) -> Value {
    match validation {
        Some(validation) => json!({
            "type": "view.list",
            "items": items,
            "validation": validation,
        }),
        None => json!({ "type": "view.list", "items": items }),
    }
}

fn input_data(path: &str) -> Value {
    json!({ "type": "data.input", "path": path })
}

fn output_data(path: &str) -> Value {
    json!({ "type": "data.output", "path": path })
}

fn output_data_with_default(path: &str, default: Value) -> Value {
    json!({ "type": "data.output", "path": path, "default": default })
}

fn internal_data(path: &str, default: Value) -> Value {
    json!({ "type": "data.internal", "path": path, "default": default })
}

fn text_view(content: Value) -> Value {
    json!({ "type": "view.text", "content": content })
}

fn image_view(url: Value) -> Value {
    json!({
        "type": "view.image",
        "url": url,
        "rotatable": true,
        "full_height": true,
    })
}

fn radio_group(output: &str, labels: &BTreeMap<String, String>) -> Value {
    let options: Vec<Value> = labels
        .iter()
        .map(|(value, label)| json!({ "value": value, "label": label }))
        .collect();

    json!({
        "type": "field.button-radio-group",
        "data": output_data(output),
        "options": options,
        "validation": {
            "type": "condition.required",
            "hint": "You must choose one response.",
        },
    })
}

fn annotation_labels(labels: &BTreeMap<String, String>) -> Value {
    if labels.is_empty() {
        return Value::Null;
    }
    labels
        .iter()
        .map(|(value, label)| json!({ "value": value, "label": label }))
        .collect::<Vec<_>>()
        .into()
}

/// Numbered hotkeys for choice interfaces with at most nine labels.
fn hotkeys_plugin(output: &str, labels: &BTreeMap<String, String>) -> Option<Value> {
    if labels.is_empty() || labels.len() > MAX_HOTKEY_LABELS {
        return None;
    }

    let mut plugin = serde_json::Map::new();
    plugin.insert("type".to_string(), json!("plugin.hotkeys"));
    for (i, value) in labels.keys().enumerate() {
        plugin.insert(
            format!("key_{}", i + 1),
            json!({
                "type": "action.set",
                "data": output_data(output),
                "payload": value,
            }),
        );
    }

    Some(Value::Object(plugin))
}

fn annotation_hotkeys_plugin() -> Value {
    json!({
        "type": "plugin.field.image-annotation.hotkeys",
        "cancel": "s",
        "confirm": "a",
        "polygon": "e",
        "rectangle": "w",
        "point": "r",
        "select": "q",
    })
}

fn task_width_plugin() -> Value {
    json!({ "type": "plugin.layout", "kind": "scroll", "task_width": 500 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;

    fn classification_config(labels: &[(&str, &str)]) -> TaskConfig {
        let label_yaml: String = labels
            .iter()
            .map(|(v, l)| format!("    \"{}\": \"{}\"\n", v, l))
            .collect();
        let yaml = format!(
            r#"
name: detect
data:
  input:
    url: url
  output:
    result: bool
interface:
  prompt: "Does the image contain text?"
  labels:
{label_yaml}
project:
  setup:
    public_name: "Detect"
    public_description: "Detect text"
pool:
  setup:
    private_name: "Detect"
    reward_per_assignment: 0.1
    assignment_max_duration_seconds: 600
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_image_classification_spec() {
        let config = classification_config(&[("true", "Yes"), ("false", "No")]);
        let spec = build_task_spec(TaskKind::ImageClassification, &config).unwrap();

        assert_eq!(spec.input_spec["url"].kind, FieldKind::Url);
        assert!(!spec.input_spec["assignment_id"].required);
        assert_eq!(spec.output_spec["result"].kind, FieldKind::Boolean);

        let plugins = spec.view_spec["plugins"].as_array().unwrap();
        assert!(plugins
            .iter()
            .any(|p| p["type"] == "plugin.hotkeys" && p["key_1"]["payload"] == "false"));
    }

    #[test]
    fn test_hotkeys_skipped_for_many_labels() {
        let labels: Vec<(String, String)> = (0..10)
            .map(|i| (format!("label{i}"), format!("Label {i}")))
            .collect();
        let refs: Vec<(&str, &str)> = labels
            .iter()
            .map(|(v, l)| (v.as_str(), l.as_str()))
            .collect();

        let mut config = classification_config(&refs);
        config.data.output.insert("result".to_string(), DataType::Str);

        let spec = build_task_spec(TaskKind::ImageClassification, &config).unwrap();
        let plugins = spec.view_spec["plugins"].as_array().unwrap();
        assert!(!plugins.iter().any(|p| p["type"] == "plugin.hotkeys"));
    }

    #[test]
    fn test_unexpected_input_type_rejected() {
        let mut config = classification_config(&[("true", "Yes")]);
        config.data.input.insert("extra".to_string(), DataType::Json);

        let err = build_task_spec(TaskKind::ImageClassification, &config).unwrap_err();
        assert!(err.to_string().contains("unexpected data type"));
    }

    #[test]
    fn test_missing_required_type_rejected() {
        let mut config = classification_config(&[("true", "Yes")]);
        config.data.input.clear();

        let err = build_task_spec(TaskKind::ImageClassification, &config).unwrap_err();
        assert!(err.to_string().contains("missing a variable"));
    }

    #[test]
    fn test_segmentation_checkbox_needs_bool_output() {
        let yaml = r#"
name: outline
data:
  input:
    url: url
  output:
    outlines: json
interface:
  prompt: "Outline all text"
  checkbox: "There is nothing to outline"
project:
  setup:
    public_name: "Outline"
    public_description: "Outline text"
pool:
  setup:
    private_name: "Outline"
    reward_per_assignment: 0.2
    assignment_max_duration_seconds: 600
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        let err = build_task_spec(TaskKind::ImageSegmentation, &config).unwrap_err();
        assert!(err.to_string().contains("bool output"));
    }

    #[test]
    fn test_segmentation_with_incoming_outlines() {
        let yaml = r#"
name: fix
data:
  input:
    url: url
    outlines: json
  output:
    fixed: json
interface:
  prompt: "Fix the outlines"
  tools: [rectangle, polygon]
project:
  setup:
    public_name: "Fix"
    public_description: "Fix outlines"
pool:
  setup:
    private_name: "Fix"
    reward_per_assignment: 0.2
    assignment_max_duration_seconds: 600
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        let spec = build_task_spec(TaskKind::ImageSegmentation, &config).unwrap();

        let annotation = &spec.view_spec["view"]["items"][0];
        assert_eq!(annotation["data"]["default"]["type"], "data.input");
        assert_eq!(annotation["shapes"]["rectangle"], true);
        assert!(annotation["shapes"].get("point").is_none());
    }

    #[test]
    fn test_invalid_tool_rejected() {
        let yaml = r#"
name: outline
data:
  input:
    url: url
  output:
    outlines: json
interface:
  prompt: "Outline"
  tools: [circle]
project:
  setup:
    public_name: "Outline"
    public_description: "Outline"
pool:
  setup:
    private_name: "Outline"
    reward_per_assignment: 0.2
    assignment_max_duration_seconds: 600
"#;
        let config: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        let err = build_task_spec(TaskKind::ImageSegmentation, &config).unwrap_err();
        assert!(err.to_string().contains("Invalid annotation tool"));
    }
}

//! Dotted-path overrides such as `--training.epochs 10` or `--set model.adjacency.diag_lambda=1.0`.

use anyhow::anyhow;
use serde_json::{Map, Value};

use super::ConfigError;

/// One `path = value` update of the raw option tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub path: String,
    pub value: Value,
}

impl Override {
    #[must_use]
    pub fn new(path: impl Into<String>, raw: &str) -> Self {
        Self {
            path: path.into(),
            value: parse_value(raw),
        }
    }
}

/// JSON when it parses (`10`, `true`, `"x"`, `[1, 2]`), otherwise the raw string.
#[must_use]
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parses `KEY=VALUE`.
///
/// # Errors
/// Returns [`ConfigError::Invalid`] when there is no `=` or the key is empty.
pub fn parse_override(raw: &str) -> Result<Override, ConfigError> {
    match raw.split_once('=') {
        Some((path, value)) if !path.trim().is_empty() => Ok(Override::new(path.trim(), value)),
        _ => Err(ConfigError::invalid(
            "override",
            anyhow!("expected KEY=VALUE, got {raw:?}"),
        )),
    }
}

/// Pulls `--a.b=v` and `--a.b v` arguments out of `args`.
///
/// Any long flag whose name contains a `.` is an override; everything else is
/// returned untouched for the regular command-line parser.
///
/// # Errors
/// Returns [`ConfigError::Invalid`] when a dotted flag has no value.
pub fn split_override_args<I>(args: I) -> Result<(Vec<String>, Vec<Override>), ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut passthrough = Vec::new();
    let mut overrides = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix("--") else {
            passthrough.push(arg);
            continue;
        };
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (flag, None),
        };
        if !name.contains('.') {
            passthrough.push(arg);
            continue;
        }
        let raw = match inline {
            Some(value) => value,
            None => args.next().ok_or_else(|| {
                ConfigError::invalid(name.to_string(), anyhow!("override flag has no value"))
            })?,
        };
        overrides.push(Override::new(name, &raw));
    }
    Ok((passthrough, overrides))
}

/// Applies `overrides` in order, creating intermediate objects as needed.
///
/// # Errors
/// Returns [`ConfigError::Invalid`] when the tree is not an object or a path
/// runs through a non-object value.
pub fn merge_overrides(tree: &mut Value, overrides: &[Override]) -> Result<(), ConfigError> {
    for entry in overrides {
        let mut node = &mut *tree;
        let mut segments = entry.path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let Value::Object(map) = node else {
                return Err(ConfigError::invalid(
                    entry.path.clone(),
                    anyhow!("{segment:?} is not inside an object"),
                ));
            };
            if segments.peek().is_none() {
                map.insert(segment.to_string(), entry.value.clone());
                break;
            }
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_reproduces_nested_updates() {
        let mut config = json!({
            "a": {"b": {"c": 6}},
            "d": 4,
            "e": {"g": 2},
            "h": 3,
        });
        let overrides = vec![
            Override::new("a.b.c", "5"),
            Override::new("d", "3"),
            Override::new("e.f", "."),
        ];
        merge_overrides(&mut config, &overrides).expect("merge succeeds");
        assert_eq!(
            config,
            json!({
                "a": {"b": {"c": 5}},
                "d": 3,
                "e": {"g": 2, "f": "."},
                "h": 3,
            })
        );
    }

    #[test]
    fn later_overrides_see_earlier_ones() {
        let mut config = json!({});
        let overrides = vec![
            Override::new("training.epochs", "2"),
            Override::new("training.epochs", "9"),
            Override::new("training.precision", "fp16"),
        ];
        merge_overrides(&mut config, &overrides).expect("merge succeeds");
        assert_eq!(config, json!({"training": {"epochs": 9, "precision": "fp16"}}));
    }

    #[test]
    fn merge_rejects_path_through_scalar() {
        let mut config = json!({"d": 4});
        let error = merge_overrides(&mut config, &[Override::new("d.x", "1")])
            .expect_err("d is a scalar");
        assert!(matches!(error, ConfigError::Invalid { ref name, .. } if name == "d.x"));
    }

    #[test]
    fn split_recognizes_both_flag_forms() {
        let args = [
            "bin",
            "--config",
            "c.json",
            "--training.epochs",
            "10",
            "--model.adjacency.diag_lambda=0.5",
            "--save-dataset-cache",
        ]
        .map(String::from);
        let (passthrough, overrides) = split_override_args(args).expect("args split");
        assert_eq!(passthrough, vec!["bin", "--config", "c.json", "--save-dataset-cache"]);
        assert_eq!(
            overrides,
            vec![
                Override {
                    path: "training.epochs".to_string(),
                    value: json!(10)
                },
                Override {
                    path: "model.adjacency.diag_lambda".to_string(),
                    value: json!(0.5)
                },
            ]
        );
    }

    #[test]
    fn split_rejects_dangling_override() {
        let args = ["bin", "--training.epochs"].map(String::from);
        assert!(split_override_args(args).is_err());
    }

    #[test]
    fn parse_override_keeps_non_json_as_string() {
        let parsed = parse_override("data_path=/tmp/graphs").expect("valid override");
        assert_eq!(parsed.value, json!("/tmp/graphs"));
        assert!(parse_override("no-equals").is_err());
    }
}

//! Предобученная модель градиентного бустинга, сохранённая как JSON-дамп LightGBM.
//! Вход модели — таблица polars; признаки берутся строго по именам колонок.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use polars::prelude::{Column, DataFrame, DataType};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{BoxError, DashboardError};

/// Модель, предсказывающая по одному значению на строку таблицы.
pub trait Regressor: Send + Sync {
    fn feature_names(&self) -> &[String];
    fn predict(&self, frame: &DataFrame) -> Result<Vec<f64>, BoxError>;
}

#[derive(Debug, Deserialize)]
struct ModelDump {
    #[serde(default)]
    objective: String,
    feature_names: Vec<String>,
    #[serde(default)]
    feature_infos: serde_json::Map<String, Value>,
    tree_info: Vec<TreeInfo>,
    #[serde(default)]
    pandas_categorical: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    average_output: bool,
}

#[derive(Debug, Deserialize)]
struct TreeInfo {
    tree_structure: RawNode,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNode {
    Split(Box<RawSplit>),
    Leaf { leaf_value: f64 },
}

#[derive(Debug, Deserialize)]
struct RawSplit {
    split_feature: usize,
    threshold: RawThreshold,
    decision_type: String,
    #[serde(default)]
    default_left: bool,
    #[serde(default)]
    missing_type: Option<String>,
    left_child: RawNode,
    right_child: RawNode,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Numeric(f64),
    Categories(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MissingType {
    None,
    Zero,
    NaN,
}

#[derive(Clone, Debug)]
enum SplitRule {
    LessOrEqual {
        threshold: f64,
        missing: MissingType,
        default_left: bool,
    },
    InSet(Vec<i64>),
}

#[derive(Clone, Debug)]
enum TreeNode {
    Leaf(f64),
    Split {
        feature: usize,
        rule: SplitRule,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn evaluate(&self, row: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                Self::Leaf(value) => return *value,
                Self::Split {
                    feature,
                    rule,
                    left,
                    right,
                } => {
                    node = if rule.goes_left(row[*feature]) {
                        left
                    } else {
                        right
                    };
                }
            }
        }
    }
}

impl SplitRule {
    fn goes_left(&self, value: f64) -> bool {
        match self {
            Self::LessOrEqual {
                threshold,
                missing,
                default_left,
            } => {
                let value = if value.is_nan() && *missing != MissingType::NaN {
                    0.0
                } else {
                    value
                };
                let is_missing = match missing {
                    MissingType::None => false,
                    MissingType::Zero => value == 0.0,
                    MissingType::NaN => value.is_nan(),
                };
                if is_missing {
                    *default_left
                } else {
                    value <= *threshold
                }
            }
            Self::InSet(categories) => {
                value.is_finite() && value >= 0.0 && categories.contains(&(value.trunc() as i64))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Link {
    Identity,
    Exp,
}

impl Link {
    fn from_objective(objective: &str) -> Result<Self, BoxError> {
        let name = objective.split_whitespace().next().unwrap_or("regression");
        match name {
            "regression" | "regression_l2" | "regression_l1" | "l2" | "l1" | "mse" | "mae"
            | "huber" | "fair" | "quantile" | "mape" => Ok(Self::Identity),
            "poisson" | "gamma" | "tweedie" => Ok(Self::Exp),
            other => Err(format!("unsupported objective '{other}'").into()),
        }
    }

    fn apply(self, raw: f64) -> f64 {
        match self {
            Self::Identity => raw,
            Self::Exp => raw.exp(),
        }
    }
}

/// Ансамбль деревьев LightGBM. Загружается один раз и дальше только читается.
#[derive(Clone, Debug)]
pub struct GbdtModel {
    feature_names: Vec<String>,
    trees: Vec<TreeNode>,
    link: Link,
    average_output: bool,
    /// Для категориальных признаков: индекс признака и список категорий pandas.
    categories: Vec<(usize, Vec<String>)>,
}

impl GbdtModel {
    pub fn load(path: &Path) -> Result<Self, DashboardError> {
        let what = format!("prediction model {}", path.display());
        let raw = fs::read_to_string(path).map_err(|err| DashboardError::data_load(&what, err))?;
        let model = Self::from_json(&raw).map_err(|err| DashboardError::data_load(&what, err))?;
        tracing::info!(
            path = %path.display(),
            trees = model.trees.len(),
            features = model.feature_names.len(),
            "Prediction model loaded"
        );
        Ok(model)
    }

    pub fn from_json(raw: &str) -> Result<Self, BoxError> {
        let dump: ModelDump = serde_json::from_str(raw)?;
        if dump.feature_names.is_empty() {
            return Err("model has no feature names".into());
        }
        if dump.tree_info.is_empty() {
            return Err("model has no trees".into());
        }
        let link = Link::from_objective(&dump.objective)?;
        let n_features = dump.feature_names.len();

        let mut categorical = BTreeSet::new();
        let trees = dump
            .tree_info
            .iter()
            .map(|info| compile_node(&info.tree_structure, n_features, &mut categorical))
            .collect::<Result<Vec<_>, _>>()?;
        for (idx, name) in dump.feature_names.iter().enumerate() {
            let has_values = dump
                .feature_infos
                .get(name)
                .and_then(|info| info.get("values"))
                .and_then(Value::as_array)
                .is_some_and(|values| !values.is_empty());
            if has_values {
                categorical.insert(idx);
            }
        }

        let pandas = dump.pandas_categorical.unwrap_or_default();
        let categories = categorical
            .iter()
            .enumerate()
            .filter_map(|(order, feature)| {
                pandas.get(order).map(|values| {
                    let labels = values
                        .iter()
                        .map(|value| {
                            value
                                .as_str()
                                .map_or_else(|| value.to_string(), str::to_string)
                        })
                        .collect();
                    (*feature, labels)
                })
            })
            .collect();

        Ok(Self {
            feature_names: dump.feature_names,
            trees,
            link,
            average_output: dump.average_output,
            categories,
        })
    }

    fn category_labels(&self, feature: usize) -> Option<&[String]> {
        self.categories
            .iter()
            .find(|(idx, _)| *idx == feature)
            .map(|(_, labels)| labels.as_slice())
    }

    fn feature_column(&self, feature: usize, column: &Column) -> Result<Vec<f64>, BoxError> {
        let name = &self.feature_names[feature];
        if column.dtype() == &DataType::String {
            let values = column.str()?;
            let labels = self.category_labels(feature);
            return values
                .into_iter()
                .map(|value| {
                    let value = value.ok_or_else(|| format!("column '{name}' has a null value"))?;
                    Ok(match labels {
                        Some(labels) => labels
                            .iter()
                            .position(|label| label == value)
                            .map_or(f64::NAN, |pos| pos as f64),
                        None => value.trim().parse::<f64>().map_err(|_| {
                            format!("column '{name}' holds text '{value}' for a numeric feature")
                        })?,
                    })
                })
                .collect();
        }
        let cast = column.cast(&DataType::Float64)?;
        Ok(cast
            .f64()?
            .into_iter()
            .map(|value| value.unwrap_or(f64::NAN))
            .collect())
    }
}

impl Regressor for GbdtModel {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict(&self, frame: &DataFrame) -> Result<Vec<f64>, BoxError> {
        let columns = self
            .feature_names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let column = frame
                    .column(name)
                    .map_err(|_| format!("input table has no column '{name}'"))?;
                self.feature_column(idx, column)
            })
            .collect::<Result<Vec<_>, BoxError>>()?;

        let mut row = vec![0.0; columns.len()];
        let mut out = Vec::with_capacity(frame.height());
        for r in 0..frame.height() {
            for (slot, column) in row.iter_mut().zip(&columns) {
                *slot = column[r];
            }
            let mut raw: f64 = self.trees.iter().map(|tree| tree.evaluate(&row)).sum();
            if self.average_output {
                raw /= self.trees.len() as f64;
            }
            out.push(self.link.apply(raw));
        }
        Ok(out)
    }
}

fn compile_node(
    node: &RawNode,
    n_features: usize,
    categorical: &mut BTreeSet<usize>,
) -> Result<TreeNode, BoxError> {
    let split = match node {
        RawNode::Leaf { leaf_value } => return Ok(TreeNode::Leaf(*leaf_value)),
        RawNode::Split(split) => split,
    };
    if split.split_feature >= n_features {
        return Err(format!(
            "split on feature {} but model has {n_features} features",
            split.split_feature
        )
        .into());
    }
    let rule = match (split.decision_type.as_str(), &split.threshold) {
        ("<=", RawThreshold::Numeric(threshold)) => SplitRule::LessOrEqual {
            threshold: *threshold,
            missing: parse_missing(split.missing_type.as_deref())?,
            default_left: split.default_left,
        },
        ("==", RawThreshold::Categories(raw)) => {
            categorical.insert(split.split_feature);
            let categories = raw
                .split("||")
                .map(|part| part.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| format!("bad categorical threshold '{raw}': {err}"))?;
            SplitRule::InSet(categories)
        }
        ("==", RawThreshold::Numeric(value)) => {
            categorical.insert(split.split_feature);
            SplitRule::InSet(vec![value.trunc() as i64])
        }
        (other, _) => return Err(format!("unsupported decision type '{other}'").into()),
    };
    Ok(TreeNode::Split {
        feature: split.split_feature,
        rule,
        left: Box::new(compile_node(&split.left_child, n_features, categorical)?),
        right: Box::new(compile_node(&split.right_child, n_features, categorical)?),
    })
}

fn parse_missing(raw: Option<&str>) -> Result<MissingType, BoxError> {
    match raw.unwrap_or("None") {
        "None" => Ok(MissingType::None),
        "Zero" => Ok(MissingType::Zero),
        "NaN" => Ok(MissingType::NaN),
        other => Err(format!("unknown missing type '{other}'").into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use polars::df;

    use super::*;

    /// Два дерева: порог по `temp` и категориальный сплит по `fan`.
    pub(crate) const TWO_TREE_MODEL: &str = r#"{
        "name": "tree",
        "version": "v4",
        "objective": "regression",
        "feature_names": ["temp", "fan"],
        "feature_infos": {
            "temp": {"min_value": -2, "max_value": 33, "values": []},
            "fan": {"min_value": 0, "max_value": 1, "values": [0, 1]}
        },
        "tree_info": [
            {
                "tree_index": 0,
                "tree_structure": {
                    "split_index": 0,
                    "split_feature": 0,
                    "threshold": 15.0,
                    "decision_type": "<=",
                    "default_left": true,
                    "missing_type": "None",
                    "left_child": {"leaf_index": 0, "leaf_value": 10.0},
                    "right_child": {"leaf_index": 1, "leaf_value": 20.0}
                }
            },
            {
                "tree_index": 1,
                "tree_structure": {
                    "split_index": 0,
                    "split_feature": 1,
                    "threshold": "1",
                    "decision_type": "==",
                    "default_left": false,
                    "missing_type": "None",
                    "left_child": {"leaf_index": 0, "leaf_value": 5.0},
                    "right_child": {"leaf_index": 1, "leaf_value": -1.0}
                }
            }
        ],
        "pandas_categorical": [["OFF", "ON"]]
    }"#;

    #[test]
    fn evaluates_numeric_and_categorical_splits_by_column_name() {
        let model = GbdtModel::from_json(TWO_TREE_MODEL).expect("model");
        // Порядок колонок в таблице не важен: признаки ищутся по имени.
        let frame = df!(
            "fan" => ["ON", "OFF", "ON"],
            "temp" => [10.0, 10.0, 20.0]
        )
        .expect("frame");
        let out = model.predict(&frame).expect("predict");
        assert_eq!(out, vec![15.0, 9.0, 25.0]);
    }

    #[test]
    fn missing_column_is_an_error() {
        let model = GbdtModel::from_json(TWO_TREE_MODEL).expect("model");
        let frame = df!("temp" => [10.0]).expect("frame");
        let err = model.predict(&frame).expect_err("missing fan");
        assert!(err.to_string().contains("'fan'"));
    }

    #[test]
    fn unknown_category_goes_right() {
        let model = GbdtModel::from_json(TWO_TREE_MODEL).expect("model");
        let frame = df!("temp" => [20.0], "fan" => ["AUTO"]).expect("frame");
        assert_eq!(model.predict(&frame).expect("predict"), vec![19.0]);
    }

    #[test]
    fn nan_missing_type_uses_default_direction() {
        let raw = r#"{
            "objective": "poisson",
            "feature_names": ["x"],
            "tree_info": [{"tree_structure": {
                "split_feature": 0, "threshold": 1.5, "decision_type": "<=",
                "default_left": false, "missing_type": "NaN",
                "left_child": {"leaf_value": 0.0},
                "right_child": {"leaf_value": 1.0}
            }}]
        }"#;
        let model = GbdtModel::from_json(raw).expect("model");
        let frame = df!("x" => [Some(1.0), None]).expect("frame");
        let out = model.predict(&frame).expect("predict");
        assert!((out[0] - 1.0).abs() < 1e-12);
        assert!((out[1] - 1.0_f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn rejects_unsupported_objective_and_bad_feature_index() {
        let classifier = TWO_TREE_MODEL.replace("\"regression\"", "\"binary sigmoid:1\"");
        assert!(GbdtModel::from_json(&classifier).is_err());
        let out_of_range = TWO_TREE_MODEL.replace("\"split_feature\": 1", "\"split_feature\": 7");
        assert!(GbdtModel::from_json(&out_of_range).is_err());
    }

    #[test]
    fn load_reports_data_stage() {
        let err = GbdtModel::load(Path::new("/nonexistent/model.json")).expect_err("missing");
        assert_eq!(err.stage(), "data");
    }
}

use std::collections::{BTreeMap, HashMap};

use cyder_tools::log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::database::channel::Channel;
use crate::database::DbResult;
use crate::relay::adaptor::Adaptor;
use crate::relay::model::Usage;
use crate::service::options::{OptionsCoordinator, MODEL_CONFIGS_MIGRATED};

/// Ratio billed for a model nobody priced.
pub const DEFAULT_MODEL_RATIO: f64 = 30.0;

/// `ratio` is quota units per input token; `completion_ratio` scales output
/// tokens relative to input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    pub ratio: f64,
    #[serde(default = "default_completion_ratio")]
    pub completion_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_completion_ratio() -> f64 {
    1.0
}

impl PricingEntry {
    pub const fn new(ratio: f64, completion_ratio: f64) -> Self {
        Self {
            ratio,
            completion_ratio,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("invalid model_configs json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported model_configs shape: {0}")]
    UnknownShape(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Shape {
    Standard,
    Legacy,
}

fn number(value: &Value, what: &str) -> Result<f64, PricingError> {
    value
        .as_f64()
        .filter(|n| *n >= 0.0)
        .ok_or_else(|| PricingError::UnknownShape(format!("{} must be a non-negative number", what)))
}

fn parse_entry(model: &str, value: &Value) -> Result<(PricingEntry, Shape), PricingError> {
    match value {
        Value::Number(_) => Ok((
            PricingEntry::new(number(value, model)?, default_completion_ratio()),
            Shape::Legacy,
        )),
        Value::Object(fields) => {
            let mut shape = Shape::Standard;
            let mut ratio = None;
            let mut completion_ratio = default_completion_ratio();
            let mut max_tokens = None;
            for (key, field) in fields {
                match key.as_str() {
                    "ratio" => ratio = Some(number(field, key)?),
                    "input_ratio" | "model_ratio" => {
                        shape = Shape::Legacy;
                        ratio = Some(number(field, key)?);
                    }
                    "completion_ratio" => completion_ratio = number(field, key)?,
                    "max_tokens" => {
                        max_tokens = match field {
                            Value::Null => None,
                            other => Some(number(other, key)? as u32),
                        }
                    }
                    other => {
                        return Err(PricingError::UnknownShape(format!(
                            "unexpected field {} for model {}",
                            other, model
                        )))
                    }
                }
            }
            let ratio = ratio.ok_or_else(|| {
                PricingError::UnknownShape(format!("model {} has no ratio", model))
            })?;
            Ok((
                PricingEntry {
                    ratio,
                    completion_ratio,
                    max_tokens,
                },
                shape,
            ))
        }
        _ => Err(PricingError::UnknownShape(format!(
            "model {} is neither a number nor an object",
            model
        ))),
    }
}

/// `{"model_ratio": {...}, "completion_ratio": {...}}`
fn parse_split(root: &Map<String, Value>) -> Result<HashMap<String, PricingEntry>, PricingError> {
    let ratios = root.get("model_ratio").and_then(Value::as_object);
    let completions = root.get("completion_ratio").and_then(Value::as_object);
    let mut table = HashMap::new();
    if let Some(ratios) = ratios {
        for (model, value) in ratios {
            table.insert(
                model.clone(),
                PricingEntry::new(number(value, model)?, default_completion_ratio()),
            );
        }
    }
    if let Some(completions) = completions {
        for (model, value) in completions {
            let completion_ratio = number(value, model)?;
            table
                .entry(model.clone())
                .or_insert(PricingEntry::new(DEFAULT_MODEL_RATIO, default_completion_ratio()))
                .completion_ratio = completion_ratio;
        }
    }
    Ok(table)
}

fn is_split_shape(root: &Map<String, Value>) -> bool {
    !root.is_empty()
        && root
            .iter()
            .all(|(k, v)| (k == "model_ratio" || k == "completion_ratio") && v.is_object())
}

fn parse_with_shape(raw: &str) -> Result<(HashMap<String, PricingEntry>, Shape), PricingError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(root) = value else {
        return Err(PricingError::UnknownShape("top level must be an object".to_string()));
    };
    if is_split_shape(&root) {
        return Ok((parse_split(&root)?, Shape::Legacy));
    }
    let mut table = HashMap::with_capacity(root.len());
    let mut shape = Shape::Standard;
    for (model, value) in &root {
        let (entry, entry_shape) = parse_entry(model, value)?;
        if entry_shape == Shape::Legacy {
            shape = Shape::Legacy;
        }
        table.insert(model.clone(), entry);
    }
    Ok((table, shape))
}

/// Reads a channel's pricing column in any supported shape.
pub fn parse_model_configs(raw: &str) -> Result<HashMap<String, PricingEntry>, PricingError> {
    parse_with_shape(raw).map(|(table, _)| table)
}

/// Standard-shape JSON for a legacy column; `None` when nothing changes.
pub fn migrate_model_configs(raw: &str) -> Result<Option<String>, PricingError> {
    let (table, shape) = parse_with_shape(raw)?;
    if shape == Shape::Standard {
        return Ok(None);
    }
    let ordered: BTreeMap<_, _> = table.into_iter().collect();
    Ok(Some(serde_json::to_string(&ordered)?))
}

/// One-shot rewrite of legacy pricing columns, recorded in the options
/// table so it runs once.
pub fn migrate_all_channels(options: &OptionsCoordinator) -> DbResult<usize> {
    if options.current().model_configs_migrated {
        return Ok(0);
    }
    let mut migrated = 0;
    for channel in Channel::list_all()? {
        let Some(raw) = channel.model_configs.as_deref().filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        match migrate_model_configs(raw) {
            Ok(Some(standard)) => {
                Channel::set_model_configs(channel.id, Some(standard))?;
                migrated += 1;
            }
            Ok(None) => {}
            Err(e) => error!(
                "refusing to migrate model_configs of channel {}: {}",
                channel.id, e
            ),
        }
    }
    options.update(MODEL_CONFIGS_MIGRATED, "true")?;
    info!("pricing migration finished, {} channels rewritten", migrated);
    Ok(migrated)
}

/// Channel pricing for the caller's model name, then the mapped name, then
/// the adaptor's defaults.
pub fn resolve(
    channel: &Channel,
    original_model: &str,
    actual_model: &str,
    adaptor: &dyn Adaptor,
) -> PricingEntry {
    let table = channel.pricing_table();
    if let Some(entry) = table.get(original_model).or_else(|| table.get(actual_model)) {
        return *entry;
    }
    if let Some(entry) = adaptor.default_pricing().get(actual_model) {
        return *entry;
    }
    warn!(
        "no pricing for model {} on channel {}, falling back to adaptor ratios",
        actual_model, channel.id
    );
    PricingEntry::new(
        adaptor.model_ratio(actual_model),
        adaptor.completion_ratio(actual_model),
    )
}

/// `round(ceil(p*r + c*r*cr) * group_ratio * channel_ratio)`; a priced
/// request never costs less than 1.
pub fn token_cost(usage: &Usage, entry: &PricingEntry, group_ratio: f64, channel_ratio: f64) -> i64 {
    let ratio = entry.ratio;
    let base = (usage.prompt_tokens as f64 * ratio
        + usage.completion_tokens as f64 * ratio * entry.completion_ratio)
        .ceil();
    let quota = (base * group_ratio * channel_ratio).round() as i64;
    if ratio != 0.0 && group_ratio != 0.0 && channel_ratio != 0.0 && quota <= 0 {
        1
    } else {
        quota
    }
}

/// Amount reserved before the upstream call: the prompt plus the requested
/// output budget (or the configured fallback) at the input ratio.
pub fn pre_consume_amount(
    prompt_tokens: i64,
    output_limit: Option<u32>,
    fallback_tokens: i64,
    entry: &PricingEntry,
    group_ratio: f64,
    channel_ratio: f64,
) -> i64 {
    let output = output_limit.map(i64::from).unwrap_or(fallback_tokens);
    ((prompt_tokens + output) as f64 * entry.ratio * group_ratio * channel_ratio).ceil() as i64
}

/// Size/quality multiplier of an image model; `None` for a size the model
/// does not produce.
pub fn image_size_ratio(model: &str, size: &str, quality: Option<&str>) -> Option<f64> {
    let hd = quality == Some("hd");
    match model {
        "dall-e-2" => match size {
            "256x256" => Some(1.0),
            "512x512" => Some(1.125),
            "1024x1024" => Some(1.25),
            _ => None,
        },
        "dall-e-3" => {
            let base = match size {
                "1024x1024" => 1.0,
                "1024x1792" | "1792x1024" => 2.0,
                _ => return None,
            };
            Some(match (hd, size) {
                (true, "1024x1024") => base * 2.0,
                (true, _) => base * 1.5,
                _ => base,
            })
        }
        _ => Some(1.0),
    }
}

/// Images are priced per picture; `ratio * 1000` is the price of one
/// standard image.
pub fn image_cost(
    entry: &PricingEntry,
    size_ratio: f64,
    n: u32,
    group_ratio: f64,
    channel_ratio: f64,
) -> i64 {
    (entry.ratio * size_ratio * 1000.0 * n.max(1) as f64 * group_ratio * channel_ratio).round()
        as i64
}

/// Speech synthesis bills each input character at the input ratio.
pub fn character_cost(chars: usize, entry: &PricingEntry, group_ratio: f64, channel_ratio: f64) -> i64 {
    (chars as f64 * entry.ratio * group_ratio * channel_ratio).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_cost_is_75() {
        let entry = PricingEntry::new(1.5, 2.0);
        assert_eq!(token_cost(&Usage::new(10, 20), &entry, 1.0, 1.0), 75);
        assert_eq!(token_cost(&Usage::new(10, 20), &entry, 0.5, 2.0), 75);
        assert_eq!(token_cost(&Usage::new(10, 20), &entry, 0.5, 1.0), 38);
    }

    #[test]
    fn minimum_charge_is_one() {
        let entry = PricingEntry::new(0.001, 1.0);
        assert_eq!(token_cost(&Usage::new(1, 0), &entry, 0.1, 1.0), 1);
        let free = PricingEntry::new(0.0, 1.0);
        assert_eq!(token_cost(&Usage::new(100, 100), &free, 1.0, 1.0), 0);
    }

    #[test]
    fn pre_consume_uses_limit_or_fallback() {
        let entry = PricingEntry::new(1.5, 2.0);
        assert_eq!(pre_consume_amount(10, Some(100), 500, &entry, 1.0, 1.0), 165);
        assert_eq!(pre_consume_amount(10, None, 500, &entry, 1.0, 1.0), 765);
    }

    #[test]
    fn standard_shape_parses_and_needs_no_migration() {
        let raw = r#"{"gpt-4":{"ratio":15,"completion_ratio":2,"max_tokens":8192}}"#;
        let table = parse_model_configs(raw).unwrap();
        assert_eq!(table["gpt-4"].max_tokens, Some(8192));
        assert_eq!(migrate_model_configs(raw).unwrap(), None);
    }

    #[test]
    fn legacy_shapes_migrate() {
        let bare = migrate_model_configs(r#"{"gpt-4":15}"#).unwrap().unwrap();
        assert_eq!(bare, r#"{"gpt-4":{"ratio":15.0,"completion_ratio":1.0}}"#);

        let renamed = migrate_model_configs(r#"{"gpt-4":{"input_ratio":15,"completion_ratio":2}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(renamed, r#"{"gpt-4":{"ratio":15.0,"completion_ratio":2.0}}"#);

        let split = migrate_model_configs(
            r#"{"model_ratio":{"a":1.5,"b":2},"completion_ratio":{"a":3}}"#,
        )
        .unwrap()
        .unwrap();
        let table = parse_model_configs(&split).unwrap();
        assert_eq!(table["a"], PricingEntry::new(1.5, 3.0));
        assert_eq!(table["b"], PricingEntry::new(2.0, 1.0));
    }

    #[test]
    fn unknown_shapes_are_refused() {
        assert!(parse_model_configs(r#"["gpt-4"]"#).is_err());
        assert!(parse_model_configs(r#"{"gpt-4":"cheap"}"#).is_err());
        assert!(parse_model_configs(r#"{"gpt-4":{"price":1}}"#).is_err());
        assert!(parse_model_configs(r#"{"gpt-4":{"completion_ratio":1}}"#).is_err());
        assert!(parse_model_configs("not json").is_err());
    }

    #[test]
    fn image_ratios() {
        assert_eq!(image_size_ratio("dall-e-3", "1024x1792", Some("hd")), Some(3.0));
        assert_eq!(image_size_ratio("dall-e-3", "1024x1024", Some("hd")), Some(2.0));
        assert_eq!(image_size_ratio("dall-e-2", "1792x1024", None), None);
        assert_eq!(image_cost(&PricingEntry::new(20.0, 1.0), 2.0, 2, 1.0, 1.0), 80_000);
    }
}

//! Notification text for triggered rules

use crate::rules::{BehaviorRule, Entity};
use crate::sensors::SensorValues;
use serde_json::Value;

pub trait MessageComposer: Send + Sync {
    fn compose(&self, entity: &Entity, rule: &BehaviorRule, values: &SensorValues) -> String;
}

/// Renders the action's message template.
///
/// `{entity}` and `{rule}` expand to the entity and rule names, `{<sensor key>}`
/// to the sensor value. Unknown placeholders are kept verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateComposer;

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl TemplateComposer {
    pub fn render(
        template: &str,
        entity: &Entity,
        rule: &BehaviorRule,
        values: &SensorValues,
    ) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return out;
            };
            let key = after[..close].trim();
            let replacement = match key {
                "entity" => Some(entity.name.clone()),
                "rule" => Some(rule.name.clone()),
                _ => values.get(key).map(display_value),
            };
            match replacement {
                Some(text) => out.push_str(&text),
                None => out.push_str(&rest[open..open + close + 2]),
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }
}

impl MessageComposer for TemplateComposer {
    fn compose(&self, entity: &Entity, rule: &BehaviorRule, values: &SensorValues) -> String {
        match rule.action.message.as_deref() {
            Some(template) if !template.trim().is_empty() => {
                Self::render(template, entity, rule, values)
            }
            _ => format!("{}: {} triggered", entity.name, rule.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ActionKind, Condition, Operator, RuleAction};
    use serde_json::json;

    fn entity() -> Entity {
        Entity {
            id: "e1".to_string(),
            user_id: "u1".to_string(),
            name: "Fern".to_string(),
            enabled: true,
            timezone: None,
        }
    }

    fn rule(message: Option<&str>) -> BehaviorRule {
        let mut action = RuleAction::new(ActionKind::Notify);
        action.message = message.map(str::to_string);
        BehaviorRule::new(
            "r1",
            "e1",
            "Dry soil",
            Condition::simple("soil_moisture", Operator::Lt, json!(20)),
            action,
        )
    }

    #[test]
    fn test_template_placeholders() {
        let values = SensorValues::from([
            ("soil_moisture".to_string(), json!(15)),
            ("weather.condition".to_string(), json!("sunny")),
        ]);
        let text = TemplateComposer.compose(
            &entity(),
            &rule(Some("{entity}: soil at {soil_moisture}% and {weather.condition} ({unknown})")),
            &values,
        );
        assert_eq!(text, "Fern: soil at 15% and sunny ({unknown})");
    }

    #[test]
    fn test_unclosed_brace_and_fallback() {
        let values = SensorValues::new();
        assert_eq!(
            TemplateComposer.compose(&entity(), &rule(Some("{rule} {oops")), &values),
            "Dry soil {oops"
        );
        assert_eq!(
            TemplateComposer.compose(&entity(), &rule(None), &values),
            "Fern: Dry soil triggered"
        );
    }
}

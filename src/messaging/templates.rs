// src/messaging/templates.rs

use std::collections::HashMap;

use crate::error::MessagingError;
use crate::models::{MessageTemplate, TriggerType};
use crate::store::MessagingStore;

/// Pick the template to use for a trigger.
///
/// Several active templates for one trigger is an operator mistake, not a
/// failure: the most recently updated one wins and the rest are logged.
pub async fn resolve_template(
    store: &dyn MessagingStore,
    trigger: TriggerType,
) -> Result<MessageTemplate, MessagingError> {
    let mut candidates = store.active_templates(trigger).await?;

    if candidates.len() > 1 {
        let ignored: Vec<String> = candidates[1..]
            .iter()
            .map(|t| t.template_id.to_string())
            .collect();
        tracing::warn!(
            trigger_type = %trigger,
            chosen = %candidates[0].template_id,
            ignored = ?ignored,
            "Multiple active templates for trigger; using most recently updated"
        );
    }

    if candidates.is_empty() {
        return Err(MessagingError::TemplateNotFound(trigger));
    }

    Ok(candidates.swap_remove(0))
}

/// Substitute `{key}` and `{{key}}` placeholders. Unknown keys and unbalanced
/// braces are copied through unchanged.
pub fn render(content: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        let (open, close) = if tail.starts_with("{{") { ("{{", "}}") } else { ("{", "}") };
        let body = &tail[open.len()..];

        match body.find(close) {
            Some(end) => {
                let key = body[..end].trim();
                let token_len = open.len() + end + close.len();
                match vars.get(key) {
                    Some(v) if !key.is_empty() && !key.contains(['{', '}']) => out.push_str(v),
                    _ => out.push_str(&tail[..token_len]),
                }
                rest = &tail[token_len..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Placeholders naming the patient and, when known, the professional.
/// `{name}`/`{paciente}`/`{nome}` carry the first name only.
pub fn person_vars(patient_name: &str, professional: Option<&str>) -> HashMap<String, String> {
    let full_name = patient_name.trim();
    let first_name = full_name.split_whitespace().next().unwrap_or(full_name);

    let mut vars = HashMap::new();
    for key in ["name", "paciente", "nome"] {
        vars.insert(key.to_string(), first_name.to_string());
    }
    vars.insert("patient_name".to_string(), full_name.to_string());

    if let Some(prof) = professional.map(str::trim).filter(|p| !p.is_empty()) {
        vars.insert("profissional".to_string(), prof.to_string());
        vars.insert("professional".to_string(), prof.to_string());
    }

    vars
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::store::memory::MemoryStore;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_single_and_double_braces() {
        let v = vars(&[("name", "Dr. M"), ("paciente", "Ana")]);
        assert_eq!(render("Hi {name}, rate 1-5", &v), "Hi Dr. M, rate 1-5");
        assert_eq!(render("Olá {{paciente}}!", &v), "Olá Ana!");
        assert_eq!(render("{{ paciente }} e {name}", &v), "Ana e Dr. M");
    }

    #[test]
    fn person_vars_use_first_name() {
        let v = person_vars("  Maria da Silva ", Some(" Dr. João "));
        assert_eq!(v["nome"], "Maria");
        assert_eq!(v["patient_name"], "Maria da Silva");
        assert_eq!(v["profissional"], "Dr. João");
        assert!(!person_vars("Ana", Some("  ")).contains_key("professional"));
    }

    #[test]
    fn unknown_tokens_stay_verbatim() {
        let v = vars(&[("name", "Ana")]);
        assert_eq!(render("{name} {missing} {{link}}", &v), "Ana {missing} {{link}}");
    }

    #[test]
    fn unbalanced_braces_do_not_panic() {
        let v = vars(&[("name", "Ana")]);
        assert_eq!(render("a { b", &v), "a { b");
        assert_eq!(render("{{name}", &v), "{{name}");
        assert_eq!(render("}{name}{", &v), "}Ana{");
        assert_eq!(render("", &v), "");
    }

    #[tokio::test]
    async fn resolve_picks_most_recent_active() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_template_at(TriggerType::PostAttendance, "old", now - Duration::hours(2))
            .await;
        let newest = store
            .insert_template_at(TriggerType::PostAttendance, "new", now)
            .await;
        store
            .insert_template_at(TriggerType::AppointmentReminder, "other", now + Duration::hours(1))
            .await;

        let tpl = resolve_template(&store, TriggerType::PostAttendance).await.unwrap();
        assert_eq!(tpl.template_id, newest.template_id);
        assert_eq!(tpl.content, "new");
    }

    #[tokio::test]
    async fn resolve_without_templates_is_not_found() {
        let store = MemoryStore::new();
        let err = resolve_template(&store, TriggerType::PostAttendance)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::TemplateNotFound(TriggerType::PostAttendance)));
    }
}

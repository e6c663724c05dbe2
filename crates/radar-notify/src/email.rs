use askama::Template;
use serde::Serialize;

use crate::profile::CompiledProfile;
use crate::store::ClaimedBid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Template)]
#[template(path = "alert_email.html")]
struct AlertEmailTemplate<'a> {
    recipient_name: &'a str,
    alert_name: &'a str,
    description: &'a str,
    entity: &'a str,
    municipality: &'a str,
    uf: &'a str,
    estimated_value: String,
    detail_url: &'a str,
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// `R$ 1.234,56`, or `R$ N/I` when the value is unknown or zero.
pub fn format_brl(value: Option<f64>) -> String {
    let Some(value) = value.filter(|v| v.is_finite() && *v != 0.0) else {
        return "R$ N/I".to_string();
    };
    let cents = (value.abs() * 100.0).round() as u64;
    let digits = (cents / 100).to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 { "-" } else { "" };
    format!("R$ {sign}{grouped},{:02}", cents % 100)
}

pub fn detail_url(base: &str, external_id: &str) -> String {
    format!("{}/{external_id}", base.trim_end_matches('/'))
}

pub fn subject_for(bid: &ClaimedBid) -> String {
    let description = bid.description.as_deref().unwrap_or_default();
    format!("Oportunidade: {}...", truncate_chars(description, 30))
}

pub fn alert_email(
    to: &str,
    bid: &ClaimedBid,
    profile: &CompiledProfile,
    detail_url_base: &str,
) -> Result<EmailMessage, askama::Error> {
    let detail_url = detail_url(detail_url_base, &bid.external_id);
    let html = AlertEmailTemplate {
        recipient_name: profile
            .owner
            .display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("Assinante"),
        alert_name: &profile.name,
        description: bid.description.as_deref().unwrap_or_default(),
        entity: bid.entity_name.as_deref().unwrap_or("Órgão"),
        municipality: bid.municipality.as_deref().unwrap_or_default(),
        uf: bid.uf.as_deref().unwrap_or_default(),
        estimated_value: format_brl(bid.estimated_total),
        detail_url: &detail_url,
    }
    .render()?;
    Ok(EmailMessage {
        to: to.to_string(),
        subject: subject_for(bid),
        html,
    })
}

//! Canonical lifecycle status derived from the source's raw code, proposal
//! dates and line-item situations.

use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RAW_ACTIVE: i32 = 1;
const RAW_REVOKED: i32 = 2;
const RAW_ANNULLED: i32 = 3;
const RAW_SUSPENDED: i32 = 4;

const TERMINAL_ITEM_STATUSES: [&str; 4] = [
    "homologado",
    "fracassado",
    "deserto",
    "anulado/revogado/cancelado",
];
const IN_PROGRESS_ITEM_STATUS: &str = "em andamento";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Closed,
    Suspended,
    UnderJudgment,
    ReceivingProposals,
    Unknown,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 5] = [
        CanonicalStatus::Closed,
        CanonicalStatus::Suspended,
        CanonicalStatus::UnderJudgment,
        CanonicalStatus::ReceivingProposals,
        CanonicalStatus::Unknown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::Closed => "closed",
            CanonicalStatus::Suspended => "suspended",
            CanonicalStatus::UnderJudgment => "under_judgment",
            CanonicalStatus::ReceivingProposals => "receiving_proposals",
            CanonicalStatus::Unknown => "unknown",
        }
    }

    /// Portuguese label shown to subscribers.
    pub const fn label(self) -> &'static str {
        match self {
            CanonicalStatus::Closed => "Encerrada",
            CanonicalStatus::Suspended => "Suspensa",
            CanonicalStatus::UnderJudgment => "Em Julgamento/Propostas Encerradas",
            CanonicalStatus::ReceivingProposals => "A Receber/Recebendo Proposta",
            CanonicalStatus::Unknown => "Desconhecida",
        }
    }

    /// Closed and suspended bids are never announced to subscribers.
    pub const fn is_actionable(self) -> bool {
        match self {
            CanonicalStatus::Closed | CanonicalStatus::Suspended => false,
            CanonicalStatus::UnderJudgment
            | CanonicalStatus::ReceivingProposals
            | CanonicalStatus::Unknown => true,
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown canonical status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for CanonicalStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusInputs {
    pub raw_status_code: Option<i32>,
    pub open_date: Option<NaiveDateTime>,
    pub close_date: Option<NaiveDateTime>,
    /// Situation text of every fetched line item, in source order.
    pub line_item_statuses: Vec<Option<String>>,
}

pub fn derive_status(inputs: &StatusInputs, today: NaiveDate) -> CanonicalStatus {
    match inputs.raw_status_code {
        Some(RAW_REVOKED | RAW_ANNULLED) => return CanonicalStatus::Closed,
        Some(RAW_SUSPENDED) => return CanonicalStatus::Suspended,
        _ => {}
    }

    if inputs.open_date.is_none() && inputs.close_date.is_none() {
        return CanonicalStatus::Closed;
    }

    if inputs.raw_status_code != Some(RAW_ACTIVE) {
        return CanonicalStatus::Unknown;
    }

    let normalized: Vec<Option<String>> = inputs
        .line_item_statuses
        .iter()
        .map(|s| s.as_deref().map(|s| s.trim().to_lowercase()))
        .collect();

    if normalized
        .iter()
        .flatten()
        .any(|s| TERMINAL_ITEM_STATUSES.contains(&s.as_str()))
    {
        return CanonicalStatus::Closed;
    }

    // Only the first item is consulted here; see DESIGN.md open questions.
    if let Some(Some(first)) = normalized.first() {
        if !first.is_empty() && first != IN_PROGRESS_ITEM_STATUS {
            return CanonicalStatus::UnderJudgment;
        }
    }

    match inputs.close_date {
        Some(close) if close.date() < today => CanonicalStatus::UnderJudgment,
        _ => CanonicalStatus::ReceivingProposals,
    }
}

pub fn derive_status_now(inputs: &StatusInputs) -> CanonicalStatus {
    derive_status(inputs, Local::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        day(y, m, d).and_hms_opt(12, 0, 0).expect("time")
    }

    fn active(close: Option<NaiveDateTime>, items: &[&str]) -> StatusInputs {
        StatusInputs {
            raw_status_code: Some(RAW_ACTIVE),
            open_date: Some(at(2025, 1, 1)),
            close_date: close,
            line_item_statuses: items.iter().map(|s| Some(s.to_string())).collect(),
        }
    }

    #[test]
    fn cancelled_codes_close_regardless_of_dates_and_items() {
        let today = day(2025, 6, 1);
        for code in [RAW_REVOKED, RAW_ANNULLED] {
            for items in [vec![], vec!["Em andamento"], vec!["Homologado"]] {
                let inputs = StatusInputs {
                    raw_status_code: Some(code),
                    open_date: Some(at(2025, 5, 1)),
                    close_date: Some(at(2099, 1, 1)),
                    line_item_statuses: items.iter().map(|s| Some(s.to_string())).collect(),
                };
                assert_eq!(derive_status(&inputs, today), CanonicalStatus::Closed);
            }
        }
    }

    #[test]
    fn suspended_code_wins_over_dates() {
        let inputs = StatusInputs {
            raw_status_code: Some(RAW_SUSPENDED),
            ..Default::default()
        };
        assert_eq!(derive_status(&inputs, day(2025, 6, 1)), CanonicalStatus::Suspended);
    }

    #[test]
    fn missing_both_dates_closes_active_bids() {
        let inputs = StatusInputs {
            raw_status_code: Some(RAW_ACTIVE),
            ..Default::default()
        };
        assert_eq!(derive_status(&inputs, day(2025, 6, 1)), CanonicalStatus::Closed);
    }

    #[test]
    fn active_without_items_follows_close_date() {
        let today = day(2025, 6, 1);
        assert_eq!(
            derive_status(&active(None, &[]), today),
            CanonicalStatus::ReceivingProposals
        );
        assert_eq!(
            derive_status(&active(Some(at(2025, 6, 1)), &[]), today),
            CanonicalStatus::ReceivingProposals
        );
        assert_eq!(
            derive_status(&active(Some(at(2025, 5, 31)), &[]), today),
            CanonicalStatus::UnderJudgment
        );
    }

    #[test]
    fn any_terminal_item_closes() {
        let inputs = active(Some(at(2099, 1, 1)), &["Em andamento", "  DESERTO "]);
        assert_eq!(derive_status(&inputs, day(2025, 6, 1)), CanonicalStatus::Closed);
    }

    #[test]
    fn only_first_item_decides_under_judgment() {
        let today = day(2025, 6, 1);
        let first_pending = active(Some(at(2099, 1, 1)), &["Em andamento", "Em julgamento"]);
        assert_eq!(derive_status(&first_pending, today), CanonicalStatus::ReceivingProposals);

        let first_judging = active(Some(at(2099, 1, 1)), &["Em julgamento", "Em andamento"]);
        assert_eq!(derive_status(&first_judging, today), CanonicalStatus::UnderJudgment);
    }

    #[test]
    fn empty_first_item_text_falls_through_to_dates() {
        let mut inputs = active(Some(at(2099, 1, 1)), &[]);
        inputs.line_item_statuses = vec![None, Some(String::new())];
        assert_eq!(
            derive_status(&inputs, day(2025, 6, 1)),
            CanonicalStatus::ReceivingProposals
        );
    }

    #[test]
    fn unrecognized_code_is_unknown() {
        let inputs = StatusInputs {
            raw_status_code: Some(9),
            close_date: Some(at(2025, 1, 1)),
            ..Default::default()
        };
        assert_eq!(derive_status(&inputs, day(2025, 6, 1)), CanonicalStatus::Unknown);

        let missing = StatusInputs {
            raw_status_code: None,
            open_date: Some(at(2025, 1, 1)),
            ..Default::default()
        };
        assert_eq!(derive_status(&missing, day(2025, 6, 1)), CanonicalStatus::Unknown);
    }

    #[test]
    fn text_form_round_trips_and_rejects_garbage() {
        for status in CanonicalStatus::ALL {
            assert_eq!(status.as_str().parse::<CanonicalStatus>(), Ok(status));
        }
        assert!("encerrada".parse::<CanonicalStatus>().is_err());
        assert!(!CanonicalStatus::Closed.is_actionable());
        assert!(CanonicalStatus::ReceivingProposals.is_actionable());
    }
}

//! Wire-frame parsing for the classifieds event stream. Frames arrive as a
//! single JSON event object or an array of them; each carries an `event`
//! discriminator and a listing payload.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::warn;

use crate::types::{Intent, ListingDeleteEvent, ListingUpdateEvent, StreamEvent};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Deserialize)]
struct RawEvent {
    pub event: Option<String>,
    pub payload: Option<RawPayload>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    pub item: Option<RawItem>,
    pub steamid: Option<String>,
    pub intent: Option<String>,
    pub currencies: Option<serde_json::Value>,
    pub details: Option<String>,
    #[serde(rename = "userAgent")]
    pub user_agent: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Deserialize)]
struct RawAttribute {
    pub float_value: Option<f64>,
}

/// Parse a raw text frame into zero or more stream events. Unrecognized
/// frames are counted and sampled into the log rather than spamming it.
pub fn parse_frame(raw: &str) -> Vec<StreamEvent> {
    let msgs: Vec<RawEvent> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawEvent>(raw) {
            Ok(m) => vec![m],
            Err(_) => vec![],
        }
    };

    if msgs.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample = &raw[..500.min(raw.len())];
            warn!(count, "[WS PARSE] unrecognized frame: {sample}");
        }
        return vec![];
    }

    msgs.into_iter().filter_map(expand_raw_event).collect()
}

fn expand_raw_event(msg: RawEvent) -> Option<StreamEvent> {
    let payload = msg.payload?;
    let item = payload.item?;
    let name = item.name?;
    let steamid = payload.steamid?;
    let intent = Intent::parse(payload.intent.as_deref()?)?;

    match msg.event.as_deref() {
        Some("listing-update") => Some(StreamEvent::Update(ListingUpdateEvent {
            name,
            steamid,
            intent,
            currencies: payload.currencies.unwrap_or(serde_json::Value::Null),
            details: payload.details,
            float_attributes: item
                .attributes
                .into_iter()
                .filter_map(|a| a.float_value)
                .collect(),
            has_user_agent: payload.user_agent.is_some(),
        })),
        Some("listing-delete") => Some(StreamEvent::Delete(ListingDeleteEvent {
            name,
            steamid,
            intent,
        })),
        _ => None,
    }
}

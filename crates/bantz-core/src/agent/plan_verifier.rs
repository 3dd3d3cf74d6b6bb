//! Static plan verification.
//!
//! Catches the logical errors JSON repair cannot: unknown tools, route ↔
//! tool prefix mismatches, missing required slots, gmail write fields,
//! tool plans with no action indicators in the input, and semantic
//! incoherence (smalltalk with tools, calendar writes without a temporal
//! slot, route ↔ intent mismatches). The caller decides enforcement.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ai::plan::{Route, RouterPlan};

/// Route → allowed tool name prefixes.
fn allowed_prefixes(route: Route) -> &'static [&'static str] {
    match route {
        Route::Calendar => &["calendar.", "time.", "contacts."],
        Route::Gmail => &["gmail.", "contacts.", "time."],
        Route::System => &["system.", "time."],
        Route::Smalltalk | Route::Unknown => &["time."],
    }
}

/// Required slots per calendar intent.
fn required_slots(intent: &str) -> &'static [&'static str] {
    match intent {
        "create_event" | "update_event" | "delete_event" => &["title"],
        _ => &[],
    }
}

/// Required fields per gmail write intent (read from plan slots).
fn required_gmail_fields(intent: &str) -> &'static [&'static str] {
    match intent {
        "send" | "create_draft" => &["to"],
        _ => &[],
    }
}

const CALENDAR_WRITE_INTENTS: &[&str] =
    &["create", "create_event", "modify", "update", "update_event"];

/// Intents incoherent with the route they arrived on.
fn mismatched_intents(route: Route) -> &'static [&'static str] {
    match route {
        Route::Gmail => &[
            "create",
            "create_event",
            "modify",
            "update_event",
            "query",
            "cancel",
            "delete_event",
        ],
        Route::Calendar => &["send", "list", "search", "read"],
        Route::Smalltalk => &["create", "create_event", "send", "delete_event", "modify"],
        _ => &[],
    }
}

/// Keyword heuristics hinting the user actually asked for a tool action
/// (Turkish first, English alongside, common ASR typo tolerance).
static TOOL_INDICATOR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(oluştur|ekle|yarat|create|add)",
        r"(?i)\b(sil|kaldır|delete|remove|cancel)",
        r"(?i)\b(güncelle|değiştir|update|change|modify|move)",
        r"(?i)\b(listele|göster|bak|list|show)",
        r"(?i)\b(gönder|yolla|send|e-?posta)",
        r"(?i)\b(oku|read|aç|open)",
        r"(?i)\b(takvim|calendar|toplantı|meeting|randevu)",
        r"(?i)\b(saat kaç|what time|tarih|date)",
        r"(?i)\b(kontrol\s*et|planımız|plan\s*var|etkinlik|ne\s*var)",
        r"(?i)\b(mailleri?|son\s*mail|gelen\s*kutusu|inbox)",
        r"(?i)\b(ne\s*yazıyor|ne\s*diyor|ne\s*gelmiş|var\s*mı)",
        r"(?i)\b(ara|bul|search|find|kontrol)",
        r"(?i)\b(özetle|summarize|summary)",
        r"(?i)\b(yaz|yazd[ıi]r|write|compose|draft)",
        r"(?i)\b(cevapla|yan[ıi]tla|reply|respond)",
        r"(?i)\b(hat[ıi]rlat|remind|alarm|bildir)",
        r"(?i)\bmail[a-zıüöğçş]*",
        r"(?i)\b(mesaj|mesajlar[ıi]?|ileti)",
        r"(?i)\b(okunmuş|okunmam[ıi]ş|okunan|okunmayan|unread)",
        r"(?i)\b(yapacağız|yapacağim|yapaca[kğ])",
        r"(?i)\b(kontro[lr]|kontorl)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("indicator pattern compiles"))
    .collect()
});

fn has_tool_indicators(user_input: &str) -> bool {
    TOOL_INDICATOR_PATTERNS.iter().any(|p| p.is_match(user_input))
}

fn slot_present(plan: &RouterPlan, key: &str) -> bool {
    plan.slots
        .get(key)
        .is_some_and(|v| !v.is_null() && v.as_str() != Some(""))
}

/// Statically validate a parsed plan against the registered tool set and
/// the raw user input. Returns `(ok, errors)`; `ok` is true when no
/// errors were found.
pub fn verify_plan(
    plan: &RouterPlan,
    user_input: &str,
    valid_tools: &HashSet<String>,
) -> (bool, Vec<String>) {
    let mut errors = Vec::new();
    let route = plan.route;

    // 1. Every planned tool must exist.
    for tool in &plan.tool_plan {
        if !valid_tools.contains(tool) {
            errors.push(format!("unknown_tool:{tool}"));
        }
    }

    // 2. Route ↔ tool prefix coherence.
    let prefixes = allowed_prefixes(route);
    for tool in &plan.tool_plan {
        if !prefixes.iter().any(|p| tool.starts_with(p)) {
            errors.push(format!("route_tool_mismatch:{}→{tool}", route.as_str()));
        }
    }

    // 3. Required slots per calendar intent.
    if route == Route::Calendar {
        for slot in required_slots(&plan.calendar_intent) {
            if !slot_present(plan, slot) {
                errors.push(format!("missing_slot:{slot}"));
            }
        }
    }

    // 4. Gmail write fields.
    if route == Route::Gmail {
        for field in required_gmail_fields(&plan.gmail_intent) {
            if !slot_present(plan, field) {
                errors.push(format!("missing_gmail_field:{field}"));
            }
        }
    }

    // 5. Tool plan with no action indicators in the input. Soft warning.
    if plan.has_tools() && !has_tool_indicators(user_input) {
        errors.push("tool_plan_no_indicators".to_string());
    }

    // 6. Smalltalk with non-time tools is almost always a routing error.
    if route == Route::Smalltalk && plan.has_tools() {
        let non_time: Vec<&String> = plan
            .tool_plan
            .iter()
            .filter(|t| !t.starts_with("time."))
            .collect();
        if !non_time.is_empty() {
            errors.push("smalltalk_with_tools".to_string());
        }
    }

    // 7. Calendar write without any temporal slot.
    if route == Route::Calendar && CALENDAR_WRITE_INTENTS.contains(&plan.calendar_intent.as_str()) {
        let has_temporal = slot_present(plan, "date")
            || slot_present(plan, "time")
            || slot_present(plan, "window_hint");
        if !has_temporal {
            errors.push("calendar_write_no_temporal".to_string());
        }
    }

    // 8. Route ↔ intent coherence.
    if plan.calendar_intent != "none"
        && mismatched_intents(route).contains(&plan.calendar_intent.as_str())
    {
        errors.push(format!(
            "route_intent_mismatch:{}+calendar_intent={}",
            route.as_str(),
            plan.calendar_intent
        ));
    }
    if plan.gmail_intent != "none" && route != Route::Gmail {
        errors.push(format!(
            "route_intent_mismatch:{}+gmail_intent={}",
            route.as_str(),
            plan.gmail_intent
        ));
    }

    if errors.is_empty() {
        tracing::debug!(route = route.as_str(), tools = plan.tool_plan.len(), "plan OK");
    } else {
        tracing::warn!(
            route = route.as_str(),
            errors = ?errors,
            input = %user_input.chars().take(60).collect::<String>(),
            "plan verification errors"
        );
    }

    (errors.is_empty(), errors)
}

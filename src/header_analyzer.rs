//! Parses rate-limit disclosures out of a single HTTP response's headers.
//!
//! Scans case-insensitively for the canonical `X-RateLimit-*` triplet, the
//! `X-Rate-Limit-*` spelling, and an optional window suffix (`-10s`,
//! `-Minute`, `-Hour`, ...). Never raises: an unparseable or absent header
//! set yields an empty list.
//!
//! `Retry-After` is handled separately via [`retry_after_seconds`], since it
//! carries a delay hint rather than a ceiling/remaining/reset triplet — the
//! fault tolerance layer and tier tester read it directly off a 429
//! response rather than through a synthesized `RateLimit`.

use crate::models::{DetectionSource, RateLimit};
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use std::collections::BTreeMap;

static TRIPLET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^x-rate-?limit-(limit|remaining|reset)(?:-(.+))?$").unwrap());

static RETRY_AFTER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^retry-after$").unwrap());

/// Default window, in seconds, when a header carries no window suffix.
const DEFAULT_WINDOW_SECONDS: u64 = 60;

fn window_seconds_for_suffix(suffix: &str) -> u64 {
    match suffix.to_ascii_lowercase().as_str() {
        "10s" => 10,
        "minute" | "min" => 60,
        "15min" => 900,
        "hour" | "hr" => 3600,
        "day" | "daily" => 86_400,
        _ => DEFAULT_WINDOW_SECONDS,
    }
}

#[derive(Default)]
struct Accumulator {
    limit: Option<u64>,
    remaining: Option<i64>,
    reset_raw: Option<String>,
}

/// Stateless rate-limit header parser.
pub struct HeaderAnalyzer;

impl HeaderAnalyzer {
    /// Scan `headers` and return one [`RateLimit`] per distinct window
    /// size discovered. Duplicate disclosures for the same window keep
    /// the first value seen for each field; a record whose limit value
    /// isn't numeric is skipped entirely.
    pub fn analyze(headers: &HeaderMap) -> Vec<RateLimit> {
        let mut by_window: BTreeMap<u64, Accumulator> = BTreeMap::new();

        for (name, value) in headers.iter() {
            let name = name.as_str();
            let Some(caps) = TRIPLET_RE.captures(name) else {
                continue;
            };
            let Ok(value) = value.to_str() else {
                continue;
            };
            let kind = caps.get(1).unwrap().as_str().to_ascii_lowercase();
            let window_seconds = caps
                .get(2)
                .map(|m| window_seconds_for_suffix(m.as_str()))
                .unwrap_or(DEFAULT_WINDOW_SECONDS);

            let entry = by_window.entry(window_seconds).or_default();
            match kind.as_str() {
                "limit" => {
                    if entry.limit.is_none() {
                        if let Ok(parsed) = value.trim().parse::<u64>() {
                            entry.limit = Some(parsed);
                        }
                        // Non-numeric limit: leave unset, record is skipped below.
                    }
                }
                "remaining" => {
                    if entry.remaining.is_none() {
                        if let Ok(parsed) = value.trim().parse::<i64>() {
                            entry.remaining = Some(parsed);
                        }
                    }
                }
                "reset" => {
                    if entry.reset_raw.is_none() {
                        entry.reset_raw = Some(value.trim().to_string());
                    }
                }
                _ => {}
            }
        }

        by_window
            .into_iter()
            .filter_map(|(window_seconds, acc)| {
                let ceiling = acc.limit?;
                let remaining = acc.remaining.unwrap_or(ceiling as i64);
                let reset_at = acc.reset_raw.as_deref().and_then(parse_reset);
                Some(RateLimit::new(
                    ceiling,
                    remaining,
                    reset_at,
                    window_seconds,
                    DetectionSource::Header,
                ))
            })
            .collect()
    }

    /// Read a `Retry-After` header, in seconds. Tries an integer
    /// seconds-delta first, falling back to an HTTP-date (interpreted
    /// relative to now, floored at zero).
    pub fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
        headers.iter().find_map(|(name, value)| {
            if !RETRY_AFTER_RE.is_match(name.as_str()) {
                return None;
            }
            let value = value.to_str().ok()?.trim();
            if let Ok(seconds) = value.parse::<u64>() {
                return Some(seconds);
            }
            let date = DateTime::parse_from_rfc2822(value).ok()?;
            let delta = date.with_timezone(&Utc) - Utc::now();
            Some(delta.num_seconds().max(0) as u64)
        })
    }
}

/// Try absolute epoch seconds first; on failure interpret the value as
/// seconds-until-reset and compute an absolute timestamp from now.
fn parse_reset(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = raw.parse::<i64>() {
        if let Some(dt) = Utc.timestamp_opt(epoch, 0).single() {
            // Anything parsed as a plausible Unix timestamp (post-2001) is
            // treated as an absolute epoch; small values are far more
            // likely to be a seconds-until-reset delta misread as epoch.
            if epoch > 1_000_000_000 {
                return Some(dt);
            }
        }
        return Some(Utc::now() + chrono::Duration::seconds(epoch));
    }
    None
}

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::log;
use crate::logging::LogLevel;
use crate::proxy::http::HeaderMap;

/// Response headers that no longer describe a rewritten body. Dropping them
/// also keeps clients from caching the filtered document.
const CACHING_HEADERS: &[&str] = &["etag", "last-modified", "cache-control"];

/// Minimum-age policy for registry metadata.
#[derive(Debug, Clone)]
pub struct AgePolicy {
    pub minimum_age_hours: u64,
    pub exempt_packages: Vec<String>,
}

impl AgePolicy {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.minimum_age_hours as i64)
    }

    fn is_exempt(&self, package_name: &str) -> bool {
        let base = base_package_name(package_name);
        self.exempt_packages.iter().any(|entry| entry == base)
    }
}

/// For scoped packages the allow-list key is the scope itself.
pub fn base_package_name(name: &str) -> &str {
    if name.starts_with('@') {
        name.split('/').next().unwrap_or(name)
    } else {
        name
    }
}

pub struct RewriteOutcome {
    pub body: Vec<u8>,
    pub suppressed: bool,
}

impl RewriteOutcome {
    fn unchanged(body: &[u8]) -> RewriteOutcome {
        RewriteOutcome {
            body: body.to_vec(),
            suppressed: false,
        }
    }
}

/// Remove versions published after the cutoff from a packument and repoint
/// the `latest` dist-tag when its target disappears. Anything that does not
/// look like a packument, or fails to parse, passes through unchanged: the
/// install must succeed even when enforcement cannot.
pub fn rewrite_packument(
    policy: &AgePolicy,
    now: DateTime<Utc>,
    body: &[u8],
    headers: &mut HeaderMap,
) -> RewriteOutcome {
    let is_json = headers
        .get("content-type")
        .map(|value| value.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);
    if !is_json || body.is_empty() {
        return RewriteOutcome::unchanged(body);
    }

    let mut doc: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(error) => {
            log!(LogLevel::Verbose, "Leaving unparsable metadata as-is: {}", error);
            return RewriteOutcome::unchanged(body);
        }
    };

    let is_packument = doc.get("time").is_some()
        && doc.get("versions").is_some()
        && doc.get("dist-tags").is_some();
    if !is_packument {
        return RewriteOutcome::unchanged(body);
    }

    if let Some(name) = doc.get("name").and_then(Value::as_str) {
        if policy.is_exempt(name) {
            return RewriteOutcome::unchanged(body);
        }
    }

    let cutoff = policy.cutoff(now);
    let removed = too_young_versions(&doc, cutoff);
    if removed.is_empty() {
        return RewriteOutcome::unchanged(body);
    }

    let previous_latest = doc
        .get("dist-tags")
        .and_then(|tags| tags.get("latest"))
        .and_then(Value::as_str)
        .map(str::to_string);

    for version in &removed {
        if let Some(time) = doc.get_mut("time").and_then(Value::as_object_mut) {
            time.shift_remove(version);
        }
        if let Some(versions) = doc.get_mut("versions").and_then(Value::as_object_mut) {
            versions.shift_remove(version);
        }
        if let Some(tags) = doc.get_mut("dist-tags").and_then(Value::as_object_mut) {
            tags.retain(|_, target| target.as_str() != Some(version));
        }
    }

    if let Some(previous) = previous_latest {
        if removed.contains(&previous) {
            if let Some(next) = next_latest(&doc) {
                if let Some(tags) = doc.get_mut("dist-tags").and_then(Value::as_object_mut) {
                    tags.insert("latest".to_string(), Value::String(next));
                }
            }
        }
    }

    let rewritten = match serde_json::to_vec(&doc) {
        Ok(bytes) => bytes,
        Err(error) => {
            log!(LogLevel::Verbose, "Could not re-serialize metadata: {}", error);
            return RewriteOutcome::unchanged(body);
        }
    };

    for name in CACHING_HEADERS {
        headers.remove(name);
    }

    RewriteOutcome {
        body: rewritten,
        suppressed: true,
    }
}

/// Versions whose publication timestamp is newer than the cutoff. Entries
/// in `versions` with no corresponding timestamp are never selected: ages
/// we do not have are not inferred.
fn too_young_versions(doc: &Value, cutoff: DateTime<Utc>) -> Vec<String> {
    let mut removed = Vec::new();
    if let Some(time) = doc.get("time").and_then(Value::as_object) {
        for (version, stamp) in time {
            if version == "created" || version == "modified" {
                continue;
            }
            if let Some(published) = parse_timestamp(stamp) {
                if published > cutoff {
                    removed.push(version.clone());
                }
            }
        }
    }
    removed
}

/// The replacement `latest` over the surviving `time` entries: the newest
/// full release when any survives, the newest prerelease otherwise. Equal
/// timestamps resolve to the lexicographically greatest version string.
fn next_latest(doc: &Value) -> Option<String> {
    let time = doc.get("time").and_then(Value::as_object)?;
    let mut candidates: Vec<(&String, DateTime<Utc>)> = time
        .iter()
        .filter(|(version, _)| *version != "created" && *version != "modified")
        .filter_map(|(version, stamp)| parse_timestamp(stamp).map(|at| (version, at)))
        .collect();
    candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let full_release = candidates
        .iter()
        .rev()
        .find(|(version, _)| !version.contains('-'));
    full_release
        .or_else(|| candidates.last())
        .map(|(version, _)| (*version).clone())
}

fn parse_timestamp(stamp: &Value) -> Option<DateTime<Utc>> {
    let text = stamp.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(hours: u64) -> AgePolicy {
        AgePolicy {
            minimum_age_hours: hours,
            exempt_packages: Vec::new(),
        }
    }

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.push("Content-Type", "application/json; charset=utf-8");
        headers.push("ETag", "\"abc\"");
        headers.push("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT");
        headers.push("Cache-Control", "public, max-age=300");
        headers
    }

    fn stamp(now: DateTime<Utc>, hours_ago: i64) -> String {
        (now - Duration::hours(hours_ago)).to_rfc3339()
    }

    fn packument(now: DateTime<Utc>) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "name": "lodash",
            "dist-tags": {"latest": "3.0.0", "next": "3.0.0", "old": "1.0.0"},
            "versions": {"1.0.0": {}, "2.0.0": {}, "2.0.0-alpha": {}, "3.0.0": {}},
            "time": {
                "created": stamp(now, 100),
                "modified": stamp(now, 1),
                "0.0.1": stamp(now, 8),
                "1.0.0": stamp(now, 7),
                "2.0.0-alpha": stamp(now, 6),
                "2.0.0": stamp(now, 4),
                "3.0.0": stamp(now, 3),
            },
        }))
        .expect("packument json")
    }

    fn parse(body: &[u8]) -> Value {
        serde_json::from_slice(body).expect("rewritten json")
    }

    #[test]
    fn removes_young_versions_and_recomputes_latest() {
        let now = Utc::now();
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(5), now, &packument(now), &mut headers);
        assert!(outcome.suppressed);

        let doc = parse(&outcome.body);
        let versions = doc["versions"].as_object().expect("versions");
        assert!(versions.contains_key("1.0.0"));
        // 6 h old survives a 5 h cutoff; only the 4 h and 3 h entries go.
        assert!(versions.contains_key("2.0.0-alpha"));
        assert!(!versions.contains_key("2.0.0"));
        assert!(!versions.contains_key("3.0.0"));

        let time = doc["time"].as_object().expect("time");
        assert!(time.contains_key("created"));
        assert!(time.contains_key("modified"));
        assert!(time.contains_key("0.0.1"));
        assert!(time.contains_key("1.0.0"));
        assert!(time.contains_key("2.0.0-alpha"));
        assert!(!time.contains_key("2.0.0"));
        assert!(!time.contains_key("3.0.0"));

        // The surviving prerelease is newer than 1.0.0, but prereleases
        // never win over full releases.
        assert_eq!(doc["dist-tags"]["latest"], "1.0.0");
    }

    #[test]
    fn day_old_default_hides_a_two_hour_old_release() {
        let now = Utc::now();
        let raw = serde_json::to_vec(&serde_json::json!({
            "name": "lodash",
            "dist-tags": {"latest": "4.17.21"},
            "versions": {"4.17.20": {}, "4.17.21": {}},
            "time": {
                "created": stamp(now, 24 * 365),
                "modified": stamp(now, 2),
                "4.17.20": stamp(now, 24 * 30),
                "4.17.21": stamp(now, 2),
            },
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(24), now, &raw, &mut headers);
        assert!(outcome.suppressed);

        let doc = parse(&outcome.body);
        assert!(doc["versions"].as_object().expect("versions").contains_key("4.17.20"));
        assert!(!doc["versions"].as_object().expect("versions").contains_key("4.17.21"));
        assert_eq!(doc["dist-tags"]["latest"], "4.17.20");
        assert!(!headers.contains("etag"));
        assert!(!headers.contains("last-modified"));
        assert!(!headers.contains("cache-control"));
    }

    #[test]
    fn dist_tags_pointing_at_removed_versions_are_dropped() {
        let now = Utc::now();
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(5), now, &packument(now), &mut headers);
        let doc = parse(&outcome.body);
        let tags = doc["dist-tags"].as_object().expect("dist-tags");
        assert!(!tags.contains_key("next"));
        // Surviving non-latest tags are left alone, not recomputed.
        assert_eq!(tags.get("old").and_then(Value::as_str), Some("1.0.0"));
    }

    #[test]
    fn caching_headers_are_dropped_only_on_modification() {
        let now = Utc::now();
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(5), now, &packument(now), &mut headers);
        assert!(outcome.suppressed);
        assert!(!headers.contains("etag"));
        assert!(!headers.contains("last-modified"));
        assert!(!headers.contains("cache-control"));
        assert!(headers.contains("content-type"));

        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(1000), now, &packument(now), &mut headers);
        assert!(!outcome.suppressed);
        assert!(headers.contains("etag"));
        assert!(headers.contains("cache-control"));
    }

    #[test]
    fn rewrite_is_idempotent_after_first_pass() {
        let now = Utc::now();
        let mut headers = json_headers();
        let first = rewrite_packument(&policy(5), now, &packument(now), &mut headers);
        let mut headers = json_headers();
        let second = rewrite_packument(&policy(5), now, &first.body, &mut headers);
        assert!(!second.suppressed);
        assert_eq!(first.body, second.body);
    }

    #[test]
    fn exempt_packages_keep_all_versions_and_headers() {
        let now = Utc::now();
        let exempt = AgePolicy {
            minimum_age_hours: 5,
            exempt_packages: vec!["lodash".to_string()],
        };
        let body = packument(now);
        let mut headers = json_headers();
        let outcome = rewrite_packument(&exempt, now, &body, &mut headers);
        assert!(!outcome.suppressed);
        assert_eq!(outcome.body, body);
        assert!(headers.contains("etag"));
    }

    #[test]
    fn scope_is_the_exemption_key_for_scoped_packages() {
        assert_eq!(base_package_name("@babel/core"), "@babel");
        assert_eq!(base_package_name("lodash"), "lodash");

        let now = Utc::now();
        let exempt = AgePolicy {
            minimum_age_hours: 5,
            exempt_packages: vec!["@types".to_string()],
        };
        let mut body: Value = serde_json::from_slice(&packument(now)).expect("json");
        body["name"] = Value::String("@types/node".to_string());
        let raw = serde_json::to_vec(&body).expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&exempt, now, &raw, &mut headers);
        assert!(!outcome.suppressed);
    }

    #[test]
    fn versions_without_time_entries_are_preserved() {
        let now = Utc::now();
        let raw = serde_json::to_vec(&serde_json::json!({
            "name": "untracked",
            "dist-tags": {"latest": "2.0.0"},
            "versions": {"1.0.0": {}, "1.5.0": {}, "2.0.0": {}},
            "time": {
                "created": stamp(now, 100),
                "1.0.0": stamp(now, 50),
                "2.0.0": stamp(now, 1),
            },
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(24), now, &raw, &mut headers);
        let doc = parse(&outcome.body);
        let versions = doc["versions"].as_object().expect("versions");
        // 1.5.0 has no timestamp, so no age is inferred for it.
        assert!(versions.contains_key("1.5.0"));
        assert!(versions.contains_key("1.0.0"));
        assert!(!versions.contains_key("2.0.0"));
    }

    #[test]
    fn latest_stays_unset_when_nothing_survives() {
        let now = Utc::now();
        let raw = serde_json::to_vec(&serde_json::json!({
            "name": "brand-new",
            "dist-tags": {"latest": "1.0.0"},
            "versions": {"1.0.0": {}},
            "time": {
                "created": stamp(now, 1),
                "1.0.0": stamp(now, 1),
            },
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(24), now, &raw, &mut headers);
        let doc = parse(&outcome.body);
        assert!(doc["dist-tags"].as_object().expect("tags").is_empty());
        assert!(outcome.suppressed);
    }

    #[test]
    fn prerelease_becomes_latest_when_no_full_release_survives() {
        let now = Utc::now();
        let raw = serde_json::to_vec(&serde_json::json!({
            "name": "edgy",
            "dist-tags": {"latest": "2.0.0"},
            "versions": {"1.0.0-beta.1": {}, "2.0.0": {}},
            "time": {
                "created": stamp(now, 100),
                "1.0.0-beta.1": stamp(now, 30),
                "2.0.0": stamp(now, 1),
            },
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(24), now, &raw, &mut headers);
        let doc = parse(&outcome.body);
        assert_eq!(doc["dist-tags"]["latest"], "1.0.0-beta.1");
    }

    #[test]
    fn equal_timestamps_resolve_lexicographically() {
        let now = Utc::now();
        let same = stamp(now, 30);
        let raw = serde_json::to_vec(&serde_json::json!({
            "name": "tied",
            "dist-tags": {"latest": "3.0.0"},
            "versions": {"1.9.0": {}, "1.10.0": {}, "3.0.0": {}},
            "time": {
                "created": stamp(now, 100),
                "1.9.0": same,
                "1.10.0": same,
                "3.0.0": stamp(now, 1),
            },
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(24), now, &raw, &mut headers);
        let doc = parse(&outcome.body);
        assert_eq!(doc["dist-tags"]["latest"], "1.9.0");
    }

    #[test]
    fn non_json_content_type_passes_through() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.push("Content-Type", "application/octet-stream");
        let body = packument(now);
        let outcome = rewrite_packument(&policy(5), now, &body, &mut headers);
        assert!(!outcome.suppressed);
        assert_eq!(outcome.body, body);
    }

    #[test]
    fn malformed_json_passes_through() {
        let now = Utc::now();
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(5), now, b"{not json", &mut headers);
        assert!(!outcome.suppressed);
        assert_eq!(outcome.body, b"{not json");
        assert!(headers.contains("etag"));
    }

    #[test]
    fn documents_missing_packument_keys_pass_through() {
        let now = Utc::now();
        let raw = serde_json::to_vec(&serde_json::json!({
            "objects": [],
            "total": 0,
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(5), now, &raw, &mut headers);
        assert!(!outcome.suppressed);
        assert_eq!(outcome.body, raw);
    }

    #[test]
    fn unknown_packument_fields_survive_verbatim() {
        let now = Utc::now();
        let raw = serde_json::to_vec(&serde_json::json!({
            "name": "annotated",
            "dist-tags": {"latest": "2.0.0"},
            "versions": {"1.0.0": {}, "2.0.0": {}},
            "time": {
                "created": stamp(now, 100),
                "1.0.0": stamp(now, 50),
                "2.0.0": stamp(now, 1),
            },
            "readme": "hello",
            "custom-field": {"nested": [1, 2, 3]},
        }))
        .expect("json");
        let mut headers = json_headers();
        let outcome = rewrite_packument(&policy(24), now, &raw, &mut headers);
        let doc = parse(&outcome.body);
        assert_eq!(doc["readme"], "hello");
        assert_eq!(doc["custom-field"]["nested"][2], 3);
    }
}

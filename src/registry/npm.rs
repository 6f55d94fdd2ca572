use std::sync::Arc;

use chrono::Utc;

use crate::interceptor::{intercept_requests, InterceptEvents, InterceptionContext, Interceptor, SetupFn};
use crate::oracle::MalwareOracle;
use crate::proxy::http::HeaderMap;
use crate::registry::url_path;
use crate::rewriter::{rewrite_packument, AgePolicy};

/// Compact metadata format served when clients only need install data. It
/// omits publication times, so requests for it are upgraded to the full
/// document.
const COMPACT_PACKUMENT_TYPE: &str = "application/vnd.npm.install-v1+json";

/// What a registry path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpmUrlKind {
    /// A package tarball download.
    Tarball,
    /// Registry API endpoints (search, advisories, dist-tags, ping) that
    /// pass through untouched.
    Special,
    /// Package metadata, the rewriter's input.
    Metadata,
}

pub fn classify_path(path: &str) -> NpmUrlKind {
    let path = strip_query(path);
    if path.ends_with(".tgz") {
        NpmUrlKind::Tarball
    } else if path.contains("/-/") {
        NpmUrlKind::Special
    } else {
        NpmUrlKind::Metadata
    }
}

/// Extract `(name, version)` from a tarball path such as
/// `/@babel/core/-/core-7.24.0.tgz`. The version begins after the last `-`
/// that introduces a digit, which keeps prerelease and build-metadata
/// suffixes attached to the version.
pub fn parse_tarball(path: &str) -> Option<(String, String)> {
    let path = strip_query(path);
    let stem = path
        .rsplit('/')
        .next()?
        .strip_suffix(".tgz")?;

    let split = last_version_split(stem)?;
    let (basename, version) = (&stem[..split], &stem[split + 1..]);
    if basename.is_empty() || version.is_empty() {
        return None;
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let name = match segments.first() {
        Some(scope) if scope.starts_with('@') => format!("{}/{}", scope, basename),
        _ => basename.to_string(),
    };
    Some((name, version.to_string()))
}

/// Position of the `-` separating name from version: the last one that is
/// immediately followed by an ASCII digit.
fn last_version_split(stem: &str) -> Option<usize> {
    let bytes = stem.as_bytes();
    (0..bytes.len().saturating_sub(1))
        .rev()
        .find(|&index| bytes[index] == b'-' && bytes[index + 1].is_ascii_digit())
}

fn strip_query(path: &str) -> &str {
    let end = path
        .find(['?', '#'])
        .unwrap_or(path.len());
    &path[..end]
}

/// Interceptor for npm registry traffic: blocks malicious tarballs and
/// wires the age rewriter into metadata responses.
pub fn npm_interceptor(
    oracle: Arc<dyn MalwareOracle>,
    policy: Option<AgePolicy>,
    events: Arc<dyn InterceptEvents>,
) -> Interceptor {
    let setups: Vec<SetupFn> = vec![
        tarball_gate(oracle),
        metadata_rewrite(policy, events.clone()),
    ];
    intercept_requests(setups, events)
}

fn tarball_gate(oracle: Arc<dyn MalwareOracle>) -> SetupFn {
    Box::new(move |context: &mut InterceptionContext| {
        let path = url_path(context.target_url()).to_string();
        if classify_path(&path) != NpmUrlKind::Tarball {
            return;
        }
        // An unparsable tarball path carries no verdict; missing info is
        // never treated as malicious.
        if let Some((name, version)) = parse_tarball(&path) {
            if oracle.is_malware(&name, &version) {
                context.block_malware(&name, &version);
            }
        }
    })
}

fn metadata_rewrite(policy: Option<AgePolicy>, events: Arc<dyn InterceptEvents>) -> SetupFn {
    Box::new(move |context: &mut InterceptionContext| {
        let path = url_path(context.target_url()).to_string();
        if classify_path(&path) != NpmUrlKind::Metadata {
            return;
        }
        context.modify_request_headers(coerce_accept_header);
        if let Some(policy) = policy.clone() {
            let events = Arc::clone(&events);
            context.modify_body(move |body, headers| {
                let outcome = rewrite_packument(&policy, Utc::now(), &body, headers);
                if outcome.suppressed {
                    events.versions_suppressed();
                }
                outcome.body
            });
        }
    })
}

/// The compact packument omits `time`; ask for the full document instead.
fn coerce_accept_header(headers: &mut HeaderMap) {
    if let Some(accept) = headers.get("accept") {
        if accept.contains(COMPACT_PACKUMENT_TYPE) {
            headers.set("accept", "application/json");
        }
    }
}

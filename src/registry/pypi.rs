use std::sync::Arc;

use crate::interceptor::{intercept_requests, InterceptEvents, InterceptionContext, Interceptor, SetupFn};
use crate::oracle::MalwareOracle;
use crate::registry::url_path;

const SDIST_EXTENSIONS: &[&str] = &[".tar.gz", ".zip", ".tar.bz2", ".tar.xz"];

/// Extract `(distribution, version)` from the artifact filename at the end
/// of a package-index path. Wheels and sdists split differently: wheel
/// filenames carry trailing compatibility tags, so the version ends at the
/// second `-`; sdists have nothing after the version, so the last `-`
/// separates it. Anything unrecognized carries no verdict.
pub fn parse_artifact(path: &str) -> Option<(String, String)> {
    let path = strip_query(path);
    let filename = percent_decode(path.rsplit('/').next()?);

    if let Some(stem) = filename.strip_suffix(".whl") {
        return parse_wheel(stem);
    }
    for extension in SDIST_EXTENSIONS {
        if let Some(stem) = filename.strip_suffix(extension) {
            return parse_sdist(stem);
        }
    }
    None
}

fn parse_wheel(stem: &str) -> Option<(String, String)> {
    let mut fields = stem.split('-');
    let dist = fields.next()?;
    let version = fields.next()?;
    // A wheel has at least python/abi/platform tags after the version.
    fields.next()?;
    if dist.is_empty() || version.is_empty() || version == "latest" {
        return None;
    }
    Some((dist.to_string(), version.to_string()))
}

fn parse_sdist(stem: &str) -> Option<(String, String)> {
    let (dist, version) = stem.rsplit_once('-')?;
    if dist.is_empty() || version.is_empty() || version == "latest" {
        return None;
    }
    Some((dist.to_string(), version.to_string()))
}

fn strip_query(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[index + 1..index + 3]).ok();
            if let Some(value) = hex.and_then(|pair| u8::from_str_radix(pair, 16).ok()) {
                decoded.push(value);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Interceptor for package-index traffic: blocks malicious artifact
/// downloads. Index responses stream through untouched.
pub fn pypi_interceptor(
    oracle: Arc<dyn MalwareOracle>,
    events: Arc<dyn InterceptEvents>,
) -> Interceptor {
    let setups: Vec<SetupFn> = vec![artifact_gate(oracle)];
    intercept_requests(setups, events)
}

fn artifact_gate(oracle: Arc<dyn MalwareOracle>) -> SetupFn {
    Box::new(move |context: &mut InterceptionContext| {
        let path = url_path(context.target_url()).to_string();
        if let Some((name, version)) = parse_artifact(&path) {
            if oracle.is_malware(&name, &version) {
                context.block_malware(&name, &version);
            }
        }
    })
}

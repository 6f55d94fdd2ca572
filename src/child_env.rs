use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::config::Ecosystem;

/// Names the wrapper owns in the child environment. Caller-provided
/// variants of these, in any casing, are replaced by our upper-case values.
pub const MANAGED_ENV_VARS: &[&str] = &[
    "HTTPS_PROXY",
    "GLOBAL_AGENT_HTTP_PROXY",
    "NODE_EXTRA_CA_CERTS",
    "SSL_CERT_FILE",
    "REQUESTS_CA_BUNDLE",
    "PIP_CERT",
    "PIP_CONFIG_FILE",
];

/// The fully merged environment for the child, plus the pip configuration
/// backing file. The temp file is deleted when this value drops, which is
/// the cleanup stage.
pub struct ChildEnv {
    vars: Vec<(String, String)>,
    pip_config: Option<NamedTempFile>,
}

impl ChildEnv {
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn pip_config_path(&self) -> Option<&Path> {
        self.pip_config.as_ref().map(|file| file.path())
    }
}

pub fn build_child_env(
    parent: &[(String, String)],
    proxy_url: &str,
    ca_cert: &Path,
    ca_bundle: &Path,
    ecosystem: Ecosystem,
) -> std::io::Result<ChildEnv> {
    let mut vars: Vec<(String, String)> = parent
        .iter()
        .filter(|(name, _)| !is_managed(name))
        .cloned()
        .collect();

    vars.push(("HTTPS_PROXY".to_string(), proxy_url.to_string()));
    vars.push(("GLOBAL_AGENT_HTTP_PROXY".to_string(), proxy_url.to_string()));
    vars.push((
        "NODE_EXTRA_CA_CERTS".to_string(),
        ca_cert.display().to_string(),
    ));

    let mut pip_config = None;
    if ecosystem == Ecosystem::Py {
        let bundle = ca_bundle.display().to_string();
        vars.push(("SSL_CERT_FILE".to_string(), bundle.clone()));
        vars.push(("REQUESTS_CA_BUNDLE".to_string(), bundle.clone()));
        vars.push(("PIP_CERT".to_string(), bundle.clone()));

        // A pre-existing pip configuration is merged into a fresh temp
        // file; the user's file is never touched.
        let existing = parent
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("PIP_CONFIG_FILE"))
            .and_then(|(_, path)| std::fs::read_to_string(path).ok());
        let merged = merge_pip_config(existing.as_deref(), &bundle, proxy_url);

        let mut file = tempfile::Builder::new()
            .prefix("safe-chain-pip-")
            .suffix(".conf")
            .tempfile()?;
        file.write_all(merged.as_bytes())?;
        file.flush()?;
        vars.push((
            "PIP_CONFIG_FILE".to_string(),
            file.path().display().to_string(),
        ));
        pip_config = Some(file);
    }

    Ok(ChildEnv { vars, pip_config })
}

fn is_managed(name: &str) -> bool {
    MANAGED_ENV_VARS
        .iter()
        .any(|managed| managed.eq_ignore_ascii_case(name))
}

/// Merge our `[global]` cert and proxy into an existing pip INI, keeping
/// every other section and key as the user wrote it.
fn merge_pip_config(existing: Option<&str>, cert: &str, proxy: &str) -> String {
    // Section order is preserved; the preamble (keys before any header)
    // rides along under the empty name.
    let mut sections: Vec<(String, Vec<String>)> = vec![(String::new(), Vec::new())];
    if let Some(text) = existing {
        let mut current = String::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current = trimmed.to_string();
                if !sections
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case(&current))
                {
                    sections.push((current.clone(), Vec::new()));
                }
                continue;
            }
            if let Some((_, lines)) = sections
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(&current))
            {
                lines.push(line.to_string());
            }
        }
    }

    if !sections
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("[global]"))
    {
        sections.insert(1, ("[global]".to_string(), Vec::new()));
    }
    for (name, lines) in &mut sections {
        if name.eq_ignore_ascii_case("[global]") {
            lines.retain(|line| {
                let key = line
                    .split('=')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_ascii_lowercase();
                key != "cert" && key != "proxy"
            });
            lines.insert(0, format!("proxy = {}", proxy));
            lines.insert(0, format!("cert = {}", cert));
        }
    }

    let mut rendered = String::new();
    for (name, lines) in &sections {
        if name.is_empty() && lines.is_empty() {
            continue;
        }
        if !name.is_empty() {
            rendered.push_str(name);
            rendered.push('\n');
        }
        for line in lines {
            rendered.push_str(line);
            rendered.push('\n');
        }
        rendered.push('\n');
    }
    rendered
}

pub mod npm;
pub mod pypi;

use std::sync::Arc;

use crate::config::Ecosystem;
use crate::interceptor::Interceptor;

/// Hosts serving JavaScript package metadata and tarballs.
pub const NPM_HOSTS: &[&str] = &["registry.npmjs.org", "registry.yarnpkg.com"];

/// Hosts serving Python package indexes and artifacts.
pub const PYPI_HOSTS: &[&str] = &[
    "files.pythonhosted.org",
    "pypi.org",
    "pypi.python.org",
    "pythonhosted.org",
];

/// The path-and-query portion of an absolute URL.
pub fn url_path(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    match after_scheme.find('/') {
        Some(index) => &after_scheme[index..],
        None => "/",
    }
}

/// Picks the interceptor for a CONNECT target, if any. Hosts outside the
/// active ecosystem's registry list get a blind tunnel.
pub struct Router {
    ecosystem: Ecosystem,
    npm: Arc<Interceptor>,
    pypi: Arc<Interceptor>,
}

impl Router {
    pub fn new(ecosystem: Ecosystem, npm: Interceptor, pypi: Interceptor) -> Router {
        Router {
            ecosystem,
            npm: Arc::new(npm),
            pypi: Arc::new(pypi),
        }
    }

    pub fn interceptor_for_host(&self, host: &str) -> Option<Arc<Interceptor>> {
        match self.ecosystem {
            Ecosystem::Js if host_in(NPM_HOSTS, host) => Some(Arc::clone(&self.npm)),
            Ecosystem::Py if host_in(PYPI_HOSTS, host) => Some(Arc::clone(&self.pypi)),
            _ => None,
        }
    }
}

fn host_in(hosts: &[&str], host: &str) -> bool {
    hosts.iter().any(|entry| entry.eq_ignore_ascii_case(host))
}

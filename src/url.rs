//! `iscsi://` URL parsing
//!
//! ```text
//! iscsi://[user[%password]@]host[:port]/target-iqn/lun
//! ```
//!
//! IPv6 hosts go in brackets. When a user is given without a password the
//! password is read from `ISCSI_CHAP_PASSWORD`.

use crate::auth::ChapCredentials;
use crate::error::{IscsiError, IscsiResult};
use crate::transport::ISCSI_PORT;
use std::fmt;

const SCHEME: &str = "iscsi://";

/// Environment variable consulted for a CHAP password missing from the URL
pub const CHAP_PASSWORD_ENV: &str = "ISCSI_CHAP_PASSWORD";

/// A parsed `iscsi://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiUrl {
    /// `host:port`, port defaulting to 3260
    pub portal: String,
    pub target: String,
    pub lun: u32,
    pub credentials: Option<ChapCredentials>,
}

fn bad(url: &str, why: &str) -> IscsiError {
    IscsiError::Config(format!("invalid iSCSI URL '{}': {}", url, why))
}

impl IscsiUrl {
    pub fn parse(url: &str) -> IscsiResult<Self> {
        Self::parse_with_password(url, std::env::var(CHAP_PASSWORD_ENV).ok())
    }

    fn parse_with_password(url: &str, env_password: Option<String>) -> IscsiResult<Self> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| bad(url, "must start with iscsi://"))?;

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| bad(url, "missing /target-iqn/lun"))?;

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, authority),
        };

        let credentials = match userinfo {
            None => None,
            Some("") => return Err(bad(url, "empty user name")),
            Some(info) => {
                let (user, password) = match info.split_once('%') {
                    Some((user, password)) => (user, Some(password.to_string())),
                    None => (info, env_password),
                };
                let password = password
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| bad(url, "CHAP user given without a password"))?;
                Some(ChapCredentials::new(user, password))
            }
        };

        let portal = parse_hostport(url, hostport)?;

        let (target, lun) = path
            .rsplit_once('/')
            .ok_or_else(|| bad(url, "missing LUN"))?;
        if target.is_empty() {
            return Err(bad(url, "empty target name"));
        }
        if target.contains('/') {
            return Err(bad(url, "target name must not contain '/'"));
        }
        let lun = lun
            .parse::<u32>()
            .map_err(|_| bad(url, &format!("LUN '{}' is not a number", lun)))?;

        Ok(IscsiUrl {
            portal,
            target: target.to_string(),
            lun,
            credentials,
        })
    }
}

/// Normalise `host[:port]` to `host:port`
fn parse_hostport(url: &str, hostport: &str) -> IscsiResult<String> {
    if hostport.is_empty() {
        return Err(bad(url, "empty host"));
    }

    let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
        let (host, after) = v6.split_once(']').ok_or_else(|| bad(url, "unterminated '['"))?;
        let port = match after {
            "" => None,
            p => Some(p.strip_prefix(':').ok_or_else(|| bad(url, "junk after IPv6 address"))?),
        };
        (format!("[{}]", host), port)
    } else {
        match hostport.split_once(':') {
            Some((host, port)) => (host.to_string(), Some(port)),
            None => (hostport.to_string(), None),
        }
    };

    let port = match port {
        None => ISCSI_PORT,
        Some(p) => p.parse::<u16>().map_err(|_| bad(url, &format!("bad port '{}'", p)))?,
    };
    Ok(format!("{}:{}", host, port))
}

impl fmt::Display for IscsiUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SCHEME)?;
        if let Some(chap) = &self.credentials {
            write!(f, "{}@", chap.username)?;
        }
        write!(f, "{}/{}/{}", self.portal, self.target, self.lun)
    }
}

impl std::str::FromStr for IscsiUrl {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IscsiUrl::parse(s)
    }
}

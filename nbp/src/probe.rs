use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How the initiator reaches the target. TCP sessions show up under an exact
/// by-path name, offloaded transports under a PCI-prefixed one that has to be
/// globbed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transport {
    #[default]
    Tcp,
    Other(String),
}

impl Transport {
    pub fn is_tcp(&self) -> bool {
        matches!(self, Transport::Tcp)
    }
}

impl From<String> for Transport {
    fn from(value: String) -> Self {
        if value.is_empty() || value.eq_ignore_ascii_case("tcp") {
            Transport::Tcp
        } else {
            Transport::Other(value)
        }
    }
}

impl From<&str> for Transport {
    fn from(value: &str) -> Self {
        Transport::from(value.to_string())
    }
}

impl From<Transport> for String {
    fn from(value: Transport) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Other(name) => write!(f, "{}", name),
        }
    }
}

/// Filesystem access used while waiting for a device node.
pub trait DeviceProbe {
    /// Succeeds when `path` exists.
    fn stat(&self, path: &str) -> io::Result<()>;

    /// Returns the sorted paths matching `pattern`.
    fn glob(&self, pattern: &str) -> io::Result<Vec<String>>;

    fn pause(&self, interval: Duration) {
        thread::sleep(interval)
    }
}

impl<P: DeviceProbe + ?Sized> DeviceProbe for &P {
    fn stat(&self, path: &str) -> io::Result<()> {
        (**self).stat(path)
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<String>> {
        (**self).glob(pattern)
    }

    fn pause(&self, interval: Duration) {
        (**self).pause(interval)
    }
}

#[derive(Debug, Default, Clone)]
pub struct HostProbe;

impl DeviceProbe for HostProbe {
    fn stat(&self, path: &str) -> io::Result<()> {
        fs::metadata(path).map(|_| ())
    }

    fn glob(&self, pattern: &str) -> io::Result<Vec<String>> {
        let path = Path::new(pattern);
        let dir = path.parent().unwrap_or(Path::new("/"));
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => return Ok(Vec::new()),
        };
        let re = glob_regex(&name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut matches = entries
            .filter_map(|res| res.ok())
            .filter(|entry| re.is_match(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path().to_string_lossy().to_string())
            .collect::<Vec<String>>();
        matches.sort();

        Ok(matches)
    }
}

/// Translates a single-component shell glob (`*`, `?`) into an anchored regex.
pub fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::from("^");
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if ch == '*' { "[^/]*" } else { "[^/]" });
            }
            _ => literal.push(ch),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');

    Regex::new(&expr)
}

/// Polls for `path` up to `max_attempts` times, `interval` apart.
///
/// Returns the resolved path on success. For non-TCP transports `path` is a
/// glob and the first match is returned. Only "not found" is retried; any
/// other probe error ends the wait at once. No pause follows the last attempt.
pub fn wait_for_path<P: DeviceProbe>(
    probe: &P,
    path: &str,
    max_attempts: u32,
    transport: &Transport,
    interval: Duration,
) -> Option<String> {
    for attempt in 0..max_attempts {
        let found = if transport.is_tcp() {
            match probe.stat(path) {
                Ok(()) => Some(path.to_string()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                Err(_) => return None,
            }
        } else {
            // several PCI links may expose the same target, only the first is used
            match probe.glob(path) {
                Ok(matches) => matches.into_iter().next(),
                Err(_) => return None,
            }
        };

        if found.is_some() {
            return found;
        }

        if attempt + 1 < max_attempts {
            probe.pause(interval);
        }
    }

    None
}

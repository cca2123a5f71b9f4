//! The route table produced by a config script.
//!
//! A table is immutable once built. Reloads build a new table and swap it in
//! whole; see [`crate::dispatch::Dispatcher::replace_table`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Var { name: String, constraint: Option<Regex> },
}

impl Segment {
    fn parse(pattern: &str, raw: &str) -> Result<Self, ConfigError> {
        let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) else {
            if raw.contains(['{', '}']) {
                return Err(invalid(pattern, format!("unbalanced braces in segment {raw:?}")));
            }
            return Ok(Segment::Literal(raw.to_string()));
        };

        let (name, constraint) = match inner.split_once(':') {
            Some((name, re)) => {
                let re = Regex::new(&format!("^(?:{re})$"))
                    .map_err(|e| invalid(pattern, e.to_string()))?;
                (name, Some(re))
            }
            None => (inner, None),
        };
        if name.is_empty() {
            return Err(invalid(pattern, "variable name is empty".to_string()));
        }
        Ok(Segment::Var {
            name: name.to_string(),
            constraint,
        })
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Segment::Literal(literal) => literal == value,
            Segment::Var { constraint, .. } => {
                !value.is_empty() && constraint.as_ref().map_or(true, |re| re.is_match(value))
            }
        }
    }
}

fn invalid(pattern: &str, reason: String) -> ConfigError {
    ConfigError::InvalidRoute {
        pattern: pattern.to_string(),
        reason,
    }
}

/// A path pattern such as `/users/{id:[0-9]+}/posts/{slug}`.
///
/// Each `{name}` binds exactly one path segment; `{name:re}` additionally
/// requires the whole segment to match `re`.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(invalid(pattern, "must start with '/'".to_string()));
        };
        let segments = rest
            .split('/')
            .map(|raw| Segment::parse(pattern, raw))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Variables bound by `path`, or `None` when it does not match.
    pub fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let parts: Vec<&str> = path.strip_prefix('/')?.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut vars = BTreeMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            if !segment.matches(part) {
                return None;
            }
            if let Segment::Var { name, .. } = segment {
                vars.insert(name.clone(), part.to_string());
            }
        }
        Some(vars)
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    /// Upper-case method names; empty matches every method.
    pub methods: Vec<String>,
    pub pattern: PathPattern,
    /// Script path relative to the table's root directory.
    pub script: String,
}

impl Route {
    pub fn new(methods: &[String], pattern: &str, script: &str) -> Result<Self, ConfigError> {
        let methods = methods
            .iter()
            .map(|m| normalize_method(m))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            methods,
            pattern: PathPattern::parse(pattern)?,
            script: script.to_string(),
        })
    }

    pub fn allows(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

fn normalize_method(method: &str) -> Result<String, ConfigError> {
    let valid = !method.is_empty() && method.bytes().all(|b| b.is_ascii_alphabetic());
    if !valid {
        return Err(ConfigError::InvalidMethod(method.to_string()));
    }
    Ok(method.to_ascii_uppercase())
}

/// Result of looking up a request in a [`RouteTable`].
#[derive(Debug)]
pub enum Lookup<'a> {
    Matched {
        route: &'a Route,
        vars: BTreeMap<String, String>,
    },
    /// Some route has this path, none accepts the method.
    MethodNotAllowed,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    /// Directory the config script was loaded from.
    pub root_dir: PathBuf,
    pub routes: Vec<Route>,
    /// Bindings predeclared in every routed script, in registration order.
    pub globals: Vec<(String, serde_json::Value)>,
    /// Mount point of the diagnostics endpoint, if enabled.
    pub profiler_path: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

impl RouteTable {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            routes: Vec::new(),
            globals: Vec::new(),
            profiler_path: None,
            loaded_at: Utc::now(),
        }
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Add or replace a global binding.
    pub fn set_global(&mut self, name: &str, value: serde_json::Value) {
        match self.globals.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.globals.push((name.to_string(), value)),
        }
    }

    /// First route, in registration order, that accepts both the path and the
    /// method.
    pub fn lookup(&self, method: &str, path: &str) -> Lookup<'_> {
        let mut path_matched = false;
        for route in &self.routes {
            let Some(vars) = route.pattern.matches(path) else {
                continue;
            };
            if route.allows(method) {
                return Lookup::Matched { route, vars };
            }
            path_matched = true;
        }
        if path_matched {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NotFound
        }
    }

    /// Whether `path` is the profiler mount point or lies below it.
    pub fn is_profiler_path(&self, path: &str) -> bool {
        let Some(mount) = self.profiler_path.as_deref() else {
            return false;
        };
        let mount = mount.trim_end_matches('/');
        path == mount
            || path
                .strip_prefix(mount)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

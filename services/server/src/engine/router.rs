//! Stream router: path patterns that bind schemas to stream families.
//!
//! A router descriptor enumerates stream definitions with concrete path
//! patterns such as `/chat/:chatId`. Each `:segment` placeholder matches one
//! path segment (`[^/]+`); patterns are compiled to anchored regexes once at
//! registration. On stream creation with no explicit schema key, the first
//! matching pattern supplies it; an explicit key always wins.

use crate::error::{StoreError, StoreResult};
use regex::Regex;

/// One stream definition inside a router descriptor.
#[derive(Debug, Clone)]
pub struct RouteDef {
    pub pattern: String,
    pub schema_key: String,
    pub schema: serde_json::Value,
    pub version: u64,
}

/// A compiled router.
pub struct StreamRouter {
    routes: Vec<CompiledRoute>,
}

struct CompiledRoute {
    def: RouteDef,
    regex: Regex,
}

impl StreamRouter {
    /// Compile a router descriptor. Patterns are kept in definition order;
    /// the first match wins.
    pub fn compile(defs: Vec<RouteDef>) -> StoreResult<Self> {
        let mut routes = Vec::with_capacity(defs.len());
        for def in defs {
            let regex = compile_pattern(&def.pattern)?;
            routes.push(CompiledRoute { def, regex });
        }
        Ok(StreamRouter { routes })
    }

    /// Find the first route whose pattern matches `path`.
    pub fn match_path(&self, path: &str) -> Option<&RouteDef> {
        self.routes
            .iter()
            .find(|r| r.regex.is_match(path))
            .map(|r| &r.def)
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteDef> {
        self.routes.iter().map(|r| &r.def)
    }
}

/// Compile one `/a/:b/c` pattern to an anchored regex.
fn compile_pattern(pattern: &str) -> StoreResult<Regex> {
    let mut out = String::from("^");
    for (i, segment) in pattern.split('/').enumerate() {
        if i > 0 {
            out.push('/');
        }
        if let Some(rest) = segment.strip_prefix(':') {
            if rest.is_empty() {
                return Err(StoreError::Internal(format!(
                    "empty placeholder in route pattern: {pattern}"
                )));
            }
            out.push_str("[^/]+");
        } else {
            out.push_str(&regex::escape(segment));
        }
    }
    out.push('$');
    Regex::new(&out)
        .map_err(|e| StoreError::Internal(format!("bad route pattern {pattern}: {e}")))
}

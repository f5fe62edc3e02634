//! Endpoint and annotation model.
//!
//! The application model declares the known HTTP endpoints as path templates
//! with typed parameters; the annotation model binds each endpoint's
//! parameters to input strings — already-rendered placeholders consumed by
//! the downstream load-testing tool (e.g. `${__GetRandomString(${Input_bar},;)}`).
//!
//! Template segments are literal, a single-segment placeholder `{name}`, or a
//! rest-of-path wildcard `{name:*}` that also matches further slashes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Kind of a declared endpoint parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Path,
    Query,
    Form,
    Body,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub id: String,
    /// Path template, e.g. `/foo/{bar}/{rest:*}`.
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// The declared application: the set of registered endpoint templates.
#[derive(Debug, Clone, Deserialize)]
pub struct Application {
    pub endpoints: Vec<Endpoint>,
}

/// Per-endpoint parameter bindings: endpoint id → parameter name → input string.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationModel {
    pub bindings: HashMap<String, HashMap<String, String>>,
}

impl Application {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading application model {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing application model {}", path.display()))
    }

    /// Map a concrete request path and method to a registered endpoint.
    ///
    /// Literal segments match exactly, `{x}` matches any single segment and
    /// `{x:*}` matches the remainder of the path including slashes.
    pub fn match_endpoint(&self, path: &str, method: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.method.eq_ignore_ascii_case(method) && template_matches(&e.path, path))
    }
}

impl AnnotationModel {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading annotation model {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing annotation model {}", path.display()))
    }

    /// Bindings registered for an endpoint, if any.
    pub fn bindings_for(&self, endpoint_id: &str) -> Option<&HashMap<String, String>> {
        self.bindings.get(endpoint_id)
    }
}

fn template_matches(template: &str, path: &str) -> bool {
    let mut tmpl_segments = split_segments(template).into_iter();
    let mut path_segments = split_segments(path).into_iter();

    loop {
        match tmpl_segments.next() {
            None => return path_segments.next().is_none(),
            Some(seg) => {
                if is_wildcard_placeholder(seg) {
                    // Consumes the rest of the path; requires at least one
                    // segment to be present.
                    return path_segments.next().is_some();
                }

                let candidate = match path_segments.next() {
                    Some(c) => c,
                    None => return false,
                };

                if is_placeholder(seg) {
                    continue;
                }
                if seg != candidate {
                    return false;
                }
            }
        }
    }
}

fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn is_placeholder(segment: &str) -> bool {
    segment.starts_with('{') && segment.ends_with('}')
}

fn is_wildcard_placeholder(segment: &str) -> bool {
    is_placeholder(segment) && segment.ends_with(":*}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn application() -> Application {
        serde_json::from_str(
            r#"{
                "endpoints": [
                    {
                        "id": "getItem",
                        "path": "/items/{id}",
                        "method": "GET",
                        "parameters": [{"name": "id", "type": "path"}]
                    },
                    {
                        "id": "files",
                        "path": "/foo/{bar}/{rest:*}",
                        "method": "GET",
                        "parameters": [
                            {"name": "bar", "type": "path"},
                            {"name": "rest", "type": "path"},
                            {"name": "id", "type": "query"}
                        ]
                    },
                    {
                        "id": "home",
                        "path": "/",
                        "method": "GET",
                        "parameters": []
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_literal_and_placeholder_match() {
        let app = application();
        assert_eq!(app.match_endpoint("/items/123", "GET").unwrap().id, "getItem");
        assert!(app.match_endpoint("/items/123/extra", "GET").is_none());
        assert!(app.match_endpoint("/other/123", "GET").is_none());
    }

    #[test]
    fn test_method_must_match() {
        let app = application();
        assert!(app.match_endpoint("/items/123", "POST").is_none());
        // Method comparison is case-insensitive.
        assert!(app.match_endpoint("/items/123", "get").is_some());
    }

    #[test]
    fn test_wildcard_matches_remainder() {
        let app = application();
        assert_eq!(app.match_endpoint("/foo/blub/whatever", "GET").unwrap().id, "files");
        assert_eq!(app.match_endpoint("/foo/blub/a/b/c", "GET").unwrap().id, "files");
        // The wildcard needs at least one segment.
        assert!(app.match_endpoint("/foo/blub", "GET").is_none());
    }

    #[test]
    fn test_root_template() {
        let app = application();
        assert_eq!(app.match_endpoint("/", "GET").unwrap().id, "home");
    }

    #[test]
    fn test_annotation_lookup() {
        let model: AnnotationModel = serde_json::from_str(
            r#"{"bindings": {"getItem": {"id": "${Input_id}"}}}"#,
        )
        .unwrap();
        assert_eq!(
            model.bindings_for("getItem").unwrap().get("id").unwrap(),
            "${Input_id}"
        );
        assert!(model.bindings_for("missing").is_none());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = Application::load(Path::new("/nonexistent/app.json")).unwrap_err();
        assert!(err.to_string().contains("application model"));
    }
}

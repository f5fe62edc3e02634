//! Endpoint annotation: rewrites concrete request paths into parameterized
//! templates bound to the declared endpoint model.
//!
//! A matched entry gets its path rebuilt from the endpoint's template
//! (placeholders substituted with the bound input strings), a query string
//! from the declared query parameters, and — for POST-like endpoints — a
//! JSON or multipart body. Entries that match no registered endpoint are
//! dropped before they reach the session state machine.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::{AnnotationModel, Application, Endpoint, ParameterKind};
use crate::pipeline::parser::LogEntry;

const APPLICATION_JSON: &str = "application/json";

const MULTIPART_BOUNDARY: &str = "XXXXXXXXXXXXX";

/// Line separator inside generated multipart bodies. The literal four
/// characters `\r\n`, expanded by the downstream load generator.
const PART_SEPARATOR: &str = "\\r\\n";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([^{]*)\}").expect("placeholder pattern is valid"))
}

/// Maps parsed entries onto the endpoint model, or passes them through
/// unchanged when no model was supplied.
pub enum Annotator {
    Noop,
    Model(ModelAnnotator),
}

pub struct ModelAnnotator {
    application: Application,
    annotation: AnnotationModel,
}

impl Annotator {
    pub fn noop() -> Self {
        Annotator::Noop
    }

    pub fn from_models(application: Application, annotation: AnnotationModel) -> Self {
        Annotator::Model(ModelAnnotator {
            application,
            annotation,
        })
    }

    /// Annotate an entry. `None` means the entry matched no registered
    /// endpoint (or its bindings are incomplete) and must be dropped.
    pub fn annotate(&self, entry: LogEntry) -> Option<LogEntry> {
        match self {
            Annotator::Noop => Some(entry),
            Annotator::Model(inner) => inner.annotate(entry),
        }
    }
}

impl ModelAnnotator {
    fn annotate(&self, entry: LogEntry) -> Option<LogEntry> {
        // The raw query is replaced by the declared query parameters.
        let path = entry.path.split('?').next().unwrap_or(&entry.path);

        let endpoint = match self.application.match_endpoint(path, &entry.method) {
            Some(e) => e,
            None => {
                tracing::debug!(method = %entry.method, path, "no matching endpoint, dropping entry");
                return None;
            }
        };

        let empty = HashMap::new();
        let inputs = self.annotation.bindings_for(&endpoint.id).unwrap_or(&empty);

        let (mut new_path, query) = match (
            annotated_path(&endpoint.path, inputs),
            query_string(endpoint, inputs),
        ) {
            (Some(p), Some(q)) => (p, q),
            _ => {
                tracing::warn!(endpoint = %endpoint.id, "incomplete bindings, dropping entry");
                return None;
            }
        };
        if !query.is_empty() {
            new_path.push('?');
            new_path.push_str(&query);
        }

        let mut new_entry = LogEntry::new(
            entry.session_key.clone(),
            entry.timestamp,
            entry.method.clone(),
            new_path,
        );
        new_entry.delay_ms = entry.delay_ms;
        apply_body(&mut new_entry, endpoint, inputs);

        Some(new_entry)
    }
}

/// Substitute every `{...}` placeholder of the template left to right,
/// stripping a trailing `:*` wildcard marker from the name before lookup.
/// Literal parts pass through unchanged.
fn annotated_path(template: &str, inputs: &HashMap<String, String>) -> Option<String> {
    let mut out = String::new();
    let mut last_end = 0;

    for caps in placeholder_pattern().captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let mut name = caps.get(1).expect("placeholder name group").as_str();
        if let Some(stripped) = name.strip_suffix(":*") {
            name = stripped;
        }

        out.push_str(&template[last_end..whole.start()]);
        out.push_str(inputs.get(name)?);
        last_end = whole.end();
    }

    out.push_str(&template[last_end..]);
    Some(out)
}

/// `name=value` pairs for all query parameters in declaration order.
fn query_string(endpoint: &Endpoint, inputs: &HashMap<String, String>) -> Option<String> {
    let mut parts = Vec::new();
    for param in &endpoint.parameters {
        if param.kind == ParameterKind::Query {
            let value = inputs.get(&param.name)?;
            parts.push(format!("{}={}", param.name, value));
        }
    }
    Some(parts.join("&"))
}

/// Body construction, mutually exclusive: a BODY parameter wins over FORM
/// parameters; neither leaves the defaults in place.
fn apply_body(entry: &mut LogEntry, endpoint: &Endpoint, inputs: &HashMap<String, String>) {
    let body_param = endpoint
        .parameters
        .iter()
        .find(|p| p.kind == ParameterKind::Body);
    let form_params: Vec<&str> = endpoint
        .parameters
        .iter()
        .filter(|p| p.kind == ParameterKind::Form)
        .map(|p| p.name.as_str())
        .collect();

    if let Some(param) = body_param {
        if let Some(value) = inputs.get(&param.name) {
            entry.body = value.clone();
            entry.content_type = APPLICATION_JSON.to_string();
        }
    } else if !form_params.is_empty() {
        entry.body = form_body(&form_params, inputs);
        entry.content_type = format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY);
    }
}

fn form_body(form_params: &[&str], inputs: &HashMap<String, String>) -> String {
    let mut body = String::new();

    for param in form_params {
        body.push_str("--");
        body.push_str(MULTIPART_BOUNDARY);
        body.push_str(PART_SEPARATOR);
        body.push_str(&format!("Content-Disposition: form-data; name=\"{}\"", param));
        body.push_str(PART_SEPARATOR);
        body.push_str("Content-Type: text/plain; charset=US-ASCII");
        body.push_str(PART_SEPARATOR);
        body.push_str("Content-Transfer-Encoding: 8bit");
        body.push_str(PART_SEPARATOR);
        body.push_str(PART_SEPARATOR);
        body.push_str(inputs.get(*param).map(String::as_str).unwrap_or_default());
        body.push_str(PART_SEPARATOR);
    }

    body.push_str("--");
    body.push_str(MULTIPART_BOUNDARY);
    body.push_str("--");

    body
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

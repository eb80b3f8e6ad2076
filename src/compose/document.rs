//! Single-document parsing and validation.
//!
//! Decodes one composition document into a [`ComposeFile`], collapsing the
//! multi-shape keys into canonical form and resolving service-level
//! `extends` directives against the same document.
//!
//! # Supported Shapes
//!
//! - `environment`: map of `KEY: value` (null unsets, numeric scalars
//!   keep their exact source text) or list of `KEY=value` / bare `KEY`
//!   (pass-through)
//! - `ports`: bare integer, `"HOST:CONTAINER"`, or bare string integer
//! - `volumes`: `"host:container[:ro|rw]"`
//! - `depends_on`: list of names or map of `name: {condition: ...}`
//! - `healthcheck`: `test` (string or `CMD`/`CMD-SHELL`/`NONE` vector),
//!   `interval`, `timeout`, `retries`, `disable`

use super::types::{
    validate_service_name, BindMount, ClusterImageStorage, ComposeFile, ComposeService,
    HealthProbe, HealthcheckSpec, PortBinding, Readiness, SchemaVersion, XKubeCompose,
};
use crate::constants::{
    DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_RETRIES, DEFAULT_PROBE_TIMEOUT, MAX_DOCUMENT_SIZE,
};
use crate::error::{Error, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

fn parse_err(path: &str, reason: impl Into<String>) -> Error {
    Error::Parse {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Parses one composition document.
pub fn parse_document(doc_path: &str, bytes: &[u8]) -> Result<ComposeFile> {
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(parse_err(
            doc_path,
            format!(
                "document size {} exceeds limit of {}",
                bytes.len(),
                MAX_DOCUMENT_SIZE
            ),
        ));
    }
    let source = std::str::from_utf8(bytes)
        .map_err(|e| parse_err(doc_path, format!("document is not valid UTF-8: {e}")))?;
    let source = preserve_environment_scalars(source);
    let doc: Value = serde_yaml::from_str(&source)
        .map_err(|e| parse_err(doc_path, format!("YAML decode failed: {e}")))?;
    let root = doc
        .as_mapping()
        .ok_or_else(|| parse_err(doc_path, "document root must be a mapping"))?;

    let version = parse_version(doc_path, root.get("version"))?;

    let mut raw_services: BTreeMap<String, RawService> = BTreeMap::new();
    if let Some(services) = root.get("services") {
        let services = services
            .as_mapping()
            .ok_or_else(|| parse_err(doc_path, "services must be a mapping"))?;
        for (key, value) in services {
            let name = key
                .as_str()
                .ok_or_else(|| parse_err(doc_path, "service names must be strings"))?;
            validate_service_name(name)?;
            let raw = parse_raw_service(doc_path, name, value)?;
            raw_services.insert(name.to_string(), raw);
        }
    }

    let mut services = BTreeMap::new();
    for name in raw_services.keys().cloned().collect::<Vec<_>>() {
        let mut stack = Vec::new();
        let resolved = resolve_extends(doc_path, &name, &raw_services, &mut stack)?;
        services.insert(name, resolved.normalize());
    }

    let x_kube_compose = match root.get("x-kube-compose") {
        Some(v) => Some(parse_extension(doc_path, v)?),
        None => None,
    };

    debug!(
        path = doc_path,
        version = %version,
        services = services.len(),
        "parsed composition document"
    );
    Ok(ComposeFile {
        path: doc_path.to_string(),
        version,
        services,
        x_kube_compose,
    })
}

fn parse_version(doc_path: &str, value: Option<&Value>) -> Result<SchemaVersion> {
    let value = value.ok_or_else(|| parse_err(doc_path, "missing top-level version"))?;
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(parse_err(doc_path, "version must be a string or number")),
    };
    let (major_text, minor_text) = match text.split_once('.') {
        Some((maj, min)) => (maj, Some(min)),
        None => (text.as_str(), None),
    };
    let major: u32 = major_text
        .parse()
        .map_err(|_| parse_err(doc_path, format!("unsupported version {text:?}")))?;
    let minor = match minor_text {
        Some(t) => Some(
            t.parse()
                .map_err(|_| parse_err(doc_path, format!("unsupported version {text:?}")))?,
        ),
        None => None,
    };
    if !(2..=3).contains(&major) {
        return Err(parse_err(doc_path, format!("unsupported version {text:?}")));
    }
    Ok(SchemaVersion { major, minor })
}

// =============================================================================
// Lexical Environment Capture
// =============================================================================

/// Quotes plain scalar values inside `environment` mappings before the
/// document is decoded.
///
/// The YAML decoder resolves unquoted scalars into native numbers, which
/// would destroy the source text of any variable wider than the native
/// types (`PI: 3.14159265358979323846264338327950288` would round to an
/// `f64`). Environment values must keep their exact lexical form, so they
/// are single-quoted up front and reach the parser as strings. Nulls and
/// booleans stay unquoted: null still unsets a variable and booleans are
/// still rejected with a diagnostic.
fn preserve_environment_scalars(source: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut env_indent: Option<usize> = None;
    for raw in source.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let trimmed = line.trim_start_matches(' ');
        let indent = line.len() - trimmed.len();
        if let Some(block) = env_indent {
            if !trimmed.is_empty() && !trimmed.starts_with('#') && indent <= block {
                env_indent = None;
            }
        }
        if env_indent.is_some() {
            out.push(quote_block_entry(line));
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("environment:") {
            let rest = rest.trim();
            if rest.is_empty() || rest.starts_with('#') {
                env_indent = Some(indent);
            } else if rest.starts_with('{') {
                out.push(quote_flow_entries(line));
                continue;
            }
        }
        out.push(line.to_string());
    }
    out.join("\n")
}

/// Quotes the value of one `KEY: value` block-mapping line.
fn quote_block_entry(line: &str) -> String {
    let trimmed = line.trim_start_matches(' ');
    // Comments, list entries, and quoted keys pass through untouched.
    if trimmed.is_empty() || trimmed.starts_with(['#', '-', '\'', '"']) {
        return line.to_string();
    }
    let Some(colon) = line.find(": ") else {
        return line.to_string();
    };
    let (head, rest) = line.split_at(colon + 2);
    let (value_raw, comment) = match rest.find(" #") {
        Some(pos) => rest.split_at(pos),
        None => (rest, ""),
    };
    let value = value_raw.trim();
    if !is_plain_value(value) {
        return line.to_string();
    }
    format!("{head}'{}'{comment}", value.replace('\'', "''"))
}

/// Quotes the values of a same-line flow mapping (`environment: {A: 1}`).
fn quote_flow_entries(line: &str) -> String {
    let (Some(open), Some(close)) = (line.find('{'), line.rfind('}')) else {
        return line.to_string();
    };
    if close < open {
        return line.to_string();
    }
    let body = &line[open + 1..close];
    // Nested collections or quoting inside the flow body would need a
    // real scanner; those bodies keep the decoder's resolution and the
    // parser's canonical rendering.
    if body.contains(['{', '[', '\'', '"']) {
        return line.to_string();
    }
    let entries: Vec<String> = body
        .split(',')
        .map(|entry| match entry.find(':') {
            Some(pos) => {
                let (key, rest) = entry.split_at(pos);
                let value = rest[1..].trim();
                if is_plain_value(value) {
                    format!("{key}: '{}'", value.replace('\'', "''"))
                } else {
                    entry.to_string()
                }
            }
            None => entry.to_string(),
        })
        .collect();
    format!(
        "{}{{{}}}{}",
        &line[..open],
        entries.join(", "),
        &line[close + 1..]
    )
}

/// True for plain scalars whose source text should be captured verbatim.
fn is_plain_value(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    // Null unsets a variable and booleans are rejected by the parser;
    // both must keep their resolved types.
    if matches!(
        value,
        "~" | "null" | "Null" | "NULL" | "true" | "True" | "TRUE" | "false" | "False" | "FALSE"
    ) {
        return false;
    }
    !value.starts_with(['\'', '"', '[', '{', '&', '*', '!', '|', '>'])
}

// =============================================================================
// Raw Service Decoding
// =============================================================================

/// One service as written, before `extends` resolution. `Option` fields
/// record whether the document set the key at all, which determines what an
/// extending service overrides.
#[derive(Debug, Clone, Default)]
struct RawService {
    image: Option<String>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
    user: Option<String>,
    environment: Option<BTreeMap<String, Option<String>>>,
    ports: Option<Vec<PortBinding>>,
    volumes: Option<Vec<BindMount>>,
    healthcheck: Option<HealthcheckSpec>,
    depends_on: Option<BTreeMap<String, Readiness>>,
    extends: Option<String>,
}

impl RawService {
    fn normalize(self) -> ComposeService {
        ComposeService {
            image: self.image,
            entrypoint: self.entrypoint,
            working_dir: self.working_dir,
            user: self.user,
            environment: self.environment.unwrap_or_default(),
            ports: self.ports.unwrap_or_default(),
            volumes: self.volumes.unwrap_or_default(),
            healthcheck: self.healthcheck,
            depends_on: self.depends_on.unwrap_or_default(),
        }
    }
}

fn parse_raw_service(doc_path: &str, name: &str, value: &Value) -> Result<RawService> {
    let map = value.as_mapping().ok_or_else(|| {
        parse_err(doc_path, format!("services.{name} must be a mapping"))
    })?;
    let mut raw = RawService {
        image: opt_string(doc_path, name, "image", map.get("image"))?,
        entrypoint: None,
        working_dir: opt_string(doc_path, name, "working_dir", map.get("working_dir"))?,
        user: opt_string(doc_path, name, "user", map.get("user"))?,
        ..RawService::default()
    };
    if let Some(v) = map.get("entrypoint") {
        raw.entrypoint = Some(parse_string_or_list(doc_path, name, "entrypoint", v)?);
    }
    if let Some(v) = map.get("environment") {
        raw.environment = Some(parse_environment(doc_path, name, v)?);
    }
    if let Some(v) = map.get("ports") {
        raw.ports = Some(parse_ports(doc_path, name, v)?);
    }
    if let Some(v) = map.get("volumes") {
        raw.volumes = Some(parse_volumes(doc_path, name, v)?);
    }
    if let Some(v) = map.get("healthcheck") {
        raw.healthcheck = Some(parse_healthcheck(doc_path, name, v)?);
    }
    if let Some(v) = map.get("depends_on") {
        raw.depends_on = Some(parse_depends_on(doc_path, name, v)?);
    }
    if let Some(v) = map.get("extends") {
        raw.extends = Some(parse_extends(doc_path, name, v)?);
    }
    Ok(raw)
}

fn opt_string(
    doc_path: &str,
    name: &str,
    key: &str,
    value: Option<&Value>,
) -> Result<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(parse_err(
            doc_path,
            format!("services.{name}.{key} must be a string"),
        )),
    }
}

fn parse_string_or_list(
    doc_path: &str,
    name: &str,
    key: &str,
    value: &Value,
) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(parse_err(
                    doc_path,
                    format!("services.{name}.{key} entries must be strings"),
                )),
            })
            .collect(),
        _ => Err(parse_err(
            doc_path,
            format!("services.{name}.{key} must be a string or a list of strings"),
        )),
    }
}

/// Normalizes an environment value to text.
///
/// Map values arrive as strings carrying their exact source text (the
/// document's environment scalars are quoted before decoding); an
/// explicit null means the variable is unset and the key is omitted.
/// Numbers can still surface from flow bodies the quoting pass skips and
/// render as the parsed value's decimal text.
fn parse_environment(
    doc_path: &str,
    name: &str,
    value: &Value,
) -> Result<BTreeMap<String, Option<String>>> {
    let mut env = BTreeMap::new();
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let key = k.as_str().ok_or_else(|| {
                    parse_err(
                        doc_path,
                        format!("services.{name}.environment keys must be strings"),
                    )
                })?;
                validate_env_key(doc_path, name, key)?;
                match v {
                    Value::Null => {}
                    Value::String(s) => {
                        env.insert(key.to_string(), Some(s.clone()));
                    }
                    Value::Number(n) => {
                        env.insert(key.to_string(), Some(n.to_string()));
                    }
                    Value::Bool(_) => {
                        return Err(parse_err(
                            doc_path,
                            format!(
                                "services.{name}.environment.{key} contains a boolean; quote the value"
                            ),
                        ))
                    }
                    _ => {
                        return Err(parse_err(
                            doc_path,
                            format!("services.{name}.environment.{key} must be a scalar"),
                        ))
                    }
                }
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                let entry = item.as_str().ok_or_else(|| {
                    parse_err(
                        doc_path,
                        format!("services.{name}.environment list entries must be strings"),
                    )
                })?;
                match entry.split_once('=') {
                    Some((key, val)) => {
                        validate_env_key(doc_path, name, key)?;
                        env.insert(key.to_string(), Some(val.to_string()));
                    }
                    // Bare KEY: value is passed through from the caller's
                    // environment.
                    None => {
                        validate_env_key(doc_path, name, entry)?;
                        env.insert(entry.to_string(), None);
                    }
                }
            }
        }
        _ => {
            return Err(parse_err(
                doc_path,
                format!("services.{name}.environment must be a mapping or a list"),
            ))
        }
    }
    Ok(env)
}

fn validate_env_key(doc_path: &str, name: &str, key: &str) -> Result<()> {
    if key.is_empty() || key.contains('=') {
        return Err(parse_err(
            doc_path,
            format!("services.{name}.environment has an invalid variable name {key:?}"),
        ));
    }
    Ok(())
}

fn parse_ports(doc_path: &str, name: &str, value: &Value) -> Result<Vec<PortBinding>> {
    let seq = value.as_sequence().ok_or_else(|| {
        parse_err(doc_path, format!("services.{name}.ports must be a list"))
    })?;
    let mut ports = Vec::with_capacity(seq.len());
    for item in seq {
        let binding = match item {
            Value::Number(n) => PortBinding {
                host: None,
                container: parse_port_number(doc_path, name, &n.to_string())?,
            },
            Value::String(s) => match s.split_once(':') {
                Some((host, container)) => PortBinding {
                    host: Some(parse_port_number(doc_path, name, host)?),
                    container: parse_port_number(doc_path, name, container)?,
                },
                None => PortBinding {
                    host: None,
                    container: parse_port_number(doc_path, name, s)?,
                },
            },
            _ => {
                return Err(parse_err(
                    doc_path,
                    format!("services.{name}.ports entries must be integers or strings"),
                ))
            }
        };
        ports.push(binding);
    }
    Ok(ports)
}

fn parse_port_number(doc_path: &str, name: &str, text: &str) -> Result<u16> {
    let port: u32 = text.trim().parse().map_err(|_| {
        parse_err(
            doc_path,
            format!("services.{name}.ports has a malformed port {text:?}"),
        )
    })?;
    if !(1..=65535).contains(&port) {
        return Err(parse_err(
            doc_path,
            format!("services.{name}.ports port {port} is out of range [1, 65535]"),
        ));
    }
    Ok(port as u16)
}

fn parse_volumes(doc_path: &str, name: &str, value: &Value) -> Result<Vec<BindMount>> {
    let seq = value.as_sequence().ok_or_else(|| {
        parse_err(doc_path, format!("services.{name}.volumes must be a list"))
    })?;
    let mut mounts = Vec::with_capacity(seq.len());
    for item in seq {
        let text = item.as_str().ok_or_else(|| {
            parse_err(
                doc_path,
                format!("services.{name}.volumes entries must be strings"),
            )
        })?;
        let parts: Vec<&str> = text.split(':').collect();
        let (host_path, container_path, read_only) = match parts.as_slice() {
            [host, container] => (*host, *container, false),
            [host, container, "ro"] => (*host, *container, true),
            [host, container, "rw"] => (*host, *container, false),
            _ => {
                return Err(parse_err(
                    doc_path,
                    format!(
                        "services.{name}.volumes entry {text:?} must be host:container[:ro|rw]"
                    ),
                ))
            }
        };
        if host_path.is_empty() {
            return Err(parse_err(
                doc_path,
                format!("services.{name}.volumes entry {text:?} has an empty host path"),
            ));
        }
        if !container_path.starts_with('/') {
            return Err(parse_err(
                doc_path,
                format!(
                    "services.{name}.volumes entry {text:?} must mount at an absolute container path"
                ),
            ));
        }
        mounts.push(BindMount {
            host_path: host_path.to_string(),
            container_path: container_path.to_string(),
            read_only,
        });
    }
    Ok(mounts)
}

fn parse_depends_on(
    doc_path: &str,
    name: &str,
    value: &Value,
) -> Result<BTreeMap<String, Readiness>> {
    let mut deps = BTreeMap::new();
    match value {
        Value::Sequence(seq) => {
            for item in seq {
                let target = item.as_str().ok_or_else(|| {
                    parse_err(
                        doc_path,
                        format!("services.{name}.depends_on list entries must be strings"),
                    )
                })?;
                validate_service_name(target)?;
                insert_dependency(&mut deps, target, Readiness::Started);
            }
        }
        Value::Mapping(map) => {
            for (k, v) in map {
                let target = k.as_str().ok_or_else(|| {
                    parse_err(
                        doc_path,
                        format!("services.{name}.depends_on keys must be strings"),
                    )
                })?;
                validate_service_name(target)?;
                let readiness = match v {
                    Value::Null => Readiness::Started,
                    Value::Mapping(cond) => match cond.get("condition").and_then(Value::as_str) {
                        Some("service_started") | None => Readiness::Started,
                        Some("service_healthy") => Readiness::Healthy,
                        Some(other) => {
                            return Err(parse_err(
                                doc_path,
                                format!(
                                    "services.{name}.depends_on.{target} has unsupported condition {other:?}"
                                ),
                            ))
                        }
                    },
                    _ => {
                        return Err(parse_err(
                            doc_path,
                            format!("services.{name}.depends_on.{target} must be a mapping"),
                        ))
                    }
                };
                insert_dependency(&mut deps, target, readiness);
            }
        }
        _ => {
            return Err(parse_err(
                doc_path,
                format!("services.{name}.depends_on must be a list or a mapping"),
            ))
        }
    }
    Ok(deps)
}

fn insert_dependency(deps: &mut BTreeMap<String, Readiness>, target: &str, readiness: Readiness) {
    deps.entry(target.to_string())
        .and_modify(|r| *r = (*r).max(readiness))
        .or_insert(readiness);
}

fn parse_healthcheck(doc_path: &str, name: &str, value: &Value) -> Result<HealthcheckSpec> {
    let map = value.as_mapping().ok_or_else(|| {
        parse_err(
            doc_path,
            format!("services.{name}.healthcheck must be a mapping"),
        )
    })?;
    if map.get("disable").and_then(Value::as_bool) == Some(true) {
        return Ok(HealthcheckSpec::Disabled);
    }
    let test = match map.get("test") {
        Some(Value::String(s)) => vec!["CMD-SHELL".to_string(), s.clone()],
        Some(Value::Sequence(seq)) => {
            let parts: Vec<String> = seq
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        parse_err(
                            doc_path,
                            format!("services.{name}.healthcheck.test entries must be strings"),
                        )
                    })
                })
                .collect::<Result<_>>()?;
            match parts.first().map(String::as_str) {
                Some("NONE") => return Ok(HealthcheckSpec::Disabled),
                Some("CMD") | Some("CMD-SHELL") => parts,
                _ => {
                    return Err(parse_err(
                        doc_path,
                        format!(
                            "services.{name}.healthcheck.test must start with CMD, CMD-SHELL or NONE"
                        ),
                    ))
                }
            }
        }
        Some(_) => {
            return Err(parse_err(
                doc_path,
                format!("services.{name}.healthcheck.test must be a string or a list"),
            ))
        }
        None => {
            return Err(parse_err(
                doc_path,
                format!("services.{name}.healthcheck requires a test"),
            ))
        }
    };
    let interval = parse_probe_duration(doc_path, name, map, "interval", DEFAULT_PROBE_INTERVAL)?;
    let timeout = parse_probe_duration(doc_path, name, map, "timeout", DEFAULT_PROBE_TIMEOUT)?;
    let retries = match map.get("retries") {
        None => DEFAULT_PROBE_RETRIES,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                parse_err(
                    doc_path,
                    format!("services.{name}.healthcheck.retries must be a non-negative integer"),
                )
            })?,
    };
    Ok(HealthcheckSpec::Probe(HealthProbe {
        test,
        interval,
        timeout,
        retries,
    }))
}

fn parse_probe_duration(
    doc_path: &str,
    name: &str,
    map: &serde_yaml::Mapping,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => {
            let text = v.as_str().ok_or_else(|| {
                parse_err(
                    doc_path,
                    format!("services.{name}.healthcheck.{key} must be a duration string"),
                )
            })?;
            parse_duration(text).ok_or_else(|| {
                parse_err(
                    doc_path,
                    format!("services.{name}.healthcheck.{key} has a malformed duration {text:?}"),
                )
            })
        }
    }
}

/// Parses durations of the form `1h2m3s`, `90s`, `500ms`.
fn parse_duration(text: &str) -> Option<Duration> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut chars = t.chars().peekable();
    while chars.peek().is_some() {
        let mut value: u64 = 0;
        let mut digits = 0usize;
        while let Some(c) = chars.peek().copied() {
            if let Some(d) = c.to_digit(10) {
                value = value.checked_mul(10)?.checked_add(u64::from(d))?;
                digits += 1;
                chars.next();
            } else {
                break;
            }
        }
        if digits == 0 {
            return None;
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied() {
            if c.is_ascii_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }
        total += match unit.as_str() {
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            "us" => Duration::from_micros(value),
            _ => return None,
        };
    }
    Some(total)
}

fn parse_extends(doc_path: &str, name: &str, value: &Value) -> Result<String> {
    let map = value.as_mapping().ok_or_else(|| {
        parse_err(
            doc_path,
            format!("services.{name}.extends must be a mapping"),
        )
    })?;
    if map.get("file").is_some() {
        return Err(parse_err(
            doc_path,
            format!("services.{name}.extends.file is not supported; extends resolves within the same document"),
        ));
    }
    map.get("service")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            parse_err(
                doc_path,
                format!("services.{name}.extends requires a service name"),
            )
        })
}

// =============================================================================
// Extends Resolution
// =============================================================================

/// Deep-copies the named base service and applies the extending service's
/// keys as overrides. Dependencies are never inherited.
fn resolve_extends(
    doc_path: &str,
    name: &str,
    raws: &BTreeMap<String, RawService>,
    stack: &mut Vec<String>,
) -> Result<RawService> {
    let raw = raws
        .get(name)
        .ok_or_else(|| {
            parse_err(
                doc_path,
                format!("extends references unknown service {name:?}"),
            )
        })?
        .clone();
    let Some(base_name) = raw.extends.clone() else {
        return Ok(raw);
    };
    if stack.iter().any(|n| n == name) {
        return Err(parse_err(
            doc_path,
            format!("extends cycle involving service {name:?}"),
        ));
    }
    stack.push(name.to_string());
    let base = resolve_extends(doc_path, &base_name, raws, stack)?;
    stack.pop();
    Ok(overlay(base, raw))
}

fn overlay(base: RawService, over: RawService) -> RawService {
    RawService {
        image: over.image.or(base.image),
        entrypoint: over.entrypoint.or(base.entrypoint),
        working_dir: over.working_dir.or(base.working_dir),
        user: over.user.or(base.user),
        environment: match (base.environment, over.environment) {
            (Some(mut b), Some(o)) => {
                b.extend(o);
                Some(b)
            }
            (b, o) => o.or(b),
        },
        ports: over.ports.or(base.ports),
        volumes: over.volumes.or(base.volumes),
        healthcheck: over.healthcheck.or(base.healthcheck),
        // depends_on is deliberately not inherited from the base service.
        depends_on: over.depends_on,
        extends: None,
    }
}

// =============================================================================
// Extension Block
// =============================================================================

fn parse_extension(doc_path: &str, value: &Value) -> Result<XKubeCompose> {
    let map = value
        .as_mapping()
        .ok_or_else(|| parse_err(doc_path, "x-kube-compose must be a mapping"))?;
    let mut ext = XKubeCompose::default();

    if let Some(v) = map.get("push_images") {
        let host = v
            .as_mapping()
            .and_then(|m| m.get("docker_registry"))
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                parse_err(
                    doc_path,
                    "x-kube-compose.push_images must be a mapping with a non-empty docker_registry host",
                )
            })?;
        ext.push_images = Some(host.to_string());
    }

    if let Some(v) = map.get("cluster_image_storage") {
        let storage = v.as_mapping().ok_or_else(|| {
            parse_err(doc_path, "x-kube-compose.cluster_image_storage must be a mapping")
        })?;
        let ty = storage
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                parse_err(doc_path, "x-kube-compose.cluster_image_storage requires a type")
            })?;
        ext.cluster_image_storage = Some(match ty {
            "docker" => {
                if storage.len() > 1 {
                    return Err(parse_err(
                        doc_path,
                        "x-kube-compose.cluster_image_storage of type docker takes no further keys",
                    ));
                }
                ClusterImageStorage::Docker
            }
            "docker_registry" => {
                let host = storage
                    .get("host")
                    .and_then(Value::as_str)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        parse_err(
                            doc_path,
                            "x-kube-compose.cluster_image_storage of type docker_registry requires a non-empty host",
                        )
                    })?;
                ClusterImageStorage::DockerRegistry {
                    host: host.to_string(),
                }
            }
            other => {
                return Err(parse_err(
                    doc_path,
                    format!("x-kube-compose.cluster_image_storage.type {other:?} is not supported"),
                ))
            }
        });
    }

    if let Some(v) = map.get("volume_init_base_image") {
        let image = v.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
            parse_err(
                doc_path,
                "x-kube-compose.volume_init_base_image must be a non-empty string",
            )
        })?;
        ext.volume_init_base_image = Some(image.to_string());
    }

    if ext.push_images.is_some() && ext.cluster_image_storage.is_some() {
        return Err(Error::Merge(format!(
            "{doc_path}: push_images and cluster_image_storage are mutually exclusive"
        )));
    }
    Ok(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<ComposeFile> {
        parse_document("/docker-compose.yml", yaml.as_bytes())
    }

    #[test]
    fn test_invalid_version_rejected() {
        assert!(matches!(parse("version: 'asdf'"), Err(Error::Parse { .. })));
        assert!(matches!(parse("version: '9'"), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_invalid_service_name_rejected() {
        let err = parse("version: '2'\nservices:\n  '!!':\n    image: ubuntu:latest\n");
        assert!(matches!(err, Err(Error::Name { .. })));
    }

    #[test]
    fn test_environment_shapes() {
        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    environment:\n      STR: hello\n      NUM: 8080\n      GONE: null\n",
        )
        .unwrap();
        let env = &file.services["app"].environment;
        assert_eq!(env.get("STR"), Some(&Some("hello".to_string())));
        assert_eq!(env.get("NUM"), Some(&Some("8080".to_string())));
        assert!(!env.contains_key("GONE"));

        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    environment:\n      - A=1\n      - PASSTHROUGH\n",
        )
        .unwrap();
        let env = &file.services["app"].environment;
        assert_eq!(env.get("A"), Some(&Some("1".to_string())));
        assert_eq!(env.get("PASSTHROUGH"), Some(&None));
    }

    #[test]
    fn test_environment_preserves_wide_number_lexical_form() {
        // Wider than f64 precision (and, for BIG, wider than u128): the
        // source text must survive unchanged.
        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    environment:\n      PI: 3.14159265358979323846264338327950288\n      BIG: 340282366920938463463374607431768211456\n      SMALL: -0.00000000000000000000000000000000001\n",
        )
        .unwrap();
        let env = &file.services["app"].environment;
        assert_eq!(
            env.get("PI"),
            Some(&Some("3.14159265358979323846264338327950288".to_string()))
        );
        assert_eq!(
            env.get("BIG"),
            Some(&Some("340282366920938463463374607431768211456".to_string()))
        );
        assert_eq!(
            env.get("SMALL"),
            Some(&Some("-0.00000000000000000000000000000000001".to_string()))
        );
    }

    #[test]
    fn test_environment_flow_mapping_preserves_lexical_form() {
        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    environment: {WIDE: 0.99999999999999999999999999, PLAIN: hi}\n",
        )
        .unwrap();
        let env = &file.services["app"].environment;
        assert_eq!(
            env.get("WIDE"),
            Some(&Some("0.99999999999999999999999999".to_string()))
        );
        assert_eq!(env.get("PLAIN"), Some(&Some("hi".to_string())));
    }

    #[test]
    fn test_preserve_environment_scalars_scope() {
        let source = "services:\n  app:\n    environment:\n      A: 1.5\n      GONE: null\n      FLAG: true\n      QUOTED: 'kept'\n    image: x\n";
        let quoted = preserve_environment_scalars(source);
        assert!(quoted.contains("A: '1.5'"));
        assert!(quoted.contains("GONE: null"));
        assert!(quoted.contains("FLAG: true"));
        assert!(quoted.contains("QUOTED: 'kept'"));
        // Keys outside the environment block are untouched.
        assert!(quoted.contains("image: x"));
    }

    #[test]
    fn test_environment_boolean_rejected() {
        let err = parse("version: '2'\nservices:\n  app:\n    environment:\n      FLAG: true\n");
        assert!(matches!(err, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_port_shapes() {
        let file = parse(
            "version: '2'\nservices:\n  app:\n    ports:\n      - 8080\n      - '9090'\n      - '80:8000'\n      - 8080\n",
        )
        .unwrap();
        let ports = &file.services["app"].ports;
        assert_eq!(
            ports,
            &vec![
                PortBinding { host: None, container: 8080 },
                PortBinding { host: None, container: 9090 },
                PortBinding { host: Some(80), container: 8000 },
                PortBinding { host: None, container: 8080 },
            ]
        );
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        let err = parse("version: '2'\nservices:\n  app:\n    ports: [65536]\n");
        assert!(matches!(err, Err(Error::Parse { .. })));
        let err = parse("version: '2'\nservices:\n  app:\n    ports: [0]\n");
        assert!(matches!(err, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_volume_shapes() {
        let file = parse(
            "version: '2'\nservices:\n  app:\n    volumes:\n      - ./data:/var/data\n      - /etc/cfg:/etc/cfg:ro\n",
        )
        .unwrap();
        let mounts = &file.services["app"].volumes;
        assert_eq!(mounts[0].host_path, "./data");
        assert!(!mounts[0].read_only);
        assert!(mounts[1].read_only);
    }

    #[test]
    fn test_depends_on_shapes() {
        let file = parse(
            "version: '2.4'\nservices:\n  a:\n    depends_on:\n      - b\n  b:\n    depends_on:\n      c:\n        condition: service_healthy\n  c: {}\n",
        )
        .unwrap();
        assert_eq!(
            file.services["a"].depends_on.get("b"),
            Some(&Readiness::Started)
        );
        assert_eq!(
            file.services["b"].depends_on.get("c"),
            Some(&Readiness::Healthy)
        );
    }

    #[test]
    fn test_healthcheck_string_test() {
        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    healthcheck:\n      test: curl -f localhost\n      interval: 1m30s\n      timeout: 10s\n      retries: 5\n",
        )
        .unwrap();
        let probe = file.services["app"]
            .healthcheck
            .as_ref()
            .unwrap()
            .probe()
            .unwrap();
        assert_eq!(probe.test, vec!["CMD-SHELL", "curl -f localhost"]);
        assert_eq!(probe.interval, Duration::from_secs(90));
        assert_eq!(probe.timeout, Duration::from_secs(10));
        assert_eq!(probe.retries, 5);
    }

    #[test]
    fn test_healthcheck_disable_and_none() {
        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    healthcheck:\n      disable: true\n",
        )
        .unwrap();
        assert_eq!(
            file.services["app"].healthcheck,
            Some(HealthcheckSpec::Disabled)
        );
        let file = parse(
            "version: '2.4'\nservices:\n  app:\n    healthcheck:\n      test: [\"NONE\"]\n",
        )
        .unwrap();
        assert_eq!(
            file.services["app"].healthcheck,
            Some(HealthcheckSpec::Disabled)
        );
    }

    #[test]
    fn test_extends_overrides_base() {
        let file = parse(
            "version: '2.4'\nservices:\n  base:\n    image: ubuntu:latest\n    environment:\n      A: base\n      B: base\n  child:\n    extends:\n      service: base\n    environment:\n      B: child\n",
        )
        .unwrap();
        let child = &file.services["child"];
        assert_eq!(child.image.as_deref(), Some("ubuntu:latest"));
        assert_eq!(child.environment["A"], Some("base".to_string()));
        assert_eq!(child.environment["B"], Some("child".to_string()));
    }

    #[test]
    fn test_extends_does_not_inherit_depends_on() {
        let file = parse(
            "version: '2.4'\nservices:\n  base:\n    image: ubuntu:latest\n    depends_on:\n      - other\n  child:\n    extends:\n      service: base\n  other: {}\n",
        )
        .unwrap();
        assert!(file.services["child"].depends_on.is_empty());
    }

    #[test]
    fn test_extends_cycle_rejected() {
        let err = parse(
            "version: '2.4'\nservices:\n  a:\n    extends:\n      service: b\n  b:\n    extends:\n      service: a\n",
        );
        assert!(matches!(err, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_extension_block() {
        let file = parse(
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: docker_registry\n    host: registry.example.com\n  volume_init_base_image: alpine:3.18\n",
        )
        .unwrap();
        let ext = file.x_kube_compose.unwrap();
        assert_eq!(
            ext.cluster_image_storage,
            Some(ClusterImageStorage::DockerRegistry {
                host: "registry.example.com".to_string()
            })
        );
        assert_eq!(ext.volume_init_base_image.as_deref(), Some("alpine:3.18"));
    }

    #[test]
    fn test_extension_legacy_push_images() {
        let file = parse(
            "version: '2'\nx-kube-compose:\n  push_images:\n    docker_registry: 'my-docker-registry.example.com'\n",
        )
        .unwrap();
        assert_eq!(
            file.x_kube_compose.unwrap().push_images.as_deref(),
            Some("my-docker-registry.example.com")
        );
    }

    #[test]
    fn test_extension_push_images_wrong_shape() {
        let err = parse("version: '2'\nx-kube-compose:\n  push_images: ''\n");
        assert!(matches!(err, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_extension_unknown_storage_type() {
        let err = parse(
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: invalid\n",
        );
        assert!(matches!(err, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_extension_registry_missing_host() {
        let err = parse(
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: docker_registry\n",
        );
        assert!(matches!(err, Err(Error::Parse { .. })));
    }

    #[test]
    fn test_extension_exclusive_keys_same_document() {
        let err = parse(
            "version: '2.4'\nx-kube-compose:\n  cluster_image_storage:\n    type: docker\n  push_images:\n    docker_registry: registry.example.com\n",
        );
        assert!(matches!(err, Err(Error::Merge(_))));
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("90"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration(""), None);
    }
}

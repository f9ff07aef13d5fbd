//! Hardened parsing of update server responses.
//!
//! The response document comes from the network, so parsing is defensive:
//! any document carrying an entity declaration is rejected before element
//! processing begins (entity expansion is a classic XML bomb vector), an
//! empty body is distinguished from a malformed one, and unknown elements
//! and attributes are ignored rather than fatal so the server can evolve.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::ErrorCode;
use crate::protocol::response::{
    Package, Response, RollbackKeyVersions, DEFAULT_MAX_FAILURE_COUNT_PER_URL,
};

/// Failures while interpreting a response document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Zero-length (or whitespace-only) response body.
    #[error("empty response document")]
    Empty,

    /// The document declares XML entities, which this client refuses to
    /// expand.
    #[error("response document contains an entity declaration")]
    EntityDecl,

    /// Not well-formed XML, or a required attribute failed to parse.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The server answered but flagged the app as failed.
    #[error("server reported status {status:?} for app {app_id}")]
    AppStatus { app_id: String, status: String },

    /// The document carried no `<app>` element for our application id.
    #[error("response has no result for app {0}")]
    MissingApp(String),
}

impl ParseError {
    /// The wire error code reported to the server for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ParseError::Empty => ErrorCode::OmahaRequestEmptyResponseError,
            ParseError::EntityDecl => ErrorCode::OmahaRequestXmlHasEntityDecl,
            ParseError::Malformed(_) => ErrorCode::OmahaRequestXmlParseError,
            ParseError::AppStatus { .. } | ParseError::MissingApp(_) => {
                ErrorCode::OmahaResponseInvalid
            }
        }
    }
}

#[derive(Debug, Default)]
struct PackageRecord {
    name: String,
    size: Option<u64>,
    hash: String,
    fingerprint: Option<String>,
}

/// Everything collected for one `<app>` element before assembly.
#[derive(Debug, Default)]
struct AppRecord {
    app_id: String,
    status: String,
    cohort: Option<String>,
    cohort_hint: Option<String>,
    cohort_name: Option<String>,
    updatecheck_status: Option<String>,
    updatecheck_attrs: HashMap<String, String>,
    url_codebases: Vec<String>,
    manifest_version: String,
    packages: Vec<PackageRecord>,
    action_attrs: HashMap<String, String>,
}

/// Raw element soup extracted by the event loop.
#[derive(Debug, Default)]
struct DocumentRecord {
    daystart_elapsed_seconds: Option<i64>,
    daystart_elapsed_days: Option<i64>,
    apps: Vec<AppRecord>,
}

fn attrs_to_map(element: &BytesStart<'_>) -> Result<HashMap<String, String>, ParseError> {
    let mut map = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| ParseError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| ParseError::Malformed(e.to_string()))?
            .to_string();
        map.insert(key, value);
    }
    Ok(map)
}

fn scan_document(document: &[u8]) -> Result<DocumentRecord, ParseError> {
    let mut reader = Reader::from_reader(document);
    reader.config_mut().trim_text(true);

    let mut record = DocumentRecord::default();
    let mut current_app: Option<AppRecord> = None;
    let mut in_updatecheck = false;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        match event {
            Event::DocType(text) => {
                let doctype = String::from_utf8_lossy(&text).to_ascii_uppercase();
                if doctype.contains("ENTITY") {
                    return Err(ParseError::EntityDecl);
                }
            }
            Event::Start(ref e) | Event::Empty(ref e) => {
                let self_closing = matches!(event, Event::Empty(_));
                let name = e.name();
                match name.as_ref() {
                    b"daystart" => {
                        let attrs = attrs_to_map(e)?;
                        record.daystart_elapsed_seconds =
                            attrs.get("elapsed_seconds").and_then(|v| v.parse().ok());
                        record.daystart_elapsed_days =
                            attrs.get("elapsed_days").and_then(|v| v.parse().ok());
                    }
                    b"app" => {
                        let attrs = attrs_to_map(e)?;
                        let app = AppRecord {
                            app_id: attrs.get("appid").cloned().unwrap_or_default(),
                            status: attrs.get("status").cloned().unwrap_or_default(),
                            cohort: attrs.get("cohort").cloned(),
                            cohort_hint: attrs.get("cohorthint").cloned(),
                            cohort_name: attrs.get("cohortname").cloned(),
                            ..Default::default()
                        };
                        if self_closing {
                            record.apps.push(app);
                        } else {
                            current_app = Some(app);
                        }
                    }
                    b"updatecheck" => {
                        if let Some(app) = current_app.as_mut() {
                            let attrs = attrs_to_map(e)?;
                            app.updatecheck_status = Some(
                                attrs.get("status").cloned().unwrap_or_default(),
                            );
                            app.updatecheck_attrs = attrs;
                            in_updatecheck = !self_closing;
                        }
                    }
                    b"url" => {
                        if let Some(app) = current_app.as_mut() {
                            if in_updatecheck {
                                let attrs = attrs_to_map(e)?;
                                if let Some(codebase) = attrs.get("codebase") {
                                    app.url_codebases.push(codebase.clone());
                                }
                            }
                        }
                    }
                    b"manifest" => {
                        if let Some(app) = current_app.as_mut() {
                            let attrs = attrs_to_map(e)?;
                            app.manifest_version =
                                attrs.get("version").cloned().unwrap_or_default();
                        }
                    }
                    b"package" => {
                        if let Some(app) = current_app.as_mut() {
                            let attrs = attrs_to_map(e)?;
                            app.packages.push(PackageRecord {
                                name: attrs.get("name").cloned().unwrap_or_default(),
                                size: attrs.get("size").and_then(|v| v.parse().ok()),
                                hash: attrs.get("hash_sha256").cloned().unwrap_or_default(),
                                fingerprint: attrs.get("fp").cloned(),
                            });
                        }
                    }
                    b"action" => {
                        if let Some(app) = current_app.as_mut() {
                            let attrs = attrs_to_map(e)?;
                            // Only the postinstall action carries payload
                            // attributes; other actions are legacy noise.
                            if attrs.get("event").map(String::as_str) == Some("postinstall") {
                                app.action_attrs = attrs;
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"app" => {
                    if let Some(app) = current_app.take() {
                        record.apps.push(app);
                    }
                }
                b"updatecheck" => in_updatecheck = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(record)
}

fn attr_bool(attrs: &HashMap<String, String>, key: &str) -> bool {
    attrs.get(key).map(String::as_str) == Some("true")
}

/// Parses a `"key.version"` pair like `"2.3"` into two u16 components.
fn parse_key_version(raw: &str) -> Option<(u16, u16)> {
    let (key, version) = raw.split_once('.')?;
    Some((key.parse().ok()?, version.parse().ok()?))
}

/// Joins a codebase prefix and a package file name with exactly one slash.
fn join_url(codebase: &str, name: &str) -> String {
    format!("{}/{}", codebase.trim_end_matches('/'), name)
}

fn packages_from_app(app: &AppRecord, can_exclude: bool) -> Result<Vec<Package>, ParseError> {
    let is_delta = attr_bool(&app.action_attrs, "IsDeltaPayload");
    let metadata_size: u64 = app
        .action_attrs
        .get("MetadataSize")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let metadata_signature = app.action_attrs.get("MetadataSignatureRsa").cloned();

    let mut packages = Vec::with_capacity(app.packages.len());
    for record in &app.packages {
        if record.name.is_empty() {
            return Err(ParseError::Malformed(format!(
                "package without a name in app {}",
                app.app_id
            )));
        }
        let size = record.size.ok_or_else(|| {
            ParseError::Malformed(format!("package {} has no valid size", record.name))
        })?;
        if size == 0 {
            return Err(ParseError::Malformed(format!(
                "package {} has zero size",
                record.name
            )));
        }
        packages.push(Package {
            payload_urls: app
                .url_codebases
                .iter()
                .map(|codebase| join_url(codebase, &record.name))
                .collect(),
            name: record.name.clone(),
            size,
            metadata_size,
            metadata_signature: metadata_signature.clone(),
            hash: record.hash.clone(),
            is_delta,
            fingerprint: record.fingerprint.clone(),
            app_id: app.app_id.clone(),
            can_exclude,
        });
    }
    Ok(packages)
}

/// Interprets a response document for `app_id` (and optionally a second
/// `system_app_id` whose packages ride along).
///
/// `ping_only` requests carry no `<updatecheck>`, so the result then only
/// reports daystart and cohort bookkeeping with `update_exists == false`.
pub fn parse_response(
    document: &[u8],
    app_id: &str,
    system_app_id: Option<&str>,
    ping_only: bool,
) -> Result<Response, ParseError> {
    if document.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }

    let record = scan_document(document)?;

    let primary = record
        .apps
        .iter()
        .find(|app| app.app_id == app_id)
        .ok_or_else(|| ParseError::MissingApp(app_id.to_string()))?;

    if primary.status != "ok" {
        return Err(ParseError::AppStatus {
            app_id: primary.app_id.clone(),
            status: primary.status.clone(),
        });
    }

    let mut response = Response {
        daystart_elapsed_seconds: record.daystart_elapsed_seconds,
        daystart_elapsed_days: record.daystart_elapsed_days,
        cohort: primary.cohort.clone(),
        cohort_hint: primary.cohort_hint.clone(),
        cohort_name: primary.cohort_name.clone(),
        max_failure_count_per_url: DEFAULT_MAX_FAILURE_COUNT_PER_URL,
        ..Default::default()
    };
    response.eol_status = primary.updatecheck_attrs.get("_eol").cloned();

    if ping_only {
        return Ok(response);
    }

    let check_status = primary.updatecheck_status.clone().unwrap_or_default();
    match check_status.as_str() {
        "noupdate" => return Ok(response),
        "ok" => {}
        other => {
            return Err(ParseError::AppStatus {
                app_id: primary.app_id.clone(),
                status: other.to_string(),
            })
        }
    }

    response.update_exists = true;
    response.version = primary.manifest_version.clone();
    if response.version.is_empty() {
        return Err(ParseError::Malformed(
            "update offered without a manifest version".to_string(),
        ));
    }
    response.packages = packages_from_app(primary, false)?;
    if response.packages.is_empty() {
        return Err(ParseError::Malformed(
            "update offered without any package".to_string(),
        ));
    }

    // A second tracked app contributes excludable packages; its parse
    // failure does not abort the primary update, but an explicit
    // "noupdate" from it holds the whole update back.
    let mut system_has_update = false;
    if let Some(system_id) = system_app_id {
        match record.apps.iter().find(|app| app.app_id == system_id) {
            Some(system) if system.status == "ok" => {
                match system.updatecheck_status.as_deref() {
                    Some("ok") => match packages_from_app(system, true) {
                        Ok(mut packages) => {
                            response.packages.append(&mut packages);
                            response.system_version = Some(system.manifest_version.clone());
                            system_has_update = !attr_bool(&system.action_attrs, "noupdate");
                        }
                        Err(e) => {
                            warn!(app_id = system_id, error = %e, "skipping system app packages")
                        }
                    },
                    Some("noupdate") => {
                        info!(app_id = system_id, "system app has no update, holding back");
                        response.update_exists = false;
                        response.version = String::new();
                        response.packages = Vec::new();
                        return Ok(response);
                    }
                    _ => warn!(app_id = system_id, "system app did not offer an update"),
                }
            }
            Some(system) => warn!(
                app_id = system_id,
                status = system.status,
                "system app entry not usable"
            ),
            None => warn!(app_id = system_id, "no response entry for system app"),
        }
    }

    // noupdate="true" on the postinstall action marks an update to self;
    // it only proceeds when some other app carries a real update.
    if attr_bool(&primary.action_attrs, "noupdate") && !system_has_update {
        info!(app_id, "update to self only, treating as no update");
        response.update_exists = false;
        response.version = String::new();
        response.packages = Vec::new();
        return Ok(response);
    }

    let action = &primary.action_attrs;
    response.more_info_url = action.get("MoreInfo").cloned().unwrap_or_default();
    response.prompt = attr_bool(action, "Prompt");
    response.deadline = action.get("deadline").cloned().unwrap_or_default();
    response.max_days_to_scatter = action
        .get("MaxDaysToScatter")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if let Some(limit) = action
        .get("MaxFailureCountPerUrl")
        .and_then(|v| v.parse().ok())
    {
        response.max_failure_count_per_url = limit;
    }
    response.disable_payload_backoff = attr_bool(action, "DisablePayloadBackoff");
    response.disable_p2p_for_downloading = attr_bool(action, "DisableP2PForDownloading");
    response.disable_p2p_for_sharing = attr_bool(action, "DisableP2PForSharing");
    response.disable_repeated_updatechecks = attr_bool(action, "DisableRepeatedUpdatechecks");
    response.public_key_rsa = action.get("PublicKeyRsa").cloned().unwrap_or_default();
    response.powerwash_required = attr_bool(action, "PowerwashRequired");
    response.poll_interval_seconds = action.get("PollInterval").and_then(|v| v.parse().ok());

    response.is_rollback = attr_bool(&primary.updatecheck_attrs, "_rollback");
    let mut key_versions = RollbackKeyVersions::default();
    if let Some((key, version)) = primary
        .updatecheck_attrs
        .get("_firmware_version")
        .and_then(|v| parse_key_version(v))
    {
        key_versions.firmware_key = key;
        key_versions.firmware = version;
    }
    if let Some((key, version)) = primary
        .updatecheck_attrs
        .get("_kernel_version")
        .and_then(|v| parse_key_version(v))
    {
        key_versions.kernel_key = key;
        key_versions.kernel = version;
    }
    response.rollback_key_versions = key_versions;

    Ok(response)
}

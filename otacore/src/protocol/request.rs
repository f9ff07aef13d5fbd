//! Outgoing request assembly.
//!
//! Requests are small, flat XML documents built by direct string assembly
//! with attribute escaping. Three shapes exist: an update check (optionally
//! carrying ping attributes), a ping-only request, and an event report.

use crate::errors::ErrorCode;

/// Protocol version sent in the `<request>` element.
pub const PROTOCOL_VERSION: &str = "3.0";

/// Ping value meaning "first ping ever sent from this install".
pub const PING_NEVER: i64 = -1;
/// Ping value meaning "the clock jumped backwards since the last ping".
pub const PING_TIME_JUMP: i64 = -2;

/// Events reported to the server at attempt stage boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Install (first-time) finished.
    InstallComplete,
    /// Update attempt reached a terminal state.
    UpdateComplete,
    /// Payload download is about to begin.
    UpdateDownloadStarted,
    /// Payload download finished successfully.
    UpdateDownloadFinished,
    /// First check after booting into an updated image.
    RebootedAfterUpdate,
}

impl EventType {
    pub fn code(self) -> u32 {
        match self {
            EventType::InstallComplete => 2,
            EventType::UpdateComplete => 3,
            EventType::UpdateDownloadStarted => 13,
            EventType::UpdateDownloadFinished => 14,
            EventType::RebootedAfterUpdate => 54,
        }
    }
}

/// Outcome attribute of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Error,
    Success,
    SuccessReboot,
    UpdateDeferred,
}

impl EventResult {
    pub fn code(self) -> u32 {
        match self {
            EventResult::Error => 0,
            EventResult::Success => 1,
            EventResult::SuccessReboot => 2,
            EventResult::UpdateDeferred => 9,
        }
    }
}

/// One `<event>` element.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub result: EventResult,
    pub error_code: ErrorCode,
    /// Sent with [`EventType::RebootedAfterUpdate`]: the version the
    /// device updated away from.
    pub previous_version: Option<String>,
}

impl Event {
    pub fn success(event_type: EventType) -> Self {
        Self {
            event_type,
            result: EventResult::Success,
            error_code: ErrorCode::Success,
            previous_version: None,
        }
    }

    pub fn error(event_type: EventType, error_code: ErrorCode) -> Self {
        Self {
            event_type,
            result: EventResult::Error,
            error_code,
            previous_version: None,
        }
    }
}

/// Static identity of this client and device, the same for every request.
#[derive(Debug, Clone)]
pub struct RequestParams {
    /// Server endpoint for update checks and events.
    pub update_url: String,
    /// Primary application id.
    pub app_id: String,
    /// Optional second application id checked in the same request (e.g. a
    /// firmware blob tracked alongside the OS).
    pub system_app_id: Option<String>,
    /// Currently running version.
    pub app_version: String,
    /// Release channel, e.g. `"stable-channel"`.
    pub channel: String,
    /// Board / platform name.
    pub board: String,
    /// Hardware class string, empty when unknown.
    pub hardware_class: String,
    /// Whether the client can apply delta payloads from this version.
    pub delta_okay: bool,
    /// True for user-initiated checks, false for the background scheduler.
    pub interactive: bool,
    /// Version prefix the device is pinned to, empty for none.
    pub target_version_prefix: String,
    /// Whether the server may respond with an enterprise rollback image.
    pub rollback_allowed: bool,
}

/// Per-request dynamic state merged into the XML.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// `a=` ping attribute (days since last active ping), omitted if
    /// `None`. [`PING_NEVER`] and [`PING_TIME_JUMP`] are valid values.
    pub ping_active_days: Option<i64>,
    /// `r=` ping attribute (days since last roll-call ping).
    pub ping_roll_call_days: Option<i64>,
    /// When set, the request reports this event and carries no
    /// `<updatecheck>` or `<ping>`.
    pub event: Option<Event>,
    /// Skip the `<updatecheck>` element (ping-only request).
    pub ping_only: bool,
    /// First check after booting a freshly applied update: piggybacks a
    /// reboot event carrying the version updated away from.
    pub previous_version: Option<String>,
    /// Days-since-epoch install date, echoed when known.
    pub install_date_days: Option<i64>,
    /// Cohort values previously persisted from responses.
    pub cohort: Option<String>,
    pub cohort_hint: Option<String>,
    pub cohort_name: Option<String>,
}

impl RequestContext {
    pub fn for_event(event: Event) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }

    fn has_ping(&self) -> bool {
        self.ping_active_days.is_some() || self.ping_roll_call_days.is_some()
    }
}

/// Escapes a string for use in XML attribute values and text nodes.
pub fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Cohort values are echoed verbatim into request attributes, so bound
/// what we are willing to store: printable ASCII, at most 1024 bytes.
pub fn is_valid_cohort(value: &str) -> bool {
    value.len() <= 1024 && value.chars().all(|c| (' '..='~').contains(&c))
}

/// Serializes the full request document.
pub fn build_request_xml(params: &RequestParams, ctx: &RequestContext) -> String {
    let mut xml = String::with_capacity(1024);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<request protocol=\"{}\" version=\"{}\" updaterversion=\"{}\" \
         installsource=\"{}\" ismachine=\"1\">\n",
        PROTOCOL_VERSION,
        xml_escape(&updater_version()),
        xml_escape(&updater_version()),
        if params.interactive {
            "ondemandupdate"
        } else {
            "scheduler"
        },
    ));
    xml.push_str(&format!(
        "    <os version=\"Indy\" platform=\"{}\" sp=\"{}\"></os>\n",
        xml_escape(&params.board),
        xml_escape(&format!("{}_{}", params.app_version, arch_name())),
    ));

    xml.push_str(&app_xml(params, ctx, &params.app_id, true));
    if let Some(system_app_id) = &params.system_app_id {
        xml.push_str(&app_xml(params, ctx, system_app_id, false));
    }

    xml.push_str("</request>\n");
    xml
}

fn updater_version() -> String {
    format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

fn arch_name() -> &'static str {
    std::env::consts::ARCH
}

fn app_xml(params: &RequestParams, ctx: &RequestContext, app_id: &str, primary: bool) -> String {
    let mut attrs = format!(
        "appid=\"{}\" version=\"{}\" track=\"{}\" board=\"{}\" \
         hardware_class=\"{}\" delta_okay=\"{}\" lang=\"en-US\"",
        xml_escape(app_id),
        xml_escape(&params.app_version),
        xml_escape(&params.channel),
        xml_escape(&params.board),
        xml_escape(&params.hardware_class),
        params.delta_okay,
    );
    // Cohorts and install date only make sense on the primary app.
    if primary {
        if let Some(days) = ctx.install_date_days {
            attrs.push_str(&format!(" installdate=\"{}\"", days));
        }
        if let Some(cohort) = &ctx.cohort {
            attrs.push_str(&format!(" cohort=\"{}\"", xml_escape(cohort)));
        }
        if let Some(hint) = &ctx.cohort_hint {
            attrs.push_str(&format!(" cohorthint=\"{}\"", xml_escape(hint)));
        }
        if let Some(name) = &ctx.cohort_name {
            attrs.push_str(&format!(" cohortname=\"{}\"", xml_escape(name)));
        }
    }

    let mut body = String::new();
    if let Some(event) = &ctx.event {
        let mut event_attrs = format!(
            "eventtype=\"{}\" eventresult=\"{}\"",
            event.event_type.code(),
            event.result.code(),
        );
        if event.error_code != ErrorCode::Success {
            event_attrs.push_str(&format!(" errorcode=\"{}\"", event.error_code.code()));
        }
        if let Some(previous) = &event.previous_version {
            event_attrs.push_str(&format!(" previousversion=\"{}\"", xml_escape(previous)));
        }
        body.push_str(&format!("        <event {}></event>\n", event_attrs));
    } else {
        if primary && ctx.has_ping() {
            let mut ping_attrs = String::from("active=\"1\"");
            if let Some(a) = ctx.ping_active_days {
                ping_attrs.push_str(&format!(" a=\"{}\"", a));
            }
            if let Some(r) = ctx.ping_roll_call_days {
                ping_attrs.push_str(&format!(" r=\"{}\"", r));
            }
            body.push_str(&format!("        <ping {}></ping>\n", ping_attrs));
        }
        if primary && !ctx.ping_only {
            if let Some(previous) = &ctx.previous_version {
                body.push_str(&format!(
                    "        <event eventtype=\"{}\" eventresult=\"{}\" \
                     previousversion=\"{}\"></event>\n",
                    EventType::RebootedAfterUpdate.code(),
                    EventResult::SuccessReboot.code(),
                    xml_escape(previous),
                ));
            }
        }
        if !ctx.ping_only {
            let mut check_attrs = String::new();
            if !params.target_version_prefix.is_empty() {
                check_attrs.push_str(&format!(
                    " targetversionprefix=\"{}\"",
                    xml_escape(&params.target_version_prefix)
                ));
            }
            if params.rollback_allowed {
                check_attrs.push_str(" rollback_allowed=\"true\"");
            }
            body.push_str(&format!("        <updatecheck{}></updatecheck>\n", check_attrs));
        }
    }

    format!("    <app {}>\n{}    </app>\n", attrs, body)
}

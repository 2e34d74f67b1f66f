use std::fmt::Write as _;

use anyhow::Context;
use askama::Template;
use chrono::DateTime;
use clap::ValueEnum;
use serde::Serialize;
use serde_json::{Map, Value};
use transcript::{ConversationRecord, Transcript, TranscriptEntry};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum DisplayStyle {
    /// Roles and text only; system messages hidden.
    Default,
    /// One line per message with its timestamp.
    Irc,
    /// Every header field, timestamped messages.
    Full,
    /// Stored fields and raw mapping nodes.
    Raw,
}

impl DisplayStyle {
    pub fn divider(self) -> Option<String> {
        match self {
            DisplayStyle::Irc => Some("--".to_string()),
            DisplayStyle::Full => Some("-".repeat(79)),
            DisplayStyle::Default | DisplayStyle::Raw => None,
        }
    }

    fn blank_between_messages(self) -> bool {
        self != DisplayStyle::Irc
    }

    fn timestamps(self) -> bool {
        matches!(self, DisplayStyle::Irc | DisplayStyle::Full)
    }

    pub fn label(self, role: &str) -> Option<String> {
        match (self, role) {
            (DisplayStyle::Default, "system") => None,
            (DisplayStyle::Default, "assistant") => Some("ChatGPT".to_string()),
            _ => Some(role.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExportFormat {
    Text,
    Html,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Text => "txt",
            ExportFormat::Html => "html",
            ExportFormat::Json => "json",
        }
    }
}

pub struct ConversationView {
    pub fields: Vec<(String, Option<String>)>,
    pub record: ConversationRecord,
    pub transcript: Transcript,
}

impl ConversationView {
    pub fn from_fields(fields: Vec<(String, Option<String>)>) -> Self {
        let record = ConversationRecord::from_fields(
            fields.iter().map(|(k, v)| (k.as_str(), v.as_deref())),
        );
        let transcript = record.transcript();
        Self {
            fields,
            record,
            transcript,
        }
    }

    fn title(&self) -> &str {
        self.record
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("Untitled conversation")
    }
}

pub fn format_time(secs: Option<f64>) -> String {
    secs.and_then(|s| {
        let whole = s.floor();
        let nanos = ((s - whole) * 1e9) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
    })
    .map(|t| t.format(TIME_FORMAT).to_string())
    .unwrap_or_else(|| "-".to_string())
}

pub fn render_text(view: &ConversationView, style: DisplayStyle) -> String {
    let mut out = String::new();
    render_header(&mut out, view, style);
    out.push('\n');
    render_messages(&mut out, view, style);
    out
}

pub fn render_many(views: &[ConversationView], style: DisplayStyle) -> String {
    let divider = style.divider();
    let mut out = String::new();
    for (i, view) in views.iter().enumerate() {
        if i > 0
            && let Some(divider) = &divider
        {
            out.push_str(divider);
            out.push('\n');
        }
        out.push_str(&render_text(view, style));
    }
    out
}

fn render_header(out: &mut String, view: &ConversationView, style: DisplayStyle) {
    let record = &view.record;
    if style == DisplayStyle::Raw {
        for (key, value) in &view.fields {
            if key != "mapping" {
                let _ = writeln!(out, "{key}: {}", value.as_deref().unwrap_or(""));
            }
        }
        return;
    }
    let _ = writeln!(out, "Title: {}", view.title());
    let _ = writeln!(out, "ID: {}", record.id);
    if style != DisplayStyle::Default {
        let _ = writeln!(out, "Create time: {}", format_time(record.create_time));
        let _ = writeln!(out, "Update time: {}", format_time(record.update_time));
    }
    if style == DisplayStyle::Full {
        let _ = writeln!(
            out,
            "Current node: {}",
            record.current_node.as_deref().unwrap_or("-")
        );
        for (key, value) in &record.extra {
            let _ = writeln!(out, "{key}: {}", value.as_deref().unwrap_or(""));
        }
    }
}

fn render_messages(out: &mut String, view: &ConversationView, style: DisplayStyle) {
    for entry in &view.transcript.entries {
        if style == DisplayStyle::Raw {
            let node = view
                .record
                .node(&entry.node_id)
                .map(|n| n.raw.to_string())
                .unwrap_or_default();
            let _ = writeln!(out, "node: {node}");
        } else {
            let Some(label) = style.label(&entry.role) else {
                continue;
            };
            if style.timestamps() {
                let _ = writeln!(
                    out,
                    "{} <{label}> {}",
                    format_time(entry.create_time),
                    entry.text
                );
            } else {
                let _ = writeln!(out, "{label}: {}", entry.text);
            }
        }
        if style.blank_between_messages() {
            out.push('\n');
        }
    }
}

struct PageMessage {
    heading: String,
    text: String,
    is_user: bool,
}

#[derive(Template)]
#[template(path = "conversation.html")]
struct ConversationPage<'a> {
    title: &'a str,
    meta: String,
    messages: Vec<PageMessage>,
}

pub fn render_html(view: &ConversationView, style: DisplayStyle) -> anyhow::Result<String> {
    let record = &view.record;
    let messages: Vec<PageMessage> = view
        .transcript
        .entries
        .iter()
        .filter_map(|entry| {
            let label = style.label(&entry.role)?;
            let heading = if style.timestamps() {
                format!("{label} · {}", format_time(entry.create_time))
            } else {
                label
            };
            Some(PageMessage {
                heading,
                text: entry.text.clone(),
                is_user: entry.role == "user",
            })
        })
        .collect();
    let mut meta = format!("Conversation {}", record.id);
    if style != DisplayStyle::Default {
        let _ = write!(
            meta,
            " · created {} · updated {}",
            format_time(record.create_time),
            format_time(record.update_time)
        );
    }
    let _ = write!(meta, " · {} messages", messages.len());
    ConversationPage {
        title: view.title(),
        meta,
        messages,
    }
    .render()
    .with_context(|| format!("rendering conversation {} as HTML", record.id))
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    id: &'a str,
    title: Option<&'a str>,
    create_time: Option<f64>,
    update_time: Option<f64>,
    current_node: Option<&'a str>,
    fields: Map<String, Value>,
    messages: &'a [TranscriptEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    issue: Option<String>,
}

pub fn render_json(view: &ConversationView) -> anyhow::Result<String> {
    let record = &view.record;
    let fields = record
        .extra
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                v.clone().map_or(Value::Null, Value::String),
            )
        })
        .collect();
    let doc = ExportDocument {
        id: &record.id,
        title: record.title.as_deref(),
        create_time: record.create_time,
        update_time: record.update_time,
        current_node: record.current_node.as_deref(),
        fields,
        messages: &view.transcript.entries,
        issue: view.transcript.issue.as_ref().map(ToString::to_string),
    };
    serde_json::to_string_pretty(&doc).with_context(|| "serializing conversation")
}

pub fn render(
    view: &ConversationView,
    format: ExportFormat,
    style: DisplayStyle,
) -> anyhow::Result<String> {
    match format {
        ExportFormat::Text => Ok(render_text(view, style)),
        ExportFormat::Html => render_html(view, style),
        ExportFormat::Json => render_json(view),
    }
}

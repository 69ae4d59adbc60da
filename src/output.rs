//! Text and JSON rendering of decoded frames

use crate::batch::Frame;
use crate::event::{Body, Event, Http};
use crate::variable::{Value, VariableInfo};
use crate::wire::EncodedStr;
use std::fmt::Write;

fn lossy(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

fn value_text(value: &Value<'_>) -> String {
    match value {
        Value::Void => "void".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Byte(v) => v.to_string(),
        Value::Short(v) => v.to_string(),
        Value::UShort(v) => v.to_string(),
        Value::Int32(v) => v.to_string(),
        Value::UInt32(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::ULong(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::String(s) => format!("{:?}", s.to_string_lossy()),
        Value::EmptyString => "\"\"".to_string(),
        Value::NullString | Value::NullObject => "nil".to_string(),
        Value::LargeString(bytes) => format!("{:?}", lossy(bytes)),
    }
}

fn variable_text(var: &VariableInfo<'_>) -> String {
    if var.name.is_empty() {
        value_text(&var.value)
    } else {
        format!("{}={}", lossy(&var.name), value_text(&var.value))
    }
}

fn encoded_text(s: &EncodedStr<'_>) -> String {
    s.value.to_string_lossy()
}

fn http_text(http: &Http<'_>) -> String {
    format!(
        "{} {} -> {} ({}us)",
        lossy(http.verb.wire_bytes()),
        http.url.to_string_lossy(),
        http.status,
        http.duration
    )
}

/// One-line description of an event's payload
pub fn describe(body: &Body<'_>) -> String {
    match body {
        Body::Begin {
            function_id,
            instance_id,
            args,
        } => {
            let args: Vec<String> = args.iter().map(variable_text).collect();
            format!("fn={} self={} ({})", function_id, instance_id, args.join(", "))
        }
        Body::End {
            function_id,
            tail_call,
            return_value,
        } => {
            let tail = if *tail_call { " tail" } else { "" };
            format!(
                "fn={}{} => {}",
                function_id,
                tail,
                variable_text(return_value)
            )
        }
        Body::MethodInfo {
            function_id,
            class_name,
            method_name,
            source,
        } => format!(
            "fn={} {}#{} [{}]",
            function_id,
            class_name.to_string_lossy(),
            method_name.to_string_lossy(),
            source
        ),
        Body::ExceptionThrown {
            exception_id,
            class_name,
            correlation_id,
        } => format!(
            "{} id={} correlation={}",
            class_name.to_string_lossy(),
            exception_id,
            correlation_id.to_string_lossy()
        ),
        Body::ThreadStarted { parent_tid } => format!("parent={}", parent_tid),
        Body::ThreadEnded | Body::ProcessEnded | Body::EndTransaction => String::new(),
        Body::ProcessFrequency { frequency } => format!("{}Hz", frequency),
        Body::ProcessType {
            technology_type,
            process_type,
        } => format!(
            "{}/{}",
            technology_type.to_string_lossy(),
            process_type.to_string_lossy()
        ),
        Body::BeginTransaction {
            api_key,
            technology_type,
            process_type,
        } => format!(
            "key={} {}/{}",
            api_key.to_string_lossy(),
            technology_type.to_string_lossy(),
            process_type.to_string_lossy()
        ),
        Body::Sql {
            provider,
            host,
            database,
            query,
            duration,
        } => format!(
            "{}://{}/{} {:?} ({}us)",
            encoded_text(provider),
            encoded_text(host),
            encoded_text(database),
            encoded_text(query),
            duration
        ),
        Body::HttpIn(http) | Body::HttpOut(http) => http_text(http),
    }
}

/// `[pid:tid @ts] KIND details`
pub fn event_line(event: &Event<'_>) -> String {
    let details = describe(&event.body);
    let mut line = format!(
        "[{}:{} @{}] {}",
        event.pid,
        event.tid,
        event.timestamp,
        event.event_type()
    );
    if !details.is_empty() {
        line.push(' ');
        line.push_str(&details);
    }
    line
}

/// Text rendering; batches get a header line and indented events
pub fn render_text(frame: &Frame) -> String {
    let mut out = String::new();
    match frame {
        Frame::Batch { header, events } => {
            let _ = writeln!(
                out,
                "BATCH seq={} pid={} events={} bytes={}",
                header.sequence, header.pid, header.count, header.length
            );
            for event in events {
                let _ = writeln!(out, "  {}", event_line(event));
            }
        }
        Frame::Event { event } => {
            let _ = writeln!(out, "{}", event_line(event));
        }
    }
    out
}

/// Pretty JSON array of frames
pub fn render_json(frames: &[Frame]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(frames)
}

//! Unix timestamps and strftime-style formatting.

use std::fmt::Write;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use mlua::{Lua, UserData, UserDataFields, UserDataMethods, Value};

use crate::engine::value_or_message;
use crate::error::ModuleError;
use crate::loader::ModuleLoader;
use crate::module::CapabilityModule;

pub const NAME: &str = "pglua/time";

/// Named layouts exposed to scripts as fields of the module.
const LAYOUTS: &[(&str, &str)] = &[
    ("ANSIC", "%a %b %e %H:%M:%S %Y"),
    ("UnixDate", "%a %b %e %H:%M:%S %Z %Y"),
    ("RFC822", "%d %b %y %H:%M %Z"),
    ("RFC822Z", "%d %b %y %H:%M %z"),
    ("RFC1123", "%a, %d %b %Y %H:%M:%S %Z"),
    ("RFC1123Z", "%a, %d %b %Y %H:%M:%S %z"),
    ("RFC3339", "%Y-%m-%dT%H:%M:%S%:z"),
    ("RFC3339Nano", "%Y-%m-%dT%H:%M:%S%.9f%:z"),
    ("Kitchen", "%-I:%M%p"),
    ("Stamp", "%b %e %H:%M:%S"),
    ("DateTime", "%Y-%m-%d %H:%M:%S"),
    ("DateOnly", "%Y-%m-%d"),
    ("TimeOnly", "%H:%M:%S"),
];

pub fn construct(_loader: &ModuleLoader) -> Result<Box<dyn CapabilityModule>, ModuleError> {
    Ok(Box::new(TimeModule))
}

#[derive(Clone, Copy)]
pub struct TimeModule;

impl CapabilityModule for TimeModule {
    fn name(&self) -> &'static str {
        NAME
    }

    fn exports(&self, lua: &Lua) -> mlua::Result<Value> {
        lua.create_userdata(*self).map(Value::UserData)
    }
}

#[derive(Debug, thiserror::Error)]
enum TimeError {
    #[error("unknown time zone {0}")]
    UnknownZone(String),
    #[error("timestamp {0} is out of range")]
    OutOfRange(i64),
    #[error("invalid format string {0:?}")]
    InvalidFormat(String),
    #[error("cannot parse {text:?} as {format:?}: {source}")]
    Parse {
        text: String,
        format: String,
        source: chrono::ParseError,
    },
}

fn render<Tz: TimeZone>(at: DateTime<Tz>, format: &str) -> Result<String, TimeError>
where
    Tz::Offset: std::fmt::Display,
{
    let mut out = String::new();
    write!(out, "{}", at.format(format)).map_err(|_| TimeError::InvalidFormat(format.to_string()))?;
    Ok(out)
}

/// Format `epoch` seconds in `zone`: empty or `UTC`, `Local`, or a fixed
/// offset such as `+02:00`.
fn format_epoch(epoch: i64, format: &str, zone: &str) -> Result<String, TimeError> {
    let at = Utc
        .timestamp_opt(epoch, 0)
        .single()
        .ok_or(TimeError::OutOfRange(epoch))?;
    match zone {
        "" | "UTC" => render(at, format),
        "Local" => render(at.with_timezone(&Local), format),
        offset => {
            let offset: FixedOffset = offset
                .parse()
                .map_err(|_| TimeError::UnknownZone(offset.to_string()))?;
            render(at.with_timezone(&offset), format)
        }
    }
}

/// Parse `text` with `format`. Inputs without an offset are taken as UTC.
fn parse_epoch(text: &str, format: &str) -> Result<i64, TimeError> {
    let parse_err = |source| TimeError::Parse {
        text: text.to_string(),
        format: format.to_string(),
        source,
    };
    if let Ok(at) = DateTime::parse_from_str(text, format) {
        return Ok(at.timestamp());
    }
    match NaiveDateTime::parse_from_str(text, format) {
        Ok(at) => Ok(at.and_utc().timestamp()),
        Err(datetime_err) => NaiveDate::parse_from_str(text, format)
            .map(|date| date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc().timestamp())
            .map_err(|_| parse_err(datetime_err)),
    }
}

impl UserData for TimeModule {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        for (name, layout) in LAYOUTS {
            fields.add_field_function_get(*name, move |_, _| Ok(*layout));
        }
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("now", |_, ()| Ok(Utc::now().timestamp()));
        methods.add_function(
            "format",
            |_, (epoch, format, zone): (i64, String, Option<String>)| {
                Ok(value_or_message(format_epoch(
                    epoch,
                    &format,
                    zone.as_deref().unwrap_or_default(),
                )))
            },
        );
        methods.add_function("epoch", |_, (text, format): (String, String)| {
            Ok(value_or_message(parse_epoch(&text, &format)))
        });
    }
}

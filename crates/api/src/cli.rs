//! Command-line interface of the `pglua` binary.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request};
use clap::{Args, Parser, Subcommand};

use crate::error::AppError;

#[derive(Debug, Parser)]
#[command(name = "pglua", version, about = "Serve Lua scripts over HTTP against PostgreSQL")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the routes declared by a config script, reloading on change.
    Server(ServerArgs),
    /// Dispatch a single request and print the response body.
    Exec(ExecArgs),
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Config script declaring the routes.
    pub config: PathBuf,

    /// Listen address; overrides `PGLUA_BIND_ADDR`.
    #[arg(long)]
    pub bind_addr: Option<SocketAddr>,

    /// PostgreSQL connection string; overrides `PGLUA_POSTGRES_CONFIG`.
    #[arg(long)]
    pub postgres_config: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Config script declaring the routes.
    pub config: PathBuf,

    /// HTTP method of the synthetic request.
    pub method: String,

    /// Request path, optionally with a query string.
    pub path: String,

    /// JSON body; only valid with POST, PUT, PATCH and DELETE.
    #[arg(long)]
    pub json_data: Option<String>,

    /// Request header as `name=value`; may be repeated.
    #[arg(long = "header", value_name = "NAME=VALUE")]
    pub headers: Vec<String>,

    /// Discard script `print` output.
    #[arg(long)]
    pub no_print: bool,

    /// PostgreSQL connection string; overrides `PGLUA_POSTGRES_CONFIG`.
    #[arg(long)]
    pub postgres_config: Option<String>,
}

const JSON_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];

impl ExecArgs {
    /// Build the synthetic request described by the arguments.
    pub fn to_request(&self) -> Result<Request<Body>, AppError> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| AppError::BadRequest(format!("invalid method {}", self.method)))?;

        let mut builder = Request::builder().method(method.clone()).uri(self.path.as_str());
        for header in &self.headers {
            let Some((name, value)) = header.split_once('=') else {
                return Err(AppError::BadRequest(format!(
                    "invalid header flag value: {header}"
                )));
            };
            builder = builder.header(name, value);
        }

        let body = match &self.json_data {
            Some(data) => {
                if !JSON_METHODS.contains(&method.as_str()) {
                    return Err(AppError::BadRequest(format!(
                        "can not use json data with method {method}"
                    )));
                }
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(data.clone())
            }
            None => Body::empty(),
        };

        builder
            .body(body)
            .map_err(|e| AppError::BadRequest(e.to_string()))
    }
}

/// Exit status of `exec`: success for any status below 400.
pub fn exit_success(status: u16) -> bool {
    status < 400
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn exec_args(method: &str, json: Option<&str>, headers: &[&str]) -> ExecArgs {
        ExecArgs {
            config: PathBuf::from("config.lua"),
            method: method.to_string(),
            path: "/items?x=1".to_string(),
            json_data: json.map(str::to_string),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            no_print: false,
            postgres_config: None,
        }
    }

    #[test]
    fn parses_exec_subcommand() {
        let cli = Cli::try_parse_from([
            "pglua", "exec", "config.lua", "POST", "/items", "--json-data", "{}", "--header",
            "X-A=1", "--header", "X-B=2", "--no-print",
        ])
        .unwrap();
        let args = assert_matches!(cli.command, Command::Exec(args) => args);
        assert_eq!(args.headers, ["X-A=1", "X-B=2"]);
        assert!(args.no_print);
    }

    #[test]
    fn json_data_sets_content_type() {
        let request = exec_args("post", Some(r#"{"a":1}"#), &["X-Trace=abc"]).to_request().unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(request.headers()["x-trace"], "abc");
        assert_eq!(request.uri().query(), Some("x=1"));
    }

    #[test]
    fn json_data_is_rejected_for_get() {
        assert_matches!(
            exec_args("GET", Some("{}"), &[]).to_request(),
            Err(AppError::BadRequest(msg)) if msg.contains("GET")
        );
    }

    #[test]
    fn header_flags_need_a_separator() {
        assert_matches!(
            exec_args("GET", None, &["broken"]).to_request(),
            Err(AppError::BadRequest(_))
        );
    }

    #[test]
    fn statuses_below_400_succeed() {
        assert!(exit_success(200));
        assert!(exit_success(302));
        assert!(!exit_success(404));
        assert!(!exit_success(500));
    }
}

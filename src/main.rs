//! Purpose: `luahost` CLI entry point.
//! Role: Binary crate root; parses args, sets up logging, runs commands, reports errors.
//! Invariants: Script `print` output owns stdout; the CLI writes reports to stdout only for report commands.
//! Invariants: Errors are emitted as JSON on stderr when stderr is not a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::ffi::OsStr;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use luahost::api::{Error, ErrorKind, to_exit_code};

const LOG_ENV: &str = "LUAHOST_LOG";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `luahost --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();

    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command, cli.no_stdlib)
        .map_err(add_compile_hint)
        .map_err(add_runtime_hint)
        .map_err(add_io_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "luahost",
    version,
    about = "Compile, cache and run Lua scripts through a shared host context",
    long_about = None,
    after_help = r#"EXAMPLES
  $ luahost eval "print('Hello World from Lua')"
  $ luahost run hello.lua
  $ luahost run --name plugin v1.lua v2.lua              # v1 wins: later sources are discarded
  $ luahost run --name plugin --override v1.lua v2.lua   # v2 wins
  $ luahost check scripts/*.lua

Set LUAHOST_LOG=debug to trace state creation and unit binding on stderr."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,
    #[arg(
        long,
        global = true,
        help = "Do not open the Lua standard libraries in script states"
    )]
    no_stdlib: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Compile script files into named units, then run each unit once",
        long_about = r#"Compile each FILE into a unit named after its file stem (or --name),
then run every distinct unit once, in the order first seen.

When several files share a name, the first compilation wins and later
sources are discarded unread, unless --override is given."#
    )]
    Run {
        #[arg(long, help = "Compile every FILE under this unit name")]
        name: Option<String>,
        #[arg(
            long = "override",
            help = "Replace an already-compiled unit instead of discarding the new source"
        )]
        allow_override: bool,
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
    },
    #[command(about = "Compile and run a source string once")]
    Eval {
        #[arg(help = "Lua source text")]
        code: String,
    },
    #[command(about = "Compile files without running them and report the result as JSON")]
    Check {
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
    },
    #[command(about = "Compile files into named units and print what got bound, as JSON")]
    Inspect {
        #[arg(long, help = "Compile every FILE under this unit name")]
        name: Option<String>,
        #[arg(long = "override", help = "Replace already-compiled units")]
        allow_override: bool,
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        files: Vec<PathBuf>,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version")]
    Version,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn unit_name_for(path: &Path, explicit: Option<&str>) -> String {
    if let Some(name) = explicit {
        return name.to_string();
    }
    path.file_stem()
        .and_then(OsStr::to_str)
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

fn add_compile_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Compile || err.hint().is_some() {
        return err;
    }
    err.with_hint("The script has a syntax error; nothing was run.")
}

fn add_runtime_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Runtime || err.hint().is_some() {
        return err;
    }
    if err.message().is_some_and(|message| message.contains("nil value (global")) {
        return err.with_hint(
            "The script called a global that does not exist. Check spelling, or drop --no-stdlib.",
        );
    }
    err
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check that the script path exists and is readable.")
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("luahost {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "luahost",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(name) = err.name() {
        inner.insert("name".to_string(), json!(name));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(name) = err.name() {
        lines.push(format!(
            "{} {name}",
            colorize_label("unit:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn error_message(err: &Error) -> String {
    err.message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err.kind()))
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        causes.push(source.to_string());
        current = source.source();
    }
    causes
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{
        Cli, Error, ErrorKind, add_runtime_hint, error_json, error_text, unit_name_for,
    };
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn unit_name_defaults_to_file_stem() {
        assert_eq!(unit_name_for(Path::new("dir/hello.lua"), None), "hello");
        assert_eq!(
            unit_name_for(Path::new("dir/hello.lua"), Some("plugin")),
            "plugin"
        );
    }

    #[test]
    fn error_text_respects_color_flag() {
        let err = Error::new(ErrorKind::Compile).with_message("unexpected symbol");
        let colored = error_text(&err, true);
        let plain = error_text(&err, false);
        assert!(colored.contains("\u{1b}[31merror:\u{1b}[0m"));
        assert!(plain.starts_with("error: unexpected symbol"));
        assert!(!plain.contains("\u{1b}["));
    }

    #[test]
    fn error_json_carries_kind_and_unit_name() {
        let err = Error::new(ErrorKind::NotFound)
            .with_message("no compiled unit")
            .with_name("test");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "NotFound");
        assert_eq!(value["error"]["name"], "test");
        assert!(value["error"].get("path").is_none());
    }

    #[test]
    fn undefined_global_gets_a_hint() {
        let err = Error::new(ErrorKind::Runtime).with_message(
            "[string \"x\"]:1: attempt to call a nil value (global 'print_not_exists')",
        );
        let err = add_runtime_hint(err);
        assert!(err.hint().unwrap_or_default().contains("does not exist"));
    }
}

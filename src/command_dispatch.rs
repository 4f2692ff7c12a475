//! Purpose: Hold top-level CLI command dispatch for `luahost`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command builds its own `Context`; nothing is cached across invocations.
//! Invariants: `run` and `eval` write nothing to stdout besides script output.

use super::*;

use luahost::api::{Context, ContextOptions, Origin, Recompile, UnitInfo};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

pub(super) fn dispatch_command(command: Command, no_stdlib: bool) -> Result<RunOutcome, Error> {
    let options = ContextOptions::new().with_standard_libraries(!no_stdlib);
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "luahost", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Eval { code } => {
            Context::with_options(options).compile_string_and_run(&code)?;
            Ok(RunOutcome::ok())
        }
        Command::Run {
            name,
            allow_override,
            files,
        } => {
            let ctx = Context::with_options(options);
            let names = compile_files(&ctx, &files, name.as_deref(), allow_override.into())?;
            for name in &names {
                ctx.run(name)?;
            }
            Ok(RunOutcome::ok())
        }
        Command::Inspect {
            name,
            allow_override,
            files,
        } => {
            let ctx = Context::with_options(options);
            let names = compile_files(&ctx, &files, name.as_deref(), allow_override.into())?;
            let units = names
                .iter()
                .map(|name| ctx.unit_info(name).map(|info| unit_json(&info)))
                .collect::<Result<Vec<_>, Error>>()?;
            emit_json(json!({ "units": units }));
            Ok(RunOutcome::ok())
        }
        Command::Check { files } => {
            let ctx = Context::with_options(options);
            let mut reports = Vec::with_capacity(files.len());
            let mut exit_code = 0;
            for path in &files {
                let name = unit_name_for(path, None);
                let error = match ctx.compile_file(&name, path, Recompile::Override) {
                    Ok(_) => None,
                    Err(err) => {
                        if exit_code == 0 {
                            exit_code = to_exit_code(err.kind());
                        }
                        Some(CheckError {
                            kind: format!("{:?}", err.kind()),
                            message: error_message(&err),
                        })
                    }
                };
                reports.push(CheckReport {
                    path: path.display().to_string(),
                    ok: error.is_none(),
                    error,
                });
            }
            emit_json(json!({ "checks": reports }));
            Ok(RunOutcome::with_code(exit_code))
        }
    }
}

#[derive(Debug, Serialize)]
struct CheckReport {
    path: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<CheckError>,
}

#[derive(Debug, Serialize)]
struct CheckError {
    kind: String,
    message: String,
}

/// Compiles `files` in order and returns the distinct unit names, first-seen first.
fn compile_files(
    ctx: &Context,
    files: &[PathBuf],
    name: Option<&str>,
    policy: Recompile,
) -> Result<Vec<String>, Error> {
    let mut names: Vec<String> = Vec::new();
    for path in files {
        let unit = unit_name_for(path, name);
        let outcome = ctx.compile_file(&unit, path, policy)?;
        tracing::debug!(unit = %unit, path = %path.display(), ?outcome, "compiled script");
        if !names.contains(&unit) {
            names.push(unit);
        }
    }
    Ok(names)
}

fn unit_json(info: &UnitInfo) -> Value {
    let mut map = Map::new();
    map.insert("name".to_string(), json!(info.name));
    let origin = match info.origin {
        Origin::Inline => "inline",
        Origin::File(_) => "file",
    };
    map.insert("origin".to_string(), json!(origin));
    if let Some(path) = info.path() {
        map.insert("path".to_string(), json!(path.display().to_string()));
    }
    map.insert("digest".to_string(), json!(info.digest));
    map.insert("bytecode_len".to_string(), json!(info.bytecode_len));
    if let Ok(compiled_at) = info.compiled_at.format(&Rfc3339) {
        map.insert("compiled_at".to_string(), json!(compiled_at));
    }
    Value::Object(map)
}

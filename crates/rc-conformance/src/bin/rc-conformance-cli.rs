#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use rc_conformance::{
    CancelToken, HarnessConfig, OracleMode, SuiteOptions, append_run_history, exit_code,
    generate_diff, generate_expected, load_cases, render_summary, run_cases, write_jsonl,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    GenExpected,
    CheckExpected,
}

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    cases: Option<PathBuf>,
    filter: Option<String>,
    oracle: Option<OracleMode>,
    mode: Option<Mode>,
    gen_diff: Option<PathBuf>,
    report: Option<PathBuf>,
    history: Option<PathBuf>,
    workers: Option<usize>,
    timeout_ms: Option<u64>,
    summary_limit: Option<usize>,
    fail_on_unexpected_pass: bool,
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("rc-conformance-cli: {err}");
            ExitCode::from(2)
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        print_help();
        return Ok(ExitCode::SUCCESS);
    };

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_yaml_file(path)?,
        None => HarnessConfig::default_paths(),
    };
    if let Some(cases) = args.cases {
        config.case_root = cases;
    }
    if let Some(oracle) = args.oracle {
        config.oracle_mode = oracle;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(limit) = args.summary_limit {
        config.summary_limit = limit;
    }
    config.fail_on_unexpected_pass |= args.fail_on_unexpected_pass;
    config.validate()?;

    let options = SuiteOptions {
        filter: args.filter,
    };
    let cases = load_cases(&config, &options)?;

    match args.mode.unwrap_or(Mode::Run) {
        Mode::GenExpected | Mode::CheckExpected => {
            let check_only = args.mode == Some(Mode::CheckExpected);
            config.oracle_mode = OracleMode::Live;
            let runner = config.build_runner()?;
            let update = generate_expected(&runner, &cases, &config.expected_file, check_only)?;
            println!(
                "expected_file={} entries={} evaluated={} missing={} changed={}",
                config.expected_file.display(),
                update.entries,
                update.evaluated,
                update.missing,
                update.changed
            );
            if check_only && update.changed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Mode::Run => {
            let runner = config.build_runner()?;
            if let Some(diff_path) = &args.gen_diff {
                let matches = generate_diff(&runner, &cases, &config.expected_file, diff_path)?;
                println!("diff={} matches={matches}", diff_path.display());
                return Ok(if matches {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                });
            }

            let report = run_cases(&runner, &cases, &CancelToken::new());
            print!("{}", render_summary(&report, config.summary_limit));
            if let Some(path) = &args.report {
                write_jsonl(&report, path)?;
                println!("wrote report={}", path.display());
            }
            if let Some(path) = &args.history {
                let entry = append_run_history(path, &report)?;
                println!("wrote history={} hash={}", path.display(), entry.report_hash);
            }
            return Ok(ExitCode::from(exit_code(
                &report,
                config.fail_on_unexpected_pass,
            )));
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// `Ok(None)` means help was requested.
fn parse_args(
    raw: impl Iterator<Item = String>,
) -> Result<Option<CliArgs>, Box<dyn std::error::Error>> {
    let mut args = CliArgs::default();
    let mut raw = raw.peekable();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(PathBuf::from(
                    raw.next().ok_or("--config requires a path")?,
                ));
            }
            "--cases" => {
                args.cases = Some(PathBuf::from(
                    raw.next().ok_or("--cases requires a file or directory")?,
                ));
            }
            "--filter" => {
                args.filter = Some(raw.next().ok_or("--filter requires a regex")?);
            }
            "--oracle" => {
                let value = raw.next().ok_or("--oracle requires stored or live")?;
                args.oracle = Some(match value.as_str() {
                    "stored" => OracleMode::Stored,
                    "live" => OracleMode::Live,
                    _ => return Err(format!("unsupported oracle mode: {value}").into()),
                });
            }
            "--gen-expected" => set_mode(&mut args, Mode::GenExpected)?,
            "--check-expected" => set_mode(&mut args, Mode::CheckExpected)?,
            "--gen-diff" => {
                args.gen_diff = Some(PathBuf::from(
                    raw.next().ok_or("--gen-diff requires an output path")?,
                ));
            }
            "--report" => {
                args.report = Some(PathBuf::from(
                    raw.next().ok_or("--report requires an output path")?,
                ));
            }
            "--history" => {
                args.history = Some(PathBuf::from(
                    raw.next().ok_or("--history requires an output path")?,
                ));
            }
            "--workers" => {
                let value = raw.next().ok_or("--workers requires a count")?;
                args.workers = Some(value.parse()?);
            }
            "--timeout-ms" => {
                let value = raw.next().ok_or("--timeout-ms requires milliseconds")?;
                args.timeout_ms = Some(value.parse()?);
            }
            "--summary-limit" => {
                let value = raw.next().ok_or("--summary-limit requires a count")?;
                args.summary_limit = Some(value.parse()?);
            }
            "--fail-on-unexpected-pass" => {
                args.fail_on_unexpected_pass = true;
            }
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }
    if args.gen_diff.is_some() && args.mode.is_some() {
        return Err("--gen-diff cannot be combined with --gen-expected or --check-expected".into());
    }
    Ok(Some(args))
}

fn set_mode(args: &mut CliArgs, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    if args.mode.is_some_and(|current| current != mode) {
        return Err("--gen-expected and --check-expected are mutually exclusive".into());
    }
    args.mode = Some(mode);
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn print_help() {
    println!(
        "rc-conformance-cli\n\
         Usage:\n\
         \trc-conformance-cli [--config rconform.yaml] [--cases DIR] [--filter REGEX] [--oracle stored|live]\n\
         Options:\n\
         \t--config <path>              YAML harness configuration\n\
         \t--cases <path>               Case table file or directory (overrides config)\n\
         \t--filter <regex>             Run only case ids matching the regex\n\
         \t--oracle <mode>              stored (default) or live reference outputs\n\
         \t--gen-expected               Add missing reference outputs to the expected-output file\n\
         \t--check-expected             Fail when the expected-output file is out of date; never writes\n\
         \t--gen-diff <path>            Write candidate vs stored differences to <path>\n\
         \t--report <path>              Write one JSON record per case\n\
         \t--history <path>             Append a run summary row to a JSONL history file\n\
         \t--workers <n>                Worker threads (0 = one per core)\n\
         \t--timeout-ms <ms>            Per-case timeout\n\
         \t--summary-limit <n>          Failing cases shown in the summary\n\
         \t--fail-on-unexpected-pass    Exit non-zero when an ignored case passes\n\
         \t-h, --help                   Show this help\n\
         Environment:\n\
         \tRUST_LOG                     Log filter, default info"
    );
}

#[cfg(test)]
mod tests {
    use super::{Mode, parse_args};

    fn parse(args: &[&str]) -> Result<Option<super::CliArgs>, Box<dyn std::error::Error>> {
        parse_args(args.iter().map(|arg| (*arg).to_owned()))
    }

    #[test]
    fn parses_run_flags() {
        let args = parse(&[
            "--filter",
            "^builtins",
            "--oracle",
            "live",
            "--workers",
            "4",
            "--fail-on-unexpected-pass",
        ])
        .expect("parse")
        .expect("not help");
        assert_eq!(args.filter.as_deref(), Some("^builtins"));
        assert_eq!(args.workers, Some(4));
        assert!(args.fail_on_unexpected_pass);
        assert!(args.mode.is_none());
    }

    #[test]
    fn help_and_bad_flags() {
        assert!(parse(&["-h"]).expect("help").is_none());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["--oracle", "fixture"]).is_err());
        assert!(parse(&["--workers", "many"]).is_err());
        assert!(parse(&["--gen-expected", "--check-expected"]).is_err());
        assert!(parse(&["--gen-expected", "--gen-diff", "d.txt"]).is_err());
        let check = parse(&["--check-expected"]).expect("parse").expect("args");
        assert_eq!(check.mode, Some(Mode::CheckExpected));
    }
}

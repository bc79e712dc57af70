use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use fit_merge::{inspect, run, Alignment, Inspection, MergeOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Copy heart-rate samples from one FIT activity file into another",
    long_about = None,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    merge: MergeArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarise record, heart-rate and power coverage of FIT files
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct MergeArgs {
    /// FIT file whose structure and fields are kept
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    base: Option<PathBuf>,

    /// FIT file supplying heart-rate values
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    source: Option<PathBuf>,

    /// Merged FIT output path
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Also copy power from the source
    #[arg(long, action = ArgAction::SetTrue)]
    power: bool,

    /// Leave heart rate alone (useful together with --power)
    #[arg(long, action = ArgAction::SetTrue)]
    no_heart_rate: bool,

    /// Require identical sample counts and timestamps in both files
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,

    /// Accept inputs whose CRCs do not match
    #[arg(long, action = ArgAction::SetTrue)]
    skip_crc: bool,

    /// JSON merge options; flags given on the command line win
    #[arg(long, value_hint = ValueHint::FilePath)]
    options: Option<PathBuf>,

    /// Write a JSON merge report
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// FIT files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Report path (defaults to stdout)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Emit JSON instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Some(Command::Inspect(args)) => args.verbose,
        None => cli.merge.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Some(Command::Inspect(args)) => handle_inspect(args),
        None => handle_merge(cli.merge),
    }
}

fn handle_merge(args: MergeArgs) -> Result<()> {
    let (Some(base), Some(source), Some(output)) = (&args.base, &args.source, &args.output) else {
        return Err(anyhow!("expected BASE SOURCE OUTPUT paths"));
    };

    let mut options = match args.options.as_ref() {
        Some(path) => load_options(path)?,
        None => MergeOptions::default(),
    };
    if args.power {
        options.merge_power = true;
    }
    if args.no_heart_rate {
        options.merge_heart_rate = false;
    }
    if args.strict {
        options.alignment = Alignment::Strict;
    }
    if args.skip_crc {
        options.verify_crc = false;
    }
    if !options.merge_heart_rate && !options.merge_power {
        warn!("heart-rate and power merging are both disabled; output will mirror the base");
    }

    let report = run(base, source, output, &options).with_context(|| {
        format!(
            "failed to merge {} into {}",
            source.display(),
            base.display()
        )
    })?;
    if report.stats.matched == 0 {
        warn!("no base sample timestamps were found in the source");
    }

    if let Some(path) = args.report.as_ref() {
        let text = serde_json::to_string_pretty(&report)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Merge report written: {}", path.display());
    }
    Ok(())
}

fn load_options(path: &Path) -> Result<MergeOptions> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read merge options {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid merge options file", path.display()))
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut summaries = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let summary =
            inspect(&data).with_context(|| format!("failed to parse {}", path.display()))?;
        if summary.records == 0 {
            warn!("{} has no record messages", path.display());
        }
        summaries.push((path.clone(), summary));
    }

    let report = if args.json {
        let entries: Vec<_> = summaries
            .iter()
            .map(|(path, summary)| serde_json::json!({ "file": path, "summary": summary }))
            .collect();
        serde_json::to_string_pretty(&entries)? + "\n"
    } else {
        summaries
            .iter()
            .map(|(path, summary)| format_summary(path, summary))
            .collect::<String>()
    };

    match args.output.as_ref() {
        Some(path) => {
            fs::write(path, report)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Inspection report written: {}", path.display());
        }
        None => io::stdout().lock().write_all(report.as_bytes())?,
    }
    Ok(())
}

fn format_summary(path: &Path, summary: &Inspection) -> String {
    let mut out = String::new();
    out.push_str(&format!("FILE: {}\n", path.display()));
    out.push_str(&format!("  records: {}\n", summary.records));
    if let (Some(first), Some(last)) = (summary.first_time, summary.last_time) {
        out.push_str(&format!("  first: {}\n", first.to_rfc3339()));
        out.push_str(&format!("  last: {}\n", last.to_rfc3339()));
    }
    if let Some(span) = summary.timespan_s {
        out.push_str(&format!("  timespan_s: {}\n", span));
    }
    out.push_str(&format!(
        "  heart_rate: count={}, min={}, max={}\n",
        summary.heart_rate_samples,
        summary.heart_rate_min.map_or("n/a".into(), |v| v.to_string()),
        summary.heart_rate_max.map_or("n/a".into(), |v| v.to_string())
    ));
    out.push_str(&format!("  power: count={}\n", summary.power_samples));
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_positional_merge_arguments() {
        let args = ["fit-merge", "a.fit", "b.fit", "out.fit", "--power"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.merge.base, Some(PathBuf::from("a.fit")));
        assert_eq!(cli.merge.source, Some(PathBuf::from("b.fit")));
        assert_eq!(cli.merge.output, Some(PathBuf::from("out.fit")));
        assert!(cli.merge.power);
        assert!(!cli.merge.strict);
    }

    #[test]
    fn test_missing_output_is_rejected() {
        assert!(Cli::try_parse_from(["fit-merge", "a.fit", "b.fit"]).is_err());
    }

    #[test]
    fn test_inspect_subcommand() {
        let args = ["fit-merge", "inspect", "a.fit", "b.fit", "--json"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Some(Command::Inspect(args)) => {
                assert_eq!(args.inputs.len(), 2);
                assert!(args.json);
            }
            None => panic!("expected inspect subcommand"),
        }
    }

    #[test]
    fn test_format_summary() {
        let summary = Inspection {
            records: 3,
            heart_rate_samples: 2,
            heart_rate_min: Some(90),
            heart_rate_max: Some(95),
            ..Inspection::default()
        };
        let text = format_summary(Path::new("ride.fit"), &summary);
        assert!(text.starts_with("FILE: ride.fit\n  records: 3\n"));
        assert!(text.contains("heart_rate: count=2, min=90, max=95"));
        assert!(!text.contains("timespan_s"));
    }
}

use anyhow::{bail, Context, Result};
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use colored::Colorize;
use patch_file::config::{load_from_path, RulesFile};
use patch_file::filter::{
    filter_lines, filter_text, FilterError, LineFilter, BUILD_TOOL_PACKAGES,
};
use patch_file::{LockedError, PatchError, PatchResult, Patcher, RetryPolicy, RewriteRule};
use similar::{ChangeTag, TextDiff};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_NOT_FOUND: u8 = 3;
const EXIT_LOCKED: u8 = 4;
const EXIT_IO: u8 = 5;
const EXIT_VERIFICATION: u8 = 6;

#[derive(Parser)]
#[command(name = "patch-file")]
#[command(
    about = "Idempotent line-anchored patching with atomic publish and lock retry",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// File to patch (or to filter, with --output)
    #[arg(short, long)]
    target: PathBuf,

    /// Regex rule matching a whole line; `\=` is a literal `=` in the pattern
    #[arg(short, long = "rule", value_name = "PATTERN=REPLACEMENT")]
    rules: Vec<String>,

    /// Like --rule, but the pattern is matched as plain text
    #[arg(long = "literal-rule", value_name = "LINE=REPLACEMENT")]
    literal_rules: Vec<String>,

    /// TOML file with [[rules]], [filter] and [retry] sections
    #[arg(long, value_name = "TOML")]
    rules_file: Option<PathBuf>,

    /// Write a filtered copy of the target here instead of patching it
    #[arg(
        short,
        long,
        value_name = "PATH",
        conflicts_with_all = [
            "rules",
            "literal_rules",
            "force_kill",
            "max_attempts",
            "sleep_seconds",
            "deadline_seconds",
        ]
    )]
    output: Option<PathBuf>,

    /// With --output: drop lines starting with this prefix
    #[arg(long = "exclude-prefix", value_name = "PREFIX", requires = "output")]
    exclude_prefixes: Vec<String>,

    /// With --output: drop requirement lines for these packages (comma-separated)
    #[arg(
        long = "exclude-package",
        value_name = "NAMES",
        value_delimiter = ',',
        requires = "output"
    )]
    exclude_packages: Vec<String>,

    /// With --output: also drop pip, setuptools and wheel
    #[arg(long, requires = "output")]
    exclude_build_tools: bool,

    /// Terminate processes that appear to hold the target open (destructive)
    #[arg(long)]
    force_kill: bool,

    /// Publish attempts before giving up [default: 5]
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,

    /// Pause between publish attempts [default: 2]
    #[arg(long)]
    sleep_seconds: Option<f64>,

    /// Give up retrying once this many seconds have passed
    #[arg(long)]
    deadline_seconds: Option<f64>,

    /// Show what would change without writing anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Show unified diff of changes
    #[arg(short, long)]
    diff: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    json: bool,

    /// --rule and --literal-rule values in command-line order
    #[arg(skip)]
    rule_args: Vec<RuleArg>,
}

impl Cli {
    fn from_matches(matches: &ArgMatches) -> Result<Self, clap::Error> {
        let mut cli = Self::from_arg_matches(matches)?;
        cli.rule_args = ordered_rule_args(matches);
        Ok(cli)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleArg {
    Regex(String),
    Literal(String),
}

impl RuleArg {
    fn compile(&self) -> Result<RewriteRule> {
        match self {
            RuleArg::Regex(spec) => {
                RewriteRule::parse(spec).with_context(|| format!("--rule {spec}"))
            }
            RuleArg::Literal(spec) => {
                RewriteRule::parse_literal(spec).with_context(|| format!("--literal-rule {spec}"))
            }
        }
    }
}

/// Interleave both rule flags by their position on the command line.
fn ordered_rule_args(matches: &ArgMatches) -> Vec<RuleArg> {
    let mut indexed = Vec::new();
    for (id, kind) in [
        ("rules", RuleArg::Regex as fn(String) -> RuleArg),
        ("literal_rules", RuleArg::Literal),
    ] {
        if let (Some(indices), Some(values)) =
            (matches.indices_of(id), matches.get_many::<String>(id))
        {
            indexed.extend(indices.zip(values.cloned().map(kind)));
        }
    }
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, arg)| arg).collect()
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::from_matches(&Cli::command().get_matches())
        .unwrap_or_else(|err| err.format(&mut Cli::command()).exit());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<PatchError>() {
        return match err {
            PatchError::NotFound(_) => EXIT_NOT_FOUND,
            PatchError::Locked(_) => EXIT_LOCKED,
            PatchError::Read { .. } | PatchError::Write { .. } => EXIT_IO,
            PatchError::VerificationFailed { .. } => EXIT_VERIFICATION,
        };
    }
    if let Some(err) = err.downcast_ref::<FilterError>() {
        return match err {
            FilterError::NotFound(_) => EXIT_NOT_FOUND,
            FilterError::Read { .. } | FilterError::Write { .. } => EXIT_IO,
            FilterError::OutputIsSource(_) => EXIT_FAILURE,
        };
    }
    EXIT_FAILURE
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.rules_file {
        Some(path) => load_from_path(path)?,
        None => RulesFile::default(),
    };

    match &cli.output {
        Some(output) => cmd_filter(cli, &config, output),
        None => cmd_patch(cli, &config),
    }
}

/// Rules-file rules first, then command-line rules as they were given.
fn collect_rules(cli: &Cli, config: &RulesFile) -> Result<Vec<RewriteRule>> {
    let mut rules = config.rules.clone();
    for arg in &cli.rule_args {
        rules.push(arg.compile()?);
    }
    if rules.is_empty() {
        bail!("no rules given: pass --rule, --literal-rule or --rules-file");
    }
    Ok(rules)
}

/// Defaults, then the rules file's [retry] table, then flags.
fn resolve_policy(cli: &Cli, config: &RulesFile) -> Result<RetryPolicy> {
    let mut policy = config.retry.apply_to(RetryPolicy::default());
    if let Some(max_attempts) = cli.max_attempts {
        policy.max_attempts = max_attempts;
    }
    if let Some(sleep) = cli.sleep_seconds {
        policy.sleep = parse_seconds("--sleep-seconds", sleep)?;
    }
    if let Some(deadline) = cli.deadline_seconds {
        policy.deadline = Some(parse_seconds("--deadline-seconds", deadline)?);
    }
    Ok(policy)
}

fn parse_seconds(flag: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{flag} {value} is not a valid number of seconds"))
}

fn cmd_patch(cli: &Cli, config: &RulesFile) -> Result<()> {
    let rules = collect_rules(cli, config)?;
    let force_kill = cli.force_kill || config.retry.force_kill;
    let patcher = Patcher::new()
        .with_policy(resolve_policy(cli, config)?)
        .with_force_terminate(force_kill);

    if force_kill {
        eprintln!(
            "{}",
            "Force mode: processes holding the target will be terminated".yellow()
        );
    }

    if cli.dry_run {
        let preview = patcher.preview(&cli.target, &rules)?;
        if cli.json {
            let status = if preview.is_changed() { "would_apply" } else { "unchanged" };
            print_json(&serde_json::json!({
                "status": status,
                "file": preview.file,
                "substitutions": preview.rewrite.substitutions,
            }))?;
        } else if preview.is_changed() {
            println!(
                "{} Would apply {} substitution(s) to {}",
                "✓".green(),
                preview.rewrite.substitutions,
                preview.file.display()
            );
        } else {
            println!("{} Unchanged: {}", "⊙".yellow(), preview.file.display());
        }
        if cli.diff && preview.is_changed() {
            display_diff(
                &preview.file.display().to_string(),
                &format!("{} (dry run)", preview.file.display()),
                &preview.original,
                &preview.rewrite.text,
            );
        }
        return Ok(());
    }

    let before = if cli.diff {
        Some(patcher.preview(&cli.target, &rules)?.original)
    } else {
        None
    };

    let result = match patcher.apply(&cli.target, &rules) {
        Ok(result) => result,
        Err(PatchError::Locked(locked)) => {
            report_locked(&locked, cli.json)?;
            return Err(PatchError::Locked(locked).into());
        }
        Err(err) => return Err(err.into()),
    };

    if cli.json {
        print_json(&result)?;
    } else {
        match &result {
            PatchResult::Applied {
                file,
                backup,
                substitutions,
                publish,
            } => {
                println!(
                    "{} Applied {} substitution(s) to {}",
                    "✓".green(),
                    substitutions,
                    file.display()
                );
                println!("  Backup: {}", backup.display());
                if publish.attempts > 1 {
                    println!("  Published after {} attempts", publish.attempts);
                }
            }
            PatchResult::Unchanged { file } => {
                println!("{} Unchanged: {}", "⊙".yellow(), file.display());
            }
        }
    }

    if let (Some(before), PatchResult::Applied { file, backup, .. }) = (before, &result) {
        let after = fs::read_to_string(file)?;
        display_diff(
            &backup.display().to_string(),
            &file.display().to_string(),
            &before,
            &after,
        );
    }

    Ok(())
}

fn report_locked(locked: &LockedError, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({ "status": "locked", "error": locked }));
    }
    eprintln!(
        "{} {}: gave up after {} attempt(s)",
        "✗".red(),
        locked.target.display(),
        locked.attempts
    );
    eprintln!("  Last error: {}", locked.last_error);
    if locked.holders.is_empty() {
        eprintln!("  No process referencing the target was found");
    } else {
        eprintln!("  Possible holders:");
        for holder in &locked.holders {
            eprintln!("    - {holder}");
        }
    }
    for failure in &locked.termination_failures {
        eprintln!("  {} {failure}", "!".yellow());
    }
    eprintln!("  Pending content: {}", locked.temp_path.display());
    match &locked.backup_path {
        Some(backup) => eprintln!("  Backup: {}", backup.display()),
        None => eprintln!("  Backup: none"),
    }
    Ok(())
}

fn cmd_filter(cli: &Cli, config: &RulesFile, output: &Path) -> Result<()> {
    if !config.rules.is_empty() {
        warn!(
            rules = config.rules.len(),
            "--output writes a filtered copy; [[rules]] from the rules file are ignored"
        );
    }
    if !config.retry.is_empty() {
        warn!("--output writes a filtered copy; [retry] from the rules file is ignored");
    }

    let build_tools: &[&str] = if cli.exclude_build_tools {
        &BUILD_TOOL_PACKAGES
    } else {
        &[]
    };
    let filter = cli
        .exclude_prefixes
        .iter()
        .fold(config.filter.to_line_filter(), |filter, prefix| {
            filter.exclude_prefix(prefix.as_str())
        })
        .exclude_packages(&cli.exclude_packages)
        .exclude_packages(build_tools);
    if filter.is_empty() {
        bail!(
            "--output needs at least one of --exclude-prefix, --exclude-package or --exclude-build-tools"
        );
    }

    if cli.dry_run {
        return preview_filter(cli, &filter, output);
    }

    let report = filter_lines(&cli.target, output, |line| filter.keeps(line))?;
    if cli.json {
        print_json(&report)?;
    } else {
        println!(
            "{} Wrote {} line(s) to {} ({} removed)",
            "✓".green(),
            report.kept,
            report.output.display(),
            report.removed
        );
    }
    Ok(())
}

fn preview_filter(cli: &Cli, filter: &LineFilter, output: &Path) -> Result<()> {
    let text = fs::read_to_string(&cli.target).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            FilterError::NotFound(cli.target.clone())
        } else {
            FilterError::Read {
                path: cli.target.clone(),
                source,
            }
        }
    })?;
    let (filtered, kept, removed) = filter_text(&text, |line| filter.keeps(line));
    if cli.json {
        print_json(&serde_json::json!({
            "status": "would_filter",
            "kept": kept,
            "removed": removed,
        }))?;
    } else {
        println!(
            "{} Would keep {} line(s), remove {}",
            "✓".green(),
            kept,
            removed
        );
    }
    if cli.diff {
        display_diff(
            &cli.target.display().to_string(),
            &format!("{} (filtered)", output.display()),
            &text,
            &filtered,
        );
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print `old` against `new` as unified hunks.
fn display_diff(old_label: &str, new_label: &str, old: &str, new: &str) {
    println!("\n{}", format!("--- {old_label}").dimmed());
    println!("{}", format!("+++ {new_label}").dimmed());

    let diff = TextDiff::from_lines(old, new);
    for hunk in diff.unified_diff().context_radius(2).iter_hunks() {
        println!("{}", hunk.header().to_string().cyan());
        for change in hunk.iter_changes() {
            let line = match change.tag() {
                ChangeTag::Delete => format!("-{change}").red(),
                ChangeTag::Insert => format!("+{change}").green(),
                ChangeTag::Equal => format!(" {change}").normal(),
            };
            print!("{line}");
            if change.missing_newline() {
                println!();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patch_file::LockHolder;

    fn parse(args: &[&str]) -> Cli {
        let matches = Cli::command()
            .try_get_matches_from(std::iter::once("patch-file").chain(args.iter().copied()))
            .unwrap();
        Cli::from_matches(&matches).unwrap()
    }

    fn locked() -> LockedError {
        LockedError {
            target: PathBuf::from("/tmp/requirements.txt"),
            attempts: 5,
            holders: vec![LockHolder {
                process_id: 42,
                process_name: "python".into(),
                command_line: "python /tmp/requirements.txt".into(),
            }],
            temp_path: PathBuf::from("/tmp/requirements.txt.tmp.abc123.tmp"),
            backup_path: Some(PathBuf::from("/tmp/requirements.txt.bak")),
            last_error: "permission denied".into(),
            terminated: Vec::new(),
            termination_failures: Vec::new(),
        }
    }

    #[test]
    fn test_rule_flags_keep_command_line_order() {
        let cli = parse(&[
            "-t",
            "f.txt",
            "--literal-rule",
            "one=two",
            "--rule",
            "two=three",
            "--literal-rule",
            "three=four",
            "-r",
            "x=y",
        ]);
        assert_eq!(
            cli.rule_args,
            vec![
                RuleArg::Literal("one=two".into()),
                RuleArg::Regex("two=three".into()),
                RuleArg::Literal("three=four".into()),
                RuleArg::Regex("x=y".into()),
            ]
        );
    }

    #[test]
    fn test_rules_file_rules_run_before_flags() {
        let config = patch_file::load_from_str(
            "[[rules]]\npattern = \"zero\"\nreplacement = \"one\"\n",
        )
        .unwrap();
        let cli = parse(&["-t", "f.txt", "--literal-rule", "one=two", "--rule", "two=three"]);

        let rules = collect_rules(&cli, &config).unwrap();
        let rewrite = patch_file::rewrite_text("zero\n", &rules);
        assert_eq!(rewrite.text, "three\n");
    }

    #[test]
    fn test_exit_codes_per_error() {
        let not_found = PatchError::NotFound(PathBuf::from("missing.txt"));
        let read = PatchError::Read {
            path: PathBuf::from("a.txt"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let write = PatchError::Write {
            path: PathBuf::from("a.txt"),
            source: std::io::Error::from(std::io::ErrorKind::Other),
        };
        let verification = PatchError::VerificationFailed {
            path: PathBuf::from("a.txt"),
            backup: PathBuf::from("a.txt.bak"),
        };

        assert_eq!(exit_code_for(&not_found.into()), EXIT_NOT_FOUND);
        assert_eq!(exit_code_for(&PatchError::Locked(locked()).into()), EXIT_LOCKED);
        assert_eq!(exit_code_for(&read.into()), EXIT_IO);
        assert_eq!(exit_code_for(&write.into()), EXIT_IO);
        assert_eq!(exit_code_for(&verification.into()), EXIT_VERIFICATION);
        assert_eq!(
            exit_code_for(&FilterError::NotFound(PathBuf::from("req.txt")).into()),
            EXIT_NOT_FOUND
        );
        assert_eq!(
            exit_code_for(&FilterError::OutputIsSource(PathBuf::from("req.txt")).into()),
            EXIT_FAILURE
        );
        assert_eq!(exit_code_for(&anyhow::anyhow!("no rules given")), EXIT_FAILURE);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::from(PatchError::Locked(locked())).context("patching f.txt");
        assert_eq!(exit_code_for(&err), EXIT_LOCKED);
    }

    #[test]
    fn test_output_rejects_publish_flags() {
        for flag in [
            &["--force-kill"][..],
            &["--max-attempts", "3"],
            &["--sleep-seconds", "1"],
            &["--deadline-seconds", "1"],
        ] {
            let args = ["patch-file", "-t", "in.txt", "-o", "out.txt", "--exclude-prefix", "x"]
                .into_iter()
                .chain(flag.iter().copied());
            let err = Cli::command().try_get_matches_from(args).unwrap_err();
            assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
        }
    }
}

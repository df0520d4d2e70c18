use anyhow::Context;
use clap::Parser;
use gecko_ingest::{Config, Converted, GeckoIngest, ProcessedProfile};
use progress::Progress;
use std::{
    collections::HashSet,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
};

mod progress;

const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Exit code used when at least one profile failed to convert.
const EXIT_SOME_FAILED: i32 = 2;

trait UnwrapOrLog {
    type Value;
    fn unwrap_or_log(self, value: Self::Value) -> Self::Value;
}

impl<T, E: std::error::Error> UnwrapOrLog for Result<T, E> {
    type Value = T;

    fn unwrap_or_log(self, value: Self::Value) -> Self::Value {
        match self {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{}", e);
                value
            }
        }
    }
}

fn existing_path(s: &str) -> std::io::Result<PathBuf> {
    let p = PathBuf::from(s);
    if !std::fs::exists(&p)? {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file does not exist",
        ))
    } else {
        Ok(p)
    }
}

/// Raw profile conversion.
///
/// All configuration is passed as TOML. In order from lowest to highest precedence: `config_file`,
/// command-line arguments, and stdin all can have TOML data which are merged to determine the
/// final configuration.
#[derive(Debug, Parser)]
pub struct Args {
    /// The path to the config file. If unspecified, uses `config.toml` (if it exists).
    #[arg(short, long, value_parser = existing_path)]
    config_file: Option<PathBuf>,

    /// The path to which to write the jsonl output when no output directory is configured. If
    /// unspecified, output is written to stdout.
    #[arg(short, long)]
    output_file: Option<PathBuf>,

    /// Read additional configuration from stdin. This configuration will be applied over the
    /// loaded config file and the command-line configuration, if any.
    #[arg(short = 'i', long)]
    stdin: bool,

    /// Disable progress display on stderr.
    #[arg(short = 'q', long)]
    no_progress: bool,

    /// A raw profile to convert, in addition to the configured `inputs`. May be repeated.
    #[arg(short = 'p', long = "profile", value_parser = existing_path)]
    profiles: Vec<PathBuf>,

    /// Additional configuration to apply over the loaded config file (if any). Each argument is a
    /// line of TOML.
    config: Vec<String>,
}

fn toml_merge(target: &mut toml::Value, from: toml::Value) {
    use toml::Value::*;
    match (target, from) {
        (Array(target), Array(from)) => target.extend(from),
        (Table(target), Table(from)) => {
            for (k, v) in from {
                match target.entry(k) {
                    toml::map::Entry::Vacant(e) => {
                        e.insert(v);
                    }
                    toml::map::Entry::Occupied(e) => toml_merge(e.into_mut(), v),
                }
            }
        }
        (target, from) => *target = from,
    }
}

fn main() {
    match try_main() {
        Ok(0) => (),
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {e:?}");
            std::process::exit(1);
        }
    }
}

fn read_config(args: &Args) -> anyhow::Result<Config> {
    let toml_config: toml::Table = if let Some(file) = &args.config_file {
        std::fs::read_to_string(file)
            .map_err(anyhow::Error::from)
            .and_then(|s| Ok(toml::from_str(&s)?))
            .with_context(|| format!("while reading {}", file.display()))?
    } else {
        Default::default()
    };
    let mut toml_config: toml::Value = toml_config.into();

    let cli_config: toml::Table =
        toml::from_str(&args.config.join("\n")).context("while parsing CLI TOML arguments")?;

    let stdin_config: toml::Table = if args.stdin {
        let mut stdin = std::io::stdin();
        let mut s = String::new();
        stdin
            .read_to_string(&mut s)
            .context("while reading stdin")?;
        toml::from_str(&s).context("while parsing stdin TOML")?
    } else {
        Default::default()
    };

    // Merge configs
    toml_merge(&mut toml_config, cli_config.into());
    toml_merge(&mut toml_config, stdin_config.into());

    let mut config: Config = toml_config.try_into()?;
    config.inputs.extend(args.profiles.iter().cloned());
    Ok(config)
}

/// Write `profile` as one line of JSON.
fn write_jsonl<W: Write>(mut output: W, profile: &ProcessedProfile) -> anyhow::Result<()> {
    serde_json::to_writer(&mut output, profile)?;
    writeln!(&mut output)?;
    Ok(())
}

fn write_file(path: &Path, profile: &ProcessedProfile, pretty: bool) -> anyhow::Result<()> {
    let mut file = BufWriter::new(std::fs::File::create(path)?);
    if pretty {
        serde_json::to_writer_pretty(&mut file, profile)?;
    } else {
        serde_json::to_writer(&mut file, profile)?;
    }
    file.flush()?;
    Ok(())
}

fn try_main() -> anyhow::Result<i32> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let mut args = Args::parse();

    if args.config_file.is_none() && std::fs::exists(DEFAULT_CONFIG_FILE).unwrap_or_log(false) {
        args.config_file = Some(DEFAULT_CONFIG_FILE.into());
    }

    let config = read_config(&args)?;
    let output_config = config.output.clone();
    if let Some(directory) = &output_config.directory {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("while creating {}", directory.display()))?;
    }

    let ingest = GeckoIngest::new(config);

    let mut jsonl = match (&output_config.directory, args.output_file) {
        (Some(_), _) => None,
        (None, Some(path)) => Some(Box::new(
            std::fs::File::create(&path)
                .with_context(|| format!("while creating {}", path.display()))?,
        ) as Box<dyn Write>),
        (None, None) => Some(Box::new(std::io::stdout()) as Box<dyn Write>),
    };

    let cancellation_status = ingest.status.clone();
    ctrlc::set_handler(move || cancellation_status.cancel())
        .context("failed to set interrupt handler")?;
    let _progress = if args.no_progress {
        None
    } else {
        Progress::new(ingest.status.clone())
    };

    let mut written = HashSet::new();
    let summary = ingest.run(|Converted { input, profile }| {
        match (&mut jsonl, output_config.unique_path_for(&input, &mut written)) {
            (_, Some(path)) => write_file(&path, &profile, output_config.pretty)
                .with_context(|| format!("while writing {}", path.display()))?,
            (Some(out), None) => write_jsonl(out, &profile)?,
            (None, None) => anyhow::bail!("no output configured for {}", input.display()),
        }
        log::info!("converted {}", input.display());
        Ok(())
    })?;

    if let Some(out) = &mut jsonl {
        out.flush()?;
    }

    log::info!(
        "{} profiles converted, {} failed",
        summary.converted,
        summary.failed
    );
    Ok(if summary.failed > 0 {
        EXIT_SOME_FAILED
    } else {
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jsonl_writes_one_line_per_profile() {
        let profile = gecko_ingest::process_gecko_profile(json!({
            "meta": {"version": 31, "startTime": 0},
            "threads": []
        }))
        .unwrap();
        let mut output = Vec::new();
        write_jsonl(&mut output, &profile).unwrap();
        write_jsonl(&mut output, &profile).unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["meta"]["version"], json!(31));
        assert_eq!(parsed["threads"], json!([]));
    }

    #[test]
    fn pretty_files_parse_back() {
        let profile = gecko_ingest::process_gecko_profile(json!({
            "meta": {"version": 31, "startTime": 0},
            "threads": []
        }))
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.processed.json");
        write_file(&path, &profile, true).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().count() > 1);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["libs"], json!([]));
    }
}

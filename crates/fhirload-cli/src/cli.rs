use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fhirload_ingest::{DecodePolicy, LoadMode, UnrecognizedPolicy};

use crate::config::LoaderConfig;

#[derive(Parser)]
#[command(name = "fhirload")]
#[command(about = "Load FHIR resources from files or Bulk Data exports into PostgreSQL")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: fhirload.toml when present)
    #[arg(short, long, global = true, env = "FHIRLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub postgres: PostgresArgs,
}

/// Connection flags, falling back to the libpq environment variables.
#[derive(clap::Args, Default)]
pub struct PostgresArgs {
    /// Full connection URL (overrides the individual options)
    #[arg(long = "db-url", global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub url: Option<String>,

    /// PostgreSQL host
    #[arg(long, global = true, env = "PGHOST")]
    pub host: Option<String>,

    /// PostgreSQL port
    #[arg(short, long, global = true, env = "PGPORT")]
    pub port: Option<u16>,

    /// PostgreSQL user
    #[arg(short = 'U', long, global = true, env = "PGUSER")]
    pub username: Option<String>,

    /// PostgreSQL password
    #[arg(short = 'W', long, global = true, env = "PGPASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// PostgreSQL database
    #[arg(short = 'd', long, global = true, env = "PGDATABASE")]
    pub db: Option<String>,

    /// SSL mode (disable, require, verify-full, ...)
    #[arg(long, global = true, env = "PGSSLMODE")]
    pub sslmode: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load resources from files or a Bulk Data endpoint
    Load(LoadArgs),
    /// Download a Bulk Data export without loading it
    Bulkget(BulkgetArgs),
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// One INSERT per resource, duplicates skipped
    Insert,
    /// One COPY per run of same-typed resources
    Copy,
}

impl From<ModeArg> for LoadMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Insert => LoadMode::Insert,
            ModeArg::Copy => LoadMode::Copy,
        }
    }
}

#[derive(clap::Args, Default)]
pub struct DownloadArgs {
    /// Number of concurrent downloads
    #[arg(short, long)]
    pub numdl: Option<usize>,

    /// Accept header sent to the Bulk Data server
    #[arg(long)]
    pub accept_header: Option<String>,
}

#[derive(clap::Args)]
pub struct LoadArgs {
    /// Write mode (default: copy for Bulk Data endpoints, insert otherwise)
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    #[command(flatten)]
    pub download: DownloadArgs,

    /// Report memory usage after each source
    #[arg(long)]
    pub memusage: bool,

    /// Keep downloaded files in this directory
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Load the files that did download when others failed
    #[arg(long)]
    pub allow_partial: bool,

    /// Skip records that fail to decode instead of aborting
    #[arg(long)]
    pub skip_invalid: bool,

    /// Skip sources whose format cannot be detected instead of aborting
    #[arg(long)]
    pub skip_unrecognized: bool,

    /// Decode and count without connecting to PostgreSQL
    #[arg(long)]
    pub dry_run: bool,

    /// Files or a single Bulk Data endpoint URL
    #[arg(required = true, value_name = "URL|FILE")]
    pub inputs: Vec<String>,
}

#[derive(clap::Args)]
pub struct BulkgetArgs {
    #[command(flatten)]
    pub download: DownloadArgs,

    /// Bulk Data endpoint ($export URL or status URL)
    pub url: String,

    /// Directory the files are written to
    pub target_dir: PathBuf,
}

impl PostgresArgs {
    pub fn apply(&self, cfg: &mut LoaderConfig) {
        let pg = &mut cfg.postgres;
        if let Some(url) = &self.url {
            pg.url = Some(url.clone());
        }
        if let Some(host) = &self.host {
            pg.host = host.clone();
        }
        if let Some(port) = self.port {
            pg.port = port;
        }
        if let Some(user) = &self.username {
            pg.user = user.clone();
        }
        if let Some(password) = &self.password {
            pg.password = Some(password.clone());
        }
        if let Some(db) = &self.db {
            pg.database = db.clone();
        }
        if let Some(mode) = &self.sslmode {
            pg.sslmode = Some(mode.clone());
        }
    }
}

impl DownloadArgs {
    pub fn apply(&self, cfg: &mut LoaderConfig) {
        if let Some(n) = self.numdl {
            cfg.bulk.concurrency = n;
        }
        if let Some(accept) = &self.accept_header {
            cfg.bulk.accept_header = accept.clone();
        }
    }
}

impl LoadArgs {
    pub fn apply(&self, cfg: &mut LoaderConfig) {
        self.download.apply(cfg);
        if let Some(mode) = self.mode {
            cfg.load.mode = Some(mode.into());
        }
        if let Some(dir) = &self.download_dir {
            cfg.bulk.download_dir = Some(dir.clone());
        }
        if self.allow_partial {
            cfg.bulk.allow_partial = true;
        }
        if self.memusage {
            cfg.load.memusage = true;
        }
        if self.skip_invalid {
            cfg.load.on_decode_error = DecodePolicy::SkipUnit;
        }
        if self.skip_unrecognized {
            cfg.load.on_unrecognized = UnrecognizedPolicy::SkipSource;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_load_flags_override_config() {
        let cli = Cli::try_parse_from([
            "fhirload",
            "load",
            "--mode",
            "copy",
            "--numdl",
            "3",
            "--accept-header",
            "application/ndjson",
            "--skip-invalid",
            "--skip-unrecognized",
            "--memusage",
            "a.ndjson",
            "b.json.gz",
        ])
        .unwrap();

        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };
        assert_eq!(args.inputs, ["a.ndjson", "b.json.gz"]);

        let mut cfg = LoaderConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.load.mode, Some(LoadMode::Copy));
        assert_eq!(cfg.bulk.concurrency, 3);
        assert_eq!(cfg.bulk.accept_header, "application/ndjson");
        assert_eq!(cfg.load.on_decode_error, DecodePolicy::SkipUnit);
        assert_eq!(cfg.load.on_unrecognized, UnrecognizedPolicy::SkipSource);
        assert!(cfg.load.memusage);
    }

    #[test]
    fn test_load_without_flags_keeps_config() {
        let cli = Cli::try_parse_from(["fhirload", "load", "bundle.json"]).unwrap();
        let Commands::Load(args) = cli.command else {
            panic!("expected load");
        };

        let mut cfg = LoaderConfig::default();
        cfg.bulk.concurrency = 7;
        args.apply(&mut cfg);
        assert_eq!(cfg.bulk.concurrency, 7);
        assert!(cfg.load.mode.is_none());
        assert_eq!(cfg.load.on_decode_error, DecodePolicy::Abort);
    }

    #[test]
    fn test_load_requires_inputs() {
        assert!(Cli::try_parse_from(["fhirload", "load"]).is_err());
    }

    #[test]
    fn test_bulkget_positionals() {
        let cli = Cli::try_parse_from([
            "fhirload",
            "bulkget",
            "-n",
            "8",
            "https://bulk.example/fhir/$export",
            "out",
        ])
        .unwrap();
        let Commands::Bulkget(args) = cli.command else {
            panic!("expected bulkget");
        };
        assert_eq!(args.url, "https://bulk.example/fhir/$export");
        assert_eq!(args.target_dir, PathBuf::from("out"));
        assert_eq!(args.download.numdl, Some(8));
    }

    #[test]
    fn test_postgres_args_apply() {
        let args = PostgresArgs {
            host: Some("db".into()),
            port: Some(6543),
            username: Some("loader".into()),
            db: Some("fhir".into()),
            ..PostgresArgs::default()
        };
        let mut cfg = LoaderConfig::default();
        args.apply(&mut cfg);
        assert_eq!(
            cfg.postgres.connection_url().unwrap(),
            "postgres://loader@db:6543/fhir"
        );
    }
}

//! File daemon - Main entry point
//!
//! Runs one backup, restore or verify job against a storage daemon, with an
//! optional director connection for heartbeats and the end-of-job report.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use file_daemon::crypto::keys::{self, KeyKind};
use file_daemon::crypto::PkiContext;
use file_daemon::daemon::{PidFile, ShutdownCoordinator};
use file_daemon::executor::RestoreOptions;
use file_daemon::fs::{AclHandler, FileSet, FindOptions, FoFlags, NoAcl, ReplaceMode, XattrAcl};
use file_daemon::job::{self, ReadSession};
use file_daemon::{config::Config, utils, Jcr};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up files to the storage daemon
    Backup(FileSetArgs),
    /// Send attributes and digests of the file set to the director
    Verify(FileSetArgs),
    /// Count the files and bytes a backup of the file set would send
    Estimate {
        #[command(flatten)]
        fileset: FileSetArgs,
        /// Also list every counted file
        #[arg(long)]
        listing: bool,
    },
    /// Restore a session from the storage daemon
    Restore {
        #[command(flatten)]
        session: SessionArgs,
        /// Restore under this directory instead of the original location
        #[arg(long = "where", value_name = "DIR", default_value = "")]
        where_: PathBuf,
        #[arg(long, value_enum, default_value_t = ReplaceMode::Always)]
        replace: ReplaceMode,
    },
    /// Read a session back and report attributes and digests to the director
    VerifyVolume {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Generate a key pair
    Keygen {
        #[arg(value_enum)]
        kind: KeyKind,
        /// Output prefix; writes <prefix>.key and <prefix>.pub
        prefix: PathBuf,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[derive(ClapArgs, Debug)]
struct JobArgs {
    #[arg(long, default_value_t = 1)]
    job_id: u32,
    #[arg(long, default_value = "file-daemon-job")]
    job_name: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DigestChoice {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

#[derive(ClapArgs, Debug)]
struct FileSetArgs {
    #[command(flatten)]
    job: JobArgs,
    /// Files and directories to save
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Compress data records at this zlib level (1-9)
    #[arg(long, value_name = "LEVEL")]
    gzip: Option<u32>,
    #[arg(long)]
    sparse: bool,
    #[arg(long, value_enum)]
    digest: Option<DigestChoice>,
    /// Send POSIX ACLs
    #[arg(long)]
    acl: bool,
    /// Do not cross file system boundaries
    #[arg(long)]
    one_fs: bool,
    #[arg(long)]
    no_recursion: bool,
    /// Read FIFOs as data
    #[arg(long)]
    read_fifo: bool,
    /// Send data in Win32 BackupRead format
    #[arg(long)]
    win32: bool,
    /// Only save files changed since this time (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    since: Option<String>,
    /// With --since, look at mtime only
    #[arg(long)]
    mtime_only: bool,
    /// Exclude pattern; a leading `*` matches a suffix
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,
}

#[derive(ClapArgs, Debug)]
struct SessionArgs {
    #[command(flatten)]
    job: JobArgs,
    #[arg(long)]
    volume: String,
    #[arg(long)]
    session_id: u32,
    #[arg(long)]
    session_time: u32,
    #[arg(long, default_value_t = 0)]
    start_file: u32,
    #[arg(long, default_value_t = u32::MAX)]
    end_file: u32,
    #[arg(long, default_value_t = 0)]
    start_block: u32,
    #[arg(long, default_value_t = u32::MAX)]
    end_block: u32,
}

impl SessionArgs {
    fn read_session(&self) -> ReadSession {
        ReadSession {
            volume: self.volume.clone(),
            vol_session_id: self.session_id,
            vol_session_time: self.session_time,
            start_file: self.start_file,
            end_file: self.end_file,
            start_block: self.start_block,
            end_block: self.end_block,
        }
    }
}

fn parse_since(text: &str) -> Result<i64> {
    if let Ok(t) = DateTime::parse_from_rfc3339(text) {
        return Ok(t.timestamp());
    }
    let day = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("invalid --since value {:?}", text))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .context("invalid --since date")?;
    Ok(midnight.and_utc().timestamp())
}

fn find_options(args: &FileSetArgs) -> Result<FindOptions> {
    let mut options = FindOptions::default();
    if let Some(level) = args.gzip {
        options.flags |= FoFlags::GZIP;
        options.gzip_level = level;
    }
    options.flags.set(FoFlags::SPARSE, args.sparse);
    options.flags.set(FoFlags::ACL, args.acl);
    options.flags.set(FoFlags::ONEFS, args.one_fs);
    options.flags.set(FoFlags::NO_RECURSION, args.no_recursion);
    options.flags.set(FoFlags::READFIFO, args.read_fifo);
    options.flags.set(FoFlags::WIN32, args.win32);
    options.flags.set(FoFlags::MTIMEONLY, args.mtime_only);
    options.flags |= match args.digest {
        Some(DigestChoice::Md5) => FoFlags::MD5,
        Some(DigestChoice::Sha1) => FoFlags::SHA1,
        Some(DigestChoice::Sha256) => FoFlags::SHA256,
        Some(DigestChoice::Sha512) => FoFlags::SHA512,
        None => FoFlags::empty(),
    };
    options.exclude_patterns = args.exclude.clone();
    options.since = args.since.as_deref().map(parse_since).transpose()?;
    Ok(options)
}

fn new_jcr(args: &JobArgs) -> Jcr {
    let jcr = Jcr::new(args.job_id, &args.job_name);
    // SIGINT/SIGTERM cancel the job
    ShutdownCoordinator::new(jcr.cancel_token()).spawn();
    jcr
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let summary = match args.command {
        Command::ShowConfig => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Command::Keygen { kind, prefix } => {
            let (secret, public) = keys::generate(kind, &prefix)?;
            println!("Wrote {} and {}", secret.display(), public.display());
            return Ok(());
        }
        Command::Backup(backup) => {
            let _pid = PidFile::create(&config.daemon.pid_file)?;
            let pki = PkiContext::from_config(&config.pki)?;
            let fileset = FileSet::new(backup.paths.clone(), find_options(&backup)?);
            let acl: Box<dyn AclHandler> = if backup.acl {
                Box::new(XattrAcl)
            } else {
                Box::new(NoAcl)
            };

            tracing::info!(
                "Starting file-daemon v{} ({})",
                env!("CARGO_PKG_VERSION"),
                config.client.name
            );
            let jcr = new_jcr(&backup.job);
            let sd = job::connect_storage(&config).await?;
            let dir = job::connect_director(&config).await?;
            job::run_backup(&jcr, &config, sd, dir, fileset, &pki, acl.as_ref()).await
        }
        Command::Restore {
            session,
            where_,
            replace,
        } => {
            let _pid = PidFile::create(&config.daemon.pid_file)?;
            let pki = PkiContext::from_config(&config.pki)?;
            let opts = RestoreOptions {
                where_,
                replace,
                buf_size: config.client.max_network_buffer_size,
            };

            let jcr = new_jcr(&session.job);
            let sd = job::connect_storage(&config).await?;
            let dir = job::connect_director(&config).await?;
            let (summary, restored) = job::run_restore(
                &jcr,
                &config,
                sd,
                dir,
                &session.read_session(),
                &opts,
                &pki,
                &XattrAcl,
            )
            .await;
            if let Some(r) = restored {
                println!(
                    "Restored {} files, {} signatures verified, {} failed",
                    r.files_restored, r.signatures_verified, r.signature_failures
                );
            }
            summary
        }
        Command::Verify(args) => {
            let fileset = FileSet::new(args.paths.clone(), find_options(&args)?);
            let jcr = new_jcr(&args.job);
            let Some(dir) = job::connect_director(&config).await? else {
                bail!("verify needs a [director] section in the configuration");
            };
            job::run_verify(&jcr, dir, fileset).await
        }
        Command::Estimate { fileset: args, listing } => {
            let fileset = FileSet::new(args.paths.clone(), find_options(&args)?);
            let jcr = new_jcr(&args.job);
            let dir = job::connect_director(&config).await?;
            let (summary, estimate) = job::run_estimate(&jcr, dir, fileset, listing).await;
            if let Some(estimate) = estimate {
                print!("{}", estimate.reply());
            }
            summary
        }
        Command::VerifyVolume { session } => {
            let jcr = new_jcr(&session.job);
            let Some(dir) = job::connect_director(&config).await? else {
                bail!("verify-volume needs a [director] section in the configuration");
            };
            let sd = job::connect_storage(&config).await?;
            job::run_verify_volume(&jcr, &config, sd, dir, &session.read_session()).await
        }
    };

    println!("{}", summary);
    if !summary.status.is_ok() {
        bail!("Job {} ended with status {}", summary.job_id, summary.status);
    }
    Ok(())
}

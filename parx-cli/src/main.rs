use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use parx_core::archive::{ArchiveClient, LocalArchiveClient};
use parx_core::config::ObjectConfig;
use parx_core::progress::Progress;
use parx_core::reader::Reader;
use parx_core::repair::{check_file, repair_file};
use parx_core::runtime::{Options, Runtime};
use parx_core::stream_writer::write_object;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "parx", version, about = "Erasure-coded object storage over a placement list of archives")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

/// The parameters that describe one erasure-coded object, shared by every
/// subcommand operating against it.
#[derive(Args)]
struct ObjectArgs {
    /// Directory that backs every placement URL (one file per archive).
    #[arg(long)]
    root: PathBuf,
    /// Object name; the base file name under each placement.
    #[arg(long, default_value = "object")]
    name: String,
    /// Number of data stripes per block.
    #[arg(long, default_value_t = 4)]
    nbdata: usize,
    /// Number of parity stripes per block.
    #[arg(long, default_value_t = 2)]
    nbparity: usize,
    /// Bytes per stripe.
    #[arg(long, default_value_t = 1 << 20)]
    chunksize: usize,
    /// Placement archive identifiers, one per chunk; repeat the flag. Must
    /// supply at least `nbdata + nbparity` of them.
    #[arg(long = "placement", required = true, num_args = 1)]
    placements: Vec<String>,
    /// Replacement archive identifiers consumed in order during repair.
    #[arg(long = "replacement")]
    replacements: Vec<String>,
    /// Suppress the side-car metadata archive.
    #[arg(long, default_value_t = false)]
    nomtfile: bool,
}

impl ObjectArgs {
    fn into_config(self) -> Result<ObjectConfig> {
        let nbchunks = self.nbdata + self.nbparity;
        if self.placements.len() < nbchunks {
            bail!(
                "need at least {nbchunks} --placement entries, got {}",
                self.placements.len()
            );
        }
        Ok(ObjectConfig::new(self.name, self.nbdata, self.nbparity, self.chunksize, self.placements)
            .with_replacements(self.replacements)
            .with_nomtfile(self.nomtfile))
    }
}

#[derive(Subcommand)]
enum Cmd {
    /// Write an object from a file (or stdin) into its placement archives.
    Write {
        #[command(flatten)]
        object: ObjectArgs,
        /// Source file; reads from stdin if omitted.
        input: Option<PathBuf>,
        /// Report progress to stderr every few seconds.
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Read an object back, to a file (or stdout).
    Read {
        #[command(flatten)]
        object: ObjectArgs,
        /// Destination file; writes to stdout if omitted.
        output: Option<PathBuf>,
        /// Byte offset to start reading at.
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Number of bytes to read; reads to the end of the object if omitted.
        #[arg(long)]
        length: Option<u64>,
    },
    /// Validate every placement archive without changing anything.
    Check {
        #[command(flatten)]
        object: ObjectArgs,
    },
    /// Validate and repair an object, redirecting corrupted placements onto
    /// replacement archives.
    Repair {
        #[command(flatten)]
        object: ObjectArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Write { object, input, progress } => cmd_write(object, input, progress),
        Cmd::Read { object, output, offset, length } => cmd_read(object, output, offset, length),
        Cmd::Check { object } => cmd_check(object),
        Cmd::Repair { object } => cmd_repair(object),
    }
}

fn archives_for(root: &PathBuf) -> Arc<dyn ArchiveClient> {
    Arc::new(LocalArchiveClient::new(root.clone()))
}

fn cmd_write(object: ObjectArgs, input: Option<PathBuf>, progress: bool) -> Result<()> {
    let root = object.root.clone();
    let objcfg = object.into_config()?;
    let runtime = Arc::new(Runtime::new(&objcfg, Options::default()));
    let archives = archives_for(&root);

    let prog = Progress::new(progress);
    prog.set_stage("writing");
    if let Some(path) = &input {
        if let Ok(meta) = std::fs::metadata(path) {
            prog.reset_bytes(meta.len() as usize);
        }
    }
    prog.start();

    let written = match input {
        Some(path) => {
            let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            write_object(file, &objcfg, &runtime, archives)
        }
        None => write_object(std::io::stdin().lock(), &objcfg, &runtime, archives),
    };
    prog.stop();

    let written = written.map_err(|e| anyhow::anyhow!("{e}"))?;
    eprintln!("wrote {written} bytes to object {:?} across {} archives", objcfg.name, objcfg.nbchunks);
    Ok(())
}

fn cmd_read(object: ObjectArgs, output: Option<PathBuf>, offset: u64, length: Option<u64>) -> Result<()> {
    let root = object.root.clone();
    let objcfg = object.into_config()?;
    let runtime = Arc::new(Runtime::new(&objcfg, Options::default()));
    let archives = archives_for(&root);

    let reader = Reader::open(objcfg, runtime, archives).map_err(|e| anyhow::anyhow!("{e}"))?;
    let want = length.unwrap_or_else(|| reader.filesize().saturating_sub(offset));

    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(File::create(path).with_context(|| format!("creating {}", path.display()))?),
        None => Box::new(std::io::stdout().lock()),
    };

    let mut pos = offset;
    let end = offset + want;
    let mut buf = vec![0u8; 1 << 20];
    while pos < end {
        let to_read = buf.len().min((end - pos) as usize);
        let n = reader
            .read(pos, &mut buf[..to_read])
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        pos += n as u64;
    }
    out.flush()?;
    reader.close().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

fn cmd_check(object: ObjectArgs) -> Result<()> {
    let root = object.root.clone();
    let objcfg = object.into_config()?;
    let archives = archives_for(&root);

    let report = check_file(&objcfg, &*archives).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_repair(object: ObjectArgs) -> Result<()> {
    let root = object.root.clone();
    let objcfg = object.into_config()?;
    let runtime = Arc::new(Runtime::new(&objcfg, Options::default()));
    let archives = archives_for(&root);

    let report = repair_file(&objcfg, archives, runtime.redundancy()).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.blocks_failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dltp::chunk::SegmentReader;
use dltp::dpfile::{DpReader, DpWriter, PackOptions};
use dltp::{merge, zip, Error, Result};

#[derive(Debug, clap::Parser)]
#[command(
    name = "dltp",
    version,
    about = "Pack and unpack MediaWiki XML dumps as delta packs"
)]
struct CommandLine {
    /// write to stdout even if unpacking a file
    #[arg(short = 'c')]
    use_stdout: bool,

    /// write to a file even if unpacking stdin
    #[arg(short = 'f')]
    use_file: bool,

    /// remove all but the last revision of each page when packing
    #[arg(long)]
    lastrev: bool,

    /// limit to pages in the given <ns>
    #[arg(long, value_name = "N")]
    ns: Option<i64>,

    /// cut <contributor>/<comment>/<minor /> metadata
    #[arg(long)]
    cutmeta: bool,

    /// just output a cut-down stdin (don't pack)
    #[arg(long)]
    cut: bool,

    /// merge the dumps listed on the command line (newest first) to stdout
    #[arg(long)]
    merge: bool,

    /// when unpacking, write only segments that differ from the previous one
    #[arg(long)]
    changes: bool,

    /// on error, show ugly but useful debug info
    #[arg(long)]
    debug: bool,

    /// output compression when packing (bz2, gz, xz, lzo, zst, none, auto)
    #[arg(long, default_value = "auto", value_name = "FORMAT")]
    zip: String,

    /// new dump then reference dumps (packing), or one delta pack (unpacking)
    files: Vec<PathBuf>,
}

fn main() {
    let args = CommandLine::parse();

    let default_filter = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        if args.debug {
            let mut source = std::error::Error::source(&e);
            while let Some(inner) = source {
                eprintln!("  caused by: {inner}");
                source = inner.source();
            }
        }
        std::process::exit(255);
    }
}

fn fail(msg: impl Into<String>) -> Error {
    Error::Format(msg.into())
}

fn run(args: &CommandLine) -> Result<()> {
    if args.merge {
        if args.use_stdout || args.use_file {
            return Err(fail("only --lastrev, --ns, and --cutmeta work with --merge"));
        }
        if args.cut {
            return Err(fail("leave out --cut when using --merge"));
        }
        if args.files.is_empty() {
            return Err(fail("--merge needs files to merge"));
        }
        return run_merge(args);
    }

    if args.cut {
        if args.use_stdout || args.use_file {
            return Err(fail("only --lastrev, --ns, and --cutmeta work with --cut"));
        }
        if !(args.lastrev || args.cutmeta || args.ns.is_some()) {
            return Err(fail("use some of --lastrev, --ns, and --cutmeta with --cut"));
        }
        if !args.files.is_empty() {
            return Err(fail("--cut only streams from stdin to stdout"));
        }
        return run_cut(args);
    }

    if args.files.len() < 2 {
        // unpacking
        if args.zip != "auto" {
            return Err(fail("compression options only work when packing"));
        }
        if args.use_file && args.use_stdout {
            return Err(fail("can't write both to stdout and to a file"));
        }
        if args.lastrev {
            return Err(fail("--lastrev is only used when packing"));
        }
        if args.ns.is_some() {
            return Err(fail("--ns is only used when packing"));
        }
        return run_unpack(args);
    }

    // packing
    if args.use_file {
        return Err(fail("-f is redundant when packing"));
    }
    if args.use_stdout {
        return Err(fail("-c not allowed when packing (won't pack to stdout)"));
    }
    if args.changes {
        return Err(fail("--changes is only used when unpacking"));
    }
    run_pack(args)
}

fn run_merge(args: &CommandLine) -> Result<()> {
    let mut readers = Vec::with_capacity(args.files.len());
    for (number, file) in args.files.iter().enumerate() {
        let src = zip::open(file)
            .map_err(|e| fail(format!("can't open source {}: {e}", file.display())))?;
        readers.push(SegmentReader::new(
            src,
            number as i64,
            args.lastrev,
            args.ns,
            args.cutmeta,
        )?);
    }
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    merge::merge(&mut readers, &mut out)?;
    out.flush()?;
    Ok(())
}

fn run_cut(args: &CommandLine) -> Result<()> {
    let stdin = std::io::stdin();
    let mut reader =
        SegmentReader::new(stdin.lock(), 0, args.lastrev, args.ns, args.cutmeta)?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    loop {
        let next = reader.read_next()?;
        out.write_all(reader.segment())?;
        if next.at_end {
            break;
        }
    }
    out.flush()?;
    Ok(())
}

fn run_unpack(args: &CommandLine) -> Result<()> {
    let working_dir: PathBuf = match args.files.first() {
        Some(file) => match file.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
        None => PathBuf::from("."),
    };

    match args.files.first() {
        Some(file) => {
            let src = zip::open(file)
                .map_err(|e| fail(format!("can't open source {}: {e}", file.display())))?;
            let streaming = args.use_stdout; // a named pack unpacks to its file
            unpack(BufReader::new(src), &working_dir, streaming, args.changes)
        }
        None => {
            let streaming = !args.use_file; // stdin unpacks to stdout
            let stdin = std::io::stdin();
            unpack(stdin.lock(), &working_dir, streaming, args.changes)
        }
    }
}

fn unpack<R: BufRead>(input: R, dir: &Path, streaming: bool, changes: bool) -> Result<()> {
    let mut reader = DpReader::new(input, dir, streaming, changes)?;
    while reader.read_segment()? {}
    reader.close()
}

fn run_pack(args: &CommandLine) -> Result<()> {
    let mut compression = args.zip.clone();
    if compression == "auto" {
        compression = if zip::can_write("bz2") { "bz2" } else { "gz" }.to_owned();
    }
    if compression == "none" {
        compression = String::new();
    }
    if !compression.is_empty() {
        compression = zip::canonical_format_name(&compression).to_owned();
        if !zip::is_known(&compression) {
            return Err(fail(format!("unknown compression type '{compression}'")));
        }
        if !zip::can_write(&compression) {
            return Err(fail(format!("can't find (un)packer for .{compression}")));
        }
    }

    let first = &args.files[0];
    let dir = match first.parent() {
        Some(parent) if parent != Path::new("") => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base = first
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| fail(format!("no file name in {}", first.display())))?;
    let mut out_name = zip::unzipped_name(&base);
    out_name.push_str(".dltp");
    if !compression.is_empty() {
        out_name.push('.');
        out_name.push_str(&compression);
    }

    let out_file = File::create(dir.join(&out_name))?;
    let zip_out = zip::writer(out_file, &compression)?;
    let out = BufWriter::new(zip_out);

    let mut sources = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let src = zip::open(file)
            .map_err(|e| fail(format!("can't open source {}: {e}", file.display())))?;
        sources.push((src, file.to_string_lossy().into_owned()));
    }

    let options = PackOptions {
        last_rev_only: args.lastrev,
        limit_to_ns: args.ns,
        cut_meta: args.cutmeta,
    };
    let mut writer = DpWriter::new(out, sources, options)?;
    while writer.write_segment()? {}
    let out = writer.close()?;
    let zip_out = out
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?;
    zip_out.finish()
}

//! oxcc command-line driver: reads a preprocessed C source file, compiles
//! it, and writes the flat image.

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use oxcc_codegen::{isa, Context};
use oxcc_front::{compile, FrontOptions};
use std::path::PathBuf;
use std::str::FromStr;
use target_lexicon::Triple;

#[derive(Parser)]
#[command(name = "oxcc", version, about = "C compiler for x86-64")]
struct Args {
    /// Preprocessed C source file.
    file: PathBuf,

    /// Output image path.
    #[arg(short, long, default_value = "a.img")]
    output: PathBuf,

    /// Base virtual address the image is linked at.
    #[arg(long, default_value_t = 0x1_0000, value_parser = parse_address)]
    start_address: u64,

    /// Disable floating-point support.
    #[arg(long)]
    no_flonum: bool,

    /// System include path, handed to the external preprocessor.
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Macro definition, handed to the external preprocessor.
    #[arg(short = 'D', value_name = "NAME[=VALUE]")]
    define: Vec<String>,
}

fn parse_address(s: &str) -> std::result::Result<u64, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.include.is_empty() || !args.define.is_empty() {
        // The core consumes preprocessed text; -I/-D only matter when the
        // external preprocessor runs in front of us.
        log::warn!("-I/-D are recorded for the preprocessor and ignored by the compiler core");
    }

    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("cannot read {}", args.file.display()))?;

    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    let isa = match isa::lookup(triple) {
        Ok(isa) => isa,
        Err(e) => bail!("target lookup failed: {}", e),
    };
    let mut ctx = Context::new(isa, args.start_address);

    let options = FrontOptions {
        filename: args.file.display().to_string(),
        no_flonum: args.no_flonum,
    };
    let diags = compile(&source, &options, &mut ctx);
    eprint!("{}", diags);
    if !diags.is_ok() {
        bail!("{} error(s); no output written", diags.error_count());
    }

    let image = match ctx.finish() {
        Ok(image) => image,
        Err(e) => bail!("image layout failed: {}", e),
    };
    log::info!(
        "{}: {} bytes in file, {} bytes in memory, {} symbols",
        args.output.display(),
        image.info.file_size(),
        image.info.mem_size(),
        image.symbols.len()
    );
    std::fs::write(&args.output, &image.bytes)
        .with_context(|| format!("cannot write {}", args.output.display()))?;
    Ok(())
}

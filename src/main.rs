//! crcforge command line
//!
//! Reads a message, and either prints its CRC or rewrites the message so
//! that its CRC becomes a chosen value, flipping only bits the user has
//! declared mutable. The input is streamed twice (checksum pass, then write
//! pass); standard input is spooled to a temporary file so the second pass
//! works there too.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::process;

use log::{debug, info, LevelFilter};
use structopt::StructOpt;
use thiserror::Error;

use crcforge::expr::{self, ExprError};
use crcforge::sparse::EngineError;
use crcforge::{forge, Bigint, Crc, ForgeError, Slice, SparseCrc};

const CHUNK: usize = 64 * 1024;

#[derive(Debug, StructOpt)]
#[structopt(name = "crcforge")]
/// Forge CRC checksums by flipping chosen message bits
///
/// Without a desired checksum the CRC of the input is printed. With one,
/// the modified message is written to standard output. Mutable bits default
/// to a register-width window appended to the message; give -b/-o/-O to
/// choose your own.
struct Opt {
    /// Register width in bits
    #[structopt(short = "w", value_name = "width")]
    width: Option<usize>,

    /// Generator polynomial (hex)
    #[structopt(short = "p", value_name = "poly")]
    poly: Option<String>,

    /// Initial register value (hex)
    #[structopt(short = "i", value_name = "init")]
    init: Option<String>,

    /// Final register XOR mask (hex)
    #[structopt(short = "x", value_name = "xor")]
    xor_out: Option<String>,

    /// Reflect input bytes (feed bits LSB first)
    #[structopt(short = "r")]
    reflect_in: bool,

    /// Reflect the final register
    #[structopt(short = "R")]
    reflect_out: bool,

    /// Absolute position of the mutable window (byte.bit expression)
    #[structopt(short = "o", value_name = "pos", allow_hyphen_values = true)]
    offset: Option<String>,

    /// Window position relative to the end of input (0 appends)
    #[structopt(
        short = "O",
        value_name = "pos",
        conflicts_with = "offset",
        allow_hyphen_values = true
    )]
    offset_end: Option<String>,

    /// Add a mutable bit slice l:r:s (may repeat)
    #[structopt(
        short = "b",
        value_name = "slice",
        number_of_values = 1,
        allow_hyphen_values = true
    )]
    slices: Vec<String>,

    /// Verbose output (repeat for more)
    #[structopt(short = "v", parse(from_occurrences))]
    verbose: u8,

    /// Input file, or - for standard input
    #[structopt(value_name = "file")]
    input: String,

    /// Desired checksum (hex)
    #[structopt(value_name = "checksum")]
    target: Option<String>,
}

/// Everything that can go wrong, with its exit code
#[derive(Debug, Error)]
enum Failure {
    #[error("{0}")]
    Usage(String),
    #[error("reading input failed: {0}")]
    Input(io::Error),
    #[error("{0}")]
    Range(String),
    #[error("creating temporary file failed: {0}")]
    Resource(io::Error),
    #[error("{0}")]
    Engine(EngineError),
    #[error("try giving {0} mutable bits more")]
    Forge(usize),
    #[error("checksum of the written message does not match the target")]
    Verify,
    #[error("writing output failed: {0}")]
    Write(io::Error),
}

impl Failure {
    fn code(&self) -> i32 {
        match self {
            Failure::Usage(_) => 1,
            Failure::Input(_) => 2,
            Failure::Range(_) => 3,
            Failure::Resource(_) => 4,
            Failure::Engine(_) => 5,
            Failure::Forge(_) | Failure::Verify => 6,
            Failure::Write(_) => 7,
        }
    }
}

fn hex_arg(width: usize, name: &str, value: &str) -> Result<Bigint, Failure> {
    Bigint::from_hex(width, value).map_err(|err| Failure::Usage(format!("bad {}: {}", name, err)))
}

/// Resolve the CRC parameter set from the flags
///
/// No CRC flag at all means standard CRC-32. Otherwise unspecified values
/// fall back to zero registers and unreflected bits, with the CRC-32
/// polynomial assumed for 32-bit registers.
///
fn build_crc(opt: &Opt) -> Result<Crc, Failure> {
    let custom = opt.width.is_some()
        || opt.poly.is_some()
        || opt.init.is_some()
        || opt.xor_out.is_some()
        || opt.reflect_in
        || opt.reflect_out;
    if !custom {
        return Ok(Crc::crc32());
    }

    let width = opt.width.unwrap_or(32);
    if width == 0 {
        return Err(Failure::Usage("register width must be at least 1".into()));
    }
    let poly = match &opt.poly {
        Some(hex) => hex_arg(width, "polynomial", hex)?,
        None if width == 32 => Bigint::from_u64(32, 0x04c11db7),
        None => {
            return Err(Failure::Usage(
                "-p <poly> is required when the width is not 32".into(),
            ))
        }
    };
    let init = match &opt.init {
        Some(hex) => hex_arg(width, "initial value", hex)?,
        None => Bigint::new(width),
    };
    let xor_out = match &opt.xor_out {
        Some(hex) => hex_arg(width, "xor mask", hex)?,
        None => Bigint::new(width),
    };
    Ok(Crc::new(
        width,
        poly,
        init,
        xor_out,
        opt.reflect_in,
        opt.reflect_out,
    ))
}

/// First pass: checksum the input and leave behind a rewound, seekable copy
fn scan_input(path: &str, crc: &Crc) -> Result<(File, usize, Bigint), Failure> {
    let mut reg = crc.checksum(&[]);
    let mut len = 0usize;
    let mut buf = vec![0u8; CHUNK];

    let mut file = if path == "-" {
        // stdin is not seekable; spool it for the second pass
        let mut spool = tempfile::tempfile().map_err(Failure::Resource)?;
        let stdin = io::stdin();
        let mut stdin = stdin.lock();
        loop {
            let n = stdin.read(&mut buf).map_err(Failure::Input)?;
            if n == 0 {
                break;
            }
            crc.append(&buf[..n], &mut reg);
            spool.write_all(&buf[..n]).map_err(Failure::Resource)?;
            len += n;
        }
        spool
    } else {
        let mut file = File::open(path).map_err(Failure::Input)?;
        loop {
            let n = file.read(&mut buf).map_err(Failure::Input)?;
            if n == 0 {
                break;
            }
            crc.append(&buf[..n], &mut reg);
            len += n;
        }
        file
    };

    file.seek(SeekFrom::Start(0)).map_err(Failure::Input)?;
    Ok((file, len, reg))
}

/// Collect the mutable bit positions from -b slices and the -o/-O window
fn mutable_bits(opt: &Opt, len_bits: usize, width: usize) -> Result<Vec<usize>, Failure> {
    let mut bits = Vec::new();

    for s in &opt.slices {
        let slice =
            Slice::parse(s).map_err(|err| Failure::Usage(format!("bad slice '{}': {}", s, err)))?;
        let positions = slice.positions(len_bits).map_err(|err| match err {
            ExprError::OutOfRange => {
                Failure::Range(format!("slice '{}' reaches before the message start", s))
            }
            err => Failure::Usage(format!("bad slice '{}': {}", s, err)),
        })?;
        bits.extend(positions);
    }

    let window = if let Some(o) = &opt.offset {
        let start =
            expr::eval(o).map_err(|err| Failure::Usage(format!("bad offset '{}': {}", o, err)))?;
        if start < 0 {
            return Err(Failure::Usage("absolute offset cannot be negative".into()));
        }
        Some(start as usize)
    } else if let Some(o) = &opt.offset_end {
        let delta =
            expr::eval(o).map_err(|err| Failure::Usage(format!("bad offset '{}': {}", o, err)))?;
        let start = len_bits as i64 + delta;
        if start < 0 {
            return Err(Failure::Range(format!(
                "offset {} reaches before the message start",
                o
            )));
        }
        Some(start as usize)
    } else if opt.slices.is_empty() {
        // no selection at all: append a register-width window
        Some(len_bits)
    } else {
        None
    };

    if let Some(start) = window {
        bits.extend(start..start + width);
    }
    Ok(bits)
}

/// Zero-padding (in bytes) needed so the message contains every mutable bit
///
/// A bit may lie at most one register width past the end; anything further
/// is a range error.
///
fn padding_for(bits: &[usize], len_bits: usize, width: usize) -> Result<usize, Failure> {
    let mut max = 0usize;
    for &b in bits {
        if b >= len_bits + width {
            return Err(Failure::Range(format!(
                "bit {} exceeds the message end by {} bits",
                b,
                b - len_bits
            )));
        }
        max = max.max(b);
    }
    if !bits.is_empty() && max >= len_bits {
        Ok(1 + (max - len_bits) / 8)
    } else {
        Ok(0)
    }
}

fn run(opt: &Opt) -> Result<(), Failure> {
    let crc = build_crc(opt)?;
    let width = crc.width();
    info!("crc parameters: {}", crc);

    // validate the target before touching the input
    let target = match &opt.target {
        Some(hex) => Some(hex_arg(width, "checksum", hex)?),
        None => None,
    };

    let (mut input, len, reg) = scan_input(&opt.input, &crc)?;
    let len_bits = 8 * len;
    info!("input: {} bytes, crc {}", len, reg);

    let target = match target {
        Some(t) => t,
        None => {
            println!("{}", reg);
            return Ok(());
        }
    };

    let mut bits = mutable_bits(opt, len_bits, width)?;
    debug!("{} mutable bits", bits.len());

    // bits past the end zero-pad the message, up to one register width
    let mut reg = reg;
    let pad = padding_for(&bits, len_bits, width)?;
    if pad > 0 {
        crc.append(&vec![0u8; pad], &mut reg);
        debug!("appending {} zero padding bytes", pad);
    }
    let total_len = len + pad;

    let mut engine = SparseCrc::new(&crc, 8 * total_len).map_err(Failure::Engine)?;
    let base = reg;
    let k = forge(
        &target,
        |pos| {
            let mut sum = base.clone();
            if let Some(p) = pos {
                engine.flip(p, &mut sum);
            }
            sum
        },
        &mut bits,
    )
    .map_err(|err| match err {
        ForgeError::Insufficient { needed } => Failure::Forge(needed),
    })?;

    info!("flipping {} of {} candidate bits", k, bits.len());
    let mut masks: HashMap<usize, u8> = HashMap::new();
    for &b in &bits[..k] {
        debug!("flip bit {} (byte {}, bit {})", b, b / 8, b % 8);
        *masks.entry(b / 8).or_insert(0) ^= 1 << (b % 8);
    }

    // second pass: apply the flips while streaming the message out
    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let mut written = crc.checksum(&[]);
    let mut buf = vec![0u8; CHUNK];
    let mut offset = 0usize;
    loop {
        let n = input.read(&mut buf).map_err(Failure::Input)?;
        if n == 0 {
            break;
        }
        for (&idx, &mask) in &masks {
            if idx >= offset && idx < offset + n {
                buf[idx - offset] ^= mask;
            }
        }
        crc.append(&buf[..n], &mut written);
        out.write_all(&buf[..n]).map_err(Failure::Write)?;
        offset += n;
    }
    for idx in offset..total_len {
        let byte = masks.get(&idx).copied().unwrap_or(0);
        crc.append(&[byte], &mut written);
        out.write_all(&[byte]).map_err(Failure::Write)?;
    }
    out.flush().map_err(Failure::Write)?;

    if written != target {
        return Err(Failure::Verify);
    }
    info!("wrote {} bytes, crc {}", total_len, written);
    Ok(())
}

fn main() {
    let opt = Opt::from_args();

    let level = match opt.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    if let Err(err) = run(&opt) {
        eprintln!("{}", err);
        process::exit(err.code());
    }
}

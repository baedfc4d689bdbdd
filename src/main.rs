//! Oxidized-Gekko - headless Gekko runner
//!
//! Loads a flat big-endian binary into physical RAM, runs it for a number of
//! CPU cycles and prints the resulting registers.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use gk_core::config::{Config, CpuCore};
use gk_cpu::{Cpu, StopReason};

/// Gekko core clock
const GEKKO_CLOCK_HZ: u64 = 486_000_000;

struct Options {
    binary: PathBuf,
    load_address: u32,
    entry: Option<u32>,
    cycles: u64,
    core: Option<CpuCore>,
    breakpoints: Vec<u32>,
    load_state: Option<PathBuf>,
    save_state: Option<PathBuf>,
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} <binary> [options]\n\
         \n\
         Options:\n\
         \x20 --load <addr>        physical load address (default 0x3100)\n\
         \x20 --entry <addr>       entry point (default: load address)\n\
         \x20 --cycles <n>         cycles to run (default: one emulated second)\n\
         \x20 --core <name>        interpreter | jit | jit-native\n\
         \x20 --break <addr>       stop at an address (repeatable)\n\
         \x20 --load-state <path>  restore a savestate before running\n\
         \x20 --save-state <path>  write a savestate after running"
    )
}

fn parse_u32(text: &str) -> Result<u32> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid number '{text}'"))
}

fn parse_core(text: &str) -> Result<CpuCore> {
    Ok(match text {
        "interpreter" => CpuCore::Interpreter,
        "jit" => CpuCore::Jit,
        "jit-native" => CpuCore::JitNative,
        other => bail!("unknown CPU core '{other}'"),
    })
}

fn parse_args(args: &[String]) -> Result<Options> {
    let program = args.first().map(String::as_str).unwrap_or("oxidized-gekko");
    let mut iter = args.iter().skip(1);
    let mut binary = None;
    let mut options = Options {
        binary: PathBuf::new(),
        load_address: 0x3100,
        entry: None,
        cycles: GEKKO_CLOCK_HZ,
        core: None,
        breakpoints: Vec::new(),
        load_state: None,
        save_state: None,
    };

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{name} needs a value\n\n{}", usage(program)))
        };
        match arg.as_str() {
            "--load" => options.load_address = parse_u32(&value("--load")?)?,
            "--entry" => options.entry = Some(parse_u32(&value("--entry")?)?),
            "--cycles" => {
                let text = value("--cycles")?;
                options.cycles = text.parse().with_context(|| format!("invalid cycle count '{text}'"))?;
            }
            "--core" => options.core = Some(parse_core(&value("--core")?)?),
            "--break" => options.breakpoints.push(parse_u32(&value("--break")?)?),
            "--load-state" => options.load_state = Some(PathBuf::from(value("--load-state")?)),
            "--save-state" => options.save_state = Some(PathBuf::from(value("--save-state")?)),
            "-h" | "--help" => {
                println!("{}", usage(program));
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option '{other}'\n\n{}", usage(program)),
            other => binary = Some(PathBuf::from(other)),
        }
    }

    options.binary = binary.with_context(|| usage(program))?;
    Ok(options)
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let options = parse_args(&args)?;

    let mut config = Config::load().unwrap_or_default();
    if let Some(core) = options.core {
        config.cpu.core = core;
    }
    gk_core::logging::init(&config);
    tracing::info!("Starting Oxidized-Gekko");

    let mut cpu = Cpu::new(&config).context("failed to create the CPU")?;

    let image = std::fs::read(&options.binary)
        .with_context(|| format!("failed to read {}", options.binary.display()))?;
    cpu.machine_mut()
        .memory
        .write_physical(options.load_address, &image)
        .context("binary does not fit in RAM")?;
    let entry = options.entry.unwrap_or(options.load_address);
    cpu.state_mut().pc = entry;
    cpu.state_mut().npc = entry.wrapping_add(4);
    tracing::info!(
        "Loaded {} bytes at 0x{:08x}, entry 0x{:08x}",
        image.len(),
        options.load_address,
        entry
    );

    if let Some(path) = &options.load_state {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        cpu.load_state(&bytes)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    for &address in &options.breakpoints {
        cpu.add_breakpoint(address);
    }

    match cpu.run_for(options.cycles) {
        StopReason::Breakpoint(pc) => println!("Breakpoint hit at 0x{pc:08x}"),
        StopReason::CyclesElapsed | StopReason::StopRequested => {}
    }

    if let Some(path) = &options.save_state {
        let bytes = cpu.save_state().context("failed to save state")?;
        std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("Saved state to {}", path.display());
    }

    let state = cpu.state();
    println!("pc  {:08x}  lr  {:08x}  ctr {:08x}", state.pc, state.lr(), state.ctr());
    println!("cr  {:08x}  xer {:08x}  msr {:08x}", state.cr, state.xer, state.msr);
    for row in 0..8 {
        let line: Vec<String> = (0..4)
            .map(|col| {
                let reg = row * 4 + col;
                format!("r{reg:<2} {:08x}", state.gpr[reg])
            })
            .collect();
        println!("{}", line.join("  "));
    }
    println!("cycles {}", state.cycles);
    if let Some(jit) = cpu.engine().jit() {
        let stats = jit.stats();
        println!(
            "blocks compiled {}, executed {}",
            stats.blocks_compiled, stats.blocks_executed
        );
    }
    Ok(())
}

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use xr32_vm::assembler;
use xr32_vm::emulator::{Emulator, DEFAULT_MEMORY_BYTES};
use xr32_vm::loader;
use xr32_vm::Trap;

#[derive(Parser, Debug)]
#[command(
    name = "xr32-tool",
    author,
    version,
    about = "XR-32 emulator, assembler and disassembler",
    long_about = None
)]
struct Args {
    /// Assemble an XR-32 source file ("-" reads stdin) into a binary image
    #[arg(short = 'a', long, value_name = "FILE", group = "mode")]
    assemble: Option<PathBuf>,

    /// Disassemble a binary image into assembly text
    #[arg(short = 'd', long, value_name = "FILE", group = "mode")]
    disassemble: Option<PathBuf>,

    /// Execute a binary image
    #[arg(short = 'e', long, value_name = "FILE", group = "mode")]
    emulate: Option<PathBuf>,

    /// Output file (defaults: output.bin for --assemble, stdout for
    /// --disassemble)
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Physical memory size in bytes
    #[arg(long, default_value_t = DEFAULT_MEMORY_BYTES)]
    mem: usize,

    /// Firmware image loaded at physical address 0. Without one, flat
    /// identity page tables are installed so bare images can run.
    #[arg(long, value_name = "FILE")]
    bios: Option<PathBuf>,

    /// Physical load address of the --emulate image
    #[arg(long, default_value_t = 0x1000)]
    load_addr: u32,

    /// Trace every executed instruction to stderr
    #[arg(long)]
    trace: bool,

    /// Dump CPU state: "int" after every delivered interrupt, a number
    /// after every N instructions
    #[arg(short = 'D', long, value_name = "int|N")]
    dump: Option<String>,

    /// Stop after this many instructions (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_steps: u64,
}

enum DumpMode {
    Never,
    OnInterrupt,
    Every(u64),
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.trace {
        builder.filter_module("xr32_vm", log::LevelFilter::Trace);
    }
    builder.init();

    let result = if let Some(source) = &args.assemble {
        run_assemble(source, args.output.as_deref())
    } else if let Some(image) = &args.disassemble {
        run_disassemble(image, args.output.as_deref())
    } else if let Some(image) = &args.emulate {
        run_emulate(&args, image)
    } else {
        eprintln!("nothing to do: pass --assemble, --disassemble or --emulate (see --help)");
        return ExitCode::FAILURE;
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run_assemble(source: &std::path::Path, output: Option<&std::path::Path>) -> Result<(), String> {
    let text = if source.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("reading stdin: {e}"))?;
        buffer
    } else {
        std::fs::read_to_string(source).map_err(|e| format!("reading {}: {e}", source.display()))?
    };

    let words = assembler::assemble(&text).map_err(|e| e.to_string())?;

    let output = output.unwrap_or_else(|| std::path::Path::new("output.bin"));
    loader::write_words(output, &words).map_err(|e| e.to_string())?;
    println!("assembled {} instruction(s) to {}", words.len(), output.display());
    Ok(())
}

fn run_disassemble(image: &std::path::Path, output: Option<&std::path::Path>) -> Result<(), String> {
    let words = loader::read_words(image).map_err(|e| e.to_string())?;
    let listing = assembler::disassemble(&words);
    match output {
        Some(path) => {
            std::fs::write(path, &listing).map_err(|e| format!("writing {}: {e}", path.display()))?;
            println!("disassembled {} word(s) to {}", words.len(), path.display());
        }
        None => print!("{listing}"),
    }
    Ok(())
}

fn run_emulate(args: &Args, image: &std::path::Path) -> Result<(), String> {
    let dump = match args.dump.as_deref() {
        None => DumpMode::Never,
        Some("int") => DumpMode::OnInterrupt,
        Some(count) => DumpMode::Every(
            count
                .parse::<u64>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| format!("invalid --dump condition `{count}`"))?,
        ),
    };

    let mut emu = Emulator::with_memory(args.mem);

    // With firmware, the machine boots like hardware: execution starts at
    // physical 0 and the firmware owns page tables and handoff. Without
    // it, install a flat view and enter the image directly.
    let entry = if let Some(bios) = &args.bios {
        let firmware = loader::read_image(bios).map_err(|e| e.to_string())?;
        emu.load_image(&firmware, 0).map_err(|e| e.to_string())?;
        println!("loaded firmware ({} bytes) at 0x0", firmware.len());
        0
    } else {
        let table_base = emu.install_default_page_tables().map_err(|e| e.to_string())?;
        log::debug!("installed flat page tables at {table_base:#010x}");
        args.load_addr
    };

    let program = loader::read_image(image).map_err(|e| e.to_string())?;
    emu.load_image(&program, args.load_addr).map_err(|e| e.to_string())?;
    emu.cpu.regs.i0 = entry;
    println!(
        "starting execution at {entry:#010x} ({} bytes of memory)",
        emu.mem.size()
    );

    let mut executed: u64 = 0;
    loop {
        if args.max_steps != 0 && executed >= args.max_steps {
            println!("stopping after {executed} instruction(s) (--max-steps)");
            break;
        }
        match emu.step() {
            Ok(()) => {}
            Err(Trap::Halted) => {
                executed += 1;
                println!("CPU halted after {executed} instruction(s)");
                break;
            }
            Err(Trap::Fatal(message)) => {
                eprintln!("fatal emulator error: {message}");
                eprint!("{}", emu.dump_state());
                return Err(message);
            }
            // Cpu::step only surfaces Halted and Fatal.
            Err(other) => return Err(other.to_string()),
        }
        executed += 1;

        match dump {
            DumpMode::OnInterrupt => {
                if let Some((vector, code)) = emu.cpu.last_interrupt {
                    println!("interrupt {vector:#04x} (error code {code}):");
                    print!("{}", emu.dump_state());
                }
            }
            DumpMode::Every(n) if executed % n == 0 => {
                println!("after {executed} instruction(s):");
                print!("{}", emu.dump_state());
            }
            _ => {}
        }
    }

    print!("{}", emu.dump_state());
    Ok(())
}

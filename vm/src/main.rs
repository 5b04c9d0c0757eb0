use clap::Parser as ClapParser;
use std::error::Error;
use std::process;

use bytecode::{BytecodeDecoder, encode};
use heap::HeapSettings;
use log::LevelFilter;
use object::Value;

use vm::demos::{self, DEMOS, Demo};
use vm::{InvocationRequest, Runtime, RuntimeSettings, resolve_stack_size};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Demo program to run
    #[arg(long, default_value = "print", help = "Name of the demo to run")]
    demo: String,

    /// List the available demos and exit
    #[arg(long, help = "List bundled demo programs")]
    list: bool,

    /// Print the demo's methods and resolved frame sizes instead of running
    #[arg(long, help = "Disassemble the demo and show stack sizes")]
    dump: bool,

    /// Initial heap arena size in bytes
    #[arg(long, help = "Initial heap size in bytes")]
    heap_size: Option<usize>,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if cli.list {
        for demo in DEMOS {
            println!("{:<12} {}", demo.name, demo.about);
        }
        return;
    }

    let Some(demo) = demos::find(&cli.demo) else {
        eprintln!("Unknown demo '{}'; try --list", cli.demo);
        process::exit(1);
    };

    let mut settings = RuntimeSettings::default();
    if let Some(size) = cli.heap_size {
        settings.heap = HeapSettings {
            initial_size: size,
            max_size: settings.heap.max_size.max(size),
            ..settings.heap
        };
    }

    if let Err(err) = run(demo, settings, cli.dump) {
        eprintln!("Error running {}: {}", demo.name, err);
        process::exit(1);
    }
}

fn run(demo: &Demo, settings: RuntimeSettings, dump: bool) -> Result<(), String> {
    let (module, entry) = (demo.build)().map_err(|e| e.to_string())?;
    let mut rt = Runtime::new(module, settings).map_err(|e| e.to_string())?;

    if dump {
        dump_module(&rt).map_err(|e| e.to_string())?;
        return Ok(());
    }

    let result = rt
        .invoke(InvocationRequest::new(entry))
        .map_err(|e| e.to_string())?;
    for line in rt.output().take() {
        println!("{line}");
    }
    if let Some(value) = result {
        println!("=> {}", format_value(&rt, value));
    }
    let stats = rt.heap.stats();
    log::info!(
        "heap: {} allocations, {} frees, {} live objects ({} bytes)",
        stats.allocations,
        stats.frees,
        stats.live_objects,
        stats.live_bytes
    );
    Ok(())
}

/// Prints every method with its resolved frame size and its body, decoded
/// back from the binary instruction stream.
fn dump_module(rt: &Runtime) -> Result<(), Box<dyn Error>> {
    let module = rt.module();
    for (idx, def) in module.methods.iter().enumerate() {
        let owner = rt.type_name(def.owner)?;
        let mut flags = Vec::new();
        if def.is_static {
            flags.push("static");
        }
        if def.is_native {
            flags.push("native");
        }
        if def.is_constructor {
            flags.push("ctor");
        }
        println!("== #{idx} {owner}::{} [{}] ==", def.name, flags.join(" "));
        if def.is_native {
            continue;
        }
        let size = resolve_stack_size(rt, idx as u32)?;
        let encoded = encode(&def.body);
        println!(
            "   max stack {} items, {} bytes; {} bytes of code",
            size.max_stack,
            size.max_stack_size,
            encoded.len()
        );
        let mut decoder = BytecodeDecoder::new(&encoded);
        let mut label = 0;
        loop {
            let offset = decoder.offset();
            let Some(insn) = decoder.decode_next() else {
                break;
            };
            println!("   {label:>4} {offset:#06x}: {}", insn?);
            label += 1;
        }
    }
    Ok(())
}

fn format_value(rt: &Runtime, value: Value) -> String {
    match value {
        Value::Primitive { .. } => rt
            .read_scalar(value)
            .map_or_else(|e| format!("<{e}>"), |s| s.to_string()),
        Value::String { target, .. } if target.is_null() => "null".to_string(),
        Value::String { .. } => rt
            .read_string(value)
            .map_or_else(|e| format!("<{e}>"), |s| format!("{s:?}")),
        other => format!(
            "{} {} @ {}",
            other.kind_name(),
            rt.descriptor(other.type_id()).name,
            other.location()
        ),
    }
}

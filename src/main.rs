use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use pourover::{DirectoryProvider, ProviderChain, RomImage, RuntimeBuilder, Severity, VmConfig};

/// Runs the static main method of a class.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Class whose `main(String[])` is run, e.g. `app/Main`
    class: String,

    /// Optional single argument handed to main
    arg: Option<String>,

    /// Directory of `<name>.class` files, searched in order
    #[clap(long, short = 'c')]
    classpath: Vec<PathBuf>,

    /// Packed class image, searched before the class path
    #[clap(long)]
    rom: Vec<PathBuf>,

    #[clap(long, default_value_t = VmConfig::default().arena_bytes)]
    arena_bytes: usize,

    #[clap(long, default_value_t = VmConfig::default().vm_stack_bytes)]
    vm_stack_bytes: usize,

    #[clap(long, default_value_t = VmConfig::default().native_stack_bytes)]
    native_stack_bytes: usize,

    #[clap(long, default_value_t = VmConfig::default().class_heap_bytes)]
    class_heap_bytes: usize,

    #[clap(long, default_value_t = VmConfig::default().object_heap_bytes)]
    object_heap_bytes: usize,

    /// Strings made available to `System.getInput`
    #[clap(long)]
    input: Vec<String>,

    /// Print memory statistics after the run
    #[clap(long)]
    mem_info: bool,
}

impl Args {
    fn config(&self) -> VmConfig {
        VmConfig {
            arena_bytes: self.arena_bytes,
            vm_stack_bytes: self.vm_stack_bytes,
            native_stack_bytes: self.native_stack_bytes,
            class_heap_bytes: self.class_heap_bytes,
            object_heap_bytes: self.object_heap_bytes,
        }
    }
}

/// Count byte followed by NUL terminated strings.
fn encode_inout(strings: &[String]) -> Vec<u8> {
    let mut buffer = vec![strings.len().min(u8::MAX as usize) as u8];
    for s in strings.iter().take(u8::MAX as usize) {
        buffer.extend_from_slice(s.as_bytes());
        buffer.push(0);
    }
    buffer
}

fn decode_inout(buffer: &[u8]) -> Vec<String> {
    let Some((&count, rest)) = buffer.split_first() else {
        return Vec::new();
    };
    rest.split(|b| *b == 0)
        .take(count as usize)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut provider = ProviderChain::new();
    for path in &args.rom {
        match RomImage::from_file(path) {
            Ok(rom) => provider.push(Box::new(rom)),
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    for dir in &args.classpath {
        provider.push(Box::new(DirectoryProvider::new(dir)));
    }
    if provider.is_empty() {
        provider.push(Box::new(DirectoryProvider::new(".")));
    }

    let mut builder = RuntimeBuilder::new(args.config()).provider(provider);
    if !args.input.is_empty() {
        builder = builder.inout_buffer(encode_inout(&args.input));
    }
    let mut runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("can't start the VM: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("running {}", args.class);
    let result = runtime.call_static_main(&args.class, args.arg.as_deref());
    if let Err(e) = &result {
        error!("{}", e);
    }
    if let Some(buffer) = runtime.take_inout_buffer() {
        for line in decode_inout(&buffer) {
            println!("{line}");
        }
    }
    if args.mem_info {
        println!("{}", runtime.mem_info());
    }
    let status = runtime.status();
    runtime.shutdown();

    match status.severity {
        Severity::NoError => ExitCode::SUCCESS,
        _ => ExitCode::from(((status.code as u16 & 0xff) as u8).max(1)),
    }
}
